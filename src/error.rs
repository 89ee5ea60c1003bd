use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create pacing histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("{0} task failed: {1}")]
    Task(&'static str, #[source] tokio::task::JoinError),

    #[error("completion channel closed after {completed} of {expected} connections")]
    CompletionsLost { completed: u64, expected: u64 },
}

/// Invalid run configuration. Always fatal before scheduling starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: sonic_rs::Error,
    },

    #[error("step {index}: failed to encode message payload: {source}")]
    Payload {
        index: usize,
        #[source]
        source: sonic_rs::Error,
    },

    #[error("no target url configured")]
    MissingUrl,

    #[error("invalid target url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported url scheme {0:?}, expected ws or wss")]
    UnsupportedScheme(String),

    #[error("ramp profile is empty")]
    EmptyRamp,

    #[error("ramp segment {index}: duration must be positive, got {duration}")]
    NonPositiveDuration { index: usize, duration: i64 },

    #[error("ramp segment {index}: end level must be a finite non-negative number, got {level}")]
    InvalidLevel { index: usize, level: f64 },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to open data file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to read data file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Why a single connection failed to open. Rendered into the connection's
/// outcome; never propagated past the driver.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("target url has no host")]
    MissingHost,

    #[error("target url has no port")]
    MissingPort,

    #[error("dns lookup failed: {0}")]
    Resolve(#[source] std::io::Error),

    #[error("dns lookup returned no addresses")]
    NoAddresses,

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("dial timed out after {0:?}")]
    Timeout(std::time::Duration),
}
