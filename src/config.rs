use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use sonic_rs::JsonValueTrait;
use url::Url;

use crate::error::ConfigError;

/// Dial timeout used when the run file leaves it unset or non-positive.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Command Line
// =============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "ws-loadgen")]
#[command(about = "WebSocket connection-rate load generator", long_about = None)]
pub struct Cli {
    /// JSON run file (target, ramp profile, test script)
    #[arg(long, env = "WS_LOADGEN_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Override the target WebSocket URL
    #[arg(long, env = "WS_LOADGEN_URL")]
    pub url: Option<String>,

    /// Override the dial timeout in seconds
    #[arg(long, env = "WS_LOADGEN_TIMEOUT")]
    pub timeout: Option<i64>,

    /// Override the CSV data file used for templated messages
    #[arg(long, env = "WS_LOADGEN_DATA")]
    pub data: Option<PathBuf>,

    /// Maximum connections running at once (0 = unbounded)
    #[arg(long, env = "WS_LOADGEN_MAX_IN_FLIGHT", default_value = "0")]
    pub max_in_flight: usize,
}

// =============================================================================
// Run File
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RunFile {
    #[serde(default)]
    pub config: ConnectionConfig,

    #[serde(default, rename = "hitrate")]
    pub ramp: Vec<RampStage>,

    #[serde(default, rename = "tests")]
    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub data: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub url: String,

    /// Dial timeout in seconds.
    #[serde(default)]
    pub timeout: i64,
}

/// One leg of the ramp as configured. The start level is chained from the
/// previous leg, so only the end level is read.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RampStage {
    #[serde(rename = "end")]
    pub end_level: f64,

    #[serde(rename = "duration")]
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    #[serde(rename = "type")]
    pub kind: String,

    /// Sleep length in seconds.
    #[serde(default)]
    pub duration: u64,

    #[serde(default)]
    pub send: Option<sonic_rs::Value>,

    /// Substitute `${N}` placeholders from the data file.
    #[serde(default)]
    pub replace: bool,
}

impl StepConfig {
    /// Text frame body for a `message` step.
    pub fn payload_text(&self, index: usize) -> Result<String, ConfigError> {
        match &self.send {
            None => Ok(String::new()),
            Some(value) => match value.as_str() {
                Some(text) => Ok(text.to_owned()),
                None => sonic_rs::to_string(value)
                    .map_err(|source| ConfigError::Payload { index, source }),
            },
        }
    }
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, sonic_rs::Error> {
        sonic_rs::from_str(content)
    }

    /// Applies command line overrides and validates everything scheduling
    /// depends on.
    pub fn into_run_config(self, cli: &Cli) -> Result<RunConfig, ConfigError> {
        let raw_url = cli.url.clone().unwrap_or(self.config.url);
        let target = parse_target(&raw_url)?;

        let timeout = cli.timeout.unwrap_or(self.config.timeout);
        let dial_timeout = if timeout <= 0 {
            Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS)
        } else {
            Duration::from_secs(timeout as u64)
        };

        validate_ramp(&self.ramp)?;

        Ok(RunConfig {
            target,
            dial_timeout,
            ramp: self.ramp,
            steps: self.steps,
            data: cli.data.clone().or(self.data),
            max_in_flight: (cli.max_in_flight > 0).then_some(cli.max_in_flight),
        })
    }
}

/// Validated configuration handed to the scheduler and drivers.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: Url,
    pub dial_timeout: Duration,
    pub ramp: Vec<RampStage>,
    pub steps: Vec<StepConfig>,
    pub data: Option<PathBuf>,
    pub max_in_flight: Option<usize>,
}

fn parse_target(raw: &str) -> Result<Url, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::MissingUrl);
    }

    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

pub fn validate_ramp(ramp: &[RampStage]) -> Result<(), ConfigError> {
    if ramp.is_empty() {
        return Err(ConfigError::EmptyRamp);
    }

    for (index, stage) in ramp.iter().enumerate() {
        if stage.duration_secs <= 0 {
            return Err(ConfigError::NonPositiveDuration {
                index,
                duration: stage.duration_secs,
            });
        }
        if !stage.end_level.is_finite() || stage.end_level < 0.0 {
            return Err(ConfigError::InvalidLevel {
                index,
                level: stage.end_level,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> Cli {
        Cli::parse_from(["ws-loadgen", "--config", "run.json"])
    }

    const RUN_FILE: &str = r#"{
        "config": { "url": "ws://127.0.0.1:8080/socket" },
        "hitrate": [ { "end": 10, "duration": 5 }, { "end": 0, "duration": 2 } ],
        "tests": [
            { "type": "message", "send": { "op": "hello", "id": "${0}" }, "replace": true },
            { "type": "sleep", "duration": 2 },
            { "type": "disconnect" }
        ]
    }"#;

    #[test]
    fn parses_run_file_and_defaults_timeout() {
        let file = RunFile::parse(RUN_FILE).unwrap();
        assert_eq!(file.ramp.len(), 2);
        assert_eq!(file.steps.len(), 3);
        assert!(file.steps[0].replace);
        assert_eq!(file.steps[1].duration, 2);

        let run = file.into_run_config(&cli()).unwrap();
        assert_eq!(run.dial_timeout, Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS));
        assert_eq!(run.target.as_str(), "ws://127.0.0.1:8080/socket");
        assert_eq!(run.max_in_flight, None);
    }

    #[test]
    fn message_payload_is_compact_json() {
        let file = RunFile::parse(RUN_FILE).unwrap();
        let text = file.steps[0].payload_text(0).unwrap();
        assert!(text.contains("\"op\":\"hello\""));
        assert!(text.contains("${0}"));
    }

    #[test]
    fn string_payload_is_sent_as_is() {
        let file =
            RunFile::parse(r#"{ "tests": [ { "type": "message", "send": "ping" } ] }"#).unwrap();
        assert_eq!(file.steps[0].payload_text(0).unwrap(), "ping");
    }

    #[test]
    fn cli_overrides_win() {
        let file = RunFile::parse(RUN_FILE).unwrap();
        let cli = Cli::parse_from([
            "ws-loadgen",
            "--url",
            "wss://example.com/ws",
            "--timeout",
            "3",
            "--max-in-flight",
            "64",
        ]);
        let run = file.into_run_config(&cli).unwrap();
        assert_eq!(run.target.scheme(), "wss");
        assert_eq!(run.dial_timeout, Duration::from_secs(3));
        assert_eq!(run.max_in_flight, Some(64));
    }

    #[test]
    fn rejects_non_positive_duration() {
        let ramp = [
            RampStage {
                end_level: 5.0,
                duration_secs: 3,
            },
            RampStage {
                end_level: 5.0,
                duration_secs: 0,
            },
        ];
        assert!(matches!(
            validate_ramp(&ramp),
            Err(ConfigError::NonPositiveDuration { index: 1, duration: 0 })
        ));
    }

    #[test]
    fn rejects_negative_level_and_empty_ramp() {
        let ramp = [RampStage {
            end_level: -1.0,
            duration_secs: 3,
        }];
        assert!(matches!(
            validate_ramp(&ramp),
            Err(ConfigError::InvalidLevel { index: 0, .. })
        ));
        assert!(matches!(validate_ramp(&[]), Err(ConfigError::EmptyRamp)));
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let file = RunFile::parse(r#"{ "config": { "url": "http://localhost" },
            "hitrate": [ { "end": 1, "duration": 1 } ] }"#)
        .unwrap();
        assert!(matches!(
            file.into_run_config(&cli()),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }
}
