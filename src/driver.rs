use std::net::SocketAddr;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};
use url::Url;

use crate::error::DialError;
use crate::script::{Script, Step};

/// Pause after every script step.
pub const STEP_DELAY: Duration = Duration::from_millis(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Outcome
// =============================================================================

/// Result of one connection attempt. Latency spans the dial never reached are
/// zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOutcome {
    pub segment: usize,
    pub dns_latency: Duration,
    pub connect_latency: Duration,
    pub overall_latency: Duration,
    pub success: bool,
    pub timed_out: bool,
    /// Empty on success.
    pub error: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct DialTrace {
    dns: Duration,
    connect: Duration,
}

// =============================================================================
// Connection Driver
// =============================================================================

/// Opens one connection to `target` and, if the dial succeeds, runs `script`
/// on it. Script step failures are logged and never change the outcome.
pub async fn run_connection(
    target: &Url,
    dial_timeout: Duration,
    script: &Script,
    data_index: usize,
    segment: usize,
) -> ConnectionOutcome {
    let mut trace = DialTrace::default();
    let started = Instant::now();

    let dialed = match timeout(dial_timeout, dial(target, &mut trace)).await {
        Ok(result) => result,
        Err(_) => Err(DialError::Timeout(dial_timeout)),
    };
    let overall = started.elapsed();

    let mut outcome = ConnectionOutcome {
        segment,
        dns_latency: trace.dns,
        connect_latency: trace.connect,
        overall_latency: overall,
        success: false,
        timed_out: false,
        error: String::new(),
    };

    match dialed {
        Ok(ws) => {
            debug!("Connected to {} in {:?}", target, overall);
            outcome.success = true;
            run_script(ws, script, data_index).await;
        }
        Err(e) => {
            error!("Failed to connect to {}: {}", target, e);
            outcome.timed_out = matches!(e, DialError::Timeout(_));
            outcome.error = e.to_string();
        }
    }

    outcome
}

async fn dial(target: &Url, trace: &mut DialTrace) -> Result<WsStream, DialError> {
    let host = target.host_str().ok_or(DialError::MissingHost)?;
    // IPv6 literals come back bracketed.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = target.port_or_known_default().ok_or(DialError::MissingPort)?;

    let dns_start = Instant::now();
    let resolved = lookup_host((host, port)).await;
    trace.dns = dns_start.elapsed();
    let addrs: Vec<SocketAddr> = resolved.map_err(DialError::Resolve)?.collect();

    let connect_start = Instant::now();
    let stream = connect_any(&addrs).await;
    trace.connect = connect_start.elapsed();
    let stream = stream?;

    let (ws, _) = client_async_tls(target.as_str(), stream)
        .await
        .map_err(DialError::Handshake)?;

    Ok(ws)
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, DialError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    match last_err {
        Some(e) => Err(DialError::Connect(e)),
        None => Err(DialError::NoAddresses),
    }
}

async fn run_script(mut ws: WsStream, script: &Script, data_index: usize) {
    for (index, step) in script.steps().iter().enumerate() {
        match step {
            Step::Message(payload) => {
                let text = payload.resolve(data_index).to_owned();
                if let Err(e) = ws.send(Message::Text(text)).await {
                    warn!("Step {}: failed to send message: {}", index, e);
                }
            }

            Step::Sleep(duration) => sleep(*duration).await,

            Step::Disconnect => {
                if let Err(e) = ws.close(None).await {
                    warn!("Step {}: failed to close connection: {}", index, e);
                }
            }

            Step::Unsupported(kind) => {
                warn!("Step {}: skipping unsupported step type {:?}", index, kind);
            }
        }

        sleep(STEP_DELAY).await;
    }
}
