use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ws_loadgen::report::format_duration;
use ws_loadgen::template;
use ws_loadgen::{Cli, LogReport, RunFile, Runner, Schedule, Script};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let run_file = RunFile::load(&cli.config).context("Failed to load run file")?;
    let config = run_file
        .into_run_config(&cli)
        .context("Invalid run configuration")?;

    let schedule = Schedule::build(&config.ramp).context("Failed to build schedule")?;

    // Templated payloads: never more rows than connections.
    let rows = match &config.data {
        Some(path) => {
            let limit = usize::try_from(schedule.total_connections())
                .unwrap_or(usize::MAX)
                .max(1);
            template::load_rows(path, limit).context("Failed to load message data")?
        }
        None => Vec::new(),
    };
    let script = Script::from_config(&config.steps, &rows).context("Invalid test script")?;

    // Print banner
    info!("════════════════════════════════════════════════════════════");
    info!("              WEBSOCKET CONNECTION RAMP TEST");
    info!("════════════════════════════════════════════════════════════");
    info!("Target: {}", config.target);
    info!("Dial Timeout: {}s", config.dial_timeout.as_secs());
    for segment in schedule.segments() {
        info!(
            "Segment {}: {} -> {} over {}s ({} connections)",
            segment.index,
            segment.start_level,
            segment.end_level,
            segment.duration_secs,
            segment.total_connections
        );
    }
    info!("Total Connections: {}", schedule.total_connections());
    info!("Duration: {}s", schedule.duration().as_secs());
    info!("Script Steps: {}", script.steps().len());
    if script.is_templated() {
        info!("Templated Payloads: {}", rows.len());
    }
    if let Some(limit) = config.max_in_flight {
        info!("Max In Flight: {}", limit);
    }
    info!("════════════════════════════════════════════════════════════");

    let summary = Runner::new(config.target, config.dial_timeout, script, schedule)
        .with_max_in_flight(config.max_in_flight)
        .run(LogReport)
        .await
        .context("Load test failed")?;

    info!("");
    info!(
        "Launched {} connections, pacing skew p99={} max={}",
        summary.launched,
        format_duration(summary.pacing.p99()),
        format_duration(summary.pacing.max())
    );
    info!("════════════════════════════════════════════════════════════");
    info!("                     LOAD TEST COMPLETE");
    info!("════════════════════════════════════════════════════════════");

    Ok(())
}
