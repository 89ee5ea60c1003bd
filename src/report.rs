use std::time::Duration;

use tracing::info;

use crate::schedule::RampSegment;
use crate::stats::{LatencySummary, StatsSnapshot};

/// Receives the aggregator's report events.
pub trait ReportSink: Send {
    /// A segment reached its realized connection total.
    fn segment_complete(&mut self, segment: &RampSegment, stats: &StatsSnapshot);

    /// Every scheduled connection has completed.
    fn run_complete(&mut self, stats: &StatsSnapshot);
}

/// Prints reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReport;

impl ReportSink for LogReport {
    fn segment_complete(&mut self, segment: &RampSegment, stats: &StatsSnapshot) {
        info!("");
        info!(
            "Segment {:<5} [start, end, total, duration]  {}, {}, {}, {}s",
            segment.index,
            segment.start_level,
            segment.end_level,
            segment.total_connections,
            segment.duration_secs
        );
        print_stats(stats);
    }

    fn run_complete(&mut self, stats: &StatsSnapshot) {
        info!("");
        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║             ALL TESTS COMPLETE - FINAL RESULTS             ║");
        info!("╚════════════════════════════════════════════════════════════╝");
        print_stats(stats);
    }
}

fn print_stats(stats: &StatsSnapshot) {
    info!("Connections   [total]                       {} sockets", stats.completed);
    info!(
        "Connect       [success, error, timeout]     {}, {}, {}",
        stats.success, stats.failure, stats.timeout
    );
    info!("Connect Time  [min, p50, p95, p99, max]     {}", latencies(&stats.connect));
    info!("DNS Time      [min, p50, p95, p99, max]     {}", latencies(&stats.dns));
    info!("Overall Time  [min, p50, p95, p99, max]     {}", latencies(&stats.overall));

    if stats.errors.is_empty() {
        info!("Error Set     [error, count]                No Errors");
    } else {
        for (error, count) in &stats.errors {
            info!("Error Set     [error, count]                {}, {}", error, count);
        }
    }
}

fn latencies(summary: &LatencySummary) -> String {
    [summary.min, summary.p50, summary.p95, summary.p99, summary.max]
        .iter()
        .map(|d| format_duration(*d))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Millisecond resolution with two decimals, e.g. `12.34ms`.
pub fn format_duration(duration: Duration) -> String {
    format!("{:.2}ms", duration.as_secs_f64() * 1_000.0)
}
