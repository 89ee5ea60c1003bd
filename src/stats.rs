use std::collections::HashMap;
use std::time::Duration;

use tdigest::TDigest;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::driver::ConnectionOutcome;
use crate::report::ReportSink;
use crate::schedule::RampSegment;

/// t-digest compression used for every latency sketch.
pub const SKETCH_COMPRESSION: usize = 100;

/// Samples buffered before they are folded into the digest.
const SKETCH_BUFFER: usize = 512;

// =============================================================================
// Latency Sketch
// =============================================================================

/// Streaming latency distribution: exact min/max plus a t-digest for
/// quantiles. Memory stays bounded regardless of sample count.
#[derive(Debug, Clone)]
pub struct LatencySketch {
    digest: TDigest,
    pending: Vec<f64>,
    min: Option<Duration>,
    max: Duration,
    count: u64,
}

impl Default for LatencySketch {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencySketch {
    pub fn new() -> Self {
        Self {
            digest: TDigest::new_with_size(SKETCH_COMPRESSION),
            pending: Vec::with_capacity(SKETCH_BUFFER),
            min: None,
            max: Duration::ZERO,
            count: 0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.count += 1;
        self.min = Some(self.min.map_or(latency, |min| min.min(latency)));
        self.max = self.max.max(latency);

        self.pending.push(latency.as_nanos() as f64);
        if self.pending.len() >= SKETCH_BUFFER {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.digest = self.digest.merge_unsorted(batch);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Approximate quantile, `q` in `[0, 1]`. Zero when empty.
    pub fn quantile(&mut self, q: f64) -> Duration {
        self.flush();
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.digest.estimate_quantile(q).max(0.0) as u64)
    }

    pub fn summary(&mut self) -> LatencySummary {
        LatencySummary {
            min: self.min.unwrap_or(Duration::ZERO),
            p50: self.quantile(0.50),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
            max: self.max,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub min: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

// =============================================================================
// Connection Stats
// =============================================================================

/// Aggregate over a set of outcomes. Used both per segment and for the whole
/// run.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    completed: u64,
    success: u64,
    failure: u64,
    timeout: u64,
    connect: LatencySketch,
    dns: LatencySketch,
    overall: LatencySketch,
    errors: HashMap<String, u64>,
}

impl ConnectionStats {
    pub fn record(&mut self, outcome: &ConnectionOutcome) {
        self.completed += 1;
        if outcome.success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        if outcome.timed_out {
            self.timeout += 1;
        }

        self.connect.record(outcome.connect_latency);
        self.dns.record(outcome.dns_latency);
        self.overall.record(outcome.overall_latency);

        if !outcome.error.is_empty() {
            *self.errors.entry(outcome.error.clone()).or_default() += 1;
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn snapshot(&mut self) -> StatsSnapshot {
        let mut errors: Vec<(String, u64)> =
            self.errors.iter().map(|(e, n)| (e.clone(), *n)).collect();
        errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        StatsSnapshot {
            completed: self.completed,
            success: self.success,
            failure: self.failure,
            timeout: self.timeout,
            connect: self.connect.summary(),
            dns: self.dns.summary(),
            overall: self.overall.summary(),
            errors,
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`] handed to reports. Errors are
/// ordered by descending count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub connect: LatencySummary,
    pub dns: LatencySummary,
    pub overall: LatencySummary,
    pub errors: Vec<(String, u64)>,
}

// =============================================================================
// Aggregator
// =============================================================================

struct SegmentState {
    ramp: RampSegment,
    stats: ConnectionStats,
    reported: bool,
}

/// Sole owner of all run statistics. Fed through a channel, so no locking.
pub struct Aggregator<S> {
    segments: Vec<SegmentState>,
    global: ConnectionStats,
    sink: S,
}

impl<S: ReportSink> Aggregator<S> {
    pub fn new(segments: &[RampSegment], sink: S) -> Self {
        Self {
            segments: segments
                .iter()
                .map(|ramp| SegmentState {
                    ramp: ramp.clone(),
                    stats: ConnectionStats::default(),
                    reported: false,
                })
                .collect(),
            global: ConnectionStats::default(),
            sink,
        }
    }

    pub fn ingest(&mut self, outcome: &ConnectionOutcome) {
        self.global.record(outcome);

        let Some(state) = self.segments.get_mut(outcome.segment) else {
            warn!(
                "Outcome for unknown segment {} counted globally only",
                outcome.segment
            );
            return;
        };
        state.stats.record(outcome);

        let completed = state.stats.completed();
        let target = state.ramp.total_connections;
        if completed < target {
            return;
        }

        if state.reported {
            warn!(
                "Segment {} received {} outcomes, expected {}",
                state.ramp.index, completed, target
            );
            return;
        }

        state.reported = true;
        let snapshot = state.stats.snapshot();
        self.sink.segment_complete(&state.ramp, &snapshot);
    }

    pub fn global_completed(&self) -> u64 {
        self.global.completed()
    }

    /// Emits the final report and returns the global snapshot. Segments that
    /// never reported (those scheduled for zero connections) are reported
    /// first.
    pub fn finish(mut self) -> StatsSnapshot {
        for state in self.segments.iter_mut().filter(|s| !s.reported) {
            if state.stats.completed() < state.ramp.total_connections {
                warn!(
                    "Segment {} finished with {} of {} outcomes",
                    state.ramp.index,
                    state.stats.completed(),
                    state.ramp.total_connections
                );
            }
            state.reported = true;
            let snapshot = state.stats.snapshot();
            self.sink.segment_complete(&state.ramp, &snapshot);
        }

        let snapshot = self.global.snapshot();
        self.sink.run_complete(&snapshot);
        snapshot
    }

    /// Consumes outcomes until `done` fires, then reports and returns the
    /// global snapshot. Queued outcomes always win over the done signal.
    pub async fn run(
        mut self,
        mut outcomes: mpsc::UnboundedReceiver<ConnectionOutcome>,
        mut done: oneshot::Receiver<()>,
    ) -> StatsSnapshot {
        loop {
            tokio::select! {
                biased;

                Some(outcome) = outcomes.recv() => self.ingest(&outcome),

                _ = &mut done => break,
            }
        }

        while let Ok(outcome) = outcomes.try_recv() {
            self.ingest(&outcome);
        }

        debug!("Aggregator done after {} outcomes", self.global_completed());
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RampStage;
    use crate::report::tests::Collect;
    use crate::schedule::Schedule;

    fn outcome(segment: usize, millis: u64, error: &str) -> ConnectionOutcome {
        ConnectionOutcome {
            segment,
            dns_latency: Duration::from_millis(millis / 4),
            connect_latency: Duration::from_millis(millis / 2),
            overall_latency: Duration::from_millis(millis),
            success: error.is_empty(),
            timed_out: error.contains("timed out"),
            error: error.to_string(),
        }
    }

    fn segments() -> Vec<RampSegment> {
        // Totals: 2 + 3 = 5, then 3 + 3 = 6
        Schedule::build(&[
            RampStage {
                end_level: 3.0,
                duration_secs: 2,
            },
            RampStage {
                end_level: 3.0,
                duration_secs: 2,
            },
        ])
        .unwrap()
        .segments()
        .to_vec()
    }

    #[test]
    fn sketch_tracks_extremes_and_quantiles() {
        let mut sketch = LatencySketch::new();
        assert_eq!(sketch.summary(), LatencySummary::default());

        for ms in 1..=1_000u64 {
            sketch.record(Duration::from_millis(ms));
        }
        let summary = sketch.summary();
        assert_eq!(sketch.count(), 1_000);
        assert_eq!(summary.min, Duration::from_millis(1));
        assert_eq!(summary.max, Duration::from_millis(1_000));

        let p50 = summary.p50.as_millis() as i64;
        let p99 = summary.p99.as_millis() as i64;
        assert!((p50 - 500).abs() <= 25, "p50 = {p50}");
        assert!((p99 - 990).abs() <= 15, "p99 = {p99}");
        assert!(summary.p50 <= summary.p95 && summary.p95 <= summary.p99);
    }

    #[test]
    fn counts_outcomes_and_errors() {
        let mut stats = ConnectionStats::default();
        stats.record(&outcome(0, 40, ""));
        stats.record(&outcome(0, 80, "connect failed: refused"));
        stats.record(&outcome(0, 90, "connect failed: refused"));
        stats.record(&outcome(0, 200, "dial timed out after 10s"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 4);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.failure, 3);
        assert_eq!(snapshot.timeout, 1);
        assert_eq!(snapshot.overall.min, Duration::from_millis(40));
        assert_eq!(snapshot.overall.max, Duration::from_millis(200));
        assert_eq!(
            snapshot.errors,
            vec![
                ("connect failed: refused".to_string(), 2),
                ("dial timed out after 10s".to_string(), 1),
            ]
        );
    }

    #[test]
    fn segment_reports_once_when_target_reached() {
        let segments = segments();
        assert_eq!(segments[0].total_connections, 5);

        let collect = Collect::default();
        let mut aggregator = Aggregator::new(&segments, collect.clone());

        for _ in 0..4 {
            aggregator.ingest(&outcome(0, 10, ""));
        }
        assert!(collect.segments().is_empty());

        aggregator.ingest(&outcome(0, 10, ""));
        assert_eq!(collect.segments(), vec![(0, 5)]);

        // An unexpected extra outcome must not re-report.
        aggregator.ingest(&outcome(0, 10, ""));
        assert_eq!(collect.segments(), vec![(0, 5)]);
        assert_eq!(aggregator.global_completed(), 6);
    }

    #[test]
    fn unknown_segment_counts_globally() {
        let mut aggregator = Aggregator::new(&segments(), Collect::default());
        aggregator.ingest(&outcome(9, 10, ""));
        assert_eq!(aggregator.global_completed(), 1);
    }

    #[tokio::test]
    async fn run_drains_queued_outcomes_before_final_report() {
        let segments = segments();
        let collect = Collect::default();
        let aggregator = Aggregator::new(&segments, collect.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        for _ in 0..5 {
            tx.send(outcome(0, 10, "")).unwrap();
        }
        for _ in 0..6 {
            tx.send(outcome(1, 10, "connect failed: refused")).unwrap();
        }
        done_tx.send(()).unwrap();

        let global = aggregator.run(rx, done_rx).await;
        assert_eq!(global.completed, 11);
        assert_eq!(global.success, 5);
        assert_eq!(global.failure, 6);
        assert_eq!(collect.segments(), vec![(0, 5), (1, 6)]);
        assert_eq!(collect.finals(), 1);
    }

    #[test]
    fn finish_reports_empty_segments() {
        let segments = Schedule::build(&[
            RampStage {
                end_level: 0.0,
                duration_secs: 3,
            },
            RampStage {
                end_level: 1.0,
                duration_secs: 1,
            },
        ])
        .unwrap()
        .segments()
        .to_vec();
        assert_eq!(segments[0].total_connections, 0);

        let collect = Collect::default();
        let mut aggregator = Aggregator::new(&segments, collect.clone());
        aggregator.ingest(&outcome(1, 10, ""));
        let global = aggregator.finish();

        assert_eq!(global.completed, 1);
        assert_eq!(collect.segments(), vec![(1, 1), (0, 0)]);
        assert_eq!(collect.finals(), 1);
    }
}
