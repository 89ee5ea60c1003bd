use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::driver::{run_connection, ConnectionOutcome};
use crate::error::{Error, Result};
use crate::report::ReportSink;
use crate::schedule::{PacingSkew, Schedule};
use crate::script::{DataCursor, Script};
use crate::stats::{Aggregator, StatsSnapshot};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub launched: u64,
    pub pacing: PacingSkew,
}

// =============================================================================
// Launcher
// =============================================================================

/// Hands each scheduled connection to its own task. Owned by the replay loop.
struct Launcher {
    target: Url,
    dial_timeout: Duration,
    script: Arc<Script>,
    cursor: DataCursor,
    limiter: Option<Arc<Semaphore>>,
    outcomes: mpsc::UnboundedSender<ConnectionOutcome>,
    completions: mpsc::UnboundedSender<()>,
    launched: u64,
}

impl Launcher {
    fn launch(&mut self, segment: usize) {
        let data_index = self.cursor.advance();
        let target = self.target.clone();
        let dial_timeout = self.dial_timeout;
        let script = Arc::clone(&self.script);
        let limiter = self.limiter.clone();
        let outcomes = self.outcomes.clone();
        let completions = self.completions.clone();
        self.launched += 1;

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(limiter) => limiter.acquire_owned().await.ok(),
                None => None,
            };

            let outcome = run_connection(&target, dial_timeout, &script, data_index, segment).await;

            // Outcome first: the aggregator must see it before the run can be
            // declared done.
            if outcomes.send(outcome).is_err() {
                warn!("Aggregator gone, dropping outcome for segment {}", segment);
            }
            let _ = completions.send(());
        });
    }
}

// =============================================================================
// Runner
// =============================================================================

pub struct Runner {
    target: Url,
    dial_timeout: Duration,
    script: Arc<Script>,
    schedule: Schedule,
    max_in_flight: Option<usize>,
}

impl Runner {
    pub fn new(target: Url, dial_timeout: Duration, script: Script, schedule: Schedule) -> Self {
        Self {
            target,
            dial_timeout,
            script: Arc::new(script),
            schedule,
            max_in_flight: None,
        }
    }

    /// Caps how many connections run at once. Launches past the cap still
    /// happen on schedule but wait for a slot before dialing.
    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.max_in_flight = limit.filter(|n| *n > 0);
        self
    }

    /// Replays the schedule, waits for every connection to report, then has
    /// the aggregator print the final report.
    pub async fn run<S>(self, sink: S) -> Result<RunSummary>
    where
        S: ReportSink + 'static,
    {
        let expected = self.schedule.total_connections();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let aggregator = Aggregator::new(self.schedule.segments(), sink);
        let aggregator = tokio::spawn(aggregator.run(outcome_rx, done_rx));

        let cursor = self.script.data_cursor();
        let mut launcher = Launcher {
            target: self.target,
            dial_timeout: self.dial_timeout,
            script: self.script,
            cursor,
            limiter: self.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
            outcomes: outcome_tx,
            completions: completion_tx,
            launched: 0,
        };

        let schedule = self.schedule;
        let replay = tokio::spawn(async move {
            let pacing = schedule.replay(|segment| launcher.launch(segment)).await?;
            debug!("Replay finished after {} launches", launcher.launched);
            Ok::<_, Error>((pacing, launcher.launched))
        });

        let mut progress = interval(PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        progress.tick().await;

        let mut completed = 0u64;
        while completed < expected {
            tokio::select! {
                signal = completion_rx.recv() => match signal {
                    Some(()) => completed += 1,
                    None => break,
                },

                _ = progress.tick() => {
                    info!("Progress: completed={}/{}", completed, expected);
                }
            }
        }

        // Exactly once: the sender is consumed here.
        let _ = done_tx.send(());

        let stats = aggregator
            .await
            .map_err(|e| Error::Task("aggregator", e))?;
        let (pacing, launched) = replay.await.map_err(|e| Error::Task("scheduler", e))??;

        if completed < expected {
            return Err(Error::CompletionsLost {
                completed,
                expected,
            });
        }

        Ok(RunSummary {
            stats,
            launched,
            pacing,
        })
    }
}
