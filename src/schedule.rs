use std::time::Duration;

use hdrhistogram::Histogram;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{validate_ramp, RampStage};
use crate::error::Result;

/// Sub-second pacing resolution: one second is replayed as this many ticks.
pub const TICKS_PER_SECOND: u64 = 100;

/// Length of one pacing tick.
pub const TICK: Duration = Duration::from_millis(10);

/// Carry is tracked in hundredths of a connection.
const CARRY_UNIT: u64 = 100;

// =============================================================================
// Ramp Segments
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RampSegment {
    pub index: usize,
    pub start_level: f64,
    pub end_level: f64,
    pub duration_secs: u64,
    /// Realized number of connections, i.e. the sum of this segment's bucket
    /// counts. Differs from `end_level` through rounding.
    pub total_connections: u64,
}

/// Connections to open during one second of the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBucket {
    pub segment: usize,
    pub count: u64,
    pub increment_per_second: f64,
}

/// Rounds half away from zero, so 2.5 becomes 3 and -2.5 becomes -3.
pub fn round_half_away_from_zero(level: f64) -> i64 {
    level.round() as i64
}

#[derive(Debug, Clone)]
pub struct Schedule {
    segments: Vec<RampSegment>,
    buckets: Vec<ScheduledBucket>,
    total_connections: u64,
}

impl Schedule {
    /// Expands the ramp into one bucket per second. Performs no I/O; the only
    /// failure is an invalid ramp.
    pub fn build(ramp: &[RampStage]) -> Result<Self> {
        validate_ramp(ramp)?;

        let total_secs: i64 = ramp.iter().map(|s| s.duration_secs).sum();
        let mut buckets = Vec::with_capacity(total_secs as usize);
        let mut segments = Vec::with_capacity(ramp.len());
        let mut total_connections = 0u64;
        let mut level = 0.0f64;

        for (index, stage) in ramp.iter().enumerate() {
            let start_level = level;
            let increment = (stage.end_level - start_level) / stage.duration_secs as f64;
            let mut segment_total = 0u64;

            for _ in 0..stage.duration_secs {
                level += increment;
                let count = round_half_away_from_zero(level).max(0) as u64;

                segment_total += count;
                total_connections += count;
                buckets.push(ScheduledBucket {
                    segment: index,
                    count,
                    increment_per_second: increment,
                });
            }
            // The next segment starts exactly where this one was configured to end.
            level = stage.end_level;

            debug!(
                "Segment {}: start={} end={} duration={}s total={}",
                index, start_level, stage.end_level, stage.duration_secs, segment_total
            );

            segments.push(RampSegment {
                index,
                start_level,
                end_level: stage.end_level,
                duration_secs: stage.duration_secs as u64,
                total_connections: segment_total,
            });
        }

        Ok(Self {
            segments,
            buckets,
            total_connections,
        })
    }

    pub fn segments(&self) -> &[RampSegment] {
        &self.segments
    }

    pub fn buckets(&self) -> &[ScheduledBucket] {
        &self.buckets
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.buckets.len() as u64)
    }

    /// Replays the schedule in real time, calling `launch` once per connection
    /// to open with that connection's segment index. `launch` must not block;
    /// it is expected to hand the connection off to its own task.
    pub async fn replay<F>(&self, mut launch: F) -> Result<PacingSkew>
    where
        F: FnMut(usize),
    {
        let mut skew = PacingSkew::new()?;
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut slot_start = Instant::now();

        for (second, bucket) in self.buckets.iter().enumerate() {
            if bucket.count > 0 {
                debug!(
                    "Second {}: opening {} connections (segment {})",
                    second, bucket.count, bucket.segment
                );
            }

            let mut pacer = SubSecondPacer::new(bucket.count);
            for _ in 0..TICKS_PER_SECOND {
                for _ in 0..pacer.tick() {
                    launch(bucket.segment);
                }

                ticker.tick().await;
                let now = Instant::now();
                skew.record(now.duration_since(slot_start));
                slot_start = now;
            }

            for _ in 0..pacer.finish() {
                launch(bucket.segment);
            }
        }

        skew.log();
        Ok(skew)
    }
}

// =============================================================================
// Sub-second Pacing
// =============================================================================

/// Spreads one second's connection count over 100 ticks.
///
/// Every tick opens `count / 100` connections. The remainder `count % 100`
/// (the fractional part of `count / 100`, in hundredths) accumulates in a
/// carry; a tick whose carry exceeds one whole connection opens an extra one.
/// Whatever is left above half a connection after the last tick is opened as
/// a single catch-up.
#[derive(Debug, Clone)]
pub struct SubSecondPacer {
    per_tick: u64,
    fractional: u64,
    carry: u64,
    ticks: u64,
}

impl SubSecondPacer {
    pub fn new(count: u64) -> Self {
        Self {
            per_tick: count / TICKS_PER_SECOND,
            fractional: count % TICKS_PER_SECOND,
            carry: 0,
            ticks: 0,
        }
    }

    /// Connections to open on the next tick.
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.carry += self.fractional;

        let mut opens = self.per_tick;
        // Strictly greater: a carry of exactly 1.00 waits for the next tick.
        if self.carry > CARRY_UNIT {
            self.carry -= CARRY_UNIT;
            opens += 1;
        }
        opens
    }

    /// End-of-second catch-up after all ticks have run.
    pub fn finish(self) -> u64 {
        debug_assert_eq!(self.ticks, TICKS_PER_SECOND);
        u64::from(self.carry > CARRY_UNIT / 2)
    }
}

// =============================================================================
// Pacing Skew
// =============================================================================

/// Lateness of each pacing tick relative to its 10 ms slot, in microseconds.
pub struct PacingSkew {
    late: Histogram<u64>,
}

impl PacingSkew {
    fn new() -> Result<Self> {
        Ok(Self {
            late: Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?,
        })
    }

    fn record(&mut self, slot: Duration) {
        let late = slot.saturating_sub(TICK).as_micros() as u64;
        self.late.saturating_record(late.max(1));
    }

    pub fn ticks(&self) -> u64 {
        self.late.len()
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.late.max())
    }

    pub fn p99(&self) -> Duration {
        Duration::from_micros(self.late.value_at_quantile(0.99))
    }

    fn log(&self) {
        if self.late.len() == 0 {
            return;
        }
        info!(
            "Pacing skew over {} ticks: p50={:?} p99={:?} max={:?}",
            self.ticks(),
            Duration::from_micros(self.late.value_at_quantile(0.50)),
            self.p99(),
            self.max()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(end_level: f64, duration_secs: i64) -> RampStage {
        RampStage {
            end_level,
            duration_secs,
        }
    }

    fn counts(schedule: &Schedule) -> Vec<u64> {
        schedule.buckets().iter().map(|b| b.count).collect()
    }

    #[test]
    fn linear_ramp_emits_instantaneous_levels() {
        let schedule = Schedule::build(&[stage(10.0, 5)]).unwrap();
        assert_eq!(counts(&schedule), vec![2, 4, 6, 8, 10]);
        assert_eq!(schedule.segments()[0].total_connections, 30);
        assert_eq!(schedule.total_connections(), 30);
        assert!(schedule
            .buckets()
            .iter()
            .all(|b| b.increment_per_second == 2.0));
    }

    #[test]
    fn segments_chain_start_levels() {
        let schedule = Schedule::build(&[stage(4.0, 2), stage(4.0, 3), stage(0.0, 2)]).unwrap();
        let segments = schedule.segments();
        assert_eq!(segments[0].start_level, 0.0);
        assert_eq!(segments[1].start_level, 4.0);
        assert_eq!(segments[2].start_level, 4.0);
        assert_eq!(counts(&schedule), vec![2, 4, 4, 4, 4, 2, 0]);
        assert_eq!(segments[2].total_connections, 2);
    }

    #[test]
    fn fractional_segments_chain_exact_end_levels() {
        let schedule = Schedule::build(&[stage(13.3, 6), stage(0.7, 3), stage(10.0, 3)]).unwrap();
        let segments = schedule.segments();
        assert_eq!(segments[1].start_level, 13.3);
        assert_eq!(segments[2].start_level, 0.7);
        for pair in segments.windows(2) {
            assert_eq!(pair[1].start_level, pair[0].end_level);
        }
        // 0.7 -> 10.0 over 3s: 3.8, 6.9, 10.0
        let tail: Vec<u64> = schedule.buckets()[9..].iter().map(|b| b.count).collect();
        assert_eq!(tail, vec![4, 7, 10]);
    }

    #[test]
    fn segment_totals_are_realized_sums() {
        let schedule = Schedule::build(&[stage(7.0, 3), stage(2.5, 4), stage(13.3, 6)]).unwrap();

        let mut grand = 0;
        for segment in schedule.segments() {
            let sum: u64 = schedule
                .buckets()
                .iter()
                .filter(|b| b.segment == segment.index)
                .map(|b| b.count)
                .sum();
            assert_eq!(sum, segment.total_connections);
            grand += sum;
        }
        assert_eq!(grand, schedule.total_connections());
    }

    #[test]
    fn rounding_goes_away_from_zero() {
        assert_eq!(round_half_away_from_zero(2.5), 3);
        assert_eq!(round_half_away_from_zero(-2.5), -3);
        assert_eq!(round_half_away_from_zero(2.49), 2);
        assert_eq!(round_half_away_from_zero(0.5), 1);

        // 0 -> 5 over 2s passes through 2.5
        let schedule = Schedule::build(&[stage(5.0, 2)]).unwrap();
        assert_eq!(counts(&schedule), vec![3, 5]);
        assert_eq!(schedule.total_connections(), 8);
    }

    #[test]
    fn rejects_zero_duration() {
        assert!(Schedule::build(&[stage(5.0, 0)]).is_err());
    }

    #[test]
    fn pacer_opens_exactly_count_per_second() {
        for count in 0..=1_000u64 {
            let mut pacer = SubSecondPacer::new(count);
            let mut opened = 0;
            for _ in 0..TICKS_PER_SECOND {
                opened += pacer.tick();
            }
            opened += pacer.finish();
            assert_eq!(opened, count, "count {count}");
        }
    }

    #[test]
    fn pacer_carry_needs_strictly_more_than_one() {
        // 0.50 per tick: carry reaches exactly 1.00 on tick 2 and only opens on tick 3.
        let mut pacer = SubSecondPacer::new(50);
        assert_eq!(pacer.tick(), 0);
        assert_eq!(pacer.tick(), 0);
        assert_eq!(pacer.tick(), 1);

        let mut rest = 1;
        for _ in 3..TICKS_PER_SECOND {
            rest += pacer.tick();
        }
        assert_eq!(rest, 49);
        assert_eq!(pacer.finish(), 1);
    }

    #[test]
    fn pacer_spreads_whole_ticks_evenly() {
        let mut pacer = SubSecondPacer::new(300);
        for _ in 0..TICKS_PER_SECOND {
            assert_eq!(pacer.tick(), 3);
        }
        assert_eq!(pacer.finish(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_launches_every_scheduled_connection() {
        let schedule = Schedule::build(&[stage(150.0, 2), stage(30.0, 1)]).unwrap();
        let mut per_segment = vec![0u64; schedule.segments().len()];

        let skew = schedule
            .replay(|segment| per_segment[segment] += 1)
            .await
            .unwrap();

        for segment in schedule.segments() {
            assert_eq!(per_segment[segment.index], segment.total_connections);
        }
        assert_eq!(skew.ticks(), 3 * TICKS_PER_SECOND);
    }
}
