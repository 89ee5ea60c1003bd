//! WebSocket connection-rate load generator.
//!
//! A ramp profile is expanded into a per-second [`Schedule`], replayed in
//! 10 ms ticks, and every scheduled connection runs a [`Script`] in its own
//! task. Outcomes stream into a single [`Aggregator`] that reports each ramp
//! segment once it completes and the whole run at the end.

pub mod config;
pub mod driver;
pub mod error;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod script;
pub mod stats;
pub mod template;

pub use config::{Cli, RampStage, RunConfig, RunFile, StepConfig};
pub use driver::{run_connection, ConnectionOutcome};
pub use error::{ConfigError, DialError, Error, Result, TemplateError};
pub use report::{LogReport, ReportSink};
pub use runner::{RunSummary, Runner};
pub use schedule::{RampSegment, Schedule, ScheduledBucket, SubSecondPacer};
pub use script::{Payload, Script, Step};
pub use stats::{Aggregator, LatencySketch, LatencySummary, StatsSnapshot};
