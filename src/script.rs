use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::StepConfig;
use crate::error::ConfigError;
use crate::template;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent verbatim on every connection.
    Raw(String),
    /// One resolved payload per data row, picked by the connection's data index.
    Templated(Arc<Vec<String>>),
}

impl Payload {
    /// Wraps around when there are more connections than payloads.
    pub fn resolve(&self, data_index: usize) -> &str {
        match self {
            Payload::Raw(text) => text,
            Payload::Templated(payloads) => payloads
                .get(data_index % payloads.len().max(1))
                .map_or("", String::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Message(Payload),
    Sleep(Duration),
    Disconnect,
    Unsupported(String),
}

/// The ordered steps every connection runs after a successful dial.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
    data_len: usize,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        let data_len = steps
            .iter()
            .filter_map(|step| match step {
                Step::Message(Payload::Templated(payloads)) => Some(payloads.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        Self { steps, data_len }
    }

    /// Builds the script from configured steps, resolving templated messages
    /// against `rows`. Without rows, templated messages are sent unresolved.
    pub fn from_config(steps: &[StepConfig], rows: &[Vec<String>]) -> Result<Self, ConfigError> {
        let mut script = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let step = match step.kind.as_str() {
                "message" => {
                    let text = step.payload_text(index)?;
                    if step.replace && !rows.is_empty() {
                        Step::Message(Payload::Templated(Arc::new(template::resolve(&text, rows))))
                    } else {
                        if step.replace {
                            warn!("Step {} uses templating but no data rows are loaded", index);
                        }
                        Step::Message(Payload::Raw(text))
                    }
                }
                "sleep" => Step::Sleep(Duration::from_secs(step.duration)),
                "disconnect" => Step::Disconnect,
                other => Step::Unsupported(other.to_string()),
            };
            script.push(step);
        }

        Ok(Self::new(script))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_templated(&self) -> bool {
        self.data_len > 0
    }

    /// Hands out data indexes round-robin over the templated payloads.
    pub fn data_cursor(&self) -> DataCursor {
        DataCursor {
            next: 0,
            len: self.data_len,
        }
    }
}

/// Round-robin payload index, owned by the scheduler.
#[derive(Debug, Clone)]
pub struct DataCursor {
    next: usize,
    len: usize,
}

impl DataCursor {
    pub fn advance(&mut self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let index = self.next;
        self.next = (self.next + 1) % self.len;
        index
    }
}
