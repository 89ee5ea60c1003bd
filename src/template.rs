//! CSV-backed message templating.
//!
//! A message template refers to data columns with `${N}` placeholders, where
//! `N` is a zero-based column index. Every usable data row yields one resolved
//! payload.

use std::path::Path;

use tracing::{debug, info};

use crate::error::TemplateError;

/// Reads at most `limit` usable rows. Rows with any empty column are skipped.
pub fn load_rows(path: &Path, limit: usize) -> Result<Vec<Vec<String>>, TemplateError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|source| TemplateError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;

    for record in reader.records() {
        if rows.len() >= limit {
            break;
        }

        let record = record.map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if record.iter().any(str::is_empty) {
            skipped += 1;
            continue;
        }

        rows.push(record.iter().map(str::to_owned).collect());
    }

    info!(
        "Loaded {} data rows from {:?} ({} skipped with empty columns)",
        rows.len(),
        path,
        skipped
    );

    Ok(rows)
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Column { index: usize, token: String },
}

/// A message split into literal text and column placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(message: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = message;

        while let Some(start) = rest.find("${") {
            let Some(len) = rest[start + 2..].find('}') else {
                break;
            };
            let token = &rest[start..start + 2 + len + 1];
            let inner = &token[2..token.len() - 1];

            // Non-numeric placeholders are left as literal text.
            let Ok(index) = inner.trim().parse::<usize>() else {
                segments.push(Segment::Text(rest[..start + token.len()].to_owned()));
                rest = &rest[start + token.len()..];
                continue;
            };

            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_owned()));
            }
            segments.push(Segment::Column {
                index,
                token: token.to_owned(),
            });
            rest = &rest[start + token.len()..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_owned()));
        }

        Self { segments }
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Column { .. }))
    }

    /// Placeholders whose column is missing from `row` stay unresolved.
    pub fn render(&self, row: &[String]) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Column { index, token } => match row.get(*index) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(token),
                },
            }
        }
        out
    }
}

/// Resolves `message` against every row, in row order.
pub fn resolve(message: &str, rows: &[Vec<String>]) -> Vec<String> {
    let template = Template::parse(message);
    if !template.has_placeholders() {
        debug!("Templated message has no column placeholders");
    }
    rows.iter().map(|row| template.render(row)).collect()
}
