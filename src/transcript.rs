//! Append-only transcript store.
//!
//! Each call contributes one block — a header with the call sid, direction
//! and timing, then the turns in occurrence order — appended to a per-day
//! file and to the long-lived `voice-calls.md` archive. Files are opened in
//! append mode per call, so sessions never interleave within a block.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::session::CallDirection;

/// One transcript entry. Immutable once appended; ordered by occurrence
/// within a call.
#[derive(Debug, Clone)]
pub enum Turn {
    Caller {
        at: DateTime<Utc>,
        text: String,
    },
    Assistant {
        at: DateTime<Utc>,
        text: String,
    },
    Tool {
        at: DateTime<Utc>,
        name: String,
        arguments: serde_json::Value,
        result: serde_json::Value,
        success: bool,
    },
}

/// Everything the store needs to persist one finished call.
#[derive(Debug)]
pub struct CallRecord {
    pub call_sid: String,
    pub direction: CallDirection,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("Failed to write transcript to {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append a finished call to today's file and the archive.
    pub fn append(&self, record: &CallRecord) -> Result<(), TranscriptError> {
        let block = format_call(record);

        let day = record.ended_at.format("%Y-%m-%d").to_string();
        let daily = self.dir.join(format!("{day}.md"));
        append_to(&daily, Some(&format!("# Voice calls — {day}\n\n")), &block)?;

        let archive = self.dir.join("voice-calls.md");
        append_to(&archive, None, &block)?;

        tracing::info!(
            call_sid = %record.call_sid,
            turns = record.turns.len(),
            path = %daily.display(),
            "Transcript written"
        );
        Ok(())
    }
}

fn append_to(path: &Path, header_if_new: Option<&str>, block: &str) -> Result<(), TranscriptError> {
    let wrap = |source| TranscriptError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }

    let is_new = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)?;

    if is_new {
        if let Some(header) = header_if_new {
            file.write_all(header.as_bytes()).map_err(wrap)?;
        }
    }
    file.write_all(block.as_bytes()).map_err(wrap)?;
    Ok(())
}

fn format_call(record: &CallRecord) -> String {
    let duration = (record.ended_at - record.started_at).num_seconds().max(0);
    let mut out = format!(
        "## Call {} ({})\n\n**Started:** {}  \n**Ended:** {}  \n**Duration:** {}s\n\n",
        record.call_sid,
        record.direction,
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        record.ended_at.format("%Y-%m-%d %H:%M:%S UTC"),
        duration,
    );

    for turn in &record.turns {
        match turn {
            Turn::Caller { at, text } => {
                out.push_str(&format!("**Caller** [{}]: {text}\n\n", at.format("%H:%M:%S")));
            }
            Turn::Assistant { at, text } => {
                out.push_str(&format!(
                    "**Assistant** [{}]: {text}\n\n",
                    at.format("%H:%M:%S")
                ));
            }
            Turn::Tool {
                at,
                name,
                arguments,
                result,
                success,
            } => {
                let verdict = if *success { "ok" } else { "failed" };
                out.push_str(&format!(
                    "*Tool {name}({arguments}) [{}] → {verdict}: `{result}`*\n\n",
                    at.format("%H:%M:%S")
                ));
            }
        }
    }

    out.push_str("---\n\n");
    out
}
