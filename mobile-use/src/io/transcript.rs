//! Session transcripts and on-disk trace recording.
//!
//! A trace is written into a working directory while the session runs and is
//! renamed to `<traces>/<name>_PASS_<ts>` or `<traces>/<name>_FAIL_<ts>` once
//! the outcome is known.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::memory::{ReplanNote, SessionRecord};
use crate::core::types::{Action, DeviceState, Goal, SessionOutcome, StepRecord};

pub const TRANSCRIPT_FILE: &str = "transcript.json";
const TRACE_TS_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Serializable account of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTranscript {
    pub session_id: String,
    pub goal: Goal,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replan_notes: Vec<ReplanNote>,
    pub outcome: SessionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confirmed_state: Option<DeviceState>,
    pub attempted_actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
}

impl SessionTranscript {
    pub fn new(
        session_id: String,
        started_at: DateTime<Utc>,
        record: &SessionRecord,
        outcome: SessionOutcome,
    ) -> Self {
        Self {
            session_id,
            goal: record.goal().clone(),
            started_at,
            ended_at: Utc::now(),
            steps: record.steps().to_vec(),
            replan_notes: record.replan_notes().to_vec(),
            outcome,
            last_confirmed_state: record.last_confirmed_state().cloned(),
            attempted_actions: record.attempted_actions(),
            structured_output: None,
        }
    }

    /// The value reported to callers: structured output if any, else the outcome.
    pub fn result_value(&self) -> Result<Value> {
        match &self.structured_output {
            Some(output) => Ok(output.clone()),
            None => serde_json::to_value(&self.outcome).context("serialize session outcome"),
        }
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Writes per-step artifacts for one named session.
#[derive(Debug)]
pub struct TraceRecorder {
    output_root: PathBuf,
    name: String,
    work_dir: PathBuf,
    started_at: DateTime<Utc>,
}

impl TraceRecorder {
    /// Create the working directory `<output_root>/.<name>.<uuid>.partial`.
    pub fn create(output_root: &Path, name: &str) -> Result<Self> {
        let name = sanitize_name(name);
        let work_dir = output_root.join(format!(".{name}.{}.partial", Uuid::new_v4()));
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("create trace dir {}", work_dir.display()))?;
        info!(dir = %work_dir.display(), "recording trace");
        Ok(Self {
            output_root: output_root.to_path_buf(),
            name,
            work_dir,
            started_at: Utc::now(),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Write the state's screenshot as `state_<seq>.png`.
    ///
    /// Returns the file name relative to the trace directory, which stays valid
    /// after [`TraceRecorder::finish`] renames it.
    pub fn record_screenshot(&self, state: &DeviceState) -> Result<Option<PathBuf>> {
        let Some(shot) = &state.screenshot else {
            return Ok(None);
        };
        if shot.png.is_empty() {
            return Ok(None);
        }
        let name = PathBuf::from(format!("state_{:04}.png", state.seq));
        let path = self.work_dir.join(&name);
        fs::write(&path, shot.png.as_slice())
            .with_context(|| format!("write screenshot {}", path.display()))?;
        Ok(Some(name))
    }

    /// Write one appended step as `step_<n>.json`.
    pub fn record_step(&self, index: usize, step: &StepRecord) -> Result<PathBuf> {
        let path = self.work_dir.join(format!("step_{index:04}.json"));
        write_json(&path, step)?;
        debug!(path = %path.display(), "step recorded");
        Ok(path)
    }

    /// Write the transcript and move the trace to its final name.
    pub fn finish(self, transcript: &SessionTranscript) -> Result<PathBuf> {
        write_json(&self.work_dir.join(TRANSCRIPT_FILE), transcript)?;
        let status = if transcript.outcome.is_success() {
            "PASS"
        } else {
            "FAIL"
        };
        let final_dir = self.output_root.join(format!(
            "{}_{status}_{}",
            self.name,
            self.started_at.format(TRACE_TS_FORMAT)
        ));
        fs::rename(&self.work_dir, &final_dir).with_context(|| {
            format!(
                "rename trace {} to {}",
                self.work_dir.display(),
                final_dir.display()
            )
        })?;
        info!(dir = %final_dir.display(), "trace saved");
        Ok(final_dir)
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

pub fn read_transcript(path: &Path) -> Result<SessionTranscript> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
