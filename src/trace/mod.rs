//! Per-session JSONL run trace.
//!
//! One file per chat session, one JSON object per line: `{"ts", "event", ...}`.
//! Trace writes never fail the caller; the first failure is logged once.

use anyhow::{Result, anyhow, bail};
use serde_json::{Map, Value, json};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::agent::{AgentAnswer, AgentProgressEvent};
use crate::sandbox::ExecutionOutcome;

const TRACE_DIR_NAME: &str = "ashare-agent/traces";

#[derive(Clone)]
pub struct SessionTrace {
    inner: Arc<TraceInner>,
}

struct TraceInner {
    writer: Mutex<BufWriter<File>>,
    file_path: PathBuf,
    write_failed: AtomicBool,
}

impl SessionTrace {
    /// Creates the trace under `trace_dir`, or the XDG state directory when
    /// none is configured.
    pub fn create(session_id: &str, trace_dir: Option<&Path>) -> Result<Self> {
        let trace_dir = match trace_dir {
            Some(dir) => dir.to_path_buf(),
            None => resolve_trace_dir_from_env()?,
        };
        Self::create_in_dir(session_id, &trace_dir)
    }

    fn create_in_dir(session_id: &str, trace_dir: &Path) -> Result<Self> {
        fs::create_dir_all(trace_dir).map_err(|err| {
            anyhow!(
                "Failed to create trace directory {}: {err}",
                trace_dir.display()
            )
        })?;

        let file_path = trace_dir.join(format!("session-{session_id}.jsonl"));
        let file = create_trace_file(&file_path)
            .map_err(|err| anyhow!("Failed to create trace file {}: {err}", file_path.display()))?;

        let trace = Self {
            inner: Arc::new(TraceInner {
                writer: Mutex::new(BufWriter::new(file)),
                file_path,
                write_failed: AtomicBool::new(false),
            }),
        };
        trace.record("session_start", json!({ "session_id": session_id }));
        Ok(trace)
    }

    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    pub fn log_question(&self, question: &str) {
        self.record("question", json!({ "text": question }));
    }

    pub fn log_python_input(&self, code: &str) {
        self.record("python_input", json!({ "code": code }));
    }

    pub fn log_execution(&self, session_id: &str, outcome: &ExecutionOutcome) {
        self.record(
            "execution",
            json!({
                "session_id": session_id,
                "success": outcome.success,
                "output": outcome.output,
                "error": outcome.error,
                "result": outcome.result,
            }),
        );
    }

    pub fn log_agent_event(&self, event: &AgentProgressEvent) {
        match event {
            AgentProgressEvent::StepStarted { step } => {
                self.record("model_start", json!({ "step": step }));
            }
            AgentProgressEvent::ModelResponse {
                step,
                thought_signatures,
                tool_calls,
                has_text,
            } => self.record(
                "model_end",
                json!({
                    "step": step,
                    "thought_signatures": thought_signatures,
                    "tool_calls": tool_calls,
                    "has_text": has_text,
                }),
            ),
            AgentProgressEvent::ToolRequest {
                step,
                id,
                name,
                args_json,
            } => self.record(
                "tool_call",
                json!({ "step": step, "id": id, "name": name, "args": args_json }),
            ),
            AgentProgressEvent::ToolResult {
                step,
                id,
                name,
                response_json,
                refused,
            } => self.record(
                if *refused { "guard_rejection" } else { "tool_result" },
                json!({ "step": step, "id": id, "name": name, "response": response_json }),
            ),
        }
    }

    pub fn log_answer(&self, answer: &AgentAnswer) {
        self.record(
            "answer",
            json!({ "text": answer.text, "degraded": answer.degraded }),
        );
    }

    pub fn log_error(&self, message: &str) {
        self.record("error", json!({ "message": message }));
    }

    fn record(&self, event: &str, fields: Value) {
        let mut line = Map::new();
        line.insert("ts".to_string(), Value::String(current_timestamp()));
        line.insert("event".to_string(), Value::String(event.to_string()));
        if let Value::Object(fields) = fields {
            line.extend(fields);
        }

        match serde_json::to_string(&Value::Object(line)) {
            Ok(text) => self.write_raw(&text),
            Err(err) => self.report_write_failure(&format!("failed to encode trace event: {err}")),
        }
    }

    fn write_raw(&self, line: &str) {
        let Ok(mut writer) = self.inner.writer.lock() else {
            self.report_write_failure("failed to acquire trace writer lock");
            return;
        };

        if writeln!(writer, "{line}").is_err() || writer.flush().is_err() {
            self.report_write_failure("failed to write to trace file");
        }
    }

    fn report_write_failure(&self, message: &str) {
        if !self.inner.write_failed.swap(true, Ordering::Relaxed) {
            warn!(path = %self.inner.file_path.display(), "trace disabled: {message}");
        }
    }
}

#[cfg(unix)]
fn create_trace_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_trace_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn current_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn resolve_trace_dir_from_env() -> Result<PathBuf> {
    let xdg_state = env::var("XDG_STATE_HOME").ok();
    let home = dirs::home_dir();
    resolve_trace_dir(xdg_state.as_deref(), home.as_deref())
}

fn resolve_trace_dir(xdg_state_home: Option<&str>, home_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(xdg) = xdg_state_home {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve trace path: XDG_STATE_HOME is set but empty");
        }
        return Ok(PathBuf::from(trimmed).join(TRACE_DIR_NAME));
    }

    let home = home_dir
        .ok_or_else(|| anyhow!("Failed to resolve trace path: HOME directory is unavailable"))?;
    Ok(home.join(".local/state").join(TRACE_DIR_NAME))
}
