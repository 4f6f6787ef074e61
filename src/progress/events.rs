//! Progress events published while a run executes.
//!
//! Serialized with a `type` tag so observers can switch on it:
//!
//! ```text
//! {"type":"init","run_id":"...","models":[...],"tasks":[...],"samples":1,"provider":"openrouter"}
//! {"type":"attempt","task_id":"...","model":"...","sample_index":0,"status":"pass",...}
//! {"type":"complete","summary":{...}}
//! {"type":"error","message":"..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::runner::result::{Attempt, AttemptStatus, RunSummary};

/// Snapshot of a finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub task_id: String,
    pub model: String,
    pub sample_index: u32,
    pub status: AttemptStatus,
    pub duration_seconds: f64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

impl From<&Attempt> for AttemptEvent {
    fn from(attempt: &Attempt) -> Self {
        Self {
            task_id: attempt.key.task_id.clone(),
            model: attempt.key.model.clone(),
            sample_index: attempt.key.sample_index,
            status: attempt.status,
            duration_seconds: attempt.duration_seconds,
            prompt_tokens: attempt.usage.map(|u| u.prompt_tokens),
            completion_tokens: attempt.usage.map(|u| u.completion_tokens),
            cost_usd: attempt.cost_usd,
            error: attempt.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Init {
        run_id: String,
        models: Vec<String>,
        tasks: Vec<String>,
        samples: u32,
        provider: String,
    },
    Attempt(AttemptEvent),
    Complete {
        summary: Box<RunSummary>,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    /// `complete` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Init { .. } => "init",
            ProgressEvent::Attempt(_) => "attempt",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
        }
    }
}

impl From<&Attempt> for ProgressEvent {
    fn from(attempt: &Attempt) -> Self {
        ProgressEvent::Attempt(AttemptEvent::from(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::result::{AttemptKey, TokenUsage};

    #[test]
    fn test_init_wire_format() {
        let event = ProgressEvent::Init {
            run_id: "r1".into(),
            models: vec!["m1".into()],
            tasks: vec!["t1".into()],
            samples: 2,
            provider: "openrouter".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "init");
        assert_eq!(json["run_id"], "r1");
        assert_eq!(json["samples"], 2);
    }

    #[test]
    fn test_attempt_wire_format_is_flat() {
        let mut attempt = Attempt::pending(AttemptKey::new("t1", "m1", 1));
        attempt.status = AttemptStatus::Fail;
        attempt.usage = Some(TokenUsage::new(12, 3));
        let json = serde_json::to_value(ProgressEvent::from(&attempt)).unwrap();
        assert_eq!(json["type"], "attempt");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["sample_index"], 1);
        assert_eq!(json["status"], "fail");
        assert_eq!(json["prompt_tokens"], 12);
        assert!(json["cost_usd"].is_null());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(ProgressEvent::error("boom").is_terminal());
        assert_eq!(ProgressEvent::error("boom").kind(), "error");
        let json = serde_json::to_string(&ProgressEvent::error("boom")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);
    }
}
