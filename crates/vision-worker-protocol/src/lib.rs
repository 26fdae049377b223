//! IPC protocol types for host ↔ vision worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.
//! Every message carries a `type` discriminator. Field names follow the
//! host's existing wire format, including the camel-cased `errMsg`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Commands the host sends to the worker via stdin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Load the vision model (no-op when already loaded).
    Init {
        model_path: String,
        /// Multimodal projector. Looked up next to the model when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mmproj_path: Option<String>,
    },
    /// Summarize one image.
    Process { image_path: String, task_id: String },
    /// Drain the pool and exit.
    Shutdown,
}

impl Command {
    /// Wire name of the command type, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Process { .. } => "process",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Messages the worker writes to stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputMessage {
    /// Informational line for the host's log.
    Log { msg: String },
    /// Outcome of an `init` command.
    InitResult {
        success: bool,
        /// Seconds spent handling the command.
        elapsed_time: f64,
        #[serde(rename = "errMsg", default, skip_serializing_if = "Option::is_none")]
        err_msg: Option<String>,
    },
    /// The task was queued; its `result` follows later.
    TaskAccepted { task_id: String },
    /// Final outcome of a task.
    Result(TaskResult),
    /// Malformed command or failure not tied to a task.
    Error {
        #[serde(rename = "errMsg")]
        err_msg: String,
    },
}

impl OutputMessage {
    pub fn log(msg: impl Into<String>) -> Self {
        OutputMessage::Log { msg: msg.into() }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        OutputMessage::Error {
            err_msg: msg.into(),
        }
    }

    pub fn init_ok(elapsed: Duration) -> Self {
        OutputMessage::InitResult {
            success: true,
            elapsed_time: elapsed.as_secs_f64(),
            err_msg: None,
        }
    }

    pub fn init_failed(elapsed: Duration, reason: impl Into<String>) -> Self {
        OutputMessage::InitResult {
            success: false,
            elapsed_time: elapsed.as_secs_f64(),
            err_msg: Some(reason.into()),
        }
    }

    /// The task id this message refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            OutputMessage::TaskAccepted { task_id } => Some(task_id),
            OutputMessage::Result(result) => Some(&result.task_id),
            _ => None,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded { summary: String, elapsed: Duration },
    Failed { reason: String },
}

/// Payload of a `result` message.
///
/// Successful results carry `result` and `elapsed_time`; failed ones carry
/// `errMsg` only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    #[serde(rename = "errMsg", default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, outcome: TaskOutcome) -> Self {
        let task_id = task_id.into();
        match outcome {
            TaskOutcome::Succeeded { summary, elapsed } => Self {
                task_id,
                success: true,
                result: Some(summary),
                elapsed_time: Some(elapsed.as_secs_f64()),
                err_msg: None,
            },
            TaskOutcome::Failed { reason } => Self {
                task_id,
                success: false,
                result: None,
                elapsed_time: None,
                err_msg: Some(reason),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_parse_init_with_and_without_projector() {
        let cmd: Command = serde_json::from_str(
            r#"{"type":"init","model_path":"/m/qwen.gguf","mmproj_path":"/m/mmproj.gguf"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Init {
                model_path: "/m/qwen.gguf".into(),
                mmproj_path: Some("/m/mmproj.gguf".into()),
            }
        );

        let cmd: Command = serde_json::from_str(r#"{"type":"init","model_path":"/m/qwen.gguf"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Init {
                model_path: "/m/qwen.gguf".into(),
                mmproj_path: None,
            }
        );
        assert_eq!(cmd.kind(), "init");
    }

    #[test]
    fn test_parse_process_and_shutdown() {
        let cmd: Command =
            serde_json::from_str(r#"{"type":"process","image_path":"cat.jpg","task_id":"t1"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Process {
                image_path: "cat.jpg".into(),
                task_id: "t1".into(),
            }
        );

        let cmd: Command = serde_json::from_str(r#"{"type":"shutdown"}"#).unwrap();
        assert_eq!(cmd, Command::Shutdown);
    }

    #[test]
    fn test_reject_unknown_type_and_missing_fields() {
        assert!(serde_json::from_str::<Command>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"type":"process","image_path":"a.png"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"model_path":"x"}"#).is_err());
    }

    #[test]
    fn test_success_result_shape() {
        let msg = OutputMessage::Result(TaskResult::new(
            "t1",
            TaskOutcome::Succeeded {
                summary: "a cat on a sofa".into(),
                elapsed: Duration::from_millis(1500),
            },
        ));
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "result",
                "task_id": "t1",
                "success": true,
                "result": "a cat on a sofa",
                "elapsed_time": 1.5,
            })
        );
    }

    #[test]
    fn test_failed_result_shape() {
        let msg = OutputMessage::Result(TaskResult::new(
            "t2",
            TaskOutcome::Failed {
                reason: "image file does not exist: /tmp/x.png".into(),
            },
        ));
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "result",
                "task_id": "t2",
                "success": false,
                "errMsg": "image file does not exist: /tmp/x.png",
            })
        );
        assert_eq!(msg.task_id(), Some("t2"));
    }

    #[test]
    fn test_other_output_shapes() {
        assert_eq!(
            serde_json::to_value(OutputMessage::log("ready")).unwrap(),
            json!({"type": "log", "msg": "ready"})
        );
        assert_eq!(
            serde_json::to_value(OutputMessage::error("bad json")).unwrap(),
            json!({"type": "error", "errMsg": "bad json"})
        );
        assert_eq!(
            serde_json::to_value(OutputMessage::TaskAccepted { task_id: "t9".into() }).unwrap(),
            json!({"type": "task_accepted", "task_id": "t9"})
        );
        assert_eq!(
            serde_json::to_value(OutputMessage::init_ok(Duration::from_secs(2))).unwrap(),
            json!({"type": "init_result", "success": true, "elapsed_time": 2.0})
        );
        let failed = serde_json::to_value(OutputMessage::init_failed(Duration::ZERO, "no model")).unwrap();
        assert_eq!(failed["success"], json!(false));
        assert_eq!(failed["errMsg"], json!("no model"));
    }

    #[test]
    fn test_output_lines_parse_back() {
        let line = r#"{"type":"result","task_id":"t3","success":true,"result":"ok","elapsed_time":0.25}"#;
        let msg: OutputMessage = serde_json::from_str(line).unwrap();
        match msg {
            OutputMessage::Result(r) => {
                assert_eq!(r.task_id, "t3");
                assert_eq!(r.result.as_deref(), Some("ok"));
                assert_eq!(r.elapsed_time, Some(0.25));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
