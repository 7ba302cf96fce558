//! プロトコルのメッセージ定義
//!
//! 1行に1つのJSONオブジェクトを置きます。全メッセージに共通の
//! `type`（`command` / `response` / `event`）と `seq` を持ちます。
//!
//! ```text
//! {"type":"command","seq":1,"command":"set_breakpoint","arguments":{"file":"a.src","line":10}}
//! {"type":"response","seq":1,"success":true,"body":{"id":1,...}}
//! {"type":"event","seq":2,"event":"thread_suspended","body":{"thread_id":1,...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tansa_core::{BreakpointId, CustomFrameId, DebugError, DebugEvent, SuspendPolicy};

/// プロトコルのバージョン
pub const PROTOCOL_VERSION: u32 = 1;

/// コントローラからのコマンド
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arguments", rename_all = "snake_case")]
pub enum Request {
    Version,
    SetBreakpoint {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hit_count: Option<u32>,
        #[serde(default)]
        suspend_policy: SuspendPolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_message: Option<String>,
    },
    ClearBreakpoint {
        id: BreakpointId,
    },
    ClearFileBreakpoints {
        file: String,
    },
    SetExceptionBreakpoint {
        type_name: String,
        #[serde(default = "default_true")]
        on_raise: bool,
        #[serde(default)]
        on_uncaught: bool,
    },
    ClearExceptionBreakpoint {
        type_name: String,
    },
    ListBreakpoints,
    ListThreads,
    GetStack {
        thread_id: u64,
    },
    GetVariables {
        thread_id: u64,
        epoch: u64,
        frame_index: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        path: Vec<String>,
        #[serde(default)]
        offset: usize,
    },
    GetCustomFrameVariables {
        frame_id: CustomFrameId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        path: Vec<String>,
        #[serde(default)]
        offset: usize,
    },
    Evaluate {
        thread_id: u64,
        epoch: u64,
        frame_index: usize,
        expression: String,
    },
    SetVariable {
        thread_id: u64,
        epoch: u64,
        frame_index: usize,
        name: String,
        value: String,
    },
    StepInto {
        thread_id: u64,
    },
    StepOver {
        thread_id: u64,
    },
    StepReturn {
        thread_id: u64,
    },
    Resume {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<u64>,
    },
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<u64>,
    },
    KillThread {
        thread_id: u64,
    },
    Detach,
}

fn default_true() -> bool {
    true
}

impl Request {
    /// コマンド名（ログ用）
    pub fn name(&self) -> &'static str {
        match self {
            Request::Version => "version",
            Request::SetBreakpoint { .. } => "set_breakpoint",
            Request::ClearBreakpoint { .. } => "clear_breakpoint",
            Request::ClearFileBreakpoints { .. } => "clear_file_breakpoints",
            Request::SetExceptionBreakpoint { .. } => "set_exception_breakpoint",
            Request::ClearExceptionBreakpoint { .. } => "clear_exception_breakpoint",
            Request::ListBreakpoints => "list_breakpoints",
            Request::ListThreads => "list_threads",
            Request::GetStack { .. } => "get_stack",
            Request::GetVariables { .. } => "get_variables",
            Request::GetCustomFrameVariables { .. } => "get_custom_frame_variables",
            Request::Evaluate { .. } => "evaluate",
            Request::SetVariable { .. } => "set_variable",
            Request::StepInto { .. } => "step_into",
            Request::StepOver { .. } => "step_over",
            Request::StepReturn { .. } => "step_return",
            Request::Resume { .. } => "resume",
            Request::Pause { .. } => "pause",
            Request::KillThread { .. } => "kill_thread",
            Request::Detach => "detach",
        }
    }
}

/// エラー応答の内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&DebugError> for ErrorBody {
    fn from(err: &DebugError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// コマンドへの応答（`seq` は対応するコマンドの `seq`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(seq: u64, body: Value) -> Self {
        Self {
            seq,
            success: true,
            body: Some(body),
            error: None,
        }
    }

    pub fn error(seq: u64, kind: &str, message: impl Into<String>) -> Self {
        Self {
            seq,
            success: false,
            body: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn from_result<T: Serialize>(seq: u64, result: Result<T, DebugError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(body) => Self::ok(seq, body),
                Err(err) => Self::error(seq, "internal", err.to_string()),
            },
            Err(err) => Self {
                seq,
                success: false,
                body: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }
}

/// ワイヤ上の1メッセージ
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command { seq: u64, request: Request },
    Response(Response),
    Event { seq: u64, event: DebugEvent },
}

impl Message {
    pub fn seq(&self) -> u64 {
        match self {
            Message::Command { seq, .. } | Message::Event { seq, .. } => *seq,
            Message::Response(response) => response.seq,
        }
    }
}
