//! エラー型の定義

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// インタプリタ側での評価エラー
///
/// 条件式、ウォッチ式、変数の書き換えなど、ターゲットのコードを
/// 実行した結果として発生した例外を表します。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{type_name}: {message}")]
pub struct EvalError {
    pub type_name: String,
    pub message: String,
}

impl EvalError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

/// インタプリタのフック操作で発生するエラー
#[derive(Debug, Error)]
pub enum HostError {
    #[error("a trace hook is already installed")]
    HookAlreadyInstalled,

    #[error("hook mode not supported by this runtime: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// デバッガ操作のエラー
///
/// コマンドレイヤではこのエラーが `kind` と `message` の組に変換され、
/// コントローラに返されます。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebugError {
    #[error("unknown thread: {0}")]
    UnknownThread(u64),

    #[error("thread {0} is not suspended")]
    NotSuspended(u64),

    #[error("stale frame handle: thread {thread_id} epoch {epoch} frame {frame_index}")]
    StaleFrame {
        thread_id: u64,
        epoch: u64,
        frame_index: usize,
    },

    #[error("unknown breakpoint: {0}")]
    UnknownBreakpoint(u64),

    #[error("invalid breakpoint: {0}")]
    InvalidBreakpoint(String),

    #[error("unknown custom frame: {0}")]
    UnknownCustomFrame(u64),

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error(transparent)]
    Evaluation(#[from] EvalError),

    #[error("timed out waiting for thread {0}")]
    Timeout(u64),

    #[error("debugger is detached")]
    Detached,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DebugError {
    /// ワイヤ上で使うエラー種別
    pub fn kind(&self) -> &'static str {
        match self {
            DebugError::UnknownThread(_) => "unknown_thread",
            DebugError::NotSuspended(_) => "not_suspended",
            DebugError::StaleFrame { .. } => "stale_frame",
            DebugError::UnknownBreakpoint(_) => "unknown_breakpoint",
            DebugError::InvalidBreakpoint(_) => "invalid_breakpoint",
            DebugError::UnknownCustomFrame(_) => "unknown_custom_frame",
            DebugError::VariableNotFound(_) => "variable_not_found",
            DebugError::Evaluation(_) => "evaluation_failed",
            DebugError::Timeout(_) => "timeout",
            DebugError::Detached => "detached",
            DebugError::Internal(_) => "internal",
        }
    }
}

/// セッション確立（アタッチ・起動）のエラー
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to install trace hook: {0}")]
    HookInstall(#[from] HostError),

    #[error("already attached")]
    AlreadyAttached,

    #[error("failed to start debugger thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 設定値のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
}
