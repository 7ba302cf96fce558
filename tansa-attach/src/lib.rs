//! 実行中のプロセスへのアタッチ
//!
//! デバッグ対象側の [`AttachAgent`] はシグナルを受けるとフラグだけを立て、
//! インタプリタの安全点での [`AttachAgent::poll`] で要求ファイルを読んで接続します。
//! ランチャ側は [`inject`] で要求ファイルを書き、シグナルを送り、結果を待ちます。

pub mod agent;
pub mod injector;
pub mod request;

pub use agent::AttachAgent;
pub use injector::{exit_code, inject, inject_request};
pub use request::{armed_path, request_path, status_path, AttachRequest, AttachStatus, ALREADY_ATTACHED};

use std::path::PathBuf;
use std::time::Duration;
use tansa_core::SessionError;
use thiserror::Error;

/// アタッチのエラー
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid attach request: {0}")]
    InvalidRequest(String),

    #[error("no such process: {0}")]
    NoSuchProcess(u32),

    #[error("failed to signal the process: {0}")]
    Signal(#[from] nix::Error),

    #[error("failed to install the attach signal handler: {0}")]
    Arm(nix::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("already attached")]
    AlreadyAttached,

    #[error("target rejected the attach: {0}")]
    Rejected(String),

    #[error("process {0} has not enabled attaching")]
    NotArmed(u32),

    #[error("no answer from the target within {0:?}")]
    Timeout(Duration),
}

/// アタッチ処理の結果型
pub type Result<T> = std::result::Result<T, AttachError>;
