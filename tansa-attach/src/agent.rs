//! デバッグ対象側のアタッチ処理
//!
//! シグナルハンドラはアトミックなフラグを立てるだけです。
//! 接続とフックのインストールは、インタプリタが安全点で呼ぶ
//! [`AttachAgent::poll`] の中で行います。

use crate::request::{
    armed_path, remove_if_exists, request_path, status_path, AttachRequest, AttachStatus,
};
use crate::{AttachError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::fs;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tansa_core::{DebuggerConfig, Runtime};
use tansa_proto::{connect_and_serve, ProtocolSession};

/// アタッチを要求するシグナル
pub const ATTACH_SIGNAL: Signal = Signal::SIGUSR2;

static ATTACH_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_attach_signal(_: c_int) {
    ATTACH_REQUESTED.store(true, Ordering::Release);
}

/// アタッチエージェント
pub struct AttachAgent {
    runtime: Arc<dyn Runtime>,
    config: DebuggerConfig,
    session: Mutex<Option<ProtocolSession>>,
    armed: AtomicBool,
}

impl AttachAgent {
    pub fn new(runtime: Arc<dyn Runtime>, config: DebuggerConfig) -> Self {
        Self {
            runtime,
            config,
            session: Mutex::new(None),
            armed: AtomicBool::new(false),
        }
    }

    /// シグナルハンドラをインストールする
    ///
    /// インストール後に導入済みファイルを書き、ランチャがシグナルを送れるようにします。
    /// 2回目以降の呼び出しは何もしません。
    pub fn arm(&self) -> Result<()> {
        if self.armed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let action = SigAction::new(
            SigHandler::Handler(on_attach_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // ハンドラはアトミック変数への書き込みしか行わない
        if let Err(err) = unsafe { signal::sigaction(ATTACH_SIGNAL, &action) } {
            self.armed.store(false, Ordering::Release);
            return Err(AttachError::Arm(err));
        }
        tracing::debug!("attach handler installed for {:?}", ATTACH_SIGNAL);

        let marker = armed_path(std::process::id());
        if let Err(source) = fs::write(&marker, format!("{}\n", std::process::id())) {
            self.armed.store(false, Ordering::Release);
            return Err(AttachError::Io {
                path: marker,
                source,
            });
        }
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// シグナルを経由せずにアタッチを要求する
    pub fn request(&self) {
        ATTACH_REQUESTED.store(true, Ordering::Release);
    }

    /// 安全点での確認
    ///
    /// 要求が無ければアトミック変数を1回読むだけです。
    /// 要求を処理した場合はその結果を返します（結果ファイルにも書かれます）。
    pub fn poll(&self) -> Option<AttachStatus> {
        if !ATTACH_REQUESTED.load(Ordering::Acquire) {
            return None;
        }
        if !ATTACH_REQUESTED.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(self.handle_request(std::process::id()))
    }

    /// 既に接続済みのセッションを引き受ける
    ///
    /// 以後のアタッチ要求は、このセッションが生きている間拒否されます。
    pub fn adopt(&self, session: ProtocolSession) {
        *self.session.lock() = Some(session);
    }

    /// 現在のセッションが生きているか
    pub fn is_attached(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(ProtocolSession::is_active)
    }

    /// 現在のセッションを閉じる
    pub fn detach(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
        }
    }

    /// ターゲットの終了をコントローラに通知してセッションを閉じる
    pub fn process_exiting(&self, exit_code: i32) {
        if let Some(session) = self.session.lock().take() {
            session.debugger().process_exiting(exit_code);
        }
    }

    fn handle_request(&self, pid: u32) -> AttachStatus {
        let status = match self.attach(pid) {
            Ok(()) => AttachStatus::Ok,
            Err(err) => {
                tracing::warn!("attach failed: {}", err);
                AttachStatus::Error(err.to_string())
            }
        };
        if let Err(err) = status.write(&status_path(pid)) {
            tracing::warn!("failed to write attach status: {}", err);
        }
        status
    }

    fn attach(&self, pid: u32) -> Result<()> {
        let path = request_path(pid);
        let request = AttachRequest::read(&path);
        remove_if_exists(&path)?;
        let request = request?;

        let mut session = self.session.lock();
        if session.as_ref().is_some_and(ProtocolSession::is_active) {
            return Err(AttachError::AlreadyAttached);
        }

        let mut config = self.config.clone();
        if let Some(strategy) = request.interception {
            config.interception = strategy;
        }
        tracing::info!("attaching to controller at {}", request.address);
        *session = Some(connect_and_serve(self.runtime.clone(), config, &request.address)?);
        Ok(())
    }
}

impl Drop for AttachAgent {
    fn drop(&mut self) {
        self.detach();
        if self.is_armed() {
            if let Err(err) = remove_if_exists(&armed_path(std::process::id())) {
                tracing::warn!("failed to remove attach marker: {}", err);
            }
        }
    }
}
