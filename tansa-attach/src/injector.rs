//! ランチャ側のアタッチ処理

use crate::agent::ATTACH_SIGNAL;
use crate::request::{
    armed_path, remove_if_exists, request_path, status_path, AttachRequest, AttachStatus,
};
use crate::{AttachError, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::thread;
use std::time::{Duration, Instant};

/// 結果ファイルを確認する間隔
const STATUS_POLL: Duration = Duration::from_millis(50);

/// 実行中のプロセスにコントローラへの接続を要求する
pub fn inject(pid: u32, address: &str, timeout: Duration) -> Result<()> {
    inject_request(pid, &AttachRequest::new(address), timeout)
}

/// 要求内容を指定してアタッチする
///
/// 対象プロセスが結果ファイルを書くまで待ちます。
/// ハンドラを導入していないプロセスにはシグナルを送らず、`NotArmed` を返します。
pub fn inject_request(pid: u32, request: &AttachRequest, timeout: Duration) -> Result<()> {
    let target = i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| AttachError::NoSuchProcess(pid))?;
    kill(target, None).map_err(|_| AttachError::NoSuchProcess(pid))?;
    // SIGUSR2 の既定の動作はプロセスの終了
    if !armed_path(pid).is_file() {
        return Err(AttachError::NotArmed(pid));
    }

    let status = status_path(pid);
    let pending = request_path(pid);
    remove_if_exists(&status)?;
    request.write(&pending)?;

    tracing::debug!("signalling process {} to attach to {}", pid, request.address);
    if let Err(err) = kill(target, ATTACH_SIGNAL) {
        remove_if_exists(&pending)?;
        return Err(AttachError::Signal(err));
    }

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = AttachStatus::read(&status)? {
            remove_if_exists(&status)?;
            return match result {
                AttachStatus::Ok => Ok(()),
                AttachStatus::Error(message) => Err(AttachError::Rejected(message)),
            };
        }
        if Instant::now() >= deadline {
            remove_if_exists(&pending)?;
            return Err(AttachError::Timeout(timeout));
        }
        thread::sleep(STATUS_POLL);
    }
}

/// コマンドとしての終了コード
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(AttachError::Timeout(_)) => 2,
        Err(_) => 1,
    }
}
