//! アタッチ要求と結果のファイル
//!
//! ランチャとデバッグ対象は一時ディレクトリのファイルでやり取りします。
//! 要求ファイルは `key=value` 形式の行、結果ファイルは1行です。

use crate::{AttachError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tansa_core::InterceptionStrategy;

/// 結果ファイルで既存セッションを表すメッセージ
pub const ALREADY_ATTACHED: &str = "already attached";

/// 要求ファイルのパス
pub fn request_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("tansa-attach-{}.request", pid))
}

/// 結果ファイルのパス
pub fn status_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("tansa-attach-{}.status", pid))
}

/// シグナルハンドラ導入済みを示すファイルのパス
///
/// このファイルが無いプロセスにはシグナルを送りません。
pub fn armed_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("tansa-attach-{}.armed", pid))
}

/// アタッチ要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    /// コントローラのアドレス（`host:port`）
    pub address: String,
    /// インターセプト方式の指定
    pub interception: Option<InterceptionStrategy>,
}

impl AttachRequest {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            interception: None,
        }
    }

    /// 要求ファイルの内容を解析する
    ///
    /// 空行と `#` で始まる行は無視します。
    pub fn parse(text: &str) -> Result<Self> {
        let mut address = None;
        let mut interception = None;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| AttachError::InvalidRequest(format!("not a key=value line: {}", line)))?;
            match key.trim() {
                "address" => address = Some(value.trim().to_string()),
                "interception" => {
                    let strategy = value.trim().parse().map_err(|_| {
                        AttachError::InvalidRequest(format!("unknown interception: {}", value.trim()))
                    })?;
                    interception = Some(strategy);
                }
                other => tracing::debug!("ignoring attach request key {}", other),
            }
        }

        match address {
            Some(address) if !address.is_empty() => Ok(Self {
                address,
                interception,
            }),
            _ => Err(AttachError::InvalidRequest("missing address".into())),
        }
    }

    pub fn render(&self) -> String {
        let mut text = format!("address={}\n", self.address);
        if let Some(strategy) = self.interception {
            text.push_str(&format!("interception={}\n", strategy));
        }
        text
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| AttachError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.render())
    }
}

/// アタッチの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachStatus {
    Ok,
    Error(String),
}

impl AttachStatus {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text == "ok" {
            return AttachStatus::Ok;
        }
        match text.strip_prefix("error:") {
            Some(message) => AttachStatus::Error(message.trim().to_string()),
            None => AttachStatus::Error(format!("unrecognized status: {}", text)),
        }
    }

    pub fn render(&self) -> String {
        match self {
            AttachStatus::Ok => "ok\n".to_string(),
            AttachStatus::Error(message) => format!("error: {}\n", message),
        }
    }

    /// 結果ファイルを読む（まだ無ければ `None`）
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(Self::parse(&text))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AttachError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.render())
    }
}

/// 一時ファイルに書いてから名前を変える
///
/// 読み手が書きかけの内容を見ることはありません。
fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let io_error = |source| AttachError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, contents).map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)
}

/// ファイルが無くても成功扱いで削除する
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(AttachError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
