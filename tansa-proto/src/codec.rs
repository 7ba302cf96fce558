//! 行区切りJSONのエンコード/デコード

use crate::message::{Message, Request, Response};
use serde_json::{Map, Value};
use std::io::{self, BufRead, Read, Write};
use tansa_core::DebugEvent;
use thiserror::Error;

/// 1行の最大バイト数
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// 引数を持たないコマンド
const UNIT_COMMANDS: &[&str] = &["version", "list_breakpoints", "list_threads", "detach"];

/// プロトコルのエラー
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("message exceeds {MAX_LINE_BYTES} bytes")]
    TooLong,

    #[error("sequence number {got} is not greater than {last}")]
    BadSequence { got: u64, last: u64 },

    #[error("controller sequence number {0} must be odd")]
    EvenSequence(u64),
}

impl ProtocolError {
    /// エラー応答に使う種別
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "io",
            ProtocolError::BadSequence { .. } | ProtocolError::EvenSequence(_) => "bad_sequence",
            ProtocolError::TooLong => "too_long",
            _ => "malformed",
        }
    }
}

/// メッセージを1行分のバイト列にする（末尾の改行を含む）
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let (kind, seq, mut value) = match message {
        Message::Command { seq, request } => ("command", *seq, serde_json::to_value(request)?),
        Message::Response(response) => ("response", response.seq, serde_json::to_value(response)?),
        Message::Event { seq, event } => ("event", *seq, serde_json::to_value(event)?),
    };
    let object = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;
    object.insert("type".into(), Value::from(kind));
    object.insert("seq".into(), Value::from(seq));

    let mut line = serde_json::to_vec(&value)?;
    line.push(b'\n');
    Ok(line)
}

/// 1行をメッセージにする
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let mut value: Value = serde_json::from_str(line.trim())?;
    let object = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;
    let kind = object
        .remove("type")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or(ProtocolError::MissingField("type"))?;
    let seq = object
        .get("seq")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("seq"))?;

    match kind.as_str() {
        "command" => {
            object.remove("seq");
            normalize_arguments(object)?;
            let request: Request = serde_json::from_value(value)?;
            Ok(Message::Command { seq, request })
        }
        "response" => {
            let response: Response = serde_json::from_value(value)?;
            Ok(Message::Response(response))
        }
        "event" => {
            object.remove("seq");
            let event: DebugEvent = serde_json::from_value(value)?;
            Ok(Message::Event { seq, event })
        }
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// `arguments` の省略を補う
fn normalize_arguments(object: &mut Map<String, Value>) -> Result<(), ProtocolError> {
    let command = object
        .get("command")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("command"))?;
    if UNIT_COMMANDS.contains(&command) {
        let empty = match object.get("arguments") {
            None | Some(Value::Null) => true,
            Some(Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        };
        if empty {
            object.remove("arguments");
        }
    } else if matches!(object.get("arguments"), None | Some(Value::Null)) {
        object.insert("arguments".into(), Value::Object(Map::new()));
    }
    Ok(())
}

/// メッセージを書き込んでフラッシュする
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    let line = encode(message)?;
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// 行単位のメッセージリーダー
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// 次の1行を読む（EOFなら `None`、空行は読み飛ばす）
    pub fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        loop {
            self.buf.clear();
            let limit = (MAX_LINE_BYTES + 1) as u64;
            let read = (&mut self.inner).take(limit).read_until(b'\n', &mut self.buf)?;
            if read == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') && self.buf.len() > MAX_LINE_BYTES {
                return Err(ProtocolError::TooLong);
            }
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim();
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }

    /// 次のメッセージを読む
    pub fn read_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.read_line()? {
            Some(line) => decode(&line).map(Some),
            None => Ok(None),
        }
    }
}

/// コマンドの `seq` が奇数で、増加していることを確認する
#[derive(Debug, Default)]
pub struct SequenceCheck {
    last: Option<u64>,
}

impl SequenceCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, seq: u64) -> Result<(), ProtocolError> {
        if seq % 2 == 0 {
            return Err(ProtocolError::EvenSequence(seq));
        }
        match self.last {
            Some(last) if seq <= last => Err(ProtocolError::BadSequence { got: seq, last }),
            _ => {
                self.last = Some(seq);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_check() {
        let mut check = SequenceCheck::new();
        assert!(check.accept(1).is_ok());
        assert!(check.accept(3).is_ok());
        assert!(matches!(
            check.accept(3),
            Err(ProtocolError::BadSequence { got: 3, last: 3 })
        ));
        assert!(check.accept(5).is_ok());
    }

    #[test]
    fn test_even_sequence_rejected() {
        let mut check = SequenceCheck::new();
        assert!(matches!(check.accept(2), Err(ProtocolError::EvenSequence(2))));
        assert!(check.accept(1).is_ok());
        let err = check.accept(4).unwrap_err();
        assert_eq!(err.kind(), "bad_sequence");
        // 拒否された seq は記録されない
        assert!(check.accept(3).is_ok());
    }

    #[test]
    fn test_missing_arguments() {
        let message = decode(r#"{"type":"command","seq":1,"command":"resume"}"#).unwrap();
        assert_eq!(
            message,
            Message::Command {
                seq: 1,
                request: Request::Resume { thread_id: None }
            }
        );
        let message = decode(r#"{"type":"command","seq":3,"command":"version","arguments":{}}"#)
            .unwrap();
        assert_eq!(
            message,
            Message::Command {
                seq: 3,
                request: Request::Version
            }
        );
    }
}
