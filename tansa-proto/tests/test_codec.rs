//! ワイヤ形式のテスト
//!
//! 実際のコントローラが送受信する行をそのまま使って検証します。

use serde_json::Value;
use std::io::Cursor;
use tansa_core::{DebugEvent, ResumeReason, SuspendPolicy};
use tansa_proto::{decode, encode, Message, MessageReader, ProtocolError, Request, Response};

fn as_json(message: &Message) -> Value {
    let line = encode(message).unwrap();
    assert_eq!(line.last(), Some(&b'\n'));
    serde_json::from_slice(&line).unwrap()
}

#[test]
fn test_command_envelope() {
    let message = Message::Command {
        seq: 7,
        request: Request::SetBreakpoint {
            file: "a.src".into(),
            line: Some(10),
            function: None,
            condition: Some("i == 3".into()),
            hit_count: None,
            suspend_policy: SuspendPolicy::All,
            log_message: None,
        },
    };
    let json = as_json(&message);
    assert_eq!(json["type"], "command");
    assert_eq!(json["seq"], 7);
    assert_eq!(json["command"], "set_breakpoint");
    assert_eq!(json["arguments"]["line"], 10);
    assert_eq!(json["arguments"]["suspend_policy"], "all");
    assert!(json["arguments"].get("function").is_none());

    let decoded = decode(&serde_json::to_string(&json).unwrap()).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_controller_line_with_defaults() {
    let line = r#"{"type":"command","seq":1,"command":"set_breakpoint","arguments":{"file":"a.src","line":10}}"#;
    match decode(line).unwrap() {
        Message::Command {
            seq: 1,
            request:
                Request::SetBreakpoint {
                    file,
                    line,
                    suspend_policy,
                    ..
                },
        } => {
            assert_eq!(file, "a.src");
            assert_eq!(line, Some(10));
            assert_eq!(suspend_policy, SuspendPolicy::Thread);
        }
        other => panic!("unexpected message: {:?}", other),
    }

    let line = r#"{"type":"command","seq":5,"command":"set_exception_breakpoint","arguments":{"type_name":"ValueError"}}"#;
    assert_eq!(
        decode(line).unwrap(),
        Message::Command {
            seq: 5,
            request: Request::SetExceptionBreakpoint {
                type_name: "ValueError".into(),
                on_raise: true,
                on_uncaught: false,
            }
        }
    );
}

#[test]
fn test_event_envelope() {
    let message = Message::Event {
        seq: 4,
        event: DebugEvent::ThreadResumed {
            thread_id: 1,
            reason: ResumeReason::Continue,
        },
    };
    let json = as_json(&message);
    assert_eq!(json["type"], "event");
    assert_eq!(json["seq"], 4);
    assert_eq!(json["event"], "thread_resumed");
    assert_eq!(json["body"]["reason"], "continue");
    assert_eq!(decode(&serde_json::to_string(&json).unwrap()).unwrap(), message);
}

#[test]
fn test_error_response() {
    let message = Message::Response(Response::error(9, "stale_frame", "stale frame handle"));
    let json = as_json(&message);
    assert_eq!(json["type"], "response");
    assert_eq!(json["seq"], 9);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["kind"], "stale_frame");
    assert!(json.get("body").is_none());
}

#[test]
fn test_malformed_lines() {
    assert!(matches!(decode("{not json"), Err(ProtocolError::Json(_))));
    assert!(matches!(decode("[1,2]"), Err(ProtocolError::NotAnObject)));
    assert!(matches!(
        decode(r#"{"seq":1,"command":"version"}"#),
        Err(ProtocolError::MissingField("type"))
    ));
    assert!(matches!(
        decode(r#"{"type":"command","command":"version"}"#),
        Err(ProtocolError::MissingField("seq"))
    ));
    assert!(matches!(
        decode(r#"{"type":"notice","seq":1}"#),
        Err(ProtocolError::UnknownType(_))
    ));
    assert!(matches!(
        decode(r#"{"type":"command","seq":1,"command":"launch_rockets","arguments":{}}"#),
        Err(ProtocolError::Json(_))
    ));
}

#[test]
fn test_reader_skips_blank_lines() {
    let input = concat!(
        "\n",
        r#"{"type":"command","seq":1,"command":"version"}"#,
        "\n\n",
        r#"{"type":"command","seq":3,"command":"list_threads"}"#,
        "\n"
    );
    let mut reader = MessageReader::new(Cursor::new(input.as_bytes().to_vec()));
    assert_eq!(
        reader.read_message().unwrap(),
        Some(Message::Command {
            seq: 1,
            request: Request::Version
        })
    );
    assert_eq!(
        reader.read_message().unwrap(),
        Some(Message::Command {
            seq: 3,
            request: Request::ListThreads
        })
    );
    assert_eq!(reader.read_message().unwrap(), None);
}

#[test]
fn test_reader_rejects_oversized_line() {
    let mut input = vec![b'x'; tansa_proto::MAX_LINE_BYTES + 10];
    input.push(b'\n');
    let mut reader = MessageReader::new(Cursor::new(input));
    assert!(matches!(reader.read_line(), Err(ProtocolError::TooLong)));
}
