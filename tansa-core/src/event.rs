//! デバッグイベント
//!
//! コアからコントローラへ非同期に通知されるイベントです。
//! ワイヤ形式はこの型のシリアライズ結果そのものです。

use crate::breakpoint::BreakpointId;
use crate::host::{ExceptionInfo, HostThreadId, OutputStream, ThreadDescriptor};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// ソース上の位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// 停止理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Breakpoint,
    FunctionBreakpoint,
    Step,
    Pause,
    ExceptionRaised,
    ExceptionUncaught,
}

/// 再開理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    Continue,
    StepInto,
    StepOver,
    StepReturn,
    Detach,
    Kill,
}

/// コントローラへ通知するイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "body", rename_all = "snake_case")]
pub enum DebugEvent {
    ThreadCreated {
        thread_id: HostThreadId,
        name: String,
    },
    ThreadExited {
        thread_id: HostThreadId,
    },
    ThreadSuspended {
        thread_id: HostThreadId,
        reason: StopReason,
        location: SourceLocation,
        epoch: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        breakpoint_id: Option<BreakpointId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<ExceptionInfo>,
    },
    ThreadResumed {
        thread_id: HostThreadId,
        reason: ResumeReason,
    },
    ProcessOutput {
        stream: OutputStream,
        text: String,
    },
    ProcessTerminated {
        exit_code: i32,
    },
    BreakpointError {
        breakpoint_id: BreakpointId,
        message: String,
    },
}

impl DebugEvent {
    pub fn thread_created(thread: &ThreadDescriptor) -> Self {
        Self::ThreadCreated {
            thread_id: thread.id,
            name: thread.name.clone(),
        }
    }
}

/// イベントの送り先
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DebugEvent);
}

/// 差し替え可能なイベントの中継点
///
/// 接続前や切断後のイベントは破棄します。
pub struct EventHub {
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            sink: RwLock::new(None),
        }
    }

    pub fn connect(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn disconnect(&self) {
        self.sink.write().take();
    }

    pub fn is_connected(&self) -> bool {
        self.sink.read().is_some()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventHub {
    fn emit(&self, event: DebugEvent) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => tracing::trace!("dropping event without controller: {:?}", event),
        }
    }
}

/// テキストを最大 `max_bytes` バイトの断片に分割する（UTF-8境界を保つ）
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(4);
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut end = max_bytes;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<DebugEvent>>);

    impl EventSink for Collect {
        fn emit(&self, event: DebugEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_chunk_text() {
        assert_eq!(chunk_text("abcdef", 4), vec!["abcd", "ef"]);
        assert!(chunk_text("", 4).is_empty());
        // 3バイト文字の途中で切らない
        let text = "ああああ";
        let chunks = chunk_text(text, 5);
        assert_eq!(chunks, vec!["あ", "あ", "あ", "あ"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_hub_drops_without_sink() {
        let hub = EventHub::new();
        hub.emit(DebugEvent::ThreadExited { thread_id: 1 });

        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        hub.connect(collect.clone());
        hub.emit(DebugEvent::ThreadExited { thread_id: 2 });
        hub.disconnect();
        hub.emit(DebugEvent::ThreadExited { thread_id: 3 });

        let events = collect.0.lock();
        assert_eq!(events.as_slice(), &[DebugEvent::ThreadExited { thread_id: 2 }]);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = DebugEvent::ThreadResumed {
            thread_id: 7,
            reason: ResumeReason::StepOver,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "thread_resumed");
        assert_eq!(json["body"]["thread_id"], 7);
        assert_eq!(json["body"]["reason"], "step_over");
    }
}
