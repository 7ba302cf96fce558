//! テスト用のコントローラ
//!
//! ループバックTCPで実際のプロトコルを話し、デバッグ対象のスクリプトを操作します。

#![allow(dead_code)]

use serde_json::Value;
use std::collections::VecDeque;
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tansa_core::{DebugEvent, DebuggerConfig, Runtime, StopReason};
use tansa_proto::{connect_and_serve, write_message, Message, MessageReader, ProtocolSession, Request, Response};
use tansa_script::{parse_program, ScriptRuntime};

/// 応答・イベントを待つ上限
pub const WAIT: Duration = Duration::from_secs(10);

pub struct Controller {
    reader: MessageReader<BufReader<TcpStream>>,
    writer: TcpStream,
    next_seq: u64,
    events: VecDeque<DebugEvent>,
}

impl Controller {
    pub fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(WAIT))
            .expect("Failed to set read timeout");
        let writer = stream.try_clone().expect("Failed to clone stream");
        Self {
            reader: MessageReader::new(BufReader::new(stream)),
            writer,
            next_seq: 1,
            events: VecDeque::new(),
        }
    }

    /// コマンドを送信して `seq` を返す
    pub fn send(&mut self, request: Request) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 2;
        write_message(&mut self.writer, &Message::Command { seq, request })
            .expect("Failed to send command");
        seq
    }

    /// 生のJSON行を送信する
    pub fn send_raw(&mut self, line: &str) {
        use std::io::Write;
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .expect("Failed to send raw line");
    }

    fn read(&mut self) -> Option<Message> {
        self.reader.read_message().expect("Failed to read message")
    }

    /// 指定した `seq` の応答を待つ（途中のイベントは保存する）
    pub fn response(&mut self, seq: u64) -> Response {
        loop {
            match self.read() {
                Some(Message::Response(response)) if response.seq == seq => return response,
                Some(Message::Response(response)) => {
                    panic!("unexpected response {:?} while waiting for {}", response, seq)
                }
                Some(Message::Event { event, .. }) => self.events.push_back(event),
                Some(other) => panic!("unexpected message {:?}", other),
                None => panic!("connection closed while waiting for response {}", seq),
            }
        }
    }

    /// コマンドを送り、成功した応答の本体を返す
    pub fn request(&mut self, request: Request) -> Value {
        let name = request.name();
        let seq = self.send(request);
        let response = self.response(seq);
        assert!(response.success, "{} failed: {:?}", name, response.error);
        response.body.unwrap_or(Value::Null)
    }

    /// 失敗するはずのコマンドを送り、エラー種別を返す
    pub fn request_error(&mut self, request: Request) -> String {
        let seq = self.send(request);
        let response = self.response(seq);
        assert!(!response.success, "expected an error, got {:?}", response.body);
        response.error.expect("error body missing").kind
    }

    /// 条件に合うイベントを待つ
    pub fn wait_event<F>(&mut self, mut matches: F) -> DebugEvent
    where
        F: FnMut(&DebugEvent) -> bool,
    {
        if let Some(pos) = self.events.iter().position(&mut matches) {
            return self.events.remove(pos).expect("event vanished");
        }
        loop {
            match self.read() {
                Some(Message::Event { event, .. }) if matches(&event) => return event,
                Some(Message::Event { event, .. }) => self.events.push_back(event),
                Some(other) => panic!("unexpected message {:?}", other),
                None => panic!("connection closed while waiting for an event"),
            }
        }
    }

    /// スレッドの停止を待ち、(スレッドID, epoch, 行, 理由) を返す
    pub fn wait_stop(&mut self) -> Stop {
        match self.wait_event(|e| matches!(e, DebugEvent::ThreadSuspended { .. })) {
            DebugEvent::ThreadSuspended {
                thread_id,
                reason,
                location,
                epoch,
                breakpoint_id,
                ..
            } => Stop {
                thread_id,
                epoch,
                line: location.line,
                function: location.function,
                reason,
                breakpoint_id,
            },
            _ => unreachable!(),
        }
    }

    /// デバッグ対象が接続を閉じるまで読み捨てる
    pub fn wait_closed(&mut self) {
        while let Some(message) = self.read() {
            if let Message::Event { event, .. } = message {
                self.events.push_back(event);
            }
        }
    }

    /// 保存済みのイベントをすべて取り出す
    pub fn take_events(&mut self) -> Vec<DebugEvent> {
        self.events.drain(..).collect()
    }

    /// フレームの変数を `名前 -> 値` で取得する
    pub fn variables(&mut self, stop: &Stop, frame_index: usize) -> Vec<(String, String)> {
        let body = self.request(Request::GetVariables {
            thread_id: stop.thread_id,
            epoch: stop.epoch,
            frame_index,
            path: Vec::new(),
            offset: 0,
        });
        body["variables"]
            .as_array()
            .expect("variables missing")
            .iter()
            .map(|node| {
                (
                    node["name"].as_str().unwrap_or_default().to_string(),
                    node["value"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    pub fn variable(&mut self, stop: &Stop, frame_index: usize, name: &str) -> Option<String> {
        self.variables(stop, frame_index)
            .into_iter()
            .find(|(var, _)| var == name)
            .map(|(_, value)| value)
    }

    pub fn resume(&mut self, thread_id: u64) {
        self.request(Request::Resume {
            thread_id: Some(thread_id),
        });
    }
}

/// 停止イベントの要約
#[derive(Debug, Clone)]
pub struct Stop {
    pub thread_id: u64,
    pub epoch: u64,
    pub line: u32,
    pub function: String,
    pub reason: StopReason,
    pub breakpoint_id: Option<u64>,
}

/// 接続済みのデバッグ対象
pub struct Debuggee {
    pub runtime: ScriptRuntime,
    pub session: ProtocolSession,
    source: String,
    script: Option<JoinHandle<tansa_script::Result<()>>>,
}

impl Debuggee {
    /// スクリプトの実行を開始する
    pub fn run(&mut self) {
        let runtime = self.runtime.clone();
        let program = parse_program("a.src", &self.source).expect("Failed to parse script");
        self.script = Some(thread::spawn(move || runtime.run_main(&program)));
    }

    /// スクリプトの終了を待つ
    pub fn join(&mut self) -> tansa_script::Result<()> {
        self.script
            .take()
            .expect("script not started")
            .join()
            .expect("script thread panicked")
    }
}

/// デバッガを接続したスクリプトとコントローラを用意する
///
/// スクリプトは [`Debuggee::run`] を呼ぶまで動きません。
pub fn attach(source: &str) -> (Controller, Debuggee) {
    attach_with(source, DebuggerConfig::default())
}

pub fn attach_with(source: &str, config: DebuggerConfig) -> (Controller, Debuggee) {
    let runtime = ScriptRuntime::new();
    attach_host(source, config, runtime.clone(), Arc::new(runtime))
}

/// デバッガに渡すランタイムを指定して接続する
///
/// `host` は `runtime` をそのまま、またはラップしたものです。
pub fn attach_host(
    source: &str,
    config: DebuggerConfig,
    runtime: ScriptRuntime,
    host: Arc<dyn Runtime>,
) -> (Controller, Debuggee) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let address = listener.local_addr().expect("Failed to get local address");

    runtime.set_echo(false);
    let session = connect_and_serve(host, config, &address.to_string())
        .expect("Failed to start debug session");
    let (stream, _) = listener.accept().expect("Failed to accept debuggee");

    (
        Controller::new(stream),
        Debuggee {
            runtime,
            session,
            source: source.to_string(),
            script: None,
        },
    )
}
