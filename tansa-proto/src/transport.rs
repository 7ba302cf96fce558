//! ソケット通信
//!
//! コントローラとの接続は受信スレッドと送信スレッドの2つのデーモンで扱います。
//! 送信は単一のキューに集約され、どのスレッドからでも応答やイベントを積めます。
//! 受信側で接続が切れるか、解釈できない行を受け取ると、セッションはデタッチします。

use crate::codec::{decode, write_message, MessageReader, ProtocolError};
use crate::dispatch::Dispatcher;
use crate::message::{Message, Response};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tansa_core::{
    DebugEvent, Debugger, DebuggerConfig, DetachReason, EventSink, KillSignal, Runtime,
    SessionError,
};

/// 送信スレッドが停止要求を確認する間隔
const WRITER_POLL: Duration = Duration::from_millis(100);

/// 送信キュー
///
/// イベントの `seq` は2から始まる偶数です（コントローラ側は奇数を使う）。
/// 採番とキューへの投入は同じロックの下で行うので、キュー内の順序は `seq` 順です。
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<Message>,
    next_event_seq: Arc<Mutex<u64>>,
}

impl Outbox {
    pub fn new() -> (Self, Receiver<Message>) {
        let (tx, rx) = channel::unbounded();
        (
            Self {
                tx,
                next_event_seq: Arc::new(Mutex::new(2)),
            },
            rx,
        )
    }

    pub fn respond(&self, response: Response) {
        if self.tx.send(Message::Response(response)).is_err() {
            tracing::debug!("dropping response after the writer stopped");
        }
    }

    pub fn send_event(&self, event: DebugEvent) {
        let mut next = self.next_event_seq.lock();
        let seq = *next;
        *next += 2;
        if self.tx.send(Message::Event { seq, event }).is_err() {
            tracing::debug!("dropping event after the writer stopped");
        }
    }

    /// 未送信のメッセージ数
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl EventSink for Outbox {
    fn emit(&self, event: DebugEvent) {
        self.send_event(event);
    }
}

/// コントローラに接続する
pub fn connect(address: &str, timeout: Duration) -> Result<TcpStream, SessionError> {
    let connect_error = |source: io::Error| SessionError::Connect {
        address: address.to_string(),
        source,
    };
    let addrs: Vec<SocketAddr> = address.to_socket_addrs().map_err(connect_error)?.collect();

    let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::info!("connected to controller at {}", addr);
                return Ok(stream);
            }
            Err(err) => {
                tracing::debug!("connect to {} failed: {}", addr, err);
                last_error = err;
            }
        }
    }
    Err(connect_error(last_error))
}

/// 1つのコントローラ接続
pub struct ProtocolSession {
    debugger: Arc<Debugger>,
    outbox: Outbox,
    peer: Option<SocketAddr>,
}

impl ProtocolSession {
    /// 接続済みのストリームでセッションを開始する
    ///
    /// フックのインストールに失敗した場合はストリームを閉じ、状態を残しません。
    pub fn start(debugger: Arc<Debugger>, stream: TcpStream) -> Result<Self, SessionError> {
        let peer = stream.peer_addr().ok();
        let read_stream = stream.try_clone().map_err(SessionError::Spawn)?;
        let shutdown_stream = stream.try_clone().map_err(SessionError::Spawn)?;

        let (outbox, rx) = Outbox::new();
        if let Err(err) = debugger.start(Arc::new(outbox.clone())) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(err);
        }

        let daemons = debugger.daemons();
        let spawned = daemons
            .spawn("writer", None, move |signal| writer_loop(stream, rx, signal))
            .and_then(|_| {
                let dispatcher = Dispatcher::new(debugger.clone(), outbox.clone());
                let reader_debugger = debugger.clone();
                daemons.spawn(
                    "reader",
                    Some(Box::new(move || {
                        let _ = shutdown_stream.shutdown(Shutdown::Read);
                    })),
                    move |signal| reader_loop(read_stream, dispatcher, reader_debugger, signal),
                )
            });
        if let Err(err) = spawned {
            debugger.detach(DetachReason::Fault);
            return Err(SessionError::Spawn(err));
        }

        Ok(Self {
            debugger,
            outbox,
            peer,
        })
    }

    pub fn debugger(&self) -> &Arc<Debugger> {
        &self.debugger
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        !self.debugger.is_detached()
    }

    /// イベントを送信する
    pub fn emit(&self, event: DebugEvent) {
        self.outbox.send_event(event);
    }

    /// セッションを閉じる
    pub fn close(&self) {
        self.debugger.detach(DetachReason::Requested);
    }
}

/// コントローラに接続し、デバッグセッションを開始する
///
/// 接続できなかった場合はフックをインストールしません。
pub fn connect_and_serve(
    runtime: Arc<dyn Runtime>,
    config: DebuggerConfig,
    address: &str,
) -> Result<ProtocolSession, SessionError> {
    let stream = connect(address, config.connect_timeout)?;
    let debugger = Debugger::new(runtime, config);
    ProtocolSession::start(debugger, stream)
}

fn writer_loop(mut stream: TcpStream, rx: Receiver<Message>, signal: KillSignal) {
    loop {
        match rx.recv_timeout(WRITER_POLL) {
            Ok(message) => {
                if let Err(err) = write_message(&mut stream, &message) {
                    tracing::warn!("failed to send message: {}", err);
                    break;
                }
                // 停止要求後はキューが空になった時点で終了する
                if signal.is_killed() && rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if signal.is_killed() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = stream.shutdown(Shutdown::Write);
    tracing::debug!("writer thread finished");
}

fn reader_loop(
    stream: TcpStream,
    mut dispatcher: Dispatcher,
    debugger: Arc<Debugger>,
    signal: KillSignal,
) {
    let mut reader = MessageReader::new(BufReader::new(stream));
    while !signal.is_killed() {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("controller closed the connection");
                break;
            }
            Err(err) => {
                if !signal.is_killed() {
                    tracing::warn!("connection error: {}", err);
                }
                break;
            }
        };

        match decode(&line) {
            Ok(Message::Command { seq, request }) => {
                if dispatcher.handle(seq, request).is_err() {
                    break;
                }
            }
            Ok(other) => tracing::warn!("ignoring unexpected message seq {}", other.seq()),
            Err(err) => {
                reject(&dispatcher, &line, err);
                break;
            }
        }
    }

    if !signal.is_killed() {
        debugger.detach(DetachReason::ConnectionClosed);
    }
    tracing::debug!("reader thread finished");
}

/// 解釈できなかったコマンドに、`seq` が読めればエラー応答を返す
///
/// 応答の後、接続は閉じられます。
fn reject(dispatcher: &Dispatcher, line: &str, err: ProtocolError) {
    tracing::warn!("malformed message: {}", err);
    let seq = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|value| value.get("seq").and_then(Value::as_u64));
    if let Some(seq) = seq {
        dispatcher.reply(Response::error(seq, err.kind(), err.to_string()));
    }
}
