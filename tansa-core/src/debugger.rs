//! デバッガのメインロジック
//!
//! ブレークポイント、インターセプタ、スレッド管理、イントロスペクションを
//! まとめ、コマンドレイヤから呼ばれる操作を提供します。
//!
//! フレームに触れる操作（変数取得・評価・代入）は対象スレッド上で実行する
//! 必要があるため、結果は [`Reply`] で非同期に返ります。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointRegistry, BreakpointSpec, ExceptionBreakpoint};
use crate::config::DebuggerConfig;
use crate::custom_frames::{CustomFrameId, CustomFrameRegistry};
use crate::daemon::DaemonRegistry;
use crate::dont_trace::DontTraceFilter;
use crate::errors::{DebugError, SessionError};
use crate::event::{chunk_text, DebugEvent, EventHub, EventSink, SourceLocation, StopReason};
use crate::host::{HookMode, HostFrame, HostThreadId, OutputSink, OutputStream, Runtime};
use crate::interceptor::Interceptor;
use crate::introspection::{resolve_path, FrameSnapshot, Inspector, VariableNode};
use crate::suspension::{
    ResumeMode, StackFrameInfo, SuspendState, SuspendedStack, ThreadKind, ThreadManager,
    ThreadSummary,
};
use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 非同期操作の結果を受け取るコールバック
pub type Reply<T> = Box<dyn FnOnce(Result<T>) + Send>;

type DetachHook = Box<dyn FnOnce() + Send>;

/// 停止中スレッドのフレームを指すハンドル
///
/// 同じスレッドが再開して再び停止すると `epoch` が変わり、古いハンドルは
/// `StaleFrame` になります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHandle {
    pub thread_id: HostThreadId,
    pub epoch: u64,
    pub frame_index: usize,
}

/// get_stack の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackReply {
    pub thread_id: u64,
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    pub frames: Vec<StackFrameInfo>,
}

/// デタッチの理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// コントローラの detach コマンド
    Requested,
    /// 接続が切れた
    ConnectionClosed,
    /// ターゲットが終了する
    ProcessExit,
    /// フック内部の異常
    Fault,
}

/// ターゲットの出力を process_output イベントに変換する
struct OutputForwarder {
    events: Arc<EventHub>,
    chunk_size: usize,
}

impl OutputSink for OutputForwarder {
    fn write(&self, stream: OutputStream, text: &str) {
        for chunk in chunk_text(text, self.chunk_size) {
            self.events.emit(DebugEvent::ProcessOutput {
                stream,
                text: chunk.to_string(),
            });
        }
    }
}

/// デバッガ
pub struct Debugger {
    config: DebuggerConfig,
    runtime: Arc<dyn Runtime>,
    registry: Arc<BreakpointRegistry>,
    threads: Arc<ThreadManager>,
    events: Arc<EventHub>,
    interceptor: Arc<Interceptor>,
    inspector: Inspector,
    custom_frames: &'static CustomFrameRegistry,
    daemons: Arc<DaemonRegistry>,
    started: AtomicBool,
    detached: AtomicBool,
    detach_hooks: Mutex<Vec<DetachHook>>,
}

impl Debugger {
    /// 新しいデバッガを作成する
    ///
    /// フックはまだインストールされません。[`Debugger::start`] で開始します。
    pub fn new(runtime: Arc<dyn Runtime>, config: DebuggerConfig) -> Arc<Self> {
        let registry = Arc::new(BreakpointRegistry::new());
        let threads = Arc::new(ThreadManager::new());
        let events = Arc::new(EventHub::new());
        let interceptor = Arc::new(Interceptor::new(
            runtime.clone(),
            registry.clone(),
            threads.clone(),
            events.clone(),
            DontTraceFilter::from_entries(&config.dont_trace),
            config.output_chunk_size,
        ));

        Arc::new_cyclic(|weak: &std::sync::Weak<Debugger>| {
            let weak = weak.clone();
            interceptor.set_fault_handler(Box::new(move || {
                if let Some(debugger) = weak.upgrade() {
                    debugger.detach(DetachReason::Fault);
                }
            }));
            Self {
                inspector: Inspector::new(config.limits),
                config,
                runtime,
                registry,
                threads,
                events,
                interceptor,
                custom_frames: CustomFrameRegistry::global(),
                daemons: Arc::new(DaemonRegistry::new()),
                started: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                detach_hooks: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// このセッションのデーモンスレッド
    pub fn daemons(&self) -> &Arc<DaemonRegistry> {
        &self.daemons
    }

    pub fn custom_frames(&self) -> &'static CustomFrameRegistry {
        self.custom_frames
    }

    /// インストール済みのバックエンド
    pub fn mode(&self) -> Option<HookMode> {
        self.interceptor.mode()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.is_detached() {
            Err(DebugError::Detached)
        } else {
            Ok(())
        }
    }

    /// イベントの送り先を接続し、フックをインストールする
    ///
    /// 既に動いているスレッドは thread_created として通知されます。
    pub fn start(self: &Arc<Self>, sink: Arc<dyn EventSink>) -> Result<HookMode, SessionError> {
        if self.is_detached() || self.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyAttached);
        }
        self.events.connect(sink);

        let mode = match self.interceptor.install(self.config.interception) {
            Ok(mode) => mode,
            Err(err) => {
                self.events.disconnect();
                self.started.store(false, Ordering::Release);
                return Err(SessionError::HookInstall(err));
            }
        };

        for thread in self.runtime.threads() {
            let (_, created) = self.threads.register(&thread);
            if created {
                self.events.emit(DebugEvent::thread_created(&thread));
            }
        }

        if self.config.redirect_output {
            self.runtime.set_output_sink(Some(Arc::new(OutputForwarder {
                events: self.events.clone(),
                chunk_size: self.config.output_chunk_size,
            })));
        }

        tracing::info!("debugger started ({:?})", mode);
        Ok(mode)
    }

    /// デタッチ時に実行する処理を登録する
    pub fn on_detach(&self, hook: DetachHook) {
        if self.is_detached() {
            hook();
            return;
        }
        self.detach_hooks.lock().push(hook);
    }

    // ---- ブレークポイント ----

    pub fn set_breakpoint(&self, spec: BreakpointSpec) -> Result<Breakpoint> {
        self.ensure_attached()?;
        let bp = self.registry.set(spec)?;
        tracing::debug!("breakpoint {} set at {}:{:?}", bp.id, bp.file, bp.location);
        Ok(bp)
    }

    pub fn clear_breakpoint(&self, id: BreakpointId) -> Result<()> {
        self.ensure_attached()?;
        self.registry.clear(id)
    }

    pub fn clear_file_breakpoints(&self, file: &str) -> Result<Vec<BreakpointId>> {
        self.ensure_attached()?;
        Ok(self.registry.clear_file(file))
    }

    pub fn set_exception_breakpoint(
        &self,
        type_name: &str,
        on_raise: bool,
        on_uncaught: bool,
    ) -> Result<ExceptionBreakpoint> {
        self.ensure_attached()?;
        self.registry.set_exception(type_name, on_raise, on_uncaught)
    }

    pub fn clear_exception_breakpoint(&self, type_name: &str) -> Result<ExceptionBreakpoint> {
        self.ensure_attached()?;
        self.registry
            .clear_exception(type_name)
            .ok_or_else(|| DebugError::InvalidBreakpoint(format!("no exception breakpoint for {}", type_name)))
    }

    pub fn breakpoints(&self) -> (Vec<Breakpoint>, Vec<ExceptionBreakpoint>) {
        (self.registry.list(), self.registry.list_exceptions())
    }

    // ---- スレッド ----

    /// 実スレッドとカスタムフレームの一覧
    pub fn list_threads(&self) -> Vec<ThreadSummary> {
        let mut list = self.threads.summaries();
        list.extend(self.custom_frames.list().into_iter().map(|frame| ThreadSummary {
            id: frame.id,
            name: frame.name,
            kind: ThreadKind::CustomFrame,
            state: SuspendState::Suspended,
            stop_reason: None,
            epoch: None,
            location: Some(SourceLocation {
                file: frame.file,
                line: frame.line,
                function: frame.function,
            }),
        }));
        list
    }

    pub fn get_stack(&self, thread_id: u64) -> Result<StackReply> {
        self.ensure_attached()?;
        if let Some(frame) = self.custom_frames.get(thread_id) {
            let stack = SuspendedStack::capture(thread_id, 0, frame.as_host_frame());
            return Ok(StackReply {
                thread_id,
                epoch: 0,
                reason: None,
                frames: stack.describe(),
            });
        }
        let (epoch, reason, frames) = self.threads.stack(thread_id)?;
        Ok(StackReply {
            thread_id,
            epoch,
            reason: Some(reason),
            frames,
        })
    }

    pub fn step_into(&self, thread_id: u64) -> Result<()> {
        self.ensure_attached()?;
        self.threads.resume(thread_id, ResumeMode::StepInto)
    }

    pub fn step_over(&self, thread_id: u64) -> Result<()> {
        self.ensure_attached()?;
        self.threads.resume(thread_id, ResumeMode::StepOver)
    }

    pub fn step_return(&self, thread_id: u64) -> Result<()> {
        self.ensure_attached()?;
        self.threads.resume(thread_id, ResumeMode::StepReturn)
    }

    /// スレッドを再開する（`None` なら停止中の全スレッド）
    pub fn resume(&self, thread_id: Option<u64>) -> Result<Vec<u64>> {
        self.ensure_attached()?;
        match thread_id {
            Some(id) => {
                self.threads.resume(id, ResumeMode::Continue)?;
                Ok(vec![id])
            }
            None => Ok(self.threads.resume_all()),
        }
    }

    /// スレッドに一時停止を要求する（`None` なら全スレッド）
    pub fn pause(&self, thread_id: Option<u64>) -> Result<Vec<u64>> {
        self.ensure_attached()?;
        match thread_id {
            Some(id) => {
                self.threads.pause(id)?;
                Ok(vec![id])
            }
            None => Ok(self.threads.pause_all(None)),
        }
    }

    pub fn kill_thread(&self, thread_id: u64) -> Result<()> {
        self.ensure_attached()?;
        self.threads.kill(thread_id)
    }

    // ---- イントロスペクション ----

    fn post_frame<T, F>(&self, handle: FrameHandle, reply: Reply<T>, body: F) -> Result<()>
    where
        T: 'static,
        F: FnOnce(&dyn HostFrame) -> Result<T> + Send + 'static,
    {
        self.ensure_attached()?;
        self.threads.post(
            handle.thread_id,
            Some(handle.epoch),
            handle.frame_index,
            Box::new(move |stack: &SuspendedStack<'_>| {
                let result = stack
                    .frame(handle.frame_index)
                    .ok_or(DebugError::StaleFrame {
                        thread_id: handle.thread_id,
                        epoch: handle.epoch,
                        frame_index: handle.frame_index,
                    })
                    .and_then(|frame| {
                        panic::catch_unwind(AssertUnwindSafe(|| body(frame))).unwrap_or_else(|_| {
                            tracing::error!("frame command panicked on thread {}", handle.thread_id);
                            Err(DebugError::Internal("frame command panicked".into()))
                        })
                    });
                reply(result);
            }),
        )
    }

    /// フレームの変数、または `path` の先の子要素を取得する
    pub fn get_variables(
        &self,
        handle: FrameHandle,
        path: Vec<String>,
        offset: usize,
        reply: Reply<Vec<VariableNode>>,
    ) -> Result<()> {
        let inspector = self.inspector;
        self.post_frame(handle, reply, move |frame| {
            if path.is_empty() {
                Ok(inspector.frame_variables(frame))
            } else {
                inspector.children_at(frame, &path, offset)
            }
        })
    }

    /// フレームのスナップショットを取得する
    pub fn get_frame(&self, handle: FrameHandle, reply: Reply<FrameSnapshot>) -> Result<()> {
        let inspector = self.inspector;
        self.post_frame(handle, reply, move |frame| {
            Ok(inspector.snapshot(handle.thread_id, handle.epoch, handle.frame_index, frame))
        })
    }

    /// フレームのコンテキストで式を評価する
    ///
    /// 文を評価した場合は `None` が返ります。
    pub fn evaluate(
        &self,
        handle: FrameHandle,
        expression: String,
        reply: Reply<Option<VariableNode>>,
    ) -> Result<()> {
        let inspector = self.inspector;
        self.post_frame(handle, reply, move |frame| {
            let value = frame.evaluate(&expression)?;
            Ok(value.map(|value| {
                inspector.render(
                    &expression,
                    &value,
                    inspector.limits().max_depth,
                    &mut HashSet::new(),
                )
            }))
        })
    }

    /// 変数に値を代入し、代入後の値を返す
    pub fn set_variable(
        &self,
        handle: FrameHandle,
        name: String,
        value: String,
        reply: Reply<VariableNode>,
    ) -> Result<()> {
        let inspector = self.inspector;
        self.post_frame(handle, reply, move |frame| {
            frame.assign(&name, &value)?;
            let updated = frame
                .lookup(&name)
                .ok_or_else(|| DebugError::VariableNotFound(name.clone()))?;
            Ok(inspector.render(&name, &updated, inspector.limits().max_depth, &mut HashSet::new()))
        })
    }

    /// カスタムフレームの変数を取得する
    pub fn get_custom_frame_variables(
        &self,
        frame_id: CustomFrameId,
        path: &[String],
        offset: usize,
    ) -> Result<Vec<VariableNode>> {
        self.ensure_attached()?;
        let frame = self
            .custom_frames
            .get(frame_id)
            .ok_or(DebugError::UnknownCustomFrame(frame_id))?;
        let frame = frame.as_host_frame();
        if path.is_empty() {
            Ok(self.inspector.frame_variables(frame))
        } else {
            let value = resolve_path(frame, path)?;
            Ok(self.inspector.page(&value, offset))
        }
    }

    /// 非同期操作の結果を待つ
    pub fn wait_reply<T, F>(&self, thread_id: u64, submit: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Reply<T>) -> Result<()>,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        submit(Box::new(move |result| {
            let _ = tx.send(result);
        }))?;
        rx.recv_timeout(self.config.command_timeout)
            .map_err(|_| DebugError::Timeout(thread_id))?
    }

    // ---- セッション終了 ----

    /// デタッチする
    ///
    /// 全ブレークポイントを削除し、フックを外し、停止中のスレッドを再開します。
    /// 2回目以降の呼び出しは何もしません。
    pub fn detach(&self, reason: DetachReason) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("detaching ({:?})", reason);

        self.registry.clear_all();
        self.interceptor.uninstall();
        let resumed = self.threads.release_all();
        if !resumed.is_empty() {
            tracing::debug!("resumed threads {:?}", resumed);
        }
        if self.config.redirect_output {
            self.runtime.set_output_sink(None);
        }

        let hooks: Vec<DetachHook> = std::mem::take(&mut *self.detach_hooks.lock());
        for hook in hooks {
            hook();
        }
        self.events.disconnect();
        self.daemons.kill_all(self.config.daemon_join_timeout);
    }

    /// ターゲットの終了を通知してからデタッチする
    pub fn process_exiting(&self, exit_code: i32) {
        if self.is_detached() {
            return;
        }
        self.events.emit(DebugEvent::ProcessTerminated { exit_code });
        self.detach(DetachReason::ProcessExit);
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if !self.is_detached() && self.started.load(Ordering::Acquire) {
            self.interceptor.uninstall();
        }
    }
}
