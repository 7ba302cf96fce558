//! 実行イベントのインターセプト
//!
//! インタプリタのフックとして登録され、行・呼び出し・復帰・例外の各イベントで
//! ブレークポイントとステップ要求を照合します。停止が必要な場合は
//! [`ThreadManager::suspend`] で現在のスレッドを待機させます。
//!
//! バックエンドは2種類あります。
//! - トレース: すべてのフレームのイベントを受け取る
//! - フレーム評価: フレーム生成時に [`TraceHook::wants_frame`] で対象を絞る
//!
//! フレーム評価が使えない場合はトレースにフォールバックします。

use crate::breakpoint::{normalize_path, Breakpoint, BreakpointRegistry};
use crate::config::InterceptionStrategy;
use crate::daemon::is_daemon_thread;
use crate::dont_trace::DontTraceFilter;
use crate::errors::{EvalError, HostError};
use crate::event::{chunk_text, DebugEvent, EventHub, EventSink, StopReason};
use crate::host::{
    ExceptionInfo, ExceptionPhase, HookMode, HostFrame, HostThreadId, OutputStream, Runtime,
    ThreadDescriptor, TraceAction, TraceEvent, TraceHook,
};
use crate::suspension::{Directive, StepEvent, SuspendDetail, ThreadManager, ThreadSlot};
use crate::SuspendPolicy;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type FaultHandler = Box<dyn Fn() + Send + Sync>;

/// トレースフック
pub struct Interceptor {
    runtime: Arc<dyn Runtime>,
    registry: Arc<BreakpointRegistry>,
    threads: Arc<ThreadManager>,
    events: Arc<EventHub>,
    dont_trace: DontTraceFilter,
    /// フレームのファイル名 -> 正規化済みパス
    paths: DashMap<String, Arc<str>>,
    output_chunk_size: usize,
    active: AtomicBool,
    mode: Mutex<Option<HookMode>>,
    faulted: AtomicBool,
    on_fault: Mutex<Option<FaultHandler>>,
}

impl Interceptor {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        registry: Arc<BreakpointRegistry>,
        threads: Arc<ThreadManager>,
        events: Arc<EventHub>,
        dont_trace: DontTraceFilter,
        output_chunk_size: usize,
    ) -> Self {
        Self {
            runtime,
            registry,
            threads,
            events,
            dont_trace,
            paths: DashMap::new(),
            output_chunk_size,
            active: AtomicBool::new(false),
            mode: Mutex::new(None),
            faulted: AtomicBool::new(false),
            on_fault: Mutex::new(None),
        }
    }

    /// フック内部で異常が起きたときの処理を設定する
    pub fn set_fault_handler(&self, handler: FaultHandler) {
        *self.on_fault.lock() = Some(handler);
    }

    /// インストール済みのバックエンド
    pub fn mode(&self) -> Option<HookMode> {
        *self.mode.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// フックをインストールする
    ///
    /// 既にインストール済みなら何もせず現在のバックエンドを返します。
    pub fn install(self: &Arc<Self>, strategy: InterceptionStrategy) -> Result<HookMode, HostError> {
        let mut mode = self.mode.lock();
        if let Some(current) = *mode {
            return Ok(current);
        }

        let preferred = match strategy {
            InterceptionStrategy::Trace => HookMode::Trace,
            InterceptionStrategy::FrameEval => HookMode::FrameEval,
            InterceptionStrategy::Auto if self.runtime.supports_frame_eval() => HookMode::FrameEval,
            InterceptionStrategy::Auto => HookMode::Trace,
        };

        self.active.store(true, Ordering::Release);
        let hook: Arc<dyn TraceHook> = self.clone();
        let installed = match self.runtime.install_hook(hook.clone(), preferred) {
            Ok(()) => Ok(preferred),
            Err(err) if preferred == HookMode::FrameEval => {
                tracing::warn!("frame evaluation hook unavailable ({}), using tracing", err);
                self.runtime.install_hook(hook, HookMode::Trace).map(|_| HookMode::Trace)
            }
            Err(err) => Err(err),
        };

        match installed {
            Ok(installed) => {
                tracing::info!("trace hook installed on {} ({:?})", self.runtime.name(), installed);
                *mode = Some(installed);
                Ok(installed)
            }
            Err(err) => {
                self.active.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// フックを取り外す
    pub fn uninstall(&self) {
        self.active.store(false, Ordering::Release);
        if self.mode.lock().take().is_some() {
            self.runtime.uninstall_hook();
            tracing::info!("trace hook removed");
        }
    }

    fn canonical(&self, file: &str) -> Arc<str> {
        if let Some(path) = self.paths.get(file) {
            return path.clone();
        }
        let path: Arc<str> = normalize_path(file).into();
        self.paths.insert(file.to_string(), path.clone());
        path
    }

    fn fault(&self) {
        if self.faulted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("internal error in trace hook, detaching");
        self.active.store(false, Ordering::Release);
        let handler = self.on_fault.lock().take();
        match handler {
            Some(handler) => handler(),
            None => self.uninstall(),
        }
    }

    fn dispatch(
        &self,
        thread: &ThreadDescriptor,
        frame: &dyn HostFrame,
        event: TraceEvent<'_>,
    ) -> TraceAction {
        let (slot, created) = self.threads.register(thread);
        if created {
            self.events.emit(DebugEvent::thread_created(thread));
        }
        // デバッガ自身の評価中に発生したイベントは無視する
        if slot.is_evaluating() {
            return TraceAction::Continue;
        }
        if self.dont_trace.should_skip(frame.file()) {
            return match event {
                TraceEvent::Call | TraceEvent::Line => TraceAction::SkipFrame,
                _ => TraceAction::Continue,
            };
        }

        match event {
            TraceEvent::Line => self.on_line(&slot, frame),
            TraceEvent::Call => self.on_call(&slot, frame),
            TraceEvent::Return => self.on_return(&slot, frame),
            TraceEvent::Exception { info, phase } => self.on_exception(&slot, frame, info, phase),
        }
    }

    fn on_line(&self, slot: &ThreadSlot, frame: &dyn HostFrame) -> TraceAction {
        let directive = self.threads.check(slot, StepEvent::Line, || frame.depth());
        if directive == Some(Directive::Terminate) {
            return TraceAction::Terminate;
        }

        let path = self.canonical(frame.file());
        if let Some(bp) = self.registry.match_line(&path, frame.line()) {
            if let Some(action) = self.on_breakpoint(slot, frame, bp, StopReason::Breakpoint) {
                return action;
            }
        }

        match directive {
            Some(Directive::Stop(reason)) => self.suspend(slot, frame, reason, SuspendDetail::default()),
            _ => TraceAction::Continue,
        }
    }

    fn on_call(&self, slot: &ThreadSlot, frame: &dyn HostFrame) -> TraceAction {
        let path = self.canonical(frame.file());
        if let Some(bp) = self.registry.match_function(&path, frame.function()) {
            if let Some(action) =
                self.on_breakpoint(slot, frame, bp, StopReason::FunctionBreakpoint)
            {
                return action;
            }
        }
        TraceAction::Continue
    }

    fn on_return(&self, slot: &ThreadSlot, frame: &dyn HostFrame) -> TraceAction {
        match self.threads.check(slot, StepEvent::Return, || frame.depth()) {
            Some(Directive::Terminate) => TraceAction::Terminate,
            Some(Directive::Stop(reason)) => self.suspend(slot, frame, reason, SuspendDetail::default()),
            None => TraceAction::Continue,
        }
    }

    fn on_exception(
        &self,
        slot: &ThreadSlot,
        frame: &dyn HostFrame,
        info: &ExceptionInfo,
        phase: ExceptionPhase,
    ) -> TraceAction {
        let Some(ebp) = self.registry.match_exception(&info.type_name, phase) else {
            return TraceAction::Continue;
        };
        let reason = match phase {
            ExceptionPhase::Raised => StopReason::ExceptionRaised,
            ExceptionPhase::Uncaught => StopReason::ExceptionUncaught,
        };
        self.suspend(
            slot,
            frame,
            reason,
            SuspendDetail {
                breakpoint_id: Some(ebp.id),
                exception: Some(info.clone()),
            },
        )
    }

    /// ブレークポイント一致時の処理（停止しなければ `None`）
    fn on_breakpoint(
        &self,
        slot: &ThreadSlot,
        frame: &dyn HostFrame,
        bp: Breakpoint,
        reason: StopReason,
    ) -> Option<TraceAction> {
        if !self.condition_holds(slot, frame, &bp) {
            return None;
        }
        let hits = self.registry.record_hit(bp.id)?;
        if bp.hit_count.is_some_and(|n| hits != n) {
            return None;
        }
        if let Some(message) = &bp.log_message {
            self.log_point(slot, frame, message);
            return None;
        }
        if bp.suspend_policy == SuspendPolicy::All {
            self.threads.pause_all(Some(slot.id()));
        }
        Some(self.suspend(
            slot,
            frame,
            reason,
            SuspendDetail {
                breakpoint_id: Some(bp.id),
                exception: None,
            },
        ))
    }

    fn suspend(
        &self,
        slot: &ThreadSlot,
        frame: &dyn HostFrame,
        reason: StopReason,
        detail: SuspendDetail,
    ) -> TraceAction {
        self.threads
            .suspend(slot, frame, reason, detail, self.events.as_ref())
    }

    fn condition_holds(&self, slot: &ThreadSlot, frame: &dyn HostFrame, bp: &Breakpoint) -> bool {
        let Some(condition) = bp.condition.as_deref() else {
            return true;
        };
        let result = match self
            .registry
            .compiled_condition(bp.id, |source| self.runtime.compile(source))
        {
            Some(Ok(code)) => {
                let _guard = slot.begin_evaluation();
                frame.evaluate_compiled(code.as_ref())
            }
            Some(Err(err)) => Err(err),
            None => return false,
        };
        match result {
            Ok(value) => value.is_truthy(),
            Err(err) => {
                self.report_condition_error(bp, condition, &err);
                false
            }
        }
    }

    fn report_condition_error(&self, bp: &Breakpoint, condition: &str, err: &EvalError) {
        if !self.registry.note_condition_error(bp.id) {
            return;
        }
        tracing::warn!("breakpoint {} condition {:?} failed: {}", bp.id, condition, err);
        self.events.emit(DebugEvent::BreakpointError {
            breakpoint_id: bp.id,
            message: format!("error evaluating condition {:?}: {}", condition, err),
        });
    }

    fn log_point(&self, slot: &ThreadSlot, frame: &dyn HostFrame, template: &str) {
        let mut text = {
            let _guard = slot.begin_evaluation();
            expand_log_message(template, |expr| match frame.evaluate(expr) {
                Ok(Some(value)) => value.repr(),
                Ok(None) => String::new(),
                Err(err) => format!("<{}>", err),
            })
        };
        text.push('\n');
        for chunk in chunk_text(&text, self.output_chunk_size) {
            self.events.emit(DebugEvent::ProcessOutput {
                stream: OutputStream::Log,
                text: chunk.to_string(),
            });
        }
    }
}

impl TraceHook for Interceptor {
    fn on_event(
        &self,
        thread: &ThreadDescriptor,
        frame: &dyn HostFrame,
        event: TraceEvent<'_>,
    ) -> TraceAction {
        if !self.is_active() || is_daemon_thread() {
            return TraceAction::Continue;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(thread, frame, event))) {
            Ok(action) => action,
            Err(_) => {
                self.fault();
                TraceAction::Continue
            }
        }
    }

    fn wants_frame(&self, file: &str) -> bool {
        if !self.is_active() || is_daemon_thread() || self.dont_trace.should_skip(file) {
            return false;
        }
        self.threads.needs_attention()
            || self.registry.has_exception_breakpoints()
            || self.registry.has_file(&self.canonical(file))
    }

    fn on_thread_start(&self, thread: &ThreadDescriptor) {
        if !self.is_active() || is_daemon_thread() {
            return;
        }
        let (_, created) = self.threads.register(thread);
        if created {
            self.events.emit(DebugEvent::thread_created(thread));
        }
    }

    fn on_thread_exit(&self, thread: HostThreadId) {
        if self.threads.remove(thread).is_some() && self.is_active() {
            self.events.emit(DebugEvent::ThreadExited { thread_id: thread });
        }
    }
}

/// ログメッセージの `{式}` を展開する（`{{` `}}` はそのまま波括弧）
pub fn expand_log_message<F>(template: &str, mut eval: F) -> String
where
    F: FnMut(&str) -> String,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut expr = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    expr.push(c);
                }
                if closed {
                    out.push_str(&eval(expr.trim()));
                } else {
                    out.push('{');
                    out.push_str(&expr);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
