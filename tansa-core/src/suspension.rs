//! スレッドの停止と再開
//!
//! 停止は協調的に行います。停止を決めたスレッドはフックの中で自分自身を
//! 条件変数で待機させ、コントローラからの再開を待ちます。
//! 待機中のスレッドはキューに積まれた内部コマンドを自分で実行するため、
//! フレームへのアクセスは常にそのフレームを所有するスレッド上で行われます。

use crate::errors::DebugError;
use crate::event::{DebugEvent, EventSink, ResumeReason, SourceLocation, StopReason};
use crate::host::{ExceptionInfo, HostFrame, HostThreadId, ThreadDescriptor, TraceAction};
use crate::breakpoint::BreakpointId;
use crate::Result;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// スレッドの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendState {
    Running,
    Suspended,
    StepInto,
    StepOver,
    StepReturn,
    Terminated,
}

/// 再開方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    Continue,
    StepInto,
    StepOver,
    StepReturn,
}

impl ResumeMode {
    fn state(self) -> SuspendState {
        match self {
            ResumeMode::Continue => SuspendState::Running,
            ResumeMode::StepInto => SuspendState::StepInto,
            ResumeMode::StepOver => SuspendState::StepOver,
            ResumeMode::StepReturn => SuspendState::StepReturn,
        }
    }

    fn reason(self) -> ResumeReason {
        match self {
            ResumeMode::Continue => ResumeReason::Continue,
            ResumeMode::StepInto => ResumeReason::StepInto,
            ResumeMode::StepOver => ResumeReason::StepOver,
            ResumeMode::StepReturn => ResumeReason::StepReturn,
        }
    }
}

/// ステップ判定に使うイベント種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Line,
    Return,
}

/// 実行中のステップ要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepRequest {
    mode: ResumeMode,
    /// ステップ開始時のスタックの深さ
    origin_depth: usize,
}

impl StepRequest {
    fn should_stop(&self, event: StepEvent, depth: usize) -> bool {
        match (self.mode, event) {
            (ResumeMode::StepInto, StepEvent::Line) => true,
            (ResumeMode::StepOver, StepEvent::Line) => depth <= self.origin_depth,
            (ResumeMode::StepReturn, StepEvent::Return) => depth == self.origin_depth,
            (ResumeMode::StepReturn, StepEvent::Line) => depth < self.origin_depth,
            _ => false,
        }
    }
}

/// フック内での判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Stop(StopReason),
    Terminate,
}

/// スレッド一覧の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Thread,
    CustomFrame,
}

/// スタックフレームの要約
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrameInfo {
    pub index: usize,
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// list_threads の1エントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: u64,
    pub name: String,
    pub kind: ThreadKind,
    pub state: SuspendState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

/// 停止中スレッドのスタック
///
/// 内部コマンドはこの構造を通してフレームに触れます。
pub struct SuspendedStack<'a> {
    thread_id: HostThreadId,
    epoch: u64,
    frames: Vec<&'a dyn HostFrame>,
}

impl<'a> SuspendedStack<'a> {
    /// 最内フレームから呼び出し元をたどってスタックを作る
    pub fn capture(thread_id: HostThreadId, epoch: u64, top: &'a dyn HostFrame) -> Self {
        let mut frames = vec![top];
        let mut current = top.back();
        while let Some(frame) = current {
            frames.push(frame);
            current = frame.back();
        }
        Self {
            thread_id,
            epoch,
            frames,
        }
    }

    pub fn thread_id(&self) -> HostThreadId {
        self.thread_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 0 が最内フレーム
    pub fn frame(&self, index: usize) -> Option<&'a dyn HostFrame> {
        self.frames.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn describe(&self) -> Vec<StackFrameInfo> {
        self.frames
            .iter()
            .enumerate()
            .map(|(index, frame)| StackFrameInfo {
                index,
                function: frame.function().to_string(),
                file: frame.file().to_string(),
                line: frame.line(),
            })
            .collect()
    }
}

/// 停止中のスレッド上で実行される内部コマンド
pub type InternalCommand = Box<dyn FnOnce(&SuspendedStack<'_>) + Send>;

/// 停止の付加情報
#[derive(Debug, Clone, Default)]
pub struct SuspendDetail {
    pub breakpoint_id: Option<BreakpointId>,
    pub exception: Option<ExceptionInfo>,
}

struct ThreadState {
    state: SuspendState,
    step: Option<StepRequest>,
    pause_requested: bool,
    epoch: u64,
    stop_reason: Option<StopReason>,
    location: Option<SourceLocation>,
    stack: Vec<StackFrameInfo>,
    queue: VecDeque<InternalCommand>,
    resume_reason: ResumeReason,
}

/// スレッドごとの制御ブロック
pub struct ThreadSlot {
    descriptor: ThreadDescriptor,
    state: Mutex<ThreadState>,
    wakeup: Condvar,
    /// ステップ・一時停止・終了の要求がある
    attention: AtomicBool,
    /// デバッガがこのスレッド上でコードを評価中
    evaluating: AtomicBool,
}

impl ThreadSlot {
    fn new(descriptor: ThreadDescriptor) -> Self {
        Self {
            descriptor,
            state: Mutex::new(ThreadState {
                state: SuspendState::Running,
                step: None,
                pause_requested: false,
                epoch: 0,
                stop_reason: None,
                location: None,
                stack: Vec::new(),
                queue: VecDeque::new(),
                resume_reason: ResumeReason::Continue,
            }),
            wakeup: Condvar::new(),
            attention: AtomicBool::new(false),
            evaluating: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> HostThreadId {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &ThreadDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SuspendState {
        self.state.lock().state
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating.load(Ordering::Acquire)
    }

    /// 評価中フラグを立てる（ガードの破棄で戻る）
    pub fn begin_evaluation(&self) -> EvaluationGuard<'_> {
        let previous = self.evaluating.swap(true, Ordering::AcqRel);
        EvaluationGuard {
            slot: self,
            previous,
        }
    }
}

/// [`ThreadSlot::begin_evaluation`] のガード
pub struct EvaluationGuard<'a> {
    slot: &'a ThreadSlot,
    previous: bool,
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        self.slot.evaluating.store(self.previous, Ordering::Release);
    }
}

/// スレッド停止マネージャ
pub struct ThreadManager {
    slots: RwLock<HashMap<HostThreadId, Arc<ThreadSlot>>>,
    /// attention が立っているスレッドの数
    attention: AtomicUsize,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            attention: AtomicUsize::new(0),
        }
    }

    /// スレッドを登録する（新規なら `true`）
    pub fn register(&self, thread: &ThreadDescriptor) -> (Arc<ThreadSlot>, bool) {
        if let Some(slot) = self.slots.read().get(&thread.id) {
            return (slot.clone(), false);
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(&thread.id) {
            return (slot.clone(), false);
        }
        let slot = Arc::new(ThreadSlot::new(thread.clone()));
        slots.insert(thread.id, slot.clone());
        (slot, true)
    }

    pub fn slot(&self, id: HostThreadId) -> Option<Arc<ThreadSlot>> {
        self.slots.read().get(&id).cloned()
    }

    fn require(&self, id: HostThreadId) -> Result<Arc<ThreadSlot>> {
        self.slot(id).ok_or(DebugError::UnknownThread(id))
    }

    pub fn remove(&self, id: HostThreadId) -> Option<Arc<ThreadSlot>> {
        let slot = self.slots.write().remove(&id)?;
        if slot.attention.swap(false, Ordering::AcqRel) {
            self.attention.fetch_sub(1, Ordering::AcqRel);
        }
        Some(slot)
    }

    pub fn count(&self) -> usize {
        self.slots.read().len()
    }

    /// いずれかのスレッドにステップ・一時停止の要求があるか
    pub fn needs_attention(&self) -> bool {
        self.attention.load(Ordering::Acquire) > 0
    }

    fn set_attention(&self, slot: &ThreadSlot, on: bool) {
        let previous = slot.attention.swap(on, Ordering::AcqRel);
        match (previous, on) {
            (false, true) => {
                self.attention.fetch_add(1, Ordering::AcqRel);
            }
            (true, false) => {
                self.attention.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    /// ステップ・一時停止・終了要求を判定する（対象スレッド上で呼ぶ）
    ///
    /// 深さの計算はスタックをたどるため、要求があるときだけ `depth` を呼びます。
    pub fn check<D>(&self, slot: &ThreadSlot, event: StepEvent, depth: D) -> Option<Directive>
    where
        D: FnOnce() -> usize,
    {
        if !slot.attention.load(Ordering::Acquire) {
            return None;
        }
        let st = slot.state.lock();
        if st.state == SuspendState::Terminated {
            return Some(Directive::Terminate);
        }
        if st.pause_requested && event == StepEvent::Line {
            return Some(Directive::Stop(StopReason::Pause));
        }
        match st.step {
            Some(step) if step.should_stop(event, depth()) => Some(Directive::Stop(StopReason::Step)),
            _ => None,
        }
    }

    /// 現在のスレッドを停止させ、再開されるまで待機する
    ///
    /// 待機中は内部コマンドを実行します。戻り値はフックがインタプリタに
    /// 返すべき動作です。
    pub fn suspend(
        &self,
        slot: &ThreadSlot,
        frame: &dyn HostFrame,
        reason: StopReason,
        detail: SuspendDetail,
        events: &dyn EventSink,
    ) -> TraceAction {
        let thread_id = slot.id();
        let location = SourceLocation {
            file: frame.file().to_string(),
            line: frame.line(),
            function: frame.function().to_string(),
        };

        let mut st = slot.state.lock();
        if st.state == SuspendState::Terminated {
            return TraceAction::Terminate;
        }
        st.epoch += 1;
        let epoch = st.epoch;
        let stack = SuspendedStack::capture(thread_id, epoch, frame);
        st.state = SuspendState::Suspended;
        st.step = None;
        st.pause_requested = false;
        st.stop_reason = Some(reason);
        st.location = Some(location.clone());
        st.stack = stack.describe();
        self.set_attention(slot, false);
        drop(st);

        tracing::debug!(
            "thread {} suspended at {}:{} ({:?})",
            thread_id,
            location.file,
            location.line,
            reason
        );
        events.emit(DebugEvent::ThreadSuspended {
            thread_id,
            reason,
            location,
            epoch,
            breakpoint_id: detail.breakpoint_id,
            exception: detail.exception,
        });

        let mut st = slot.state.lock();
        loop {
            while let Some(command) = st.queue.pop_front() {
                MutexGuard::unlocked(&mut st, || {
                    let _guard = slot.begin_evaluation();
                    if panic::catch_unwind(AssertUnwindSafe(|| command(&stack))).is_err() {
                        tracing::error!("internal command panicked on thread {}", thread_id);
                    }
                });
            }
            if st.state != SuspendState::Suspended {
                break;
            }
            slot.wakeup.wait(&mut st);
        }

        let resumed = st.state;
        let resume_reason = st.resume_reason;
        st.stop_reason = None;
        st.location = None;
        st.stack.clear();
        let action = match resumed {
            SuspendState::Terminated => TraceAction::Terminate,
            SuspendState::StepInto | SuspendState::StepOver | SuspendState::StepReturn => {
                let mode = match resumed {
                    SuspendState::StepInto => ResumeMode::StepInto,
                    SuspendState::StepOver => ResumeMode::StepOver,
                    _ => ResumeMode::StepReturn,
                };
                st.step = Some(StepRequest {
                    mode,
                    origin_depth: stack.len(),
                });
                self.set_attention(slot, true);
                TraceAction::Continue
            }
            _ => TraceAction::Continue,
        };
        drop(st);

        events.emit(DebugEvent::ThreadResumed {
            thread_id,
            reason: resume_reason,
        });
        action
    }

    /// 停止中のスレッドを再開する
    pub fn resume(&self, id: HostThreadId, mode: ResumeMode) -> Result<()> {
        let slot = self.require(id)?;
        let mut st = slot.state.lock();
        if st.state != SuspendState::Suspended {
            return Err(DebugError::NotSuspended(id));
        }
        st.state = mode.state();
        st.resume_reason = mode.reason();
        slot.wakeup.notify_all();
        Ok(())
    }

    /// 停止中の全スレッドを再開し、再開したIDを返す
    pub fn resume_all(&self) -> Vec<HostThreadId> {
        self.release(ResumeReason::Continue, false)
    }

    /// 全スレッドのステップ・一時停止要求を取り消し、停止中のスレッドを再開する
    pub fn release_all(&self) -> Vec<HostThreadId> {
        self.release(ResumeReason::Detach, true)
    }

    fn release(&self, reason: ResumeReason, clear_requests: bool) -> Vec<HostThreadId> {
        let slots: Vec<Arc<ThreadSlot>> = self.slots.read().values().cloned().collect();
        let mut resumed = Vec::new();
        for slot in slots {
            let mut st = slot.state.lock();
            if clear_requests {
                st.step = None;
                st.pause_requested = false;
                if st.state != SuspendState::Terminated {
                    self.set_attention(&slot, false);
                }
            }
            if st.state == SuspendState::Suspended {
                st.state = SuspendState::Running;
                st.resume_reason = reason;
                slot.wakeup.notify_all();
                resumed.push(slot.id());
            } else if clear_requests && st.state != SuspendState::Terminated {
                st.state = SuspendState::Running;
            }
        }
        resumed.sort_unstable();
        resumed
    }

    /// スレッドに一時停止を要求する（次の行イベントで停止）
    pub fn pause(&self, id: HostThreadId) -> Result<()> {
        let slot = self.require(id)?;
        self.request_pause(&slot);
        Ok(())
    }

    /// `except` 以外の全スレッドに一時停止を要求する
    pub fn pause_all(&self, except: Option<HostThreadId>) -> Vec<HostThreadId> {
        let slots: Vec<Arc<ThreadSlot>> = self.slots.read().values().cloned().collect();
        let mut requested = Vec::new();
        for slot in slots {
            if Some(slot.id()) == except {
                continue;
            }
            if self.request_pause(&slot) {
                requested.push(slot.id());
            }
        }
        requested.sort_unstable();
        requested
    }

    fn request_pause(&self, slot: &ThreadSlot) -> bool {
        let mut st = slot.state.lock();
        match st.state {
            SuspendState::Suspended | SuspendState::Terminated => false,
            _ => {
                st.pause_requested = true;
                self.set_attention(slot, true);
                true
            }
        }
    }

    /// スレッドの終了を要求する
    ///
    /// 停止中なら即座に起こし、実行中なら次のイベントで終了させます。
    pub fn kill(&self, id: HostThreadId) -> Result<()> {
        let slot = self.require(id)?;
        let mut st = slot.state.lock();
        st.state = SuspendState::Terminated;
        st.resume_reason = ResumeReason::Kill;
        st.step = None;
        st.pause_requested = false;
        self.set_attention(&slot, true);
        slot.wakeup.notify_all();
        Ok(())
    }

    /// 停止中のスレッドに内部コマンドを送る
    ///
    /// `epoch` を指定した場合、現在の停止と一致しなければ `StaleFrame` です。
    pub fn post(
        &self,
        id: HostThreadId,
        epoch: Option<u64>,
        frame_index: usize,
        command: InternalCommand,
    ) -> Result<()> {
        let slot = self.require(id)?;
        let mut st = slot.state.lock();
        if st.state != SuspendState::Suspended {
            return match epoch {
                Some(epoch) => Err(DebugError::StaleFrame {
                    thread_id: id,
                    epoch,
                    frame_index,
                }),
                None => Err(DebugError::NotSuspended(id)),
            };
        }
        if let Some(epoch) = epoch {
            if epoch != st.epoch || frame_index >= st.stack.len() {
                return Err(DebugError::StaleFrame {
                    thread_id: id,
                    epoch,
                    frame_index,
                });
            }
        }
        st.queue.push_back(command);
        slot.wakeup.notify_all();
        Ok(())
    }

    /// 停止中のスレッドのスタック
    pub fn stack(&self, id: HostThreadId) -> Result<(u64, StopReason, Vec<StackFrameInfo>)> {
        let slot = self.require(id)?;
        let st = slot.state.lock();
        match (st.state, st.stop_reason) {
            (SuspendState::Suspended, Some(reason)) => Ok((st.epoch, reason, st.stack.clone())),
            _ => Err(DebugError::NotSuspended(id)),
        }
    }

    pub fn summaries(&self) -> Vec<ThreadSummary> {
        let slots: Vec<Arc<ThreadSlot>> = self.slots.read().values().cloned().collect();
        let mut list: Vec<ThreadSummary> = slots
            .iter()
            .map(|slot| {
                let st = slot.state.lock();
                let suspended = st.state == SuspendState::Suspended;
                ThreadSummary {
                    id: slot.id(),
                    name: slot.descriptor.name.clone(),
                    kind: ThreadKind::Thread,
                    state: st.state,
                    stop_reason: st.stop_reason.filter(|_| suspended),
                    epoch: suspended.then_some(st.epoch),
                    location: st.location.clone().filter(|_| suspended),
                }
            })
            .collect();
        list.sort_by_key(|summary| summary.id);
        list
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EvalError;
    use crate::host::{CompiledCode, Scope, ValueHandle};
    use std::thread;
    use std::time::{Duration, Instant};

    struct StubFrame {
        line: u32,
        parent: Option<Box<StubFrame>>,
    }

    impl HostFrame for StubFrame {
        fn file(&self) -> &str {
            "stub.src"
        }
        fn line(&self) -> u32 {
            self.line
        }
        fn function(&self) -> &str {
            if self.parent.is_some() {
                "inner"
            } else {
                "<module>"
            }
        }
        fn back(&self) -> Option<&dyn HostFrame> {
            self.parent.as_deref().map(|f| f as &dyn HostFrame)
        }
        fn variables(&self, _scope: Scope) -> Vec<(String, ValueHandle)> {
            Vec::new()
        }
        fn evaluate(&self, _source: &str) -> std::result::Result<Option<ValueHandle>, EvalError> {
            Ok(None)
        }
        fn evaluate_compiled(
            &self,
            _code: &dyn CompiledCode,
        ) -> std::result::Result<ValueHandle, EvalError> {
            Err(EvalError::new("Unsupported", "stub"))
        }
    }

    struct Events(Mutex<Vec<DebugEvent>>);

    impl EventSink for Events {
        fn emit(&self, event: DebugEvent) {
            self.0.lock().push(event);
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_step_rules() {
        let into = StepRequest {
            mode: ResumeMode::StepInto,
            origin_depth: 2,
        };
        assert!(into.should_stop(StepEvent::Line, 3));

        let over = StepRequest {
            mode: ResumeMode::StepOver,
            origin_depth: 2,
        };
        assert!(!over.should_stop(StepEvent::Line, 3));
        assert!(over.should_stop(StepEvent::Line, 2));
        assert!(over.should_stop(StepEvent::Line, 1));

        let ret = StepRequest {
            mode: ResumeMode::StepReturn,
            origin_depth: 2,
        };
        assert!(!ret.should_stop(StepEvent::Line, 2));
        assert!(!ret.should_stop(StepEvent::Return, 3));
        assert!(ret.should_stop(StepEvent::Return, 2));
        assert!(ret.should_stop(StepEvent::Line, 1));
    }

    #[test]
    fn test_suspend_runs_commands_and_resumes() {
        let manager = Arc::new(ThreadManager::new());
        let events = Arc::new(Events(Mutex::new(Vec::new())));
        let (slot, created) = manager.register(&ThreadDescriptor::new(1, "MainThread"));
        assert!(created);

        let worker = {
            let manager = manager.clone();
            let events = events.clone();
            let slot = slot.clone();
            thread::spawn(move || {
                let frame = StubFrame {
                    line: 4,
                    parent: Some(Box::new(StubFrame {
                        line: 10,
                        parent: None,
                    })),
                };
                manager.suspend(
                    &slot,
                    &frame,
                    StopReason::Breakpoint,
                    SuspendDetail::default(),
                    events.as_ref(),
                )
            })
        };

        wait_until(|| slot.state() == SuspendState::Suspended);
        let (epoch, reason, frames) = manager.stack(1).unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].line, 10);

        let (tx, rx) = crossbeam::channel::bounded(1);
        manager
            .post(
                1,
                Some(epoch),
                1,
                Box::new(move |stack| {
                    let line = stack.frame(1).map(|f| f.line());
                    let _ = tx.send((line, stack.epoch()));
                }),
            )
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (Some(10), 1)
        );

        assert_eq!(
            manager.post(1, Some(epoch + 1), 0, Box::new(|_| {})),
            Err(DebugError::StaleFrame {
                thread_id: 1,
                epoch: epoch + 1,
                frame_index: 0
            })
        );

        manager.resume(1, ResumeMode::StepOver).unwrap();
        assert_eq!(worker.join().unwrap(), TraceAction::Continue);
        assert!(manager.needs_attention());
        assert_eq!(
            manager.check(&slot, StepEvent::Line, || 3),
            None,
            "deeper lines are skipped by step over"
        );
        assert_eq!(
            manager.check(&slot, StepEvent::Line, || 2),
            Some(Directive::Stop(StopReason::Step))
        );

        assert_eq!(manager.resume(1, ResumeMode::Continue), Err(DebugError::NotSuspended(1)));
        assert!(manager.stack(1).is_err());

        let events = events.0.lock();
        assert!(matches!(events[0], DebugEvent::ThreadSuspended { epoch: 1, .. }));
        assert!(matches!(
            events[1],
            DebugEvent::ThreadResumed {
                reason: ResumeReason::StepOver,
                ..
            }
        ));
    }

    #[test]
    fn test_pause_and_kill() {
        let manager = ThreadManager::new();
        let (slot, _) = manager.register(&ThreadDescriptor::new(5, "worker"));
        assert!(!manager.needs_attention());

        assert_eq!(manager.pause_all(None), vec![5]);
        assert!(manager.needs_attention());
        assert_eq!(manager.check(&slot, StepEvent::Return, || 1), None);
        assert_eq!(
            manager.check(&slot, StepEvent::Line, || 1),
            Some(Directive::Stop(StopReason::Pause))
        );

        manager.kill(5).unwrap();
        assert_eq!(
            manager.check(&slot, StepEvent::Line, || 1),
            Some(Directive::Terminate)
        );
        assert_eq!(manager.kill(6), Err(DebugError::UnknownThread(6)));

        manager.remove(5);
        assert!(!manager.needs_attention());
    }

    #[test]
    fn test_release_all_clears_requests() {
        let manager = ThreadManager::new();
        let (slot, _) = manager.register(&ThreadDescriptor::new(2, "t"));
        manager.pause(2).unwrap();
        assert!(manager.release_all().is_empty());
        assert!(!manager.needs_attention());
        assert_eq!(manager.check(&slot, StepEvent::Line, || 1), None);
    }
}
