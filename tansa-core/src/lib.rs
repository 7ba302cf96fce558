//! Tansa デバッガのコア機能
//!
//! このクレートは、動的インタプリタ向けランタイムデバッガの中核を提供します。
//! ブレークポイント管理、実行イベントのインターセプト、スレッドの停止/再開、
//! フレームと変数のイントロスペクションを統合します。
//! インタプリタ本体は [`host`] のトレイトを通して利用します。

pub mod breakpoint;
pub mod config;
pub mod custom_frames;
pub mod daemon;
pub mod debugger;
pub mod dont_trace;
pub mod errors;
pub mod event;
pub mod host;
pub mod interceptor;
pub mod introspection;
pub mod suspension;

pub use breakpoint::{
    normalize_path, Breakpoint, BreakpointId, BreakpointLocation, BreakpointRegistry,
    BreakpointSpec, ExceptionBreakpoint, SuspendPolicy,
};
pub use config::{DebuggerConfig, InspectLimits, InterceptionStrategy};
pub use custom_frames::{CustomFrameId, CustomFrameInfo, CustomFrameRegistry};
pub use daemon::{is_daemon_thread, DaemonRegistry, KillSignal};
pub use debugger::{DetachReason, Debugger, FrameHandle, Reply, StackReply};
pub use dont_trace::DontTraceFilter;
pub use errors::{ConfigError, DebugError, EvalError, HostError, SessionError};
pub use event::{DebugEvent, EventHub, EventSink, ResumeReason, SourceLocation, StopReason};
pub use host::{
    CompiledCode, CustomFrame, ExceptionInfo, ExceptionPhase, HookMode, HostFrame, HostThreadId,
    Inspect, OutputSink, OutputStream, Runtime, Scope, ThreadDescriptor, TraceAction, TraceEvent, TraceHook,
    ValueHandle,
};
pub use interceptor::Interceptor;
pub use introspection::{FrameSnapshot, Inspector, VariableNode};
pub use suspension::{
    ResumeMode, StackFrameInfo, SuspendState, SuspendedStack, ThreadKind, ThreadManager,
    ThreadSummary,
};

/// デバッガ操作の結果型
pub type Result<T, E = DebugError> = std::result::Result<T, E>;
