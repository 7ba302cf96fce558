//! スクリプトランタイム
//!
//! グローバル変数・スレッド・フック・出力先をすべてのインタプリタスレッドで共有します。

use crate::ast::{FunctionDef, Program};
use crate::interp::{CompiledExpr, Interp, ScriptException};
use crate::parser::parse_program;
use crate::value::Value;
use crate::{Result, ScriptError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tansa_core::{
    CompiledCode, EvalError, HookMode, HostError, HostThreadId, OutputSink, OutputStream, Runtime,
    ThreadDescriptor, TraceHook,
};

/// 各文の実行前に呼ばれるコールバック
pub type Safepoint = Arc<dyn Fn() + Send + Sync>;

/// スクリプトスレッドのスタックサイズ
const THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct InstalledHook {
    pub(crate) hook: Arc<dyn TraceHook>,
    pub(crate) mode: HookMode,
}

struct Shared {
    globals: RwLock<BTreeMap<String, Value>>,
    hook: RwLock<Option<InstalledHook>>,
    sink: RwLock<Option<Arc<dyn OutputSink>>>,
    safepoint: RwLock<Option<Safepoint>>,
    echo: AtomicBool,
    frame_eval: AtomicBool,
    threads: Mutex<BTreeMap<HostThreadId, ThreadDescriptor>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_thread_id: AtomicU64,
}

/// スクリプトランタイム
///
/// クローンは同じランタイムを指します。
#[derive(Clone)]
pub struct ScriptRuntime {
    shared: Arc<Shared>,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                globals: RwLock::new(BTreeMap::new()),
                hook: RwLock::new(None),
                sink: RwLock::new(None),
                safepoint: RwLock::new(None),
                echo: AtomicBool::new(true),
                frame_eval: AtomicBool::new(true),
                threads: Mutex::new(BTreeMap::new()),
                handles: Mutex::new(Vec::new()),
                next_thread_id: AtomicU64::new(1),
            }),
        }
    }

    /// `print` の出力をプロセスの標準出力にも書くか
    pub fn set_echo(&self, echo: bool) {
        self.shared.echo.store(echo, Ordering::Relaxed);
    }

    /// フレーム評価フックを提供するか（無効にするとトレースのみ）
    pub fn set_frame_eval_support(&self, supported: bool) {
        self.shared.frame_eval.store(supported, Ordering::Relaxed);
    }

    pub fn set_safepoint(&self, safepoint: Option<Safepoint>) {
        *self.shared.safepoint.write() = safepoint;
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.shared.globals.read().get(name).cloned()
    }

    pub fn set_global(&self, name: &str, value: Value) {
        self.shared.globals.write().insert(name.to_string(), value);
    }

    /// 名前順のグローバル変数
    pub fn globals(&self) -> Vec<(String, Value)> {
        self.shared
            .globals
            .read()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn hook_mode(&self) -> Option<HookMode> {
        self.shared.hook.read().as_ref().map(|installed| installed.mode)
    }

    /// ファイルを読み込んで実行する
    pub fn run_file(&self, path: &Path) -> Result<()> {
        let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let program = parse_program(&path.to_string_lossy(), &source)?;
        self.run_main(&program)
    }

    /// メインスレッドとしてプログラムを実行する
    ///
    /// `spawn` で起動したスレッドがすべて終わるまで戻りません。
    pub fn run_main(&self, program: &Program) -> Result<()> {
        let thread = self.register_thread(|_| "MainThread".to_string());
        self.thread_started(&thread);

        let interp = Interp::new(self.clone(), thread.clone());
        let result = interp.run_module(program);
        if let Err(exc) = &result {
            self.report_uncaught(&thread, exc);
        }

        self.join_threads();
        self.thread_finished(thread.id);
        result.map_err(|exc| ScriptError::Uncaught {
            type_name: exc.info.type_name,
            message: exc.info.message,
        })
    }

    /// 起動済みのスレッドの終了を待つ
    pub fn join_threads(&self) {
        loop {
            let handles = std::mem::take(&mut *self.shared.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::warn!("script thread panicked");
                }
            }
        }
    }

    pub(crate) fn hook(&self) -> Option<InstalledHook> {
        self.shared.hook.read().clone()
    }

    pub(crate) fn run_safepoint(&self) {
        let safepoint = self.shared.safepoint.read().clone();
        if let Some(safepoint) = safepoint {
            safepoint();
        }
    }

    pub(crate) fn write_output(&self, stream: OutputStream, text: &str) {
        let sink = self.shared.sink.read().clone();
        if let Some(sink) = sink {
            sink.write(stream, text);
        }
        if self.shared.echo.load(Ordering::Relaxed) {
            let _ = match stream {
                OutputStream::Stderr => io::stderr().lock().write_all(text.as_bytes()),
                _ => io::stdout().lock().write_all(text.as_bytes()),
            };
        }
    }

    /// 新しいスクリプトスレッドで関数を実行する
    pub(crate) fn spawn(&self, def: Arc<FunctionDef>, args: Vec<Value>) -> io::Result<HostThreadId> {
        let thread = self.register_thread(|id| format!("Thread-{}", id));
        let runtime = self.clone();
        let descriptor = thread.clone();
        let spawned = thread::Builder::new()
            .name(thread.name.clone())
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || {
                runtime.thread_started(&descriptor);
                let interp = Interp::new(runtime.clone(), descriptor.clone());
                if let Err(exc) = interp.run_function(&def, args) {
                    runtime.report_uncaught(&descriptor, &exc);
                }
                runtime.thread_finished(descriptor.id);
            });

        match spawned {
            Ok(handle) => {
                self.shared.handles.lock().push(handle);
                Ok(thread.id)
            }
            Err(err) => {
                self.shared.threads.lock().remove(&thread.id);
                Err(err)
            }
        }
    }

    fn register_thread<F>(&self, name: F) -> ThreadDescriptor
    where
        F: FnOnce(HostThreadId) -> String,
    {
        let id = self.shared.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = ThreadDescriptor::new(id, name(id));
        self.shared.threads.lock().insert(id, thread.clone());
        thread
    }

    fn thread_started(&self, thread: &ThreadDescriptor) {
        if let Some(installed) = self.hook() {
            installed.hook.on_thread_start(thread);
        }
    }

    fn thread_finished(&self, id: HostThreadId) {
        self.shared.threads.lock().remove(&id);
        if let Some(installed) = self.hook() {
            installed.hook.on_thread_exit(id);
        }
    }

    fn report_uncaught(&self, thread: &ThreadDescriptor, exc: &ScriptException) {
        tracing::debug!("uncaught exception in {}: {}", thread.name, exc);
        self.write_output(
            OutputStream::Stderr,
            &format!("Exception in {}: {}\n", thread.name, exc),
        );
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for ScriptRuntime {
    fn name(&self) -> &str {
        "tansa-script"
    }

    fn supports_frame_eval(&self) -> bool {
        self.shared.frame_eval.load(Ordering::Relaxed)
    }

    fn install_hook(&self, hook: Arc<dyn TraceHook>, mode: HookMode) -> std::result::Result<(), HostError> {
        if mode == HookMode::FrameEval && !self.supports_frame_eval() {
            return Err(HostError::Unsupported("frame evaluation hook".into()));
        }
        let mut installed = self.shared.hook.write();
        if installed.is_some() {
            return Err(HostError::HookAlreadyInstalled);
        }
        *installed = Some(InstalledHook { hook, mode });
        Ok(())
    }

    fn uninstall_hook(&self) {
        self.shared.hook.write().take();
    }

    fn threads(&self) -> Vec<ThreadDescriptor> {
        self.shared.threads.lock().values().cloned().collect()
    }

    fn compile(&self, source: &str) -> std::result::Result<Arc<dyn CompiledCode>, EvalError> {
        Ok(Arc::new(CompiledExpr::compile(source)?))
    }

    fn set_output_sink(&self, sink: Option<Arc<dyn OutputSink>>) {
        *self.shared.sink.write() = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tansa_core::{HostFrame, TraceAction, TraceEvent};

    /// イベントを記録するだけのフック
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        wanted: AtomicBool,
    }

    impl TraceHook for Recorder {
        fn on_event(
            &self,
            thread: &ThreadDescriptor,
            frame: &dyn HostFrame,
            event: TraceEvent<'_>,
        ) -> TraceAction {
            let kind = match event {
                TraceEvent::Call => "call".to_string(),
                TraceEvent::Line => "line".to_string(),
                TraceEvent::Return => "return".to_string(),
                TraceEvent::Exception { info, phase } => format!("{:?} {}", phase, info.type_name),
            };
            self.events.lock().push(format!(
                "{} {} {}:{} {}",
                thread.name,
                kind,
                frame.function(),
                frame.line(),
                frame.depth()
            ));
            TraceAction::Continue
        }

        fn wants_frame(&self, _file: &str) -> bool {
            self.wanted.load(Ordering::Relaxed)
        }

        fn on_thread_start(&self, thread: &ThreadDescriptor) {
            self.events.lock().push(format!("start {}", thread.name));
        }

        fn on_thread_exit(&self, thread: HostThreadId) {
            self.events.lock().push(format!("exit {}", thread));
        }
    }

    fn runtime() -> ScriptRuntime {
        let runtime = ScriptRuntime::new();
        runtime.set_echo(false);
        runtime
    }

    #[test]
    fn test_trace_events() {
        let runtime = runtime();
        let recorder = Arc::new(Recorder::default());
        runtime.install_hook(recorder.clone(), HookMode::Trace).unwrap();
        assert!(matches!(
            runtime.install_hook(recorder.clone(), HookMode::Trace),
            Err(HostError::HookAlreadyInstalled)
        ));

        let program = parse_program("t.src", "def f():\n    return 1\nx = f()\n").unwrap();
        runtime.run_main(&program).unwrap();

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                "start MainThread",
                "MainThread call <module>:1 1",
                "MainThread line <module>:1 1",
                "MainThread line <module>:3 1",
                "MainThread call f:1 2",
                "MainThread line f:2 2",
                "MainThread return f:2 2",
                "MainThread return <module>:3 1",
                "exit 1",
            ]
        );
    }

    #[test]
    fn test_frame_eval_filters_frames() {
        let runtime = runtime();
        let recorder = Arc::new(Recorder::default());
        runtime.install_hook(recorder.clone(), HookMode::FrameEval).unwrap();

        let program = parse_program("t.src", "x = 1\n").unwrap();
        runtime.run_main(&program).unwrap();
        assert_eq!(recorder.events.lock().clone(), vec!["start MainThread", "exit 1"]);

        runtime.uninstall_hook();
        runtime.set_frame_eval_support(false);
        assert!(matches!(
            runtime.install_hook(recorder, HookMode::FrameEval),
            Err(HostError::Unsupported(_))
        ));
    }

    #[test]
    fn test_uncaught_exception_event() {
        let runtime = runtime();
        let recorder = Arc::new(Recorder::default());
        runtime.install_hook(recorder.clone(), HookMode::Trace).unwrap();

        let program = parse_program("t.src", "raise KeyError('k')\n").unwrap();
        let err = runtime.run_main(&program).unwrap_err();
        assert!(matches!(err, ScriptError::Uncaught { ref type_name, .. } if type_name == "KeyError"));

        let events = recorder.events.lock().clone();
        assert!(events.contains(&"MainThread Raised KeyError <module>:1 1".to_string()));
        assert!(events.contains(&"MainThread Uncaught KeyError <module>:1 1".to_string()));
    }

    #[test]
    fn test_spawned_threads_share_globals() {
        let runtime = runtime();
        let program = parse_program(
            "t.src",
            "\
results = []
def work(n):
    append(results, n * 10)
spawn work(1)
spawn work(2)
",
        )
        .unwrap();
        runtime.run_main(&program).unwrap();

        let Some(Value::List(items)) = runtime.global("results") else {
            panic!("results missing");
        };
        let mut values: Vec<String> = items.lock().iter().map(Value::repr).collect();
        values.sort();
        assert_eq!(values, vec!["10", "20"]);
        assert!(runtime.threads().is_empty());
    }

    #[test]
    fn test_compile_and_output_sink() {
        struct Capture(Mutex<String>);
        impl OutputSink for Capture {
            fn write(&self, _stream: OutputStream, text: &str) {
                self.0.lock().push_str(text);
            }
        }

        let runtime = runtime();
        assert!(runtime.compile("1 +").is_err());
        assert_eq!(runtime.compile("a == 1").unwrap().source(), "a == 1");

        let capture = Arc::new(Capture(Mutex::new(String::new())));
        runtime.set_output_sink(Some(capture.clone()));
        let program = parse_program("t.src", "print 'hello', 42\n").unwrap();
        runtime.run_main(&program).unwrap();
        assert_eq!(capture.0.lock().as_str(), "hello 42\n");
    }
}
