//! インタプリタ本体
//!
//! 各文の実行前に安全点コールバックを呼び、フックがあれば行イベントを通知します。
//! フレームはRustのスタック上に置かれ、親フレームへの参照でつながります。
//! そのためデバッガがフレームに触れられるのは、フックの中で停止している間だけです。

use crate::ast::{BinaryOp, Expr, FunctionDef, Program, Stmt, StmtKind, Target};
use crate::parser::{parse_expression, parse_snippet, ParseError};
use crate::runtime::ScriptRuntime;
use crate::value::{Builtin, Value};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tansa_core::{
    CompiledCode, EvalError, ExceptionInfo, ExceptionPhase, HookMode, HostFrame, OutputStream,
    Scope, ThreadDescriptor, TraceAction, TraceEvent, ValueHandle,
};

/// 関数呼び出しの最大の深さ
const MAX_CALL_DEPTH: usize = 64;

/// 1つの文字列の最大バイト数
const MAX_STR_BYTES: usize = 16 * 1024 * 1024;

/// `range()` が作るリストの最大の長さ
const MAX_RANGE_LEN: i64 = 1 << 20;

/// スクリプトの例外
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    pub info: ExceptionInfo,
    /// 送出イベントを通知済みか
    reported: bool,
}

impl ScriptException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            info: ExceptionInfo {
                type_name: type_name.into(),
                message: message.into(),
            },
            reported: false,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.info.type_name
    }

    pub fn message(&self) -> &str {
        &self.info.message
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.info.type_name, self.info.message)
    }
}

/// 通常の制御フロー以外での脱出
#[derive(Debug)]
pub(crate) enum Unwind {
    Raise(ScriptException),
    /// デバッガによるスレッド終了
    Terminate,
}

type Exec<T> = std::result::Result<T, Unwind>;

fn raise<T>(type_name: &str, message: impl Into<String>) -> Exec<T> {
    Err(Unwind::Raise(ScriptException::new(type_name, message)))
}

impl From<Unwind> for EvalError {
    fn from(unwind: Unwind) -> Self {
        match unwind {
            Unwind::Raise(exc) => EvalError::new(exc.info.type_name, exc.info.message),
            Unwind::Terminate => EvalError::new("Terminated", "thread was terminated"),
        }
    }
}

impl From<ParseError> for EvalError {
    fn from(err: ParseError) -> Self {
        EvalError::new("SyntaxError", err.message)
    }
}

enum Flow {
    Normal,
    Return(Value),
}

/// [`tansa_core::Runtime::compile`] の結果
pub(crate) struct CompiledExpr {
    source: String,
    expr: Expr,
}

impl CompiledExpr {
    pub(crate) fn compile(source: &str) -> Result<Self, EvalError> {
        Ok(Self {
            source: source.to_string(),
            expr: parse_expression(source)?,
        })
    }
}

impl CompiledCode for CompiledExpr {
    fn source(&self) -> &str {
        &self.source
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 1スレッド分の実行コンテキスト
pub(crate) struct Interp {
    runtime: ScriptRuntime,
    thread: ThreadDescriptor,
}

/// 実行中のフレーム
pub(crate) struct Frame<'a> {
    interp: &'a Interp,
    parent: Option<&'a Frame<'a>>,
    depth: usize,
    file: Arc<str>,
    function: Arc<str>,
    line: Cell<u32>,
    /// モジュールフレームは `None`（代入先はグローバル）
    locals: Option<RefCell<Vec<(String, Value)>>>,
    declared_globals: RefCell<Vec<String>>,
    /// フレーム評価モードでフックが対象と判断した
    wanted: Cell<bool>,
    /// フックが以降のイベントを不要とした
    skipped: Cell<bool>,
}

impl<'a> Frame<'a> {
    fn new(
        interp: &'a Interp,
        parent: Option<&'a Frame<'a>>,
        file: Arc<str>,
        function: Arc<str>,
        line: u32,
        locals: Option<Vec<(String, Value)>>,
    ) -> Self {
        Self {
            interp,
            parent,
            depth: parent.map_or(1, |p| p.depth + 1),
            file,
            function,
            line: Cell::new(line),
            locals: locals.map(RefCell::new),
            declared_globals: RefCell::new(Vec::new()),
            wanted: Cell::new(false),
            skipped: Cell::new(false),
        }
    }

    fn is_global(&self, name: &str) -> bool {
        self.locals.is_none() || self.declared_globals.borrow().iter().any(|n| n == name)
    }

    fn load(&self, name: &str) -> Exec<Value> {
        if !self.is_global(name) {
            if let Some(locals) = &self.locals {
                let found = locals
                    .borrow()
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone());
                if let Some(value) = found {
                    return Ok(value);
                }
            }
        }
        if let Some(value) = self.interp.runtime.global(name) {
            return Ok(value);
        }
        match Builtin::from_name(name) {
            Some(builtin) => Ok(Value::Builtin(builtin)),
            None => raise("NameError", format!("name '{}' is not defined", name)),
        }
    }

    fn store(&self, name: &str, value: Value) {
        match &self.locals {
            Some(locals) if !self.is_global(name) => {
                let mut locals = locals.borrow_mut();
                match locals.iter_mut().find(|(n, _)| n == name) {
                    Some(slot) => slot.1 = value,
                    None => locals.push((name.to_string(), value)),
                }
            }
            _ => self.interp.runtime.set_global(name, value),
        }
    }
}

impl HostFrame for Frame<'_> {
    fn file(&self) -> &str {
        &self.file
    }

    fn line(&self) -> u32 {
        self.line.get()
    }

    fn function(&self) -> &str {
        &self.function
    }

    fn back(&self) -> Option<&dyn HostFrame> {
        self.parent.map(|parent| parent as &dyn HostFrame)
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn variables(&self, scope: Scope) -> Vec<(String, ValueHandle)> {
        match scope {
            Scope::Local => match &self.locals {
                Some(locals) => locals
                    .borrow()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.handle()))
                    .collect(),
                None => Vec::new(),
            },
            Scope::Global => self
                .interp
                .runtime
                .globals()
                .into_iter()
                .map(|(name, value)| (name, value.handle()))
                .collect(),
            Scope::Class => Vec::new(),
        }
    }

    fn evaluate(&self, source: &str) -> Result<Option<ValueHandle>, EvalError> {
        let stmt = parse_snippet(source)?;
        match &stmt.kind {
            StmtKind::Expr(expr) => Ok(Some(self.interp.eval(self, expr)?.handle())),
            _ => {
                self.interp.exec_stmt(self, &stmt)?;
                Ok(None)
            }
        }
    }

    fn evaluate_compiled(&self, code: &dyn CompiledCode) -> Result<ValueHandle, EvalError> {
        match code.as_any().downcast_ref::<CompiledExpr>() {
            Some(compiled) => Ok(self.interp.eval(self, &compiled.expr)?.handle()),
            None => self
                .evaluate(code.source())?
                .ok_or_else(|| EvalError::new("SyntaxError", "not an expression")),
        }
    }
}

impl Interp {
    pub(crate) fn new(runtime: ScriptRuntime, thread: ThreadDescriptor) -> Self {
        Self { runtime, thread }
    }

    /// モジュールを実行する
    pub(crate) fn run_module(&self, program: &Program) -> Result<(), ScriptException> {
        let frame = Frame::new(self, None, program.file.clone(), "<module>".into(), 1, None);
        let result = self.run_body(&frame, &program.body);
        self.finish_root(&frame, result)
    }

    /// スレッドの最上位で関数を実行する
    pub(crate) fn run_function(
        &self,
        def: &FunctionDef,
        args: Vec<Value>,
    ) -> Result<(), ScriptException> {
        let locals = bind_arguments(def, args).map_err(|unwind| match unwind {
            Unwind::Raise(exc) => exc,
            Unwind::Terminate => ScriptException::new("Terminated", "thread was terminated"),
        })?;
        let frame = Frame::new(
            self,
            None,
            def.file.clone(),
            def.name.as_str().into(),
            def.line,
            Some(locals),
        );
        let result = self.run_body(&frame, &def.body);
        self.finish_root(&frame, result)
    }

    fn finish_root(&self, frame: &Frame<'_>, result: Exec<Value>) -> Result<(), ScriptException> {
        match result {
            Ok(_) | Err(Unwind::Terminate) => Ok(()),
            Err(Unwind::Raise(exc)) => {
                let event = TraceEvent::Exception {
                    info: &exc.info,
                    phase: ExceptionPhase::Uncaught,
                };
                // 終了要求でもスレッドはここで終わる
                let _ = self.trace(frame, event);
                Err(exc)
            }
        }
    }

    fn trace(&self, frame: &Frame<'_>, event: TraceEvent<'_>) -> Exec<()> {
        let Some(installed) = self.runtime.hook() else {
            return Ok(());
        };
        if frame.skipped.get() {
            return Ok(());
        }
        if installed.mode == HookMode::FrameEval && !frame.wanted.get() {
            if !installed.hook.wants_frame(&frame.file) {
                return Ok(());
            }
            frame.wanted.set(true);
        }
        match installed.hook.on_event(&self.thread, frame, event) {
            TraceAction::Continue => Ok(()),
            TraceAction::SkipFrame => {
                frame.skipped.set(true);
                Ok(())
            }
            TraceAction::Terminate => Err(Unwind::Terminate),
        }
    }

    /// 文の実行前に呼ぶ
    fn before_line(&self, frame: &Frame<'_>, line: u32) -> Exec<()> {
        frame.line.set(line);
        self.runtime.run_safepoint();
        self.trace(frame, TraceEvent::Line)
    }

    fn run_body(&self, frame: &Frame<'_>, body: &[Stmt]) -> Exec<Value> {
        self.trace(frame, TraceEvent::Call)?;
        let value = match self.exec_block(frame, body)? {
            Flow::Return(value) => value,
            Flow::Normal => Value::None,
        };
        self.trace(frame, TraceEvent::Return)?;
        Ok(value)
    }

    fn exec_block(&self, frame: &Frame<'_>, body: &[Stmt]) -> Exec<Flow> {
        for stmt in body {
            self.before_line(frame, stmt.line)?;
            match self.exec_stmt(frame, stmt) {
                Ok(Flow::Normal) => {}
                Ok(flow) => return Ok(flow),
                Err(Unwind::Raise(mut exc)) => {
                    if !exc.reported {
                        exc.reported = true;
                        let event = TraceEvent::Exception {
                            info: &exc.info,
                            phase: ExceptionPhase::Raised,
                        };
                        self.trace(frame, event)?;
                    }
                    return Err(Unwind::Raise(exc));
                }
                Err(unwind) => return Err(unwind),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&self, frame: &Frame<'_>, stmt: &Stmt) -> Exec<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(frame, expr)?;
            }

            StmtKind::Assign { target, value } => match target {
                Target::Name(name) => {
                    let value = self.eval(frame, value)?;
                    frame.store(name, value);
                }
                Target::Index { target, index } => {
                    let container = self.eval(frame, target)?;
                    let index = self.eval(frame, index)?;
                    let value = self.eval(frame, value)?;
                    set_index(&container, index, value)?;
                }
            },

            StmtKind::Print(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    parts.push(self.eval(frame, value)?.display());
                }
                let mut text = parts.join(" ");
                text.push('\n');
                self.runtime.write_output(OutputStream::Stdout, &text);
            }

            StmtKind::Def(def) => frame.store(&def.name, Value::Function(def.clone())),

            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(frame, expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }

            StmtKind::If { branches, orelse } => {
                for (condition, body) in branches {
                    if self.eval(frame, condition)?.truthy() {
                        return self.exec_block(frame, body);
                    }
                }
                return self.exec_block(frame, orelse);
            }

            StmtKind::While { condition, body } => {
                let mut first = true;
                loop {
                    // 2回目以降の条件判定も `while` の行として通知する
                    if !first {
                        self.before_line(frame, stmt.line)?;
                    }
                    first = false;
                    if !self.eval(frame, condition)?.truthy() {
                        break;
                    }
                    if let Flow::Return(value) = self.exec_block(frame, body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }

            StmtKind::Try { body, handlers } => match self.exec_block(frame, body) {
                Err(Unwind::Raise(exc)) => {
                    let handler = handlers.iter().find(|handler| match &handler.type_name {
                        None => true,
                        Some(name) => name == "Exception" || *name == exc.info.type_name,
                    });
                    return match handler {
                        Some(handler) => self.exec_block(frame, &handler.body),
                        None => Err(Unwind::Raise(exc)),
                    };
                }
                other => return other,
            },

            StmtKind::Raise { type_name, message } => {
                let message = match message {
                    Some(expr) => self.eval(frame, expr)?.display(),
                    None => String::new(),
                };
                return raise(type_name, message);
            }

            StmtKind::Spawn { callee, args } => {
                let callee = self.eval(frame, callee)?;
                let args = self.eval_all(frame, args)?;
                let def = match callee {
                    Value::Function(def) => def,
                    other => {
                        return raise("TypeError", format!("cannot spawn a {}", other.type_name()))
                    }
                };
                if let Err(err) = self.runtime.spawn(def, args) {
                    return raise("RuntimeError", format!("can't start new thread: {}", err));
                }
            }

            StmtKind::Global(names) => {
                if frame.locals.is_some() {
                    frame.declared_globals.borrow_mut().extend(names.iter().cloned());
                }
            }

            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    fn eval_all(&self, frame: &Frame<'_>, exprs: &[Expr]) -> Exec<Vec<Value>> {
        exprs.iter().map(|expr| self.eval(frame, expr)).collect()
    }

    fn eval(&self, frame: &Frame<'_>, expr: &Expr) -> Exec<Value> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => frame.load(name),
            Expr::List(items) => Ok(Value::list(self.eval_all(frame, items)?)),
            Expr::Dict(entries) => {
                let mut out: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval(frame, key)?;
                    let value = self.eval(frame, value)?;
                    match out.iter_mut().find(|(k, _)| k.equals(&key)) {
                        Some(slot) => slot.1 = value,
                        None => out.push((key, value)),
                    }
                }
                Ok(Value::dict(out))
            }
            Expr::Neg(operand) => match self.eval(frame, operand)? {
                Value::Int(n) => n
                    .checked_neg()
                    .map(Value::Int)
                    .map_or_else(overflow, Ok),
                other => raise(
                    "TypeError",
                    format!("bad operand type for unary -: '{}'", other.type_name()),
                ),
            },
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(frame, operand)?.truthy())),
            Expr::And(left, right) => {
                let left = self.eval(frame, left)?;
                if !left.truthy() {
                    return Ok(left);
                }
                self.eval(frame, right)
            }
            Expr::Or(left, right) => {
                let left = self.eval(frame, left)?;
                if left.truthy() {
                    return Ok(left);
                }
                self.eval(frame, right)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(frame, left)?;
                let right = self.eval(frame, right)?;
                binary_op(*op, &left, &right)
            }
            Expr::Call { callee, args } => {
                let callee = self.eval(frame, callee)?;
                let args = self.eval_all(frame, args)?;
                self.call(frame, callee, args)
            }
            Expr::Index { target, index } => {
                let target = self.eval(frame, target)?;
                let index = self.eval(frame, index)?;
                get_index(&target, &index)
            }
        }
    }

    fn call(&self, caller: &Frame<'_>, callee: Value, args: Vec<Value>) -> Exec<Value> {
        match callee {
            Value::Function(def) => {
                if caller.depth >= MAX_CALL_DEPTH {
                    return raise("RecursionError", "maximum recursion depth exceeded");
                }
                let locals = bind_arguments(&def, args)?;
                let frame = Frame::new(
                    self,
                    Some(caller),
                    def.file.clone(),
                    def.name.as_str().into(),
                    def.line,
                    Some(locals),
                );
                self.run_body(&frame, &def.body)
            }
            Value::Builtin(builtin) => call_builtin(builtin, args),
            other => raise(
                "TypeError",
                format!("'{}' object is not callable", other.type_name()),
            ),
        }
    }
}

fn bind_arguments(def: &FunctionDef, args: Vec<Value>) -> Exec<Vec<(String, Value)>> {
    if args.len() != def.params.len() {
        return raise(
            "TypeError",
            format!(
                "{}() takes {} arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            ),
        );
    }
    Ok(def.params.iter().cloned().zip(args).collect())
}

fn call_builtin(builtin: Builtin, args: Vec<Value>) -> Exec<Value> {
    let arity = |expected: usize| -> Exec<()> {
        if args.len() == expected {
            Ok(())
        } else {
            raise(
                "TypeError",
                format!("{}() takes {} arguments", builtin.name(), expected),
            )
        }
    };

    match builtin {
        Builtin::Len => {
            arity(1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.lock().len(),
                Value::Dict(entries) => entries.lock().len(),
                other => {
                    return raise(
                        "TypeError",
                        format!("object of type '{}' has no len()", other.type_name()),
                    )
                }
            };
            Ok(Value::Int(len as i64))
        }
        Builtin::Append => {
            arity(2)?;
            match &args[0] {
                Value::List(items) => {
                    items.lock().push(args[1].clone());
                    Ok(Value::None)
                }
                other => raise(
                    "TypeError",
                    format!("cannot append to '{}'", other.type_name()),
                ),
            }
        }
        Builtin::Str => {
            arity(1)?;
            Ok(Value::str(&args[0].display()))
        }
        Builtin::Range => {
            let (start, end) = match args.as_slice() {
                [Value::Int(end)] => (0, *end),
                [Value::Int(start), Value::Int(end)] => (*start, *end),
                _ => return raise("TypeError", "range() expects one or two integers"),
            };
            if end.saturating_sub(start) > MAX_RANGE_LEN {
                return raise("MemoryError", "range is too large");
            }
            Ok(Value::list((start..end).map(Value::Int).collect()))
        }
        Builtin::Sleep => {
            arity(1)?;
            match &args[0] {
                Value::Int(ms) if *ms >= 0 => {
                    thread::sleep(Duration::from_millis(*ms as u64));
                    Ok(Value::None)
                }
                _ => raise("ValueError", "sleep() expects a non-negative integer"),
            }
        }
    }
}

fn overflow<T>() -> Exec<T> {
    raise("OverflowError", "integer overflow")
}

fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Exec<Value> {
    match (op, left, right) {
        (BinaryOp::Eq, _, _) => Ok(Value::Bool(left.equals(right))),
        (BinaryOp::Ne, _, _) => Ok(Value::Bool(!left.equals(right))),

        (BinaryOp::Add, Value::Int(a), Value::Int(b)) => {
            a.checked_add(*b).map_or_else(overflow, |n| Ok(Value::Int(n)))
        }
        (BinaryOp::Sub, Value::Int(a), Value::Int(b)) => {
            a.checked_sub(*b).map_or_else(overflow, |n| Ok(Value::Int(n)))
        }
        (BinaryOp::Mul, Value::Int(a), Value::Int(b)) => {
            a.checked_mul(*b).map_or_else(overflow, |n| Ok(Value::Int(n)))
        }
        (BinaryOp::Div | BinaryOp::Rem, Value::Int(_), Value::Int(0)) => {
            raise("ZeroDivisionError", "integer division or modulo by zero")
        }
        (BinaryOp::Div, Value::Int(a), Value::Int(b)) => {
            let q = a.checked_div(*b).map_or_else(overflow, Ok)?;
            let floor = if a % b != 0 && ((*a < 0) != (*b < 0)) { q - 1 } else { q };
            Ok(Value::Int(floor))
        }
        (BinaryOp::Rem, Value::Int(a), Value::Int(b)) => {
            let r = a.checked_rem(*b).map_or_else(overflow, Ok)?;
            let r = if r != 0 && ((r < 0) != (*b < 0)) { r + b } else { r };
            Ok(Value::Int(r))
        }

        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::str(&format!("{}{}", a, b))),
        (BinaryOp::Mul, Value::Str(s), Value::Int(n))
        | (BinaryOp::Mul, Value::Int(n), Value::Str(s)) => {
            let count = usize::try_from((*n).max(0)).unwrap_or(usize::MAX);
            match s.len().checked_mul(count) {
                Some(total) if total <= MAX_STR_BYTES => Ok(Value::str(&s.repeat(count))),
                _ => raise("MemoryError", "repeated string is too large"),
            }
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Ok(Value::list(items))
        }

        (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge, _, _) => {
            let ordering = match (left, right) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => return unsupported(op, left, right),
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }

        _ => unsupported(op, left, right),
    }
}

fn unsupported<T>(op: BinaryOp, left: &Value, right: &Value) -> Exec<T> {
    raise(
        "TypeError",
        format!(
            "unsupported operand types for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ),
    )
}

/// 負のインデックスは末尾から数える
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 { index + len as i64 } else { index };
    (0..len as i64).contains(&index).then_some(index as usize)
}

fn get_index(target: &Value, index: &Value) -> Exec<Value> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.lock();
            match normalize_index(*i, items.len()) {
                Some(i) => Ok(items[i].clone()),
                None => raise("IndexError", "list index out of range"),
            }
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            match normalize_index(*i, chars.len()) {
                Some(i) => Ok(Value::str(&chars[i].to_string())),
                None => raise("IndexError", "string index out of range"),
            }
        }
        (Value::Dict(entries), key) => entries
            .lock()
            .iter()
            .find(|(k, _)| k.equals(key))
            .map(|(_, v)| v.clone())
            .map_or_else(|| raise("KeyError", key.repr()), Ok),
        _ => raise(
            "TypeError",
            format!(
                "'{}' object is not subscriptable by '{}'",
                target.type_name(),
                index.type_name()
            ),
        ),
    }
}

fn set_index(target: &Value, index: Value, value: Value) -> Exec<()> {
    match (target, &index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.lock();
            match normalize_index(*i, items.len()) {
                Some(i) => {
                    items[i] = value;
                    Ok(())
                }
                None => raise("IndexError", "list assignment index out of range"),
            }
        }
        (Value::Dict(entries), _) => {
            let mut entries = entries.lock();
            match entries.iter_mut().find(|(k, _)| k.equals(&index)) {
                Some(slot) => slot.1 = value,
                None => entries.push((index, value)),
            }
            Ok(())
        }
        _ => raise(
            "TypeError",
            format!("'{}' object does not support item assignment", target.type_name()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn run(source: &str) -> (ScriptRuntime, Result<(), ScriptException>) {
        let runtime = ScriptRuntime::new();
        runtime.set_echo(false);
        let program = parse_program("t.src", source).unwrap();
        let interp = Interp::new(runtime.clone(), ThreadDescriptor::new(1, "MainThread"));
        let result = interp.run_module(&program);
        (runtime, result)
    }

    fn global(runtime: &ScriptRuntime, name: &str) -> String {
        runtime.global(name).unwrap().repr()
    }

    #[test]
    fn test_arithmetic_and_functions() {
        let (runtime, result) = run("\
def fact(n):
    if n <= 1:
        return 1
    return n * fact(n - 1)
x = fact(5)
y = -7 / 2
z = -7 % 3
s = 'ab' * 2 + str(3)
");
        result.unwrap();
        assert_eq!(global(&runtime, "x"), "120");
        assert_eq!(global(&runtime, "y"), "-4");
        assert_eq!(global(&runtime, "z"), "2");
        assert_eq!(global(&runtime, "s"), "\"abab3\"");
    }

    #[test]
    fn test_containers_and_loops() {
        let (runtime, result) = run("\
xs = []
i = 0
while i < 3:
    append(xs, i * i)
    i = i + 1
d = {'a': 1}
d['b'] = len(xs)
xs[-1] = 'last'
");
        result.unwrap();
        assert_eq!(global(&runtime, "xs"), "[0, 1, \"last\"]");
        assert_eq!(global(&runtime, "d"), "{\"a\": 1, \"b\": 3}");
    }

    #[test]
    fn test_exceptions() {
        let (runtime, result) = run("\
caught = False
try:
    raise ValueError('bad')
except KeyError:
    caught = 'wrong'
except ValueError:
    caught = True
try:
    x = 1 / 0
except:
    pass
");
        result.unwrap();
        assert_eq!(global(&runtime, "caught"), "True");

        let (_, result) = run("def f():\n    return missing\nf()\n");
        let exc = result.unwrap_err();
        assert_eq!(exc.type_name(), "NameError");
        assert_eq!(exc.message(), "name 'missing' is not defined");
    }

    #[test]
    fn test_oversized_values_raise() {
        let (runtime, result) = run("\
try:
    x = 'ab' * 9223372036854775807
except MemoryError:
    x = 'caught'
y = 3 * 'ab'
z = 'ab' * -1
");
        result.unwrap();
        assert_eq!(global(&runtime, "x"), "\"caught\"");
        assert_eq!(global(&runtime, "y"), "\"ababab\"");
        assert_eq!(global(&runtime, "z"), "\"\"");

        let (_, result) = run("xs = range(0, 9223372036854775807)\n");
        assert_eq!(result.unwrap_err().type_name(), "MemoryError");
    }

    #[test]
    fn test_globals_from_functions() {
        let (runtime, result) = run("\
count = 0
def bump():
    global count
    count = count + 1
    local = 5
bump()
bump()
");
        result.unwrap();
        assert_eq!(global(&runtime, "count"), "2");
        assert!(runtime.global("local").is_none());
    }

    #[test]
    fn test_recursion_limit() {
        let (_, result) = run("def f(n):\n    return f(n + 1)\nf(0)\n");
        assert_eq!(result.unwrap_err().type_name(), "RecursionError");
    }
}
