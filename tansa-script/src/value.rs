//! スクリプトの値
//!
//! リストと辞書は共有参照で、スレッド間でも同じオブジェクトを指します。

use crate::ast::FunctionDef;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tansa_core::{Inspect, ValueHandle};

/// 組み込み関数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Append,
    Str,
    Range,
    /// 引数はミリ秒
    Sleep,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Builtin::Len),
            "append" => Some(Builtin::Append),
            "str" => Some(Builtin::Str),
            "range" => Some(Builtin::Range),
            "sleep" => Some(Builtin::Sleep),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Append => "append",
            Builtin::Str => "str",
            Builtin::Range => "range",
            Builtin::Sleep => "sleep",
        }
    }
}

pub type ListRef = Arc<Mutex<Vec<Value>>>;
pub type DictRef = Arc<Mutex<Vec<(Value, Value)>>>;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    List(ListRef),
    /// 挿入順を保つ
    Dict(DictRef),
    Function(Arc<FunctionDef>),
    Builtin(Builtin),
}

impl Value {
    pub fn str(text: &str) -> Self {
        Value::Str(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Dict(Arc::new(Mutex::new(entries)))
    }

    pub fn handle(&self) -> ValueHandle {
        Arc::new(self.clone())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.lock().is_empty(),
            Value::Dict(entries) => !entries.lock().is_empty(),
            Value::Function(_) | Value::Builtin(_) => true,
        }
    }

    /// コンテナの同一性
    pub fn address(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(Arc::as_ptr(items) as *const () as usize),
            Value::Dict(entries) => Some(Arc::as_ptr(entries) as *const () as usize),
            _ => None,
        }
    }

    /// `print` と `str()` の表示（文字列は引用符なし）
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }

    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Vec::new());
        out
    }

    fn write_repr(&self, out: &mut String, seen: &mut Vec<usize>) {
        if let Some(addr) = self.address() {
            if seen.contains(&addr) {
                out.push_str(if matches!(self, Value::List(_)) { "[...]" } else { "{...}" });
                return;
            }
            seen.push(addr);
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::Str(s) => out.push_str(&format!("{:?}", s.as_ref())),
            Value::List(items) => {
                let items = items.lock().clone();
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, seen);
                }
                out.push(']');
            }
            Value::Dict(entries) => {
                let entries = entries.lock().clone();
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.write_repr(out, seen);
                    out.push_str(": ");
                    value.write_repr(out, seen);
                }
                out.push('}');
            }
            Value::Function(def) => out.push_str(&format!("<function {}>", def.name)),
            Value::Builtin(builtin) => out.push_str(&format!("<builtin {}>", builtin.name())),
        }
        if self.address().is_some() {
            seen.pop();
        }
    }

    /// 等価比較
    ///
    /// 循環したコンテナ同士は同一オブジェクトの場合だけ等しいとみなします。
    pub fn equals(&self, other: &Value) -> bool {
        self.equals_guarded(other, 0)
    }

    fn equals_guarded(&self, other: &Value, depth: usize) -> bool {
        const MAX_DEPTH: usize = 64;
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                if depth >= MAX_DEPTH {
                    return false;
                }
                let (a, b) = (a.lock().clone(), b.lock().clone());
                a.len() == b.len()
                    && a.iter().zip(&b).all(|(x, y)| x.equals_guarded(y, depth + 1))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                if depth >= MAX_DEPTH {
                    return false;
                }
                let (a, b) = (a.lock().clone(), b.lock().clone());
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter().any(|(k, v)| {
                            key.equals_guarded(k, depth + 1) && value.equals_guarded(v, depth + 1)
                        })
                    })
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }

    /// 辞書キーや子要素名として使う名前
    fn child_name(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.repr(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl Inspect for Value {
    fn type_name(&self) -> String {
        Value::type_name(self).to_string()
    }

    fn repr(&self) -> String {
        Value::repr(self)
    }

    fn identity(&self) -> Option<u64> {
        self.address().map(|addr| addr as u64)
    }

    fn is_truthy(&self) -> bool {
        self.truthy()
    }

    fn child_count(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(items.lock().len()),
            Value::Dict(entries) => Some(entries.lock().len()),
            _ => None,
        }
    }

    fn children(&self, offset: usize, limit: usize) -> Vec<(String, ValueHandle)> {
        match self {
            Value::List(items) => items
                .lock()
                .iter()
                .enumerate()
                .skip(offset)
                .take(limit)
                .map(|(i, item)| (i.to_string(), item.handle()))
                .collect(),
            Value::Dict(entries) => entries
                .lock()
                .iter()
                .skip(offset)
                .take(limit)
                .map(|(key, value)| (key.child_name(), value.handle()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn child(&self, name: &str) -> Option<ValueHandle> {
        match self {
            Value::List(items) => {
                let index: usize = name.parse().ok()?;
                items.lock().get(index).map(Value::handle)
            }
            Value::Dict(entries) => entries
                .lock()
                .iter()
                .find(|(key, _)| key.child_name() == name)
                .map(|(_, value)| value.handle()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr() {
        let value = Value::list(vec![
            Value::Int(1),
            Value::str("a\"b"),
            Value::None,
            Value::dict(vec![(Value::str("k"), Value::Bool(true))]),
        ]);
        assert_eq!(value.repr(), r#"[1, "a\"b", None, {"k": True}]"#);
        assert_eq!(Value::str("x").display(), "x");
    }

    #[test]
    fn test_cyclic_list() {
        let value = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &value {
            items.lock().push(value.clone());
        }
        assert_eq!(value.repr(), "[1, [...]]");
        assert!(value.equals(&value.clone()));
        assert_eq!(Inspect::child_count(&value), Some(2));
        assert_eq!(value.child("1").unwrap().identity(), value.identity());
    }

    #[test]
    fn test_dict_children() {
        let value = Value::dict(vec![
            (Value::str("a"), Value::Int(1)),
            (Value::Int(2), Value::Int(3)),
        ]);
        let names: Vec<String> = value.children(0, 10).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "2"]);
        assert_eq!(value.child("2").unwrap().repr(), "3");
        assert!(value.child("b").is_none());
    }
}
