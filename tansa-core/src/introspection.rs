//! フレームと変数のイントロスペクション
//!
//! 値を深さ・幅を制限したツリーに変換します。1回の要求の中で、
//! 祖先と同じIDを持つ値は循環として展開を打ち切ります。

use crate::config::InspectLimits;
use crate::errors::DebugError;
use crate::host::{HostFrame, Scope, ValueHandle};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 変数ツリーのノード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub type_name: String,
    pub value: String,
    /// オブジェクトID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<VariableNode>,
    /// 値の文字列か子要素の一部を省略した
    #[serde(default)]
    pub truncated: bool,
    /// 祖先と同じオブジェクト
    #[serde(default)]
    pub cycle: bool,
}

/// フレームのスナップショット
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub thread_id: u64,
    pub epoch: u64,
    pub frame_index: usize,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub variables: Vec<VariableNode>,
}

/// 値のツリー化
#[derive(Debug, Clone, Copy)]
pub struct Inspector {
    limits: InspectLimits,
}

impl Inspector {
    pub fn new(limits: InspectLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &InspectLimits {
        &self.limits
    }

    /// フレームの変数一覧（ローカル、クラス、グローバルの順）
    ///
    /// ローカルと同名のグローバルは隠れているため含めません。
    pub fn frame_variables(&self, frame: &dyn HostFrame) -> Vec<VariableNode> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for scope in [Scope::Local, Scope::Class, Scope::Global] {
            for (name, value) in frame.variables(scope) {
                if !seen.insert(name.clone()) {
                    continue;
                }
                if nodes.len() >= self.limits.max_items {
                    return nodes;
                }
                let mut ancestors = HashSet::new();
                let mut node = self.render(&name, &value, self.limits.max_depth, &mut ancestors);
                node.scope = Some(scope);
                nodes.push(node);
            }
        }
        nodes
    }

    /// フレームのスナップショットを作る
    pub fn snapshot(
        &self,
        thread_id: u64,
        epoch: u64,
        frame_index: usize,
        frame: &dyn HostFrame,
    ) -> FrameSnapshot {
        FrameSnapshot {
            thread_id,
            epoch,
            frame_index,
            function: frame.function().to_string(),
            file: frame.file().to_string(),
            line: frame.line(),
            variables: self.frame_variables(frame),
        }
    }

    /// パスをたどった先の値の子要素を `offset` から返す
    ///
    /// パスの先頭はフレームの変数名、以降は子要素名です。
    pub fn children_at(
        &self,
        frame: &dyn HostFrame,
        path: &[String],
        offset: usize,
    ) -> Result<Vec<VariableNode>> {
        let value = resolve_path(frame, path)?;
        Ok(self.page(&value, offset))
    }

    /// 値の子要素を1ページ分ツリー化する
    pub fn page(&self, value: &ValueHandle, offset: usize) -> Vec<VariableNode> {
        let mut ancestors = HashSet::new();
        if let Some(id) = value.identity() {
            ancestors.insert(id);
        }
        let depth = self.limits.max_depth.saturating_sub(1);
        value
            .children(offset, self.limits.max_items)
            .into_iter()
            .take(self.limits.max_items)
            .map(|(name, child)| self.render(&name, &child, depth, &mut ancestors))
            .collect()
    }

    /// 1つの値をツリー化する
    pub fn render(
        &self,
        name: &str,
        value: &ValueHandle,
        depth: usize,
        ancestors: &mut HashSet<u64>,
    ) -> VariableNode {
        let (repr, repr_truncated) = truncate(value.repr(), self.limits.max_string);
        let id = value.identity();
        let child_count = value.child_count();
        let mut node = VariableNode {
            name: name.to_string(),
            scope: None,
            type_name: value.type_name(),
            value: repr,
            id,
            child_count,
            children: Vec::new(),
            truncated: repr_truncated,
            cycle: false,
        };

        let Some(count) = child_count.filter(|c| *c > 0) else {
            return node;
        };
        if let Some(id) = id {
            if ancestors.contains(&id) {
                node.cycle = true;
                return node;
            }
        }
        if depth == 0 {
            node.truncated = true;
            return node;
        }

        if let Some(id) = id {
            ancestors.insert(id);
        }
        let limit = self.limits.max_items;
        node.children = value
            .children(0, limit)
            .into_iter()
            .take(limit)
            .map(|(child_name, child)| self.render(&child_name, &child, depth - 1, ancestors))
            .collect();
        if count > node.children.len() {
            node.truncated = true;
        }
        if let Some(id) = id {
            ancestors.remove(&id);
        }
        node
    }
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new(InspectLimits::default())
    }
}

/// 変数名と子要素名のパスを値に解決する
pub fn resolve_path(frame: &dyn HostFrame, path: &[String]) -> Result<ValueHandle> {
    let (first, rest) = path
        .split_first()
        .ok_or_else(|| DebugError::VariableNotFound(String::new()))?;
    let mut value = frame
        .lookup(first)
        .ok_or_else(|| DebugError::VariableNotFound(first.clone()))?;
    for (depth, segment) in rest.iter().enumerate() {
        value = value
            .child(segment)
            .ok_or_else(|| DebugError::VariableNotFound(path[..depth + 2].join(".")))?;
    }
    Ok(value)
}

fn truncate(mut text: String, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            text.truncate(cut);
            text.push_str("...");
            (text, true)
        }
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EvalError;
    use crate::host::{CompiledCode, Inspect};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Int(i64);

    impl Inspect for Int {
        fn type_name(&self) -> String {
            "int".into()
        }
        fn repr(&self) -> String {
            self.0.to_string()
        }
        fn is_truthy(&self) -> bool {
            self.0 != 0
        }
    }

    /// 自分自身を要素に持てるリスト
    struct List {
        id: u64,
        items: Mutex<Vec<ValueHandle>>,
    }

    impl Inspect for List {
        fn type_name(&self) -> String {
            "list".into()
        }
        fn repr(&self) -> String {
            format!("<list {}>", self.id)
        }
        fn identity(&self) -> Option<u64> {
            Some(self.id)
        }
        fn is_truthy(&self) -> bool {
            true
        }
        fn child_count(&self) -> Option<usize> {
            Some(self.items.lock().len())
        }
        fn children(&self, offset: usize, limit: usize) -> Vec<(String, ValueHandle)> {
            self.items
                .lock()
                .iter()
                .enumerate()
                .skip(offset)
                .take(limit)
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect()
        }
    }

    struct Frame {
        locals: Vec<(String, ValueHandle)>,
        globals: Vec<(String, ValueHandle)>,
    }

    impl HostFrame for Frame {
        fn file(&self) -> &str {
            "t.src"
        }
        fn line(&self) -> u32 {
            1
        }
        fn function(&self) -> &str {
            "f"
        }
        fn back(&self) -> Option<&dyn HostFrame> {
            None
        }
        fn variables(&self, scope: Scope) -> Vec<(String, ValueHandle)> {
            match scope {
                Scope::Local => self.locals.clone(),
                Scope::Global => self.globals.clone(),
                Scope::Class => Vec::new(),
            }
        }
        fn evaluate(&self, _source: &str) -> std::result::Result<Option<ValueHandle>, EvalError> {
            Ok(None)
        }
        fn evaluate_compiled(
            &self,
            _code: &dyn CompiledCode,
        ) -> std::result::Result<ValueHandle, EvalError> {
            Err(EvalError::new("Unsupported", ""))
        }
    }

    fn int(v: i64) -> ValueHandle {
        Arc::new(Int(v))
    }

    fn list(id: u64, items: Vec<ValueHandle>) -> Arc<List> {
        Arc::new(List {
            id,
            items: Mutex::new(items),
        })
    }

    #[test]
    fn test_cycle_is_marked() {
        let l = list(1, vec![int(1)]);
        l.items.lock().push(l.clone());
        let value: ValueHandle = l;
        // 循環参照はテスト終了までリークする

        let inspector = Inspector::default();
        let node = inspector.render("l", &value, 3, &mut HashSet::new());
        assert_eq!(node.children.len(), 2);
        assert!(!node.cycle);
        assert!(node.children[1].cycle);
        assert!(node.children[1].children.is_empty());
    }

    #[test]
    fn test_shared_value_is_not_a_cycle() {
        let shared: ValueHandle = list(9, vec![int(5)]);
        let outer: ValueHandle = list(1, vec![shared.clone(), shared]);
        let node = Inspector::default().render("o", &outer, 3, &mut HashSet::new());
        assert!(node.children.iter().all(|c| !c.cycle));
        assert_eq!(node.children[1].children[0].value, "5");
    }

    #[test]
    fn test_width_and_depth_limits() {
        let items: Vec<ValueHandle> = (0..10).map(int).collect();
        let wide: ValueHandle = list(2, items);
        let inspector = Inspector::new(InspectLimits {
            max_depth: 1,
            max_items: 4,
            max_string: 256,
        });
        let node = inspector.render("w", &wide, 1, &mut HashSet::new());
        assert_eq!(node.children.len(), 4);
        assert!(node.truncated);
        assert_eq!(node.child_count, Some(10));

        let page = inspector.page(&wide, 8);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "8");

        let nested: ValueHandle = list(3, vec![wide]);
        let node = inspector.render("n", &nested, 1, &mut HashSet::new());
        assert!(node.children[0].truncated);
        assert!(node.children[0].children.is_empty());
    }

    #[test]
    fn test_long_repr_is_truncated() {
        let (text, cut) = truncate("abcdef".into(), 3);
        assert_eq!(text, "abc...");
        assert!(cut);
        let (text, cut) = truncate("abc".into(), 3);
        assert_eq!(text, "abc");
        assert!(!cut);
    }

    #[test]
    fn test_frame_variables_and_paths() {
        let inner: ValueHandle = list(4, vec![int(7)]);
        let frame = Frame {
            locals: vec![
                ("x".into(), int(1)),
                ("items".into(), inner),
            ],
            globals: vec![("x".into(), int(99)), ("g".into(), int(2))],
        };
        let inspector = Inspector::default();
        let vars = inspector.frame_variables(&frame);
        let names: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["x", "items", "g"]);
        assert_eq!(vars[0].value, "1");
        assert_eq!(vars[2].scope, Some(Scope::Global));

        let children = inspector
            .children_at(&frame, &["items".to_string()], 0)
            .unwrap();
        assert_eq!(children[0].value, "7");

        let err = inspector
            .children_at(&frame, &["items".to_string(), "5".to_string()], 0)
            .unwrap_err();
        assert_eq!(err, DebugError::VariableNotFound("items.5".into()));
    }
}
