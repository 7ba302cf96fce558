//! ブレークポイント管理
//!
//! ブレークポイントの登録・削除と、実行イベントごとの照合を行います。
//! コントローラのスレッドから更新され、インタプリタの各スレッドから
//! 参照されるため、内部状態はロックで保護します。

use crate::errors::{DebugError, EvalError};
use crate::host::{CompiledCode, ExceptionPhase};
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// ブレークポイントID
pub type BreakpointId = u64;

/// 例外ブレークポイントで全ての型にマッチする名前
pub const ANY_EXCEPTION: &str = "*";

/// ファイル内の位置
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointLocation {
    Line(u32),
    /// 関数の呼び出し時に停止する
    Function(String),
}

/// 停止するスレッドの範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendPolicy {
    /// ヒットしたスレッドだけ
    #[default]
    Thread,
    /// 全スレッド
    All,
}

/// ブレークポイントの設定内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub file: String,
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    /// N回目のヒットでだけ停止する
    pub hit_count: Option<u32>,
    pub suspend_policy: SuspendPolicy,
    /// 設定されていれば停止せずにメッセージを出力する（`{式}` を展開）
    pub log_message: Option<String>,
}

impl BreakpointSpec {
    pub fn line(file: impl Into<String>, line: u32) -> Self {
        Self::new(file, BreakpointLocation::Line(line))
    }

    pub fn function(file: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(file, BreakpointLocation::Function(name.into()))
    }

    fn new(file: impl Into<String>, location: BreakpointLocation) -> Self {
        Self {
            file: file.into(),
            location,
            condition: None,
            hit_count: None,
            suspend_policy: SuspendPolicy::Thread,
            log_message: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_hit_count(mut self, hit_count: u32) -> Self {
        self.hit_count = Some(hit_count);
        self
    }

    pub fn with_suspend_policy(mut self, policy: SuspendPolicy) -> Self {
        self.suspend_policy = policy;
        self
    }

    pub fn with_log_message(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }
}

/// 登録済みのブレークポイント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    /// 正規化済みのファイルパス
    pub file: String,
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    pub hit_count: Option<u32>,
    pub suspend_policy: SuspendPolicy,
    pub log_message: Option<String>,
    pub enabled: bool,
    /// これまでに条件を満たした回数
    pub hits: u32,
}

/// 例外ブレークポイント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionBreakpoint {
    pub id: BreakpointId,
    /// 例外の型名（`*` は全ての型）
    pub type_name: String,
    pub on_raise: bool,
    pub on_uncaught: bool,
    pub enabled: bool,
}

impl ExceptionBreakpoint {
    pub fn matches(&self, type_name: &str, phase: ExceptionPhase) -> bool {
        if !self.enabled {
            return false;
        }
        if self.type_name != ANY_EXCEPTION && self.type_name != type_name {
            return false;
        }
        match phase {
            ExceptionPhase::Raised => self.on_raise,
            ExceptionPhase::Uncaught => self.on_uncaught,
        }
    }
}

/// 条件式のキャッシュ状態
enum ConditionCache {
    Empty,
    Compiled(Arc<dyn CompiledCode>),
    Failed(EvalError),
}

struct Entry {
    breakpoint: Breakpoint,
    condition: ConditionCache,
    /// 条件式のエラーを既に報告したか
    error_reported: bool,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<BreakpointId, Entry>,
    /// ファイル -> 位置 -> ID
    by_file: HashMap<String, HashMap<BreakpointLocation, BreakpointId>>,
    exceptions: HashMap<String, ExceptionBreakpoint>,
}

/// ブレークポイントレジストリ
pub struct BreakpointRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
}

impl BreakpointRegistry {
    /// 新しいレジストリを作成する
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> BreakpointId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// ブレークポイントを登録する
    ///
    /// 同じファイル・位置に既存のブレークポイントがあれば置き換えます。
    /// 置き換えた場合も新しいIDが割り当てられます。
    pub fn set(&self, spec: BreakpointSpec) -> Result<Breakpoint> {
        let file = normalize_path(&spec.file);
        if file.is_empty() {
            return Err(DebugError::InvalidBreakpoint("file must not be empty".into()));
        }
        match &spec.location {
            BreakpointLocation::Line(0) => {
                return Err(DebugError::InvalidBreakpoint("line numbers start at 1".into()))
            }
            BreakpointLocation::Function(name) if name.is_empty() => {
                return Err(DebugError::InvalidBreakpoint(
                    "function name must not be empty".into(),
                ))
            }
            _ => {}
        }

        let breakpoint = Breakpoint {
            id: self.allocate_id(),
            file: file.clone(),
            location: spec.location.clone(),
            condition: spec.condition.filter(|c| !c.trim().is_empty()),
            hit_count: spec.hit_count.filter(|n| *n > 0),
            suspend_policy: spec.suspend_policy,
            log_message: spec.log_message,
            enabled: true,
            hits: 0,
        };

        let mut inner = self.inner.write();
        let previous = inner
            .by_file
            .entry(file)
            .or_default()
            .insert(spec.location, breakpoint.id);
        if let Some(old) = previous {
            inner.entries.remove(&old);
            tracing::debug!("breakpoint {} replaced by {}", old, breakpoint.id);
        }
        inner.entries.insert(
            breakpoint.id,
            Entry {
                breakpoint: breakpoint.clone(),
                condition: ConditionCache::Empty,
                error_reported: false,
            },
        );

        Ok(breakpoint)
    }

    /// ブレークポイントを削除する（例外ブレークポイントのIDも受け付ける）
    pub fn clear(&self, id: BreakpointId) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(&id) {
            let bp = entry.breakpoint;
            let now_empty = match inner.by_file.get_mut(&bp.file) {
                Some(locations) => {
                    locations.remove(&bp.location);
                    locations.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.by_file.remove(&bp.file);
            }
            return Ok(());
        }

        let before = inner.exceptions.len();
        inner.exceptions.retain(|_, ebp| ebp.id != id);
        if inner.exceptions.len() < before {
            Ok(())
        } else {
            Err(DebugError::UnknownBreakpoint(id))
        }
    }

    /// ファイル内のブレークポイントを全て削除し、削除したIDを返す
    pub fn clear_file(&self, file: &str) -> Vec<BreakpointId> {
        let file = normalize_path(file);
        let mut inner = self.inner.write();
        let Some(locations) = inner.by_file.remove(&file) else {
            return Vec::new();
        };
        let mut ids: Vec<BreakpointId> = locations.into_values().collect();
        ids.sort_unstable();
        for id in &ids {
            inner.entries.remove(id);
        }
        ids
    }

    /// 全てのブレークポイントを削除する（デタッチ時）
    pub fn clear_all(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.by_file.clear();
        inner.exceptions.clear();
    }

    /// 例外ブレークポイントを登録する（同じ型名は置き換え）
    pub fn set_exception(
        &self,
        type_name: &str,
        on_raise: bool,
        on_uncaught: bool,
    ) -> Result<ExceptionBreakpoint> {
        let type_name = type_name.trim();
        if type_name.is_empty() {
            return Err(DebugError::InvalidBreakpoint(
                "exception type name must not be empty".into(),
            ));
        }
        let ebp = ExceptionBreakpoint {
            id: self.allocate_id(),
            type_name: type_name.to_string(),
            on_raise,
            on_uncaught,
            enabled: on_raise || on_uncaught,
        };
        self.inner
            .write()
            .exceptions
            .insert(ebp.type_name.clone(), ebp.clone());
        Ok(ebp)
    }

    pub fn clear_exception(&self, type_name: &str) -> Option<ExceptionBreakpoint> {
        self.inner.write().exceptions.remove(type_name.trim())
    }

    pub fn get(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|entry| entry.breakpoint.clone())
    }

    /// 全てのブレークポイントをID順に返す
    pub fn list(&self) -> Vec<Breakpoint> {
        let inner = self.inner.read();
        let mut list: Vec<Breakpoint> = inner
            .entries
            .values()
            .map(|entry| entry.breakpoint.clone())
            .collect();
        list.sort_by_key(|bp| bp.id);
        list
    }

    pub fn list_exceptions(&self) -> Vec<ExceptionBreakpoint> {
        let inner = self.inner.read();
        let mut list: Vec<ExceptionBreakpoint> = inner.exceptions.values().cloned().collect();
        list.sort_by_key(|ebp| ebp.id);
        list
    }

    pub fn count(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// ファイルにブレークポイントがあるか
    pub fn has_file(&self, file: &str) -> bool {
        self.inner.read().by_file.contains_key(file)
    }

    pub fn has_exception_breakpoints(&self) -> bool {
        !self.inner.read().exceptions.is_empty()
    }

    /// 行イベントに一致する有効なブレークポイント
    pub fn match_line(&self, file: &str, line: u32) -> Option<Breakpoint> {
        self.match_location(file, &BreakpointLocation::Line(line))
    }

    /// 関数呼び出しに一致する有効なブレークポイント
    pub fn match_function(&self, file: &str, function: &str) -> Option<Breakpoint> {
        self.match_location(file, &BreakpointLocation::Function(function.to_string()))
    }

    fn match_location(&self, file: &str, location: &BreakpointLocation) -> Option<Breakpoint> {
        let inner = self.inner.read();
        let id = inner.by_file.get(file)?.get(location)?;
        inner
            .entries
            .get(id)
            .map(|entry| &entry.breakpoint)
            .filter(|bp| bp.enabled)
            .cloned()
    }

    /// 例外に一致する例外ブレークポイント（型名の完全一致を `*` より優先）
    pub fn match_exception(
        &self,
        type_name: &str,
        phase: ExceptionPhase,
    ) -> Option<ExceptionBreakpoint> {
        let inner = self.inner.read();
        [type_name, ANY_EXCEPTION]
            .into_iter()
            .filter_map(|key| inner.exceptions.get(key))
            .find(|ebp| ebp.matches(type_name, phase))
            .cloned()
    }

    /// 条件を満たしたヒットを記録し、累積ヒット数を返す
    pub fn record_hit(&self, id: BreakpointId) -> Option<u32> {
        let mut inner = self.inner.write();
        let entry = inner.entries.get_mut(&id)?;
        entry.breakpoint.hits = entry.breakpoint.hits.saturating_add(1);
        Some(entry.breakpoint.hits)
    }

    /// 条件式のコンパイル結果を取得する
    ///
    /// 初回だけ `compile` を呼び、以降は成功・失敗ともにキャッシュを返します。
    /// ロックを保持したままホストのコンパイラを呼ばないよう、
    /// コンパイルはロックの外で行います。
    pub fn compiled_condition<F>(
        &self,
        id: BreakpointId,
        compile: F,
    ) -> Option<std::result::Result<Arc<dyn CompiledCode>, EvalError>>
    where
        F: FnOnce(&str) -> std::result::Result<Arc<dyn CompiledCode>, EvalError>,
    {
        let source = {
            let inner = self.inner.read();
            let entry = inner.entries.get(&id)?;
            match &entry.condition {
                ConditionCache::Compiled(code) => return Some(Ok(code.clone())),
                ConditionCache::Failed(err) => return Some(Err(err.clone())),
                ConditionCache::Empty => entry.breakpoint.condition.clone()?,
            }
        };

        let result = compile(&source);

        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.condition = match &result {
                Ok(code) => ConditionCache::Compiled(code.clone()),
                Err(err) => ConditionCache::Failed(err.clone()),
            };
        }
        Some(result)
    }

    /// 条件式のエラーを記録し、ブレークポイントを無効にする
    ///
    /// そのブレークポイントで初めてのエラーなら `true` を返します。
    /// 無効になったブレークポイントは設定し直すまで停止しません。
    pub fn note_condition_error(&self, id: BreakpointId) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&id) {
            Some(entry) if !entry.error_reported => {
                entry.error_reported = true;
                entry.breakpoint.enabled = false;
                true
            }
            _ => false,
        }
    }
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// ファイルパスを正規化する
///
/// ファイルシステムには問い合わせず、区切り文字の統一と
/// `.` / `..` の字句的な解決だけを行います。
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}
