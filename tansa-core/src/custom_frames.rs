//! カスタムフレームのレジストリ
//!
//! テンプレートエンジンなど、実スレッドのスタックに現れないフレームを
//! 仮想スレッドとして公開します。レジストリはフレームを弱参照で保持し、
//! 所有者が破棄したフレームは一覧から自動的に消えます。

use crate::host::{CustomFrame, HostThreadId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// カスタムフレームID
pub type CustomFrameId = u64;

/// 実スレッドIDと衝突しないよう上位ビットを立てたID空間を使う
pub const CUSTOM_FRAME_ID_BASE: CustomFrameId = 1 << 48;

/// カスタムフレームの一覧情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFrameInfo {
    pub id: CustomFrameId,
    pub name: String,
    /// 関連付けられた実スレッド
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<HostThreadId>,
    pub file: String,
    pub line: u32,
    pub function: String,
}

struct Entry {
    name: String,
    thread_id: Option<HostThreadId>,
    frame: Weak<dyn CustomFrame>,
}

pub struct CustomFrameRegistry {
    frames: Mutex<HashMap<CustomFrameId, Entry>>,
    next_id: AtomicU64,
}

impl CustomFrameRegistry {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(CUSTOM_FRAME_ID_BASE),
        }
    }

    /// プロセス全体で共有するレジストリ
    pub fn global() -> &'static CustomFrameRegistry {
        static GLOBAL: OnceLock<CustomFrameRegistry> = OnceLock::new();
        GLOBAL.get_or_init(CustomFrameRegistry::new)
    }

    /// フレームを登録する
    pub fn add(
        &self,
        name: &str,
        frame: &Arc<dyn CustomFrame>,
        thread_id: Option<HostThreadId>,
    ) -> CustomFrameId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().insert(
            id,
            Entry {
                name: name.to_string(),
                thread_id,
                frame: Arc::downgrade(frame),
            },
        );
        tracing::debug!("custom frame {} registered as {}", name, id);
        id
    }

    pub fn update_name(&self, id: CustomFrameId, name: &str) -> bool {
        match self.frames.lock().get_mut(&id) {
            Some(entry) => {
                entry.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// 生きているフレームを取得する
    pub fn get(&self, id: CustomFrameId) -> Option<Arc<dyn CustomFrame>> {
        let mut frames = self.frames.lock();
        let frame = frames.get(&id)?.frame.upgrade();
        if frame.is_none() {
            frames.remove(&id);
        }
        frame
    }

    pub fn remove(&self, id: CustomFrameId) -> bool {
        self.frames.lock().remove(&id).is_some()
    }

    /// 生きているフレームの一覧（破棄済みのものは取り除く）
    pub fn list(&self) -> Vec<CustomFrameInfo> {
        let mut frames = self.frames.lock();
        frames.retain(|_, entry| entry.frame.strong_count() > 0);
        let mut list: Vec<CustomFrameInfo> = frames
            .iter()
            .filter_map(|(id, entry)| {
                let frame = entry.frame.upgrade()?;
                Some(CustomFrameInfo {
                    id: *id,
                    name: entry.name.clone(),
                    thread_id: entry.thread_id,
                    file: frame.file().to_string(),
                    line: frame.line(),
                    function: frame.function().to_string(),
                })
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl Default for CustomFrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EvalError;
    use crate::host::{CompiledCode, HostFrame, Scope, ValueHandle};

    struct Template {
        line: u32,
    }

    impl HostFrame for Template {
        fn file(&self) -> &str {
            "page.tmpl"
        }
        fn line(&self) -> u32 {
            self.line
        }
        fn function(&self) -> &str {
            "render"
        }
        fn back(&self) -> Option<&dyn HostFrame> {
            None
        }
        fn variables(&self, _scope: Scope) -> Vec<(String, ValueHandle)> {
            Vec::new()
        }
        fn evaluate(&self, _source: &str) -> Result<Option<ValueHandle>, EvalError> {
            Ok(None)
        }
        fn evaluate_compiled(&self, _code: &dyn CompiledCode) -> Result<ValueHandle, EvalError> {
            Err(EvalError::new("Unsupported", ""))
        }
    }

    #[test]
    fn test_dropped_frames_disappear() {
        let registry = CustomFrameRegistry::new();
        let frame: Arc<dyn CustomFrame> = Arc::new(Template { line: 12 });
        let id = registry.add("template", &frame, None);
        assert!(id >= CUSTOM_FRAME_ID_BASE);

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].line, 12);
        assert!(registry.get(id).is_some());

        assert!(registry.update_name(id, "page"));
        assert_eq!(registry.list()[0].name, "page");

        drop(frame);
        assert!(registry.get(id).is_none());
        assert!(registry.list().is_empty());
        assert!(!registry.remove(id));
    }
}
