//! トレース対象外ファイルの判定
//!
//! デバッガ自身のソースや組み込みモジュールのフレームは停止対象にしません。
//! 判定結果はファイルごとにメモ化します。

use crate::breakpoint::normalize_path;
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::Path;

/// 組み込みソースとして扱うファイル名の接頭辞（`<eval>` など）
const BUILTIN_PREFIX: char = '<';

/// トレース対象外フィルタ
pub struct DontTraceFilter {
    files: HashSet<String>,
    prefixes: Vec<String>,
    memo: DashMap<String, bool>,
}

impl DontTraceFilter {
    /// 組み込みソースだけを除外するフィルタを作成する
    pub fn new() -> Self {
        Self {
            files: HashSet::new(),
            prefixes: Vec::new(),
            memo: DashMap::new(),
        }
    }

    /// エントリのリストからフィルタを作成する
    ///
    /// 末尾が `/` のエントリと既存のディレクトリを指すエントリはディレクトリ接頭辞、
    /// それ以外は完全一致のファイルとして扱います。
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new();
        for entry in entries {
            filter.add(entry.as_ref());
        }
        filter
    }

    pub fn add(&mut self, entry: &str) {
        let entry = entry.trim();
        if entry.is_empty() {
            return;
        }
        if entry.ends_with('/') || entry.ends_with('\\') || Path::new(entry).is_dir() {
            let mut prefix = normalize_path(entry);
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            self.prefixes.push(prefix);
        } else {
            self.files.insert(normalize_path(entry));
        }
        self.memo.clear();
    }

    /// このファイルのフレームをスキップすべきか
    pub fn should_skip(&self, file: &str) -> bool {
        if let Some(cached) = self.memo.get(file) {
            return *cached;
        }
        let skip = self.compute(file);
        self.memo.insert(file.to_string(), skip);
        skip
    }

    fn compute(&self, file: &str) -> bool {
        if file.is_empty() || file.starts_with(BUILTIN_PREFIX) {
            return true;
        }
        let normalized = normalize_path(file);
        if self.files.contains(&normalized) {
            return true;
        }
        self.prefixes
            .iter()
            .any(|prefix| normalized.starts_with(prefix.as_str()))
    }
}

impl Default for DontTraceFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sources_are_skipped() {
        let filter = DontTraceFilter::new();
        assert!(filter.should_skip("<eval>"));
        assert!(filter.should_skip("<condition>"));
        assert!(filter.should_skip(""));
        assert!(!filter.should_skip("a.src"));
    }

    #[test]
    fn test_files_and_prefixes() {
        let filter = DontTraceFilter::from_entries(["/opt/stdlib/", "helpers.src", "/w/x.src"]);
        assert!(filter.should_skip("/opt/stdlib/io.src"));
        assert!(filter.should_skip("/opt/stdlib/sub/deep.src"));
        assert!(!filter.should_skip("/opt/stdlibx/io.src"));
        assert!(filter.should_skip("helpers.src"));
        assert!(filter.should_skip("./helpers.src"));
        // ファイルのエントリは完全一致のみ
        assert!(!filter.should_skip("/project/helpers.src"));
        assert!(filter.should_skip("/w/./x.src"));
        assert!(!filter.should_skip("/w/y.src"));
    }

    #[test]
    fn test_existing_directory_is_a_prefix() {
        let dir = std::env::temp_dir().join(format!("tansa-dont-trace-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let entry = dir.to_str().unwrap().trim_end_matches('/').to_string();

        let filter = DontTraceFilter::from_entries([entry.as_str()]);
        assert!(filter.should_skip(&format!("{}/lib.src", entry)));
        assert!(filter.should_skip(&format!("{}/sub/deep.src", entry)));
        assert!(!filter.should_skip(&format!("{}x/lib.src", entry)));

        // 存在しないパスはファイルとして扱う
        let missing = format!("{}/missing", entry);
        let filter = DontTraceFilter::from_entries([missing.as_str()]);
        assert!(filter.should_skip(&missing));
        assert!(!filter.should_skip(&format!("{}/lib.src", missing)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_memo_is_invalidated_on_add() {
        let mut filter = DontTraceFilter::new();
        assert!(!filter.should_skip("a.src"));
        filter.add("a.src");
        assert!(filter.should_skip("a.src"));
    }
}
