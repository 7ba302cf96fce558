//! デバッガ内部スレッドの管理
//!
//! 通信スレッドなどデバッガ自身のスレッドはデーモンとして登録します。
//! デーモンスレッドで発生した実行イベントはフックで無視され、
//! デタッチ時にはまとめて停止されます。

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

thread_local! {
    static DAEMON_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// 現在のスレッドがデバッガのデーモンスレッドか
pub fn is_daemon_thread() -> bool {
    DAEMON_THREAD.with(Cell::get)
}

fn mark_current_as_daemon() {
    DAEMON_THREAD.with(|flag| flag.set(true));
}

/// デーモンID
pub type DaemonId = u64;

/// 停止要求の受信側
#[derive(Debug, Clone)]
pub struct KillSignal(Arc<AtomicBool>);

impl KillSignal {
    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type KillAction = Box<dyn Fn() + Send + Sync>;

struct DaemonEntry {
    name: String,
    killed: Arc<AtomicBool>,
    on_kill: Option<KillAction>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

/// デーモンスレッドのレジストリ
pub struct DaemonRegistry {
    entries: Mutex<HashMap<DaemonId, DaemonEntry>>,
    next_id: AtomicU64,
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// デーモンスレッドを起動する
    ///
    /// `body` は停止要求を [`KillSignal`] で確認しながら動きます。
    /// ブロッキングI/Oで待つスレッドは `on_kill` でその待ちを解除します。
    pub fn spawn<F>(&self, name: &str, on_kill: Option<KillAction>, body: F) -> io::Result<DaemonId>
    where
        F: FnOnce(KillSignal) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let killed = Arc::new(AtomicBool::new(false));
        let signal = KillSignal(killed.clone());

        // 登録前に終了してもエントリが残るよう、ロックを保持したまま起動する
        let mut entries = self.entries.lock();
        let handle = thread::Builder::new()
            .name(format!("tansa-{}", name))
            .spawn(move || {
                mark_current_as_daemon();
                body(signal);
            })?;
        entries.insert(
            id,
            DaemonEntry {
                name: name.to_string(),
                killed,
                on_kill,
                thread_id: handle.thread().id(),
                handle: Some(handle),
            },
        );
        tracing::debug!("daemon thread {} ({}) started", name, id);
        Ok(id)
    }

    /// 生きているデーモンの名前
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut names: Vec<String> = entries
            .values()
            .filter(|entry| {
                entry
                    .handle
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished())
            })
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, thread_id: ThreadId) -> bool {
        self.entries
            .lock()
            .values()
            .any(|entry| entry.thread_id == thread_id)
    }

    /// 1つのデーモンを停止する
    pub fn kill(&self, id: DaemonId, timeout: Duration) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => stop_entries(vec![entry], timeout) == 1,
            None => false,
        }
    }

    /// 全デーモンを停止し、終了を確認できた数を返す
    ///
    /// 呼び出し元自身がデーモンの場合、そのスレッドは待ちません。
    pub fn kill_all(&self, timeout: Duration) -> usize {
        let entries: Vec<DaemonEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        if entries.is_empty() {
            return 0;
        }
        stop_entries(entries, timeout)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DaemonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn stop_entries(entries: Vec<DaemonEntry>, timeout: Duration) -> usize {
    for entry in &entries {
        entry.killed.store(true, Ordering::Release);
        if let Some(action) = &entry.on_kill {
            action();
        }
    }

    let current = thread::current().id();
    let deadline = Instant::now() + timeout;
    let mut stopped = 0;
    for mut entry in entries {
        if entry.thread_id == current {
            stopped += 1;
            continue;
        }
        let Some(handle) = entry.handle.take() else {
            continue;
        };
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
            stopped += 1;
        } else {
            tracing::warn!("daemon thread {} did not stop in time", entry.name);
        }
    }
    stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_daemon_flag_is_thread_local() {
        assert!(!is_daemon_thread());
        let registry = DaemonRegistry::new();
        let (tx, rx) = mpsc::channel();
        registry
            .spawn("flag-check", None, move |_| {
                let _ = tx.send(is_daemon_thread());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!is_daemon_thread());
    }

    #[test]
    fn test_kill_all_stops_loops() {
        let registry = DaemonRegistry::new();
        for name in ["reader", "writer"] {
            registry
                .spawn(name, None, |signal| {
                    while !signal.is_killed() {
                        thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
        }
        assert_eq!(registry.names(), vec!["reader", "writer"]);
        assert_eq!(registry.kill_all(Duration::from_secs(5)), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.kill_all(Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_kill_action_runs() {
        let registry = DaemonRegistry::new();
        let (tx, rx) = mpsc::channel::<()>();
        let tx = Mutex::new(Some(tx));
        let id = registry
            .spawn(
                "blocked",
                Some(Box::new(move || {
                    tx.lock().take();
                })),
                move |_| {
                    // 送信側が破棄されるまでブロックする
                    let _ = rx.recv();
                },
            )
            .unwrap();
        assert!(registry.kill(id, Duration::from_secs(5)));
    }
}
