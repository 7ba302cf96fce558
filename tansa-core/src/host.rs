//! インタプリタ埋め込みインターフェース
//!
//! デバッガはインタプリタの内部構造を知りません。インタプリタ側が
//! このモジュールのトレイトを実装し、実行イベント・フレーム・値を公開します。
//!
//! 実行イベントは実行中のスレッド上で同期的に [`TraceHook::on_event`] に
//! 渡されます。フックから戻るまでそのスレッドは先へ進みません。

use crate::errors::{EvalError, HostError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// インタプリタスレッドID
pub type HostThreadId = u64;

/// インタプリタスレッドの識別情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    pub id: HostThreadId,
    pub name: String,
}

impl ThreadDescriptor {
    pub fn new(id: HostThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// 変数のスコープ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Local,
    Global,
    Class,
}

/// 例外の情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
}

/// 例外イベントの段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionPhase {
    /// 送出された時点
    Raised,
    /// スレッドの最上位まで捕捉されなかった
    Uncaught,
}

/// インタプリタから通知される実行イベント
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent<'a> {
    Call,
    Line,
    Return,
    Exception {
        info: &'a ExceptionInfo,
        phase: ExceptionPhase,
    },
}

/// フックの戻り値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    /// 通常どおり続行
    Continue,
    /// このフレームの以降のイベントを通知しない
    SkipFrame,
    /// このスレッドを終了させる
    Terminate,
}

/// フックのインストール方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    /// すべてのフレームのイベントを通知する
    Trace,
    /// フレーム生成時に [`TraceHook::wants_frame`] を問い合わせ、
    /// 対象フレームのイベントだけを通知する
    FrameEval,
}

/// 値ハンドル
pub type ValueHandle = Arc<dyn Inspect>;

/// イントロスペクション可能な値
pub trait Inspect: Send + Sync {
    /// 型名
    fn type_name(&self) -> String;

    /// 表示用の文字列表現
    fn repr(&self) -> String;

    /// オブジェクトの同一性を表すID（循環検出に使用）
    ///
    /// 子を持たない値は `None` で構いません。
    fn identity(&self) -> Option<u64> {
        None
    }

    fn is_truthy(&self) -> bool;

    /// 子要素の数（コンテナでなければ `None`）
    fn child_count(&self) -> Option<usize> {
        None
    }

    /// `offset` から最大 `limit` 個の子要素を名前付きで返す
    fn children(&self, _offset: usize, _limit: usize) -> Vec<(String, ValueHandle)> {
        Vec::new()
    }

    /// 名前で子要素を探す
    fn child(&self, name: &str) -> Option<ValueHandle> {
        let count = self.child_count()?;
        self.children(0, count)
            .into_iter()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, value)| value)
    }
}

/// [`Runtime::compile`] でコンパイル済みのコード
pub trait CompiledCode: Send + Sync {
    fn source(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// 実行中のフレーム
///
/// フレームは対象スレッドのスタック上にしか存在しないため、
/// 参照できるのはそのスレッドがフックの中にいる間だけです。
pub trait HostFrame {
    fn file(&self) -> &str;
    fn line(&self) -> u32;
    fn function(&self) -> &str;

    /// 呼び出し元のフレーム
    fn back(&self) -> Option<&dyn HostFrame>;

    /// スタックの深さ（最外フレームが1）
    fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = self.back();
        while let Some(frame) = current {
            depth += 1;
            current = frame.back();
        }
        depth
    }

    /// 指定スコープの変数一覧
    fn variables(&self, scope: Scope) -> Vec<(String, ValueHandle)>;

    /// 名前解決（ローカル、グローバルの順）
    fn lookup(&self, name: &str) -> Option<ValueHandle> {
        [Scope::Local, Scope::Global].into_iter().find_map(|scope| {
            self.variables(scope)
                .into_iter()
                .find(|(var, _)| var == name)
                .map(|(_, value)| value)
        })
    }

    /// このフレームのコンテキストでソースを評価する
    ///
    /// 文（代入など）の場合は `Ok(None)` を返します。副作用はターゲットの
    /// 状態にそのまま反映されます。
    fn evaluate(&self, source: &str) -> Result<Option<ValueHandle>, EvalError>;

    /// コンパイル済みの式を評価する
    fn evaluate_compiled(&self, code: &dyn CompiledCode) -> Result<ValueHandle, EvalError>;

    /// 変数に値を代入する（`value` はこのフレームで評価される式）
    fn assign(&self, name: &str, value: &str) -> Result<(), EvalError> {
        self.evaluate(&format!("{} = {}", name, value)).map(|_| ())
    }
}

/// 実スレッドに属さないカスタムフレーム
pub trait CustomFrame: HostFrame + Send + Sync {
    fn as_host_frame(&self) -> &dyn HostFrame;
}

impl<T: HostFrame + Send + Sync> CustomFrame for T {
    fn as_host_frame(&self) -> &dyn HostFrame {
        self
    }
}

/// インタプリタスレッド上で呼ばれるフック
pub trait TraceHook: Send + Sync {
    fn on_event(
        &self,
        thread: &ThreadDescriptor,
        frame: &dyn HostFrame,
        event: TraceEvent<'_>,
    ) -> TraceAction;

    /// [`HookMode::FrameEval`] でフレーム生成時に呼ばれる
    fn wants_frame(&self, file: &str) -> bool;

    fn on_thread_start(&self, thread: &ThreadDescriptor);

    fn on_thread_exit(&self, thread: HostThreadId);
}

/// 出力ストリームの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// ログポイントの出力
    Log,
}

/// ターゲットの標準出力/標準エラーの転送先
pub trait OutputSink: Send + Sync {
    fn write(&self, stream: OutputStream, text: &str);
}

/// デバッグ対象のインタプリタ
pub trait Runtime: Send + Sync {
    /// ランタイム名（versionコマンドで報告）
    fn name(&self) -> &str;

    /// フレーム評価フックをサポートするか
    fn supports_frame_eval(&self) -> bool {
        false
    }

    /// 全スレッドにフックを設定する
    ///
    /// 既に動いているスレッドと、今後作られるスレッドの両方が対象です。
    fn install_hook(&self, hook: Arc<dyn TraceHook>, mode: HookMode) -> Result<(), HostError>;

    fn uninstall_hook(&self);

    /// 生きているインタプリタスレッドの一覧
    fn threads(&self) -> Vec<ThreadDescriptor>;

    /// 式をコンパイルする
    fn compile(&self, source: &str) -> Result<Arc<dyn CompiledCode>, EvalError>;

    /// 出力の転送先を設定する（`None` で解除）
    fn set_output_sink(&self, sink: Option<Arc<dyn OutputSink>>);
}
