//! デバッグ対象用の小さなスクリプト言語
//!
//! インデントでブロックを表す行指向の言語です。インタプリタは
//! [`tansa_core::Runtime`] を実装しており、トレースとフレーム評価の
//! どちらのバックエンドでもデバッガを受け入れます。

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod value;

pub use ast::Program;
pub use interp::ScriptException;
pub use parser::{parse_expression, parse_program, parse_snippet, ParseError};
pub use runtime::{Safepoint, ScriptRuntime};
pub use value::Value;

use std::path::PathBuf;
use thiserror::Error;

/// スクリプト実行のエラー
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("{file}:{line}: syntax error: {message}")]
    Parse {
        file: String,
        line: u32,
        message: String,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("uncaught {type_name}: {message}")]
    Uncaught { type_name: String, message: String },
}

/// スクリプト処理の結果型
pub type Result<T> = std::result::Result<T, ScriptError>;
