//! デバッガの設定

use crate::errors::ConfigError;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// トレース対象外とするファイルのリスト
pub const ENV_DONT_TRACE: &str = "TANSA_DONT_TRACE";
/// インターセプト方式（`trace` / `frame-eval` / `auto`）
pub const ENV_INTERCEPTION: &str = "TANSA_INTERCEPTION";
/// 出力転送の有効/無効（`0` で無効）
pub const ENV_REDIRECT_OUTPUT: &str = "TANSA_REDIRECT_OUTPUT";

/// インターセプト方式の選択
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterceptionStrategy {
    /// ランタイムがサポートしていればフレーム評価フック、そうでなければトレース
    #[default]
    Auto,
    Trace,
    FrameEval,
}

impl FromStr for InterceptionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "trace" => Ok(Self::Trace),
            "frame-eval" | "frame_eval" | "frameeval" => Ok(Self::FrameEval),
            _ => Err(ConfigError::InvalidValue {
                var: ENV_INTERCEPTION.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for InterceptionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Trace => "trace",
            Self::FrameEval => "frame-eval",
        };
        f.write_str(name)
    }
}

/// 変数ツリー展開の上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectLimits {
    /// 子要素を展開する最大の深さ
    pub max_depth: usize,
    /// 1階層あたりの最大要素数
    pub max_items: usize,
    /// 値の文字列表現の最大長（文字数）
    pub max_string: usize,
}

impl Default for InspectLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_items: 100,
            max_string: 256,
        }
    }
}

/// デバッガの設定
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// トレース対象外のファイル（末尾が `/` のものと既存のディレクトリはディレクトリ接頭辞）
    pub dont_trace: Vec<String>,
    pub interception: InterceptionStrategy,
    pub limits: InspectLimits,
    /// ターゲットの出力をコントローラへ転送するか
    pub redirect_output: bool,
    /// コントローラ接続のタイムアウト
    pub connect_timeout: Duration,
    /// 同期的な内部コマンドの応答待ち時間
    pub command_timeout: Duration,
    /// デタッチ時にデーモンスレッドの終了を待つ時間
    pub daemon_join_timeout: Duration,
    /// process_output 1件あたりの最大バイト数
    pub output_chunk_size: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            dont_trace: Vec::new(),
            interception: InterceptionStrategy::Auto,
            limits: InspectLimits::default(),
            redirect_output: true,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            daemon_join_timeout: Duration::from_secs(2),
            output_chunk_size: 1000,
        }
    }
}

impl DebuggerConfig {
    /// 環境変数から設定を読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// 任意の取得関数から設定を読み込む
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_DONT_TRACE) {
            config.dont_trace = parse_path_list(&value);
        }
        if let Some(value) = lookup(ENV_INTERCEPTION) {
            config.interception = value.parse()?;
        }
        if let Some(value) = lookup(ENV_REDIRECT_OUTPUT) {
            config.redirect_output = match value.trim() {
                "0" | "false" | "no" | "off" => false,
                "1" | "true" | "yes" | "on" | "" => true,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: ENV_REDIRECT_OUTPUT.to_string(),
                        value,
                    })
                }
            };
        }

        Ok(config)
    }
}

/// `:` `;` `,` 区切りのパスリストを分割する
pub fn parse_path_list(value: &str) -> Vec<String> {
    value
        .split([':', ';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DebuggerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.interception, InterceptionStrategy::Auto);
        assert_eq!(config.limits.max_items, 100);
        assert!(config.redirect_output);
        assert!(config.dont_trace.is_empty());
    }

    #[test]
    fn test_env_values() {
        let config = DebuggerConfig::from_lookup(lookup_from(&[
            (ENV_DONT_TRACE, "/opt/lib/; util.src, :helpers.src"),
            (ENV_INTERCEPTION, "frame-eval"),
            (ENV_REDIRECT_OUTPUT, "0"),
        ]))
        .unwrap();
        assert_eq!(config.dont_trace, vec!["/opt/lib/", "util.src", "helpers.src"]);
        assert_eq!(config.interception, InterceptionStrategy::FrameEval);
        assert!(!config.redirect_output);
    }

    #[test]
    fn test_invalid_interception() {
        let err = DebuggerConfig::from_lookup(lookup_from(&[(ENV_INTERCEPTION, "jit")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
