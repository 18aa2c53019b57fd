//! Error types for the dataset pipeline

use serde::Serialize;

use crate::types::StratumKey;

/// 盤面ルール層のエラー
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RulesError {
    /// FEN として解釈できない
    #[error("invalid FEN '{0}'")]
    InvalidFen(String),

    /// 指し手が UCI / SAN のどちらとしても解釈できない、または非合法
    #[error("illegal move '{mv}' in {fen}")]
    IllegalMove { fen: String, mv: String },
}

/// 評価器（エンジン）のエラー
#[derive(thiserror::Error, Debug)]
pub enum EvaluatorError {
    /// 応答待ちのタイムアウト
    #[error("evaluator timed out after {0} ms")]
    Timeout(u64),

    /// エンジンプロセスの異常（起動失敗・途中終了・プロトコル違反）
    #[error("engine process: {0}")]
    Process(String),

    /// 返ってきた指し手集合が合法手と一致しない
    #[error("evaluator mismatch: {0}")]
    Mismatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rules(#[from] RulesError),
}

/// 目標数に届かなかった層
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub key: StratumKey,
    pub target: u32,
    pub selected: u32,
}

impl Shortfall {
    pub fn missing(&self) -> u32 {
        self.target.saturating_sub(self.selected)
    }
}

fn describe_shortfalls(list: &[Shortfall]) -> String {
    list.iter()
        .map(|s| format!("{} ({}/{}, short {})", s.key, s.selected, s.target, s.missing()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// パイプライン全体のエラー
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// 入力レコードの破損。呼び出し側でログに残して捨てる（致命的ではない）。
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// 目標数を満たせなかった層の一覧
    #[error("stratum shortfall in {} strata: {}", .0.len(), describe_shortfalls(.0))]
    StratumShortfall(Vec<Shortfall>),

    /// 評価結果の手数・指し手集合が合法手と食い違う
    #[error("evaluator mismatch at index {index} ({fen}): {detail}")]
    EvaluatorMismatch {
        index: usize,
        fen: String,
        detail: String,
    },

    /// 同じシードで選択結果が変わった
    #[error("non-determinism detected: {0}")]
    NonDeterminismDetected(String),

    /// 分布仕様の不整合（合計不一致・キー重複など）
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
