//! 局面評価器のインターフェースと組み込みの駒得評価器

use crate::error::EvaluatorError;
use crate::rules::{ChessRules, Rules};
use crate::types::{MoveScore, Score};

/// 局面評価器。
///
/// `max_variations` が合法手数以上なら、全合法手を1件ずつ返すこと。
/// 戻り値は良い順（手番側視点）。
pub trait Evaluator: Send {
    fn evaluate(
        &mut self,
        fen: &str,
        depth: u32,
        max_variations: u32,
    ) -> Result<Vec<MoveScore>, EvaluatorError>;
}

impl<E: Evaluator + ?Sized> Evaluator for Box<E> {
    fn evaluate(
        &mut self,
        fen: &str,
        depth: u32,
        max_variations: u32,
    ) -> Result<Vec<MoveScore>, EvaluatorError> {
        (**self).evaluate(fen, depth, max_variations)
    }
}

/// 探索しない決定的な評価器。
///
/// 1手詰めは `mate 1`、それ以外は着手の SEE を centipawn として返す。
/// エンジンなしでパイプライン全体を通すとき（構造確認・テスト）に使う。
#[derive(Debug, Clone, Default)]
pub struct MaterialEvaluator {
    rules: ChessRules,
}

impl MaterialEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evaluator for MaterialEvaluator {
    fn evaluate(
        &mut self,
        fen: &str,
        _depth: u32,
        max_variations: u32,
    ) -> Result<Vec<MoveScore>, EvaluatorError> {
        let mut scored = Vec::new();
        for uci in self.rules.legal_moves(fen)? {
            let after = self.rules.play(fen, &uci)?;
            let reply = self.rules.inspect(&after)?;
            let score = if reply.legal_move_count == 0 && reply.in_check {
                Score::Mate(1)
            } else if reply.legal_move_count == 0 || reply.insufficient_material {
                Score::Cp(0)
            } else {
                Score::Cp(self.rules.static_exchange_eval(fen, &uci)?)
            };
            scored.push(MoveScore { uci, score });
        }
        scored.sort_by(|a, b| {
            b.score
                .to_cp()
                .cmp(&a.score.to_cp())
                .then_with(|| a.uci.cmp(&b.uci))
        });
        scored.truncate(max_variations as usize);
        Ok(scored)
    }
}
