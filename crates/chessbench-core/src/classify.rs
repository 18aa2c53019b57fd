//! フェーズと戦術/静的の分類
//!
//! ゲーム局面は浅い MultiPV 探索の結果とヒューリスティックで分類する。
//! パズルは探索せず戦術扱いで、フェーズはテーマタグを優先する。

use serde::{Deserialize, Serialize};

use crate::error::{EvaluatorError, PipelineError};
use crate::evaluator::Evaluator;
use crate::rules::{PositionFacts, Rules};
use crate::types::{Candidate, Character, MoveScore, Phase};

/// 分類の閾値
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub classify_depth: u32,
    /// MultiPV 本数（3〜5）
    pub classify_lines: u32,
    pub opening_max_ply: u32,
    pub opening_min_material: u32,
    pub endgame_max_material: u32,
    pub tactical_gap: i32,
    pub tactical_gap_endgame: i32,
    pub quiet_gap: i32,
    pub quiet_gap_endgame: i32,
    /// 最善から何 cp 以内を「良い手」と数えるか
    pub good_move_window: i32,
    pub min_capture_see: i32,
    pub max_good_moves_tactical: u32,
    pub min_good_moves_quiet: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            classify_depth: 12,
            classify_lines: 4,
            opening_max_ply: 20,
            opening_min_material: 26,
            endgame_max_material: 14,
            tactical_gap: 100,
            tactical_gap_endgame: 60,
            quiet_gap: 30,
            quiet_gap_endgame: 20,
            good_move_window: 50,
            min_capture_see: 100,
            max_good_moves_tactical: 2,
            min_good_moves_quiet: 3,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(3..=5).contains(&self.classify_lines) {
            return Err(PipelineError::InvalidDistribution(format!(
                "classifier.classify_lines must be 3..=5, got {}",
                self.classify_lines
            )));
        }
        if self.quiet_gap > self.tactical_gap || self.quiet_gap_endgame > self.tactical_gap_endgame {
            return Err(PipelineError::InvalidDistribution(
                "classifier quiet gaps must not exceed tactical gaps".to_string(),
            ));
        }
        Ok(())
    }

    fn gaps(&self, phase: Phase) -> (i32, i32) {
        match phase {
            Phase::Endgame => (self.tactical_gap_endgame, self.quiet_gap_endgame),
            Phase::Opening | Phase::Middlegame => (self.tactical_gap, self.quiet_gap),
        }
    }
}

/// フェーズ判定。Opening → Endgame → Middlegame の順に見る。
pub fn phase_of(facts: &PositionFacts, ply: u32, cfg: &ClassifierConfig) -> Phase {
    if ply <= cfg.opening_max_ply && facts.both_queens() && facts.material >= cfg.opening_min_material
    {
        Phase::Opening
    } else if facts.material <= cfg.endgame_max_material {
        Phase::Endgame
    } else {
        Phase::Middlegame
    }
}

/// パズルのテーマタグからフェーズを読む
pub fn phase_from_themes(themes: &[String]) -> Option<Phase> {
    themes.iter().find_map(|t| match t.as_str() {
        "opening" => Some(Phase::Opening),
        "middlegame" => Some(Phase::Middlegame),
        "endgame" => Some(Phase::Endgame),
        _ => None,
    })
}

/// MultiPV の結果から読み取った特徴量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPvSummary {
    pub best: MoveScore,
    pub gap: i32,
    pub good_move_count: u32,
}

impl MultiPvSummary {
    /// 良い順に並べ直してから要約する。空なら `None`。
    pub fn from_lines(mut lines: Vec<MoveScore>, window: i32) -> Option<Self> {
        lines.sort_by_key(|m| std::cmp::Reverse(m.score.to_cp()));
        let best = lines.first()?.clone();
        let best_cp = best.score.to_cp();
        let gap = lines.get(1).map_or(0, |second| best_cp - second.score.to_cp());
        let good_move_count = lines
            .iter()
            .filter(|m| best_cp - m.score.to_cp() <= window)
            .count() as u32;
        Some(Self {
            best,
            gap,
            good_move_count,
        })
    }
}

pub struct Classifier<'a> {
    rules: &'a dyn Rules,
    cfg: &'a ClassifierConfig,
}

impl<'a> Classifier<'a> {
    pub fn new(rules: &'a dyn Rules, cfg: &'a ClassifierConfig) -> Self {
        Self { rules, cfg }
    }

    /// ゲーム局面のフェーズと性格を埋める
    pub fn classify_game(
        &self,
        candidate: &mut Candidate,
        evaluator: &mut dyn Evaluator,
    ) -> Result<(), EvaluatorError> {
        let fen = candidate.canonical_fen.as_str();
        let facts = self.rules.inspect(fen)?;
        candidate.phase = phase_of(&facts, candidate.ply_number, self.cfg);

        let lines = evaluator.evaluate(&candidate.search_fen(), self.cfg.classify_depth, self.cfg.classify_lines)?;
        let Some(summary) = MultiPvSummary::from_lines(lines, self.cfg.good_move_window) else {
            candidate.character = Character::Unclassified;
            return Ok(());
        };
        candidate.is_mate = summary.best.score.is_mate();
        candidate.character = self.character_of(fen, candidate.phase, &summary)?;
        Ok(())
    }

    /// パズルのフェーズを埋める（性格は正規化時点で Tactical）
    pub fn classify_puzzle(&self, candidate: &mut Candidate) -> Result<(), EvaluatorError> {
        candidate.phase = match phase_from_themes(&candidate.themes) {
            Some(p) => p,
            None => {
                let facts = self.rules.inspect(&candidate.canonical_fen)?;
                phase_of(&facts, candidate.ply_number, self.cfg)
            }
        };
        candidate.character = Character::Tactical;
        Ok(())
    }

    fn character_of(
        &self,
        fen: &str,
        phase: Phase,
        summary: &MultiPvSummary,
    ) -> Result<Character, EvaluatorError> {
        if summary.best.score.is_mate() {
            return Ok(Character::Tactical);
        }
        let (tactical_gap, quiet_gap) = self.cfg.gaps(phase);
        let forcing = self.rules.is_check_or_capture(fen, &summary.best.uci)?;

        if summary.gap >= tactical_gap || summary.good_move_count <= self.cfg.max_good_moves_tactical {
            return Ok(Character::Tactical);
        }
        if forcing && self.rules.static_exchange_eval(fen, &summary.best.uci)? >= self.cfg.min_capture_see
        {
            return Ok(Character::Tactical);
        }
        if summary.gap <= quiet_gap && !forcing && summary.good_move_count >= self.cfg.min_good_moves_quiet {
            return Ok(Character::Quiet);
        }
        Ok(Character::Unclassified)
    }
}
