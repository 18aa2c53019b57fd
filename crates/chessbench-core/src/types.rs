//! データセット構築で共有する基本型

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 50手ルールの手前で打ち切る halfmove clock の上限（これ以上は候補にしない）
pub const MAX_HALFMOVE_CLOCK: u32 = 80;

/// 詰みスコアを centipawn に畳み込むときの基準値
pub const MATE_SCORE: i32 = 30_000;

/// 手番
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn label(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }

    /// FEN の手番フィールド（`w` / `b`）から変換する
    pub fn from_fen_field(field: &str) -> Option<Side> {
        match field {
            "w" => Some(Side::White),
            "b" => Some(Side::Black),
            _ => None,
        }
    }
}

impl std::ops::Not for Side {
    type Output = Side;

    fn not(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }
}

/// 局面のフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Opening,
    Middlegame,
    Endgame,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Opening, Phase::Middlegame, Phase::Endgame];

    pub fn label(self) -> &'static str {
        match self {
            Phase::Opening => "opening",
            Phase::Middlegame => "middlegame",
            Phase::Endgame => "endgame",
        }
    }
}

/// 戦術的 / 静的の区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Character {
    Tactical,
    Quiet,
    Unclassified,
}

impl Character {
    pub fn label(self) -> &'static str {
        match self {
            Character::Tactical => "tactical",
            Character::Quiet => "quiet",
            Character::Unclassified => "unclassified",
        }
    }
}

/// 候補の出どころ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Game,
    Puzzle,
}

/// レーティング帯のラベル（例: `<1400`, `1400-1800`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatingBucket(pub String);

impl RatingBucket {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RatingBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 正規化済みの候補局面。
///
/// Normalizer で生成され、Classifier が `phase` / `character` / `is_mate` を埋める。
/// 以降のステージでは書き換えない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// 先頭4フィールドのみの FEN（アンパッサンは実際に取れる場合のみ残す）
    pub canonical_fen: String,
    pub side_to_move: Side,
    pub source: Source,
    pub source_game_id: String,
    pub ply_number: u32,
    pub halfmove_clock: u32,
    pub legal_move_count: u32,
    pub rating: u32,
    pub rating_bucket: RatingBucket,
    pub phase: Phase,
    pub character: Character,
    #[serde(default)]
    pub is_mate: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub themes: Vec<String>,
}

impl Candidate {
    /// `legal_move_count >= 1` かつ `halfmove_clock < 80`
    pub fn is_valid(&self) -> bool {
        self.legal_move_count >= 1 && self.halfmove_clock < MAX_HALFMOVE_CLOCK
    }

    /// 評価器へ渡す6フィールド FEN。50手ルールのカウンタを落とさない。
    pub fn search_fen(&self) -> String {
        format!("{} {} {}", self.canonical_fen, self.halfmove_clock, self.ply_number / 2 + 1)
    }
}

/// エンジンの評価値（手番側視点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

impl Score {
    /// 比較用に centipawn へ畳み込む。詰みは `±(30000 - n)`。
    pub fn to_cp(self) -> i32 {
        match self {
            Score::Cp(v) => v,
            Score::Mate(n) if n > 0 => MATE_SCORE - n,
            Score::Mate(n) => -MATE_SCORE - n,
        }
    }

    pub fn is_mate(self) -> bool {
        matches!(self, Score::Mate(_))
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Cp(v) => write!(f, "cp {v}"),
            Score::Mate(n) => write!(f, "mate {n}"),
        }
    }
}

/// 1手分の評価
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveScore {
    pub uci: String,
    pub score: Score,
}

/// 分布仕様の1セル。ゲームは4次元、パズルは (rating, phase) の2次元。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StratumKey {
    pub rating_bucket: RatingBucket,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<Character>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_to_move: Option<Side>,
}

impl StratumKey {
    pub fn game(rating_bucket: RatingBucket, phase: Phase, character: Character, side: Side) -> Self {
        Self {
            rating_bucket,
            phase,
            character: Some(character),
            side_to_move: Some(side),
        }
    }

    pub fn puzzle(rating_bucket: RatingBucket, phase: Phase) -> Self {
        Self {
            rating_bucket,
            phase,
            character: None,
            side_to_move: None,
        }
    }
}

impl fmt::Display for StratumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rating_bucket, self.phase.label())?;
        if let Some(c) = self.character {
            write!(f, "/{}", c.label())?;
        }
        if let Some(s) = self.side_to_move {
            write!(f, "/{}", s.label())?;
        }
        Ok(())
    }
}

/// 候補をどの次元で層別するか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyShape {
    /// (rating, phase, character, side)
    Games,
    /// (rating, phase)
    Puzzles,
}

impl KeyShape {
    /// 候補を層キーへ射影する
    pub fn project(self, c: &Candidate) -> StratumKey {
        match self {
            KeyShape::Games => {
                StratumKey::game(c.rating_bucket.clone(), c.phase, c.character, c.side_to_move)
            }
            KeyShape::Puzzles => StratumKey::puzzle(c.rating_bucket.clone(), c.phase),
        }
    }

    /// キーがこの形に沿っているか
    pub fn conforms(self, key: &StratumKey) -> bool {
        match self {
            KeyShape::Games => {
                matches!(key.character, Some(Character::Tactical | Character::Quiet))
                    && key.side_to_move.is_some()
            }
            KeyShape::Puzzles => key.character.is_none() && key.side_to_move.is_none(),
        }
    }
}

/// 出力レコード（questions.csv の1行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub index: usize,
    pub fen: String,
    /// 指し手(UCI) → 評価。`--skip-eval` 時は空。
    pub legal_move_evaluations: BTreeMap<String, Score>,
    pub is_private: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mate_scores_fold_around_mate_base() {
        assert_eq!(Score::Mate(3).to_cp(), 29_997);
        assert_eq!(Score::Mate(-1).to_cp(), -29_999);
        assert!(Score::Mate(-3).to_cp() > Score::Mate(-1).to_cp());
        assert_eq!(Score::Cp(-42).to_cp(), -42);
    }

    #[test]
    fn score_serializes_like_multipv_logs() {
        assert_eq!(serde_json::to_string(&Score::Cp(25)).unwrap(), r#"{"cp":25}"#);
        assert_eq!(serde_json::to_string(&Score::Mate(-2)).unwrap(), r#"{"mate":-2}"#);
    }

    #[test]
    fn key_display_lists_present_dimensions() {
        let key = StratumKey::game(
            RatingBucket::new("<1400"),
            Phase::Opening,
            Character::Tactical,
            Side::White,
        );
        assert_eq!(key.to_string(), "<1400/opening/tactical/white");
        let key = StratumKey::puzzle(RatingBucket::new("2600+"), Phase::Endgame);
        assert_eq!(key.to_string(), "2600+/endgame");
    }

    #[test]
    fn game_shape_rejects_unclassified_keys() {
        let mut key = StratumKey::game(
            RatingBucket::new("<1400"),
            Phase::Middlegame,
            Character::Unclassified,
            Side::Black,
        );
        assert!(!KeyShape::Games.conforms(&key));
        key.character = Some(Character::Quiet);
        assert!(KeyShape::Games.conforms(&key));
        assert!(!KeyShape::Puzzles.conforms(&key));
    }
}
