//! 棋譜・パズルのレコードを候補局面へ正規化する
//!
//! ゲームは1局につき高々1局面。適格な ply の中からリザーバサンプリングで選ぶ。

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, RulesError};
use crate::rating::RatingBands;
use crate::rules::Rules;
use crate::types::{Candidate, Character, MAX_HALFMOVE_CLOCK, Phase, Source};

/// 読み込んだままの対局レコード
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGame {
    pub game_id: String,
    pub white_elo: Option<u32>,
    pub black_elo: Option<u32>,
    pub time_control: Option<String>,
    pub variant: Option<String>,
    pub event: Option<String>,
    /// 主手順の指し手（SAN または UCI）
    pub moves: Vec<String>,
}

/// 読み込んだままのパズルレコード
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPuzzle {
    pub puzzle_id: String,
    /// 相手の仕掛けの手を指す前の局面
    pub fen: String,
    /// 正解手順（UCI）。先頭は相手の仕掛けの手。
    pub moves: Vec<String>,
    pub rating: u32,
    pub themes: Vec<String>,
}

/// 持ち時間の区分（想定対局時間 = base + 40 × increment 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeClass {
    Ultrafast,
    Bullet,
    Blitz,
    Rapid,
    Classical,
}

impl TimeClass {
    /// `"300+3"` 形式を解釈する。`"-"`（通信対局）や桁あふれする値は `None`。
    pub fn from_time_control(tc: &str) -> Option<TimeClass> {
        let (base, inc) = match tc.trim().split_once('+') {
            Some((b, i)) => (b.parse::<u32>().ok()?, i.parse::<u32>().ok()?),
            None => (tc.trim().parse::<u32>().ok()?, 0),
        };
        let estimated = inc.checked_mul(40)?.checked_add(base)?;
        Some(match estimated {
            0..29 => TimeClass::Ultrafast,
            29..179 => TimeClass::Bullet,
            179..479 => TimeClass::Blitz,
            479..1499 => TimeClass::Rapid,
            _ => TimeClass::Classical,
        })
    }
}

/// 対局単位のフィルタ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameFilter {
    pub standard_only: bool,
    pub rated_only: bool,
    pub time_classes: Vec<TimeClass>,
}

impl Default for GameFilter {
    fn default() -> Self {
        Self {
            standard_only: true,
            rated_only: true,
            time_classes: vec![TimeClass::Blitz, TimeClass::Rapid, TimeClass::Classical],
        }
    }
}

/// 除外理由ごとの件数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub seen: u64,
    pub accepted: u64,
    pub variant: u64,
    pub casual: u64,
    pub time_control: u64,
    pub missing_rating: u64,
    pub malformed: u64,
    pub no_eligible_ply: u64,
    pub terminal: u64,
    pub halfmove_clock: u64,
}

impl NormalizeStats {
    pub fn rejected(&self) -> u64 {
        self.seen - self.accepted
    }

    pub fn log_summary(&self, label: &str) {
        log::info!(
            "{label}: seen={} accepted={} rejected={} (variant={} casual={} time_control={} missing_rating={} malformed={} no_eligible_ply={} terminal={} halfmove_clock={})",
            self.seen,
            self.accepted,
            self.rejected(),
            self.variant,
            self.casual,
            self.time_control,
            self.missing_rating,
            self.malformed,
            self.no_eligible_ply,
            self.terminal,
            self.halfmove_clock,
        );
    }
}

#[derive(Debug)]
enum Rejection {
    Variant,
    Casual,
    TimeControl,
    MissingRating,
    Malformed(String),
    NoEligiblePly,
    Terminal,
    HalfmoveClock,
}

impl From<RulesError> for Rejection {
    fn from(e: RulesError) -> Self {
        Rejection::Malformed(e.to_string())
    }
}

/// FEN を先頭4フィールドへ切り詰め、取れないアンパッサン欄を `-` に直す
pub fn canonical_fen(rules: &dyn Rules, fen: &str) -> Result<String, RulesError> {
    let fields: Vec<&str> = fen.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(RulesError::InvalidFen(fen.to_string()));
    }
    let ep = if fields[3] != "-" && !rules.is_en_passant_capture_legal(fen)? {
        "-"
    } else {
        fields[3]
    };
    Ok(format!("{} {} {} {}", fields[0], fields[1], fields[2], ep))
}

fn is_mate_theme(theme: &str) -> bool {
    theme == "mate" || theme.starts_with("mateIn") || theme.ends_with("Mate")
}

pub struct Normalizer<'a> {
    rules: &'a dyn Rules,
    bands: &'a RatingBands,
    filter: &'a GameFilter,
    stats: NormalizeStats,
}

impl<'a> Normalizer<'a> {
    pub fn new(rules: &'a dyn Rules, bands: &'a RatingBands, filter: &'a GameFilter) -> Self {
        Self {
            rules,
            bands,
            filter,
            stats: NormalizeStats::default(),
        }
    }

    pub fn stats(&self) -> &NormalizeStats {
        &self.stats
    }

    /// 対局1件を正規化する。除外した場合は理由を数えて `None`。
    pub fn normalize_game<R: Rng + ?Sized>(&mut self, raw: &RawGame, rng: &mut R) -> Option<Candidate> {
        let result = self.try_game(raw, rng);
        self.record(&raw.game_id, result)
    }

    /// パズル1件を正規化する
    pub fn normalize_puzzle(&mut self, raw: &RawPuzzle) -> Option<Candidate> {
        let result = self.try_puzzle(raw);
        self.record(&raw.puzzle_id, result)
    }

    fn record(&mut self, id: &str, result: Result<Candidate, Rejection>) -> Option<Candidate> {
        self.stats.seen += 1;
        let reason = match result {
            Ok(c) => {
                self.stats.accepted += 1;
                return Some(c);
            }
            Err(r) => r,
        };
        let s = &mut self.stats;
        match reason {
            Rejection::Variant => s.variant += 1,
            Rejection::Casual => s.casual += 1,
            Rejection::TimeControl => s.time_control += 1,
            Rejection::MissingRating => s.missing_rating += 1,
            Rejection::NoEligiblePly => s.no_eligible_ply += 1,
            Rejection::Terminal => s.terminal += 1,
            Rejection::HalfmoveClock => s.halfmove_clock += 1,
            Rejection::Malformed(detail) => {
                s.malformed += 1;
                log::warn!("{id}: {}", PipelineError::MalformedInput(detail));
            }
        }
        None
    }

    fn check_filters(&self, raw: &RawGame) -> Result<u32, Rejection> {
        if self.filter.standard_only {
            let variant = raw.variant.as_deref().unwrap_or("Standard");
            if !variant.eq_ignore_ascii_case("standard") {
                return Err(Rejection::Variant);
            }
        }
        if self.filter.rated_only
            && raw
                .event
                .as_deref()
                .is_some_and(|e| e.to_ascii_lowercase().contains("casual"))
        {
            return Err(Rejection::Casual);
        }
        let class = raw
            .time_control
            .as_deref()
            .and_then(TimeClass::from_time_control)
            .ok_or(Rejection::TimeControl)?;
        if !self.filter.time_classes.contains(&class) {
            return Err(Rejection::TimeControl);
        }
        match (raw.white_elo, raw.black_elo) {
            (Some(w), Some(b)) if w > 0 && b > 0 => Ok(w / 2 + b / 2 + (w % 2 + b % 2) / 2),
            _ => Err(Rejection::MissingRating),
        }
    }

    fn try_game<R: Rng + ?Sized>(&self, raw: &RawGame, rng: &mut R) -> Result<Candidate, Rejection> {
        let rating = self.check_filters(raw)?;
        if raw.moves.is_empty() {
            return Err(Rejection::NoEligiblePly);
        }
        let plies = self.rules.replay(&raw.moves)?;

        // リザーバサンプリング（k 番目の適格局面を 1/k で採用）
        let mut chosen = None;
        let mut eligible: u32 = 0;
        let (mut by_clock, mut by_terminal) = (0u32, 0u32);
        for pos in plies {
            if pos.halfmove_clock >= MAX_HALFMOVE_CLOCK {
                by_clock += 1;
                continue;
            }
            let facts = self.rules.inspect(&pos.fen)?;
            if facts.is_terminal() {
                by_terminal += 1;
                continue;
            }
            eligible += 1;
            if rng.random_range(0..eligible) == 0 {
                chosen = Some((pos, facts));
            }
        }
        // 全 ply が除外されたら多い方の理由で数える
        let Some((pos, facts)) = chosen else {
            return Err(if by_terminal > by_clock {
                Rejection::Terminal
            } else if by_clock > 0 {
                Rejection::HalfmoveClock
            } else {
                Rejection::NoEligiblePly
            });
        };

        Ok(Candidate {
            canonical_fen: canonical_fen(self.rules, &pos.fen)?,
            side_to_move: facts.side_to_move,
            source: Source::Game,
            source_game_id: raw.game_id.clone(),
            ply_number: pos.ply,
            halfmove_clock: pos.halfmove_clock,
            legal_move_count: facts.legal_move_count,
            rating,
            rating_bucket: self.bucket(rating)?,
            phase: Phase::Middlegame,
            character: Character::Unclassified,
            is_mate: false,
            themes: Vec::new(),
        })
    }

    fn try_puzzle(&self, raw: &RawPuzzle) -> Result<Candidate, Rejection> {
        let setup = raw
            .moves
            .first()
            .ok_or_else(|| Rejection::Malformed("puzzle has no moves".to_string()))?;
        let fen = self.rules.play(&raw.fen, setup)?;
        let facts = self.rules.inspect(&fen)?;
        if facts.is_terminal() {
            return Err(Rejection::Terminal);
        }
        if facts.halfmove_clock >= MAX_HALFMOVE_CLOCK {
            return Err(Rejection::HalfmoveClock);
        }

        Ok(Candidate {
            canonical_fen: canonical_fen(self.rules, &fen)?,
            side_to_move: facts.side_to_move,
            source: Source::Puzzle,
            source_game_id: raw.puzzle_id.clone(),
            ply_number: facts.ply(),
            halfmove_clock: facts.halfmove_clock,
            legal_move_count: facts.legal_move_count,
            rating: raw.rating,
            rating_bucket: self.bucket(raw.rating)?,
            phase: Phase::Middlegame,
            // パズルは探索なしで戦術扱い
            character: Character::Tactical,
            is_mate: raw.themes.iter().any(|t| is_mate_theme(t)),
            themes: raw.themes.clone(),
        })
    }

    fn bucket(&self, rating: u32) -> Result<crate::types::RatingBucket, Rejection> {
        self.bands
            .bucket_for(rating)
            .ok_or_else(|| Rejection::Malformed(format!("no rating band for {rating}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ChessRules;
    use crate::seed::RunSeed;
    use crate::types::Side;

    fn game(id: &str, moves: &[&str]) -> RawGame {
        RawGame {
            game_id: id.to_string(),
            white_elo: Some(1500),
            black_elo: Some(1700),
            time_control: Some("300+0".to_string()),
            variant: None,
            event: Some("Rated Blitz game".to_string()),
            moves: moves.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn time_classes_follow_estimated_duration() {
        assert_eq!(TimeClass::from_time_control("15+0"), Some(TimeClass::Ultrafast));
        assert_eq!(TimeClass::from_time_control("60+1"), Some(TimeClass::Bullet));
        assert_eq!(TimeClass::from_time_control("180+0"), Some(TimeClass::Blitz));
        assert_eq!(TimeClass::from_time_control("600+5"), Some(TimeClass::Rapid));
        assert_eq!(TimeClass::from_time_control("1800+20"), Some(TimeClass::Classical));
        assert_eq!(TimeClass::from_time_control("-"), None);
    }

    #[test]
    fn illegal_en_passant_field_is_cleared() {
        let rules = ChessRules;
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";
        assert_eq!(
            canonical_fen(&rules, fen).unwrap(),
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq -"
        );
        let fen = "rnbqkbnr/ppp1pppp/8/8/3pP3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 3";
        assert!(canonical_fen(&rules, fen).unwrap().ends_with(" e3"));
    }

    #[test]
    fn game_filters_count_each_reason() {
        let rules = ChessRules;
        let bands = RatingBands::default();
        let filter = GameFilter::default();
        let mut n = Normalizer::new(&rules, &bands, &filter);
        let mut rng = RunSeed::new(1).stream("t");

        let mut g = game("bullet", &["e4", "e5"]);
        g.time_control = Some("60+0".to_string());
        assert!(n.normalize_game(&g, &mut rng).is_none());

        let mut g = game("casual", &["e4", "e5"]);
        g.event = Some("Casual Rapid game".to_string());
        assert!(n.normalize_game(&g, &mut rng).is_none());

        let mut g = game("variant", &["e4", "e5"]);
        g.variant = Some("Chess960".to_string());
        assert!(n.normalize_game(&g, &mut rng).is_none());

        let mut g = game("elo", &["e4", "e5"]);
        g.black_elo = None;
        assert!(n.normalize_game(&g, &mut rng).is_none());

        let g = game("broken", &["e4", "Ke3"]);
        assert!(n.normalize_game(&g, &mut rng).is_none());

        let s = n.stats();
        assert_eq!(s.seen, 5);
        assert_eq!(s.accepted, 0);
        assert_eq!((s.time_control, s.casual, s.variant, s.missing_rating, s.malformed), (1, 1, 1, 1, 1));
    }

    #[test]
    fn reservoir_pick_is_seeded_and_valid() {
        let rules = ChessRules;
        let bands = RatingBands::default();
        let filter = GameFilter::default();
        let g = game("g1", &["e4", "e5", "Nf3", "Nc6", "Bb5", "a6", "Ba4", "Nf6"]);

        let pick = |seed: u64| {
            let mut n = Normalizer::new(&rules, &bands, &filter);
            let mut rng = RunSeed::new(seed).stream("t");
            n.normalize_game(&g, &mut rng).unwrap()
        };
        let a = pick(7);
        assert_eq!(a, pick(7));
        assert!(a.is_valid());
        assert_eq!(a.rating, 1600);
        assert_eq!(a.rating_bucket.as_str(), "1400-1800");
        assert_eq!(a.canonical_fen.split(' ').count(), 4);
        assert!((1..=8).contains(&a.ply_number));
        let expected = if a.ply_number % 2 == 1 { Side::Black } else { Side::White };
        assert_eq!(a.side_to_move, expected);

        // シードを変えれば別の ply も選ばれうる
        let plies: std::collections::BTreeSet<u32> = (0..32).map(|s| pick(s).ply_number).collect();
        assert!(plies.len() > 1);
    }

    #[test]
    fn overflowing_headers_are_handled_without_panic() {
        assert_eq!(TimeClass::from_time_control("4294967295+1"), None);
        assert_eq!(TimeClass::from_time_control("1+107374183"), None);
        assert_eq!(TimeClass::from_time_control("4294967295"), Some(TimeClass::Classical));

        let rules = ChessRules;
        let bands = RatingBands::default();
        let filter = GameFilter::default();
        let mut n = Normalizer::new(&rules, &bands, &filter);
        let mut rng = RunSeed::new(3).stream("t");

        let mut g = game("tc", &["e4", "e5"]);
        g.time_control = Some("4294967295+1".to_string());
        assert!(n.normalize_game(&g, &mut rng).is_none());
        assert_eq!(n.stats().time_control, 1);

        let mut g = game("elo", &["e4", "e5"]);
        g.white_elo = Some(u32::MAX);
        g.black_elo = Some(u32::MAX);
        let c = n.normalize_game(&g, &mut rng).unwrap();
        assert_eq!(c.rating, u32::MAX);
        assert_eq!(c.rating_bucket.as_str(), "2600+");

        let mut g = game("odd", &["e4", "e5"]);
        g.white_elo = Some(1501);
        g.black_elo = Some(1600);
        assert_eq!(n.normalize_game(&g, &mut rng).unwrap().rating, 1550);
    }

    /// 再生結果だけを差し替える
    struct ScriptedReplay {
        clock_shift: u32,
        last_only: bool,
    }

    impl Rules for ScriptedReplay {
        fn legal_moves(&self, fen: &str) -> Result<Vec<String>, RulesError> {
            ChessRules.legal_moves(fen)
        }
        fn is_en_passant_capture_legal(&self, fen: &str) -> Result<bool, RulesError> {
            ChessRules.is_en_passant_capture_legal(fen)
        }
        fn static_exchange_eval(&self, fen: &str, mv: &str) -> Result<i32, RulesError> {
            ChessRules.static_exchange_eval(fen, mv)
        }
        fn material_count(&self, fen: &str) -> Result<u32, RulesError> {
            ChessRules.material_count(fen)
        }
        fn inspect(&self, fen: &str) -> Result<crate::rules::PositionFacts, RulesError> {
            ChessRules.inspect(fen)
        }
        fn is_check_or_capture(&self, fen: &str, mv: &str) -> Result<bool, RulesError> {
            ChessRules.is_check_or_capture(fen, mv)
        }
        fn play(&self, fen: &str, mv: &str) -> Result<String, RulesError> {
            ChessRules.play(fen, mv)
        }
        fn replay(&self, moves: &[String]) -> Result<Vec<crate::rules::PlyPosition>, RulesError> {
            let mut plies = ChessRules.replay(moves)?;
            if self.last_only {
                plies.drain(..plies.len().saturating_sub(1));
            }
            for p in &mut plies {
                p.halfmove_clock += self.clock_shift;
            }
            Ok(plies)
        }
    }

    #[test]
    fn game_without_eligible_ply_is_counted_by_cause() {
        let bands = RatingBands::default();
        let filter = GameFilter::default();
        let mut rng = RunSeed::new(5).stream("t");

        // どの ply も半手カウンタ 80 以上
        let stale = ScriptedReplay {
            clock_shift: MAX_HALFMOVE_CLOCK,
            last_only: false,
        };
        let mut n = Normalizer::new(&stale, &bands, &filter);
        assert!(n.normalize_game(&game("stale", &["Nf3", "Nf6", "Ng1", "Ng8"]), &mut rng).is_none());
        let s = n.stats();
        assert_eq!((s.halfmove_clock, s.terminal, s.no_eligible_ply), (1, 0, 0));

        // 残る ply は詰みだけ
        let mated = ScriptedReplay {
            clock_shift: 0,
            last_only: true,
        };
        let mut n = Normalizer::new(&mated, &bands, &filter);
        assert!(n.normalize_game(&game("fools", &["f3", "e5", "g4", "Qh4"]), &mut rng).is_none());
        let s = n.stats();
        assert_eq!((s.halfmove_clock, s.terminal, s.no_eligible_ply), (0, 1, 0));

        // 詰みの直前までは選ばれうる
        let rules = ChessRules;
        let mut n = Normalizer::new(&rules, &bands, &filter);
        let c = n.normalize_game(&game("fools", &["f3", "e5", "g4", "Qh4"]), &mut rng).unwrap();
        assert!(c.ply_number < 4);
    }

    #[test]
    fn puzzle_exclusions() {
        let rules = ChessRules;
        let bands = RatingBands::default();
        let filter = GameFilter::default();
        let mut n = Normalizer::new(&rules, &bands, &filter);
        let puzzle = |id: &str, fen: &str, setup: &str| RawPuzzle {
            puzzle_id: id.to_string(),
            fen: fen.to_string(),
            moves: vec![setup.to_string(), "a2a3".to_string()],
            rating: 1500,
            themes: Vec::new(),
        };

        // 仕掛けの手で詰んでしまう
        let mate = puzzle("mate", "rnbqkbnr/pppp1ppp/8/4p3/6P1/5P2/PPPPP2P/RNBQKBNR b KQkq - 0 2", "d8h4");
        assert!(n.normalize_puzzle(&mate).is_none());
        // 79 → 80
        let stale = puzzle("stale", "4k3/8/8/8/8/8/4P3/R3K3 w - - 79 60", "a1a2");
        assert!(n.normalize_puzzle(&stale).is_none());
        let fresh = puzzle("fresh", "4k3/8/8/8/8/8/4P3/R3K3 w - - 78 60", "a1a2");
        assert_eq!(n.normalize_puzzle(&fresh).unwrap().halfmove_clock, 79);

        let s = n.stats();
        assert_eq!((s.terminal, s.halfmove_clock, s.accepted), (1, 1, 1));
    }

    #[test]
    fn puzzle_applies_setup_move() {
        let rules = ChessRules;
        let bands = RatingBands::default();
        let filter = GameFilter::default();
        let mut n = Normalizer::new(&rules, &bands, &filter);
        let raw = RawPuzzle {
            puzzle_id: "p1".to_string(),
            fen: "r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - 2 3".to_string(),
            moves: vec!["f1c4".to_string(), "g8f6".to_string()],
            rating: 1850,
            themes: vec!["opening".to_string(), "mateIn2".to_string()],
        };
        let c = n.normalize_puzzle(&raw).unwrap();
        assert_eq!(c.side_to_move, Side::Black);
        assert_eq!(c.source, Source::Puzzle);
        assert_eq!(c.character, Character::Tactical);
        assert!(c.is_mate);
        assert_eq!(c.rating_bucket.as_str(), "1800-2200");
        assert_eq!(
            c.canonical_fen,
            "r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R b KQkq -"
        );
        assert_eq!(c.ply_number, 5);
    }
}
