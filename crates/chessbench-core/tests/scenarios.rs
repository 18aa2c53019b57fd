//! 正規化 → 重複除去 → 分類 → 層別抽出 を通しで確かめる

use std::collections::HashSet;

use chessbench_core::dedup::DEFAULT_SALT;
use chessbench_core::seed::{NS_NORMALIZE_GAMES, NS_SAMPLE_GAMES};
use chessbench_core::{
    Character, ChessRules, Classifier, ClassifierConfig, Deduplicator, DistributionSpec, GameFilter,
    KeyShape, MaterialEvaluator, Normalizer, Phase, PoolEntry, RatingBands, RatingBucket, RawGame,
    RunSeed, SamplerOptions, Side, SplitAssigner, StratifiedSampler, StratumKey, selection_digest,
};

const OPENINGS: &[&[&str]] = &[
    &["d4", "d5"],
    &["e4", "e5"],
    &["c4", "c5"],
    &["Nf3", "Nf6"],
    &["g3", "g6"],
    &["b3", "b6"],
    &["a3", "a6"],
    &["h3", "h6"],
    &["Nc3", "Nc6"],
    &["e3", "e6"],
    &["d3", "d6"],
    &["f4", "f5"],
];

fn raw_game(id: &str, moves: &[&str]) -> RawGame {
    RawGame {
        game_id: id.to_string(),
        white_elo: Some(2000),
        black_elo: Some(2100),
        time_control: Some("600+0".to_string()),
        variant: Some("Standard".to_string()),
        event: Some("Rated Rapid game".to_string()),
        moves: moves.iter().map(|s| s.to_string()).collect(),
    }
}

/// 正規化・重複除去・分類までを行い、プールに入れる候補を返す
fn pooled(games: &[RawGame], seed: RunSeed) -> (Vec<PoolEntry>, u64) {
    let rules = ChessRules;
    let bands = RatingBands::default();
    let filter = GameFilter::default();
    let cfg = ClassifierConfig::default();
    let mut normalizer = Normalizer::new(&rules, &bands, &filter);
    let mut dedup = Deduplicator::new(DEFAULT_SALT, SplitAssigner::default());
    let classifier = Classifier::new(&rules, &cfg);
    let mut evaluator = MaterialEvaluator::new();
    let mut rng = seed.stream(NS_NORMALIZE_GAMES);

    let mut out = Vec::new();
    for g in games {
        let Some(candidate) = normalizer.normalize_game(g, &mut rng) else {
            continue;
        };
        let Some(mut entry) = dedup.admit(candidate) else {
            continue;
        };
        classifier
            .classify_game(&mut entry.candidate, &mut evaluator)
            .unwrap();
        out.push(entry);
    }
    (out, dedup.dropped())
}

fn opening_corpus() -> Vec<RawGame> {
    OPENINGS
        .iter()
        .enumerate()
        .map(|(i, moves)| raw_game(&format!("g{i}"), moves))
        .collect()
}

fn quiet_opening_key(side: Side) -> StratumKey {
    StratumKey::game(RatingBucket::new("1800-2200"), Phase::Opening, Character::Quiet, side)
}

#[test]
fn two_stratum_spec_picks_one_per_color() {
    let corpus = opening_corpus();
    // 白番・黒番の両方がプールに入るシードを探す
    let seed = (0..64)
        .map(RunSeed::new)
        .find(|s| {
            let (entries, _) = pooled(&corpus, *s);
            let sides: HashSet<Side> = entries.iter().map(|e| e.candidate.side_to_move).collect();
            sides.len() == 2
        })
        .expect("some seed yields both colors");

    let (entries, _) = pooled(&corpus, seed);
    assert!(entries.iter().all(|e| e.candidate.phase == Phase::Opening));
    assert!(entries.iter().all(|e| e.candidate.character == Character::Quiet));

    let spec = DistributionSpec::new(
        KeyShape::Games,
        2,
        vec![(quiet_opening_key(Side::White), 1), (quiet_opening_key(Side::Black), 1)],
    )
    .unwrap();
    let options = SamplerOptions {
        mate_cap_percent: None,
        one_per_game: true,
    };
    let sampler = StratifiedSampler::new(&spec, options);
    let draw = || {
        let (entries, _) = pooled(&corpus, seed);
        let mut rng = seed.stream(NS_SAMPLE_GAMES);
        sampler.select(&entries, &mut rng).into_result().unwrap()
    };

    let first = draw();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].entry.candidate.side_to_move, Side::White);
    assert_eq!(first[1].entry.candidate.side_to_move, Side::Black);
    let second = draw();
    assert_eq!(first, second);
    assert_eq!(selection_digest(&first), selection_digest(&second));
}

#[test]
fn duplicate_position_from_second_game_is_dropped() {
    let games = vec![raw_game("first", &["e4"]), raw_game("second", &["e4"])];
    let (entries, dropped) = pooled(&games, RunSeed::new(3));
    assert_eq!(entries.len(), 1);
    assert_eq!(dropped, 1);
    assert_eq!(entries[0].candidate.source_game_id, "first");
    // 取れないアンパッサン欄は落ちる
    assert_eq!(
        entries[0].candidate.canonical_fen,
        "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq -"
    );
}

#[test]
fn pooled_candidates_are_valid_unique_and_stably_split() {
    let corpus = opening_corpus();
    let (a, _) = pooled(&corpus, RunSeed::new(11));
    let (b, _) = pooled(&corpus, RunSeed::new(12));

    let ids: HashSet<_> = a.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids.len(), a.len());
    assert!(a.iter().all(|e| e.candidate.is_valid()));
    assert!(a.iter().all(|e| e.candidate.canonical_fen.split(' ').count() == 4));

    // 同じ局面ならシードが違っても分割は同じ
    let splits = SplitAssigner::default();
    for e in a.iter().chain(b.iter()) {
        assert_eq!(e.split, splits.assign(&e.candidate.canonical_fen));
    }
}

#[test]
fn shortfall_reports_underfilled_strata() {
    let corpus = opening_corpus();
    let seed = RunSeed::new(5);
    let (entries, _) = pooled(&corpus, seed);
    let spec = DistributionSpec::new(
        KeyShape::Games,
        40,
        vec![(quiet_opening_key(Side::White), 20), (quiet_opening_key(Side::Black), 20)],
    )
    .unwrap();
    let mut rng = seed.stream(NS_SAMPLE_GAMES);
    let sel = StratifiedSampler::new(&spec, SamplerOptions::default()).select(&entries, &mut rng);
    assert_eq!(sel.selected.len(), entries.len());
    assert_eq!(sel.shortfalls.len(), 2);
    let missing: u32 = sel.shortfalls.iter().map(|s| s.missing()).sum();
    assert_eq!(missing as usize, 40 - entries.len());
}
