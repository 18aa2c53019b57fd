//! ステージを順に実行する
//!
//! games → puzzles → selection → questions。各ステージはパラメータのダイジェストと
//! 前段の出力 SHA-256 で鍵付けされ、記録と一致すれば前回の出力を読み直すだけで済ませる。

use std::path::PathBuf;

use anyhow::{Context, Result};
use chessbench_core::seed::{NS_NORMALIZE_GAMES, NS_SAMPLE_GAMES, NS_SAMPLE_PUZZLES};
use chessbench_core::{
    Candidate, Character, ChessRules, Classifier, DatasetAssembler, Deduplicator, Evaluator, EvaluatorError,
    EvaluatorFactory, KeyShape, MaterialEvaluator, Normalizer, PipelineError, PoolEntry, PuzzleSelector,
    SamplerOptions, Selected, SelectionPool, Shortfall, Source, StratifiedSampler, selection_digest,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::common::io::{read_jsonl, write_jsonl};
use crate::config::{EngineKind, RunConfig};
use crate::corpus::{read_games, read_puzzles};
use crate::questions::write_questions;
use crate::stages::{Stage, StageStatus, params_digest};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub work_dir: PathBuf,
    /// 記録を無視して全ステージを実行する
    pub force: bool,
    pub skip_eval: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pooled_games: usize,
    pub pooled_puzzles: usize,
    pub selected_games: usize,
    pub selected_puzzles: usize,
    pub questions: usize,
    pub selection_digest: String,
    /// 前回の出力を使ったステージ
    pub reused: Vec<String>,
}

/// エラーの原因に応じた終了コード。
///
/// 層の不足 2、評価器 3、非決定性 4、それ以外 1。
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(p) = cause.downcast_ref::<PipelineError>() {
            return match p {
                PipelineError::StratumShortfall(_) => 2,
                PipelineError::EvaluatorMismatch { .. } | PipelineError::Evaluator(_) => 3,
                PipelineError::NonDeterminismDetected(_) => 4,
                _ => 1,
            };
        }
        if cause.downcast_ref::<EvaluatorError>().is_some() {
            return 3;
        }
    }
    1
}

fn material_evaluator(_worker: usize) -> Result<Box<dyn Evaluator>, EvaluatorError> {
    Ok(Box::new(MaterialEvaluator::new()))
}

fn evaluator_factory(cfg: &RunConfig) -> Result<Box<dyn EvaluatorFactory>> {
    let factory: Box<dyn EvaluatorFactory> = match cfg.engine.kind {
        EngineKind::Material => Box::new(material_evaluator),
        EngineKind::Uci => Box::new(cfg.uci().context("engine.path is required for a UCI engine")?),
    };
    Ok(factory)
}

/// 失敗しても `retries` 回までは同じ評価器でやり直す
fn classify_with_retries(
    classifier: &Classifier<'_>,
    candidate: &mut Candidate,
    evaluator: &mut dyn Evaluator,
    retries: u32,
) -> Result<(), EvaluatorError> {
    let mut attempt = 0;
    loop {
        match classifier.classify_game(candidate, evaluator) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                log::warn!("{}: classification search failed ({e}); retry {attempt}/{retries}", candidate.source_game_id);
            }
            Err(e) => return Err(e),
        }
    }
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub struct Pipeline<'a> {
    cfg: &'a RunConfig,
    opts: PipelineOptions,
    status: StageStatus,
    rules: ChessRules,
    factory: Box<dyn EvaluatorFactory>,
    summary: RunSummary,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a RunConfig, opts: PipelineOptions) -> Result<Self> {
        std::fs::create_dir_all(&opts.work_dir)
            .with_context(|| format!("create {}", opts.work_dir.display()))?;
        let status = StageStatus::load(&opts.work_dir)?;
        Ok(Self {
            cfg,
            factory: evaluator_factory(cfg)?,
            opts,
            status,
            rules: ChessRules,
            summary: RunSummary::default(),
        })
    }

    pub fn run(mut self) -> Result<RunSummary> {
        let games_params = self.games_params()?;
        let games = self.stage(Stage::Games, &games_params, |p| {
            let entries = p.normalize_games()?;
            write_jsonl(&p.status.output_path(Stage::Games), &entries)?;
            Ok((entries, None))
        })?;
        self.summary.pooled_games = games.len();

        let puzzles_params = self.puzzles_params()?;
        let puzzles = self.stage(Stage::Puzzles, &puzzles_params, |p| {
            let entries = p.normalize_puzzles(&games)?;
            write_jsonl(&p.status.output_path(Stage::Puzzles), &entries)?;
            Ok((entries, None))
        })?;
        self.summary.pooled_puzzles = puzzles.len();

        let selection_params = self.selection_params()?;
        let recorded = self.status.recorded_selection(&selection_params).map(str::to_string);
        let selected = self.stage(Stage::Selection, &selection_params, |p| {
            let selected = p.select(&games, &puzzles)?;
            let digest = selection_digest(&selected);
            if let Some(previous) = recorded.as_deref().filter(|prev| *prev != digest) {
                return Err(PipelineError::NonDeterminismDetected(format!(
                    "selection digest {digest} differs from the recorded {previous} for identical parameters"
                ))
                .into());
            }
            write_jsonl(&p.status.output_path(Stage::Selection), &selected)?;
            Ok((selected, Some(digest)))
        })?;
        self.summary.selection_digest = selection_digest(&selected);
        self.summary.selected_games = selected.iter().filter(|s| s.entry.candidate.source == Source::Game).count();
        self.summary.selected_puzzles = selected.len() - self.summary.selected_games;

        let questions_params = self.questions_params()?;
        let questions_path = self.status.output_path(Stage::Questions);
        self.summary.questions =
            self.stage(Stage::Questions, &questions_params, |p| Ok((p.assemble(selected)?, None)))?;
        log::info!(
            "{} questions in {} (selection {})",
            self.summary.questions,
            questions_path.display(),
            self.summary.selection_digest
        );
        Ok(self.summary)
    }

    /// 記録が新しければ出力を読み直し、そうでなければ `body` を実行して記録する
    fn stage<T, F>(&mut self, stage: Stage, params: &str, body: F) -> Result<T>
    where
        T: StageOutput,
        F: FnOnce(&mut Self) -> Result<(T, Option<String>)>,
    {
        if !self.opts.force && self.status.is_fresh(stage, params) {
            log::info!("{stage}: up to date, reusing {}", stage.output());
            self.summary.reused.push(stage.name().to_string());
            return T::reload(&self.status.output_path(stage));
        }
        log::info!("{stage}: running");
        self.status.mark_pending(stage, params)?;
        match body(self) {
            Ok((out, digest)) => {
                self.status.mark_done(stage, params, digest)?;
                Ok(out)
            }
            Err(e) => {
                if let Err(save) = self.status.mark_failed(stage, params, &format!("{e:#}")) {
                    log::error!("{stage}: could not record failure: {save:#}");
                }
                Err(e.context(format!("stage {stage} failed")))
            }
        }
    }

    fn upstream(&self, stage: Stage) -> String {
        self.status
            .entry(stage)
            .and_then(|e| e.output_sha256.clone())
            .unwrap_or_default()
    }

    fn games_params(&self) -> Result<String> {
        let c = self.cfg;
        let section = json(&(
            c.seed,
            &c.salt,
            c.public_fraction_cutoff,
            &c.rating_bands,
            &c.game_filter,
            &c.classifier,
            &c.engine,
            c.evaluation.timeout_ms,
            &c.games.inputs,
            c.games.limit,
        ))?;
        Ok(params_digest([Stage::Games.name(), section.as_str()]))
    }

    fn puzzles_params(&self) -> Result<String> {
        let c = self.cfg;
        let section = json(&(
            c.seed,
            &c.salt,
            c.public_fraction_cutoff,
            &c.rating_bands,
            &c.classifier,
            &c.puzzles.inputs,
            c.puzzles.limit,
        ))?;
        let games = self.upstream(Stage::Games);
        Ok(params_digest([Stage::Puzzles.name(), section.as_str(), games.as_str()]))
    }

    fn selection_params(&self) -> Result<String> {
        let c = self.cfg;
        let section = json(&(
            c.seed,
            &c.rating_bands,
            &c.games.distribution,
            c.games.mate_cap_percent,
            &c.puzzles.distribution,
            c.puzzles.mate_cap_percent,
        ))?;
        let games = self.upstream(Stage::Games);
        let puzzles = self.upstream(Stage::Puzzles);
        Ok(params_digest([
            Stage::Selection.name(),
            section.as_str(),
            games.as_str(),
            puzzles.as_str(),
        ]))
    }

    fn questions_params(&self) -> Result<String> {
        let c = self.cfg;
        let section = json(&(&c.engine, &c.evaluation, c.order, self.opts.skip_eval))?;
        let selection = self.upstream(Stage::Selection);
        Ok(params_digest([Stage::Questions.name(), section.as_str(), selection.as_str()]))
    }

    fn normalize_games(&self) -> Result<Vec<PoolEntry>> {
        let c = self.cfg;
        if c.games.inputs.is_empty() {
            log::warn!("no game inputs configured");
        }
        let mut rng = c.run_seed().stream(NS_NORMALIZE_GAMES);
        let mut normalizer = Normalizer::new(&self.rules, &c.rating_bands, &c.game_filter);
        let mut dedup = Deduplicator::new(c.salt.clone(), c.splits()?);
        let classifier = Classifier::new(&self.rules, &c.classifier);
        let mut evaluator = self.factory.create(0).map_err(PipelineError::from)?;
        let retries = c.evaluation.retries;

        let mut entries = Vec::new();
        let mut unclassified = 0u64;
        for input in &c.games.inputs {
            read_games(input, c.games.limit, |raw| {
                let Some(candidate) = normalizer.normalize_game(&raw, &mut rng) else {
                    return Ok(());
                };
                let Some(mut entry) = dedup.admit(candidate) else {
                    return Ok(());
                };
                classify_with_retries(&classifier, &mut entry.candidate, evaluator.as_mut(), retries)
                    .map_err(PipelineError::from)?;
                if entry.candidate.character == Character::Unclassified {
                    unclassified += 1;
                }
                entries.push(entry);
                Ok(())
            })?;
        }
        normalizer.stats().log_summary("games");
        log::info!(
            "games: {} pooled, {} duplicates dropped, {unclassified} unclassified",
            entries.len(),
            dedup.dropped()
        );
        Ok(entries)
    }

    /// ゲーム局面を先に登録しておくので、パズルがゲーム局面を押し出すことはない
    fn normalize_puzzles(&self, games: &[PoolEntry]) -> Result<Vec<PoolEntry>> {
        let c = self.cfg;
        let mut normalizer = Normalizer::new(&self.rules, &c.rating_bands, &c.game_filter);
        let mut dedup = Deduplicator::new(c.salt.clone(), c.splits()?);
        for g in games {
            dedup.remember(g.candidate.canonical_fen.clone());
        }
        let classifier = Classifier::new(&self.rules, &c.classifier);

        let mut entries = Vec::new();
        for input in &c.puzzles.inputs {
            read_puzzles(input, c.puzzles.limit, |raw| {
                let Some(candidate) = normalizer.normalize_puzzle(&raw) else {
                    return Ok(());
                };
                let Some(mut entry) = dedup.admit(candidate) else {
                    return Ok(());
                };
                classifier.classify_puzzle(&mut entry.candidate).map_err(PipelineError::from)?;
                entries.push(entry);
                Ok(())
            })?;
        }
        normalizer.stats().log_summary("puzzles");
        log::info!("puzzles: {} pooled, {} duplicates dropped", entries.len(), dedup.dropped());
        Ok(entries)
    }

    fn draw(&self, games: &[PoolEntry], puzzles: &[PoolEntry]) -> Result<(Vec<Selected>, Vec<Shortfall>)> {
        let c = self.cfg;
        let seed = c.run_seed();
        let games_spec = c.games_spec()?;
        let puzzles_spec = c.puzzles_spec()?;

        let options = SamplerOptions {
            mate_cap_percent: c.games.mate_cap_percent,
            one_per_game: true,
        };
        let mut rng = seed.stream(NS_SAMPLE_GAMES);
        let game_sel = StratifiedSampler::new(&games_spec, options).select(games, &mut rng);
        let puzzle_sel = PuzzleSelector::new(&puzzles_spec, c.puzzles.mate_cap_percent)?.select(puzzles, seed);

        let mut selected = game_sel.selected;
        selected.extend(puzzle_sel.selected);
        let mut shortfalls = game_sel.shortfalls;
        shortfalls.extend(puzzle_sel.shortfalls);
        Ok((selected, shortfalls))
    }

    /// 2回引いて一致を確かめてから、不足があれば失敗にする
    fn select(&self, games: &[PoolEntry], puzzles: &[PoolEntry]) -> Result<Vec<Selected>> {
        let seed = self.cfg.run_seed();
        SelectionPool::build(KeyShape::Games, games, &mut seed.stream(NS_SAMPLE_GAMES)).log_sizes("games");
        SelectionPool::build(KeyShape::Puzzles, puzzles, &mut seed.stream(NS_SAMPLE_PUZZLES)).log_sizes("puzzles");

        let (first, shortfalls) = self.draw(games, puzzles)?;
        let (second, _) = self.draw(games, puzzles)?;
        if first != second {
            return Err(PipelineError::NonDeterminismDetected(format!(
                "two draws with seed {} disagree ({} vs {})",
                seed.value(),
                selection_digest(&first),
                selection_digest(&second)
            ))
            .into());
        }
        if !shortfalls.is_empty() {
            for s in &shortfalls {
                log::error!("stratum {} short by {} ({}/{})", s.key, s.missing(), s.selected, s.target);
            }
            return Err(PipelineError::StratumShortfall(shortfalls).into());
        }
        log::info!("selected {} positions (digest {})", first.len(), selection_digest(&first));
        Ok(first)
    }

    fn assemble(&self, selected: Vec<Selected>) -> Result<usize> {
        let (games, puzzles): (Vec<Selected>, Vec<Selected>) = selected
            .into_iter()
            .partition(|s| s.entry.candidate.source == Source::Game);
        let assembler = DatasetAssembler::new(&self.rules, self.cfg.assembler(self.opts.skip_eval));
        let ordered = assembler.order(games, puzzles);

        let bar = ProgressBar::new(ordered.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} evaluated ({eta})")?,
        );
        let result = assembler.assemble(&ordered, self.factory.as_ref(), &mut |done, _| {
            bar.set_position(done as u64)
        });
        bar.finish_and_clear();
        let records = result?;

        write_questions(&self.status.output_path(Stage::Questions), &records)?;
        let private = records.iter().filter(|r| r.is_private).count();
        log::info!("questions: {} public, {private} private", records.len() - private);
        Ok(records.len())
    }
}

/// 記録済みの出力を読み直す方法
trait StageOutput: Sized {
    fn reload(path: &std::path::Path) -> Result<Self>;
}

impl StageOutput for Vec<PoolEntry> {
    fn reload(path: &std::path::Path) -> Result<Self> {
        read_jsonl(path)
    }
}

impl StageOutput for Vec<Selected> {
    fn reload(path: &std::path::Path) -> Result<Self> {
        read_jsonl(path)
    }
}

/// questions は件数だけ返す
impl StageOutput for usize {
    fn reload(path: &std::path::Path) -> Result<Self> {
        Ok(crate::questions::read_questions(path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chessbench_core::{Phase, RatingBucket, StratumKey};

    #[test]
    fn exit_codes_follow_the_error_kind() {
        let shortfall = anyhow::Error::from(PipelineError::StratumShortfall(vec![Shortfall {
            key: StratumKey::puzzle(RatingBucket::new("<1400"), Phase::Endgame),
            target: 2,
            selected: 1,
        }]))
        .context("stage selection failed");
        assert_eq!(exit_code(&shortfall), 2);

        let mismatch = anyhow::Error::from(PipelineError::EvaluatorMismatch {
            index: 3,
            fen: "8/8/8/8/8/8/8/K6k w - -".to_string(),
            detail: "3 of 4 moves".to_string(),
        });
        assert_eq!(exit_code(&mismatch), 3);
        assert_eq!(exit_code(&anyhow::Error::from(EvaluatorError::Timeout(10))), 3);
        assert_eq!(
            exit_code(&anyhow::Error::from(PipelineError::NonDeterminismDetected("x".into()))),
            4
        );
        assert_eq!(exit_code(&anyhow::anyhow!("missing file")), 1);
    }
}
