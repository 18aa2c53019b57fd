//! 選ばれた局面を並べ、全合法手の評価を付けて出力レコードにする
//!
//! 評価はワーカープールで並列に行う。各ワーカーは自分専用の評価器を持ち、
//! 結果は index をキーにした事前確保スロットへ入るので、完了順は出力に影響しない。

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};

use crate::error::{EvaluatorError, PipelineError, Shortfall};
use crate::evaluator::Evaluator;
use crate::rules::Rules;
use crate::sampler::Selected;
use crate::types::{MoveScore, QuestionRecord, Score, StratumKey};

/// ゲームとパズルのどちらを先に並べるか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyOrder {
    #[default]
    GamesFirst,
    PuzzlesFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    pub depth: u32,
    pub workers: usize,
    /// 失敗時の再試行回数（初回を含まない）
    pub retries: u32,
    pub order: AssemblyOrder,
    /// 評価器を呼ばずに空の評価で出力する
    pub skip_eval: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            depth: 20,
            workers: 1,
            retries: 2,
            order: AssemblyOrder::GamesFirst,
            skip_eval: false,
        }
    }
}

/// ワーカーごとに評価器を作る
pub trait EvaluatorFactory: Sync {
    fn create(&self, worker: usize) -> Result<Box<dyn Evaluator>, EvaluatorError>;
}

impl<F> EvaluatorFactory for F
where
    F: Fn(usize) -> Result<Box<dyn Evaluator>, EvaluatorError> + Sync,
{
    fn create(&self, worker: usize) -> Result<Box<dyn Evaluator>, EvaluatorError> {
        self(worker)
    }
}

struct Ticket {
    index: usize,
    fen: String,
    legal: Vec<String>,
}

enum Outcome {
    Done {
        index: usize,
        evaluations: BTreeMap<String, Score>,
    },
    Failed {
        index: usize,
        fen: String,
        error: EvaluatorError,
    },
    WorkerDown {
        worker: usize,
        error: EvaluatorError,
    },
}

/// 返ってきた評価が合法手集合とちょうど一致するか確かめて map にする
fn check_evaluations(
    lines: Vec<MoveScore>,
    legal: &[String],
) -> Result<BTreeMap<String, Score>, EvaluatorError> {
    if lines.len() != legal.len() {
        return Err(EvaluatorError::Mismatch(format!(
            "{} scored moves for {} legal moves",
            lines.len(),
            legal.len()
        )));
    }
    let mut evaluations = BTreeMap::new();
    for line in lines {
        if evaluations.insert(line.uci.clone(), line.score).is_some() {
            return Err(EvaluatorError::Mismatch(format!("move {} scored twice", line.uci)));
        }
    }
    let expected: BTreeSet<&str> = legal.iter().map(String::as_str).collect();
    if let Some(extra) = evaluations.keys().find(|m| !expected.contains(m.as_str())) {
        return Err(EvaluatorError::Mismatch(format!("move {extra} is not legal")));
    }
    Ok(evaluations)
}

fn evaluate_with_retries(
    evaluator: &mut dyn Evaluator,
    ticket: &Ticket,
    depth: u32,
    retries: u32,
) -> Result<BTreeMap<String, Score>, EvaluatorError> {
    let mut attempt = 0;
    loop {
        let result = evaluator
            .evaluate(&ticket.fen, depth, ticket.legal.len() as u32)
            .and_then(|lines| check_evaluations(lines, &ticket.legal));
        match result {
            Ok(map) => return Ok(map),
            Err(e) if attempt < retries => {
                attempt += 1;
                log::warn!(
                    "index {} ({}): {e}; retry {attempt}/{retries}",
                    ticket.index,
                    ticket.fen
                );
            }
            Err(e) => return Err(e),
        }
    }
}

fn worker_main(
    worker: usize,
    factory: &dyn EvaluatorFactory,
    depth: u32,
    retries: u32,
    rx: chan::Receiver<Ticket>,
    tx: chan::Sender<Outcome>,
) {
    let mut evaluator = match factory.create(worker) {
        Ok(e) => e,
        Err(error) => {
            let _ = tx.send(Outcome::WorkerDown { worker, error });
            return;
        }
    };
    while let Ok(ticket) = rx.recv() {
        let outcome = match evaluate_with_retries(evaluator.as_mut(), &ticket, depth, retries) {
            Ok(evaluations) => Outcome::Done {
                index: ticket.index,
                evaluations,
            },
            Err(error) => Outcome::Failed {
                index: ticket.index,
                fen: ticket.fen,
                error,
            },
        };
        if tx.send(outcome).is_err() {
            break;
        }
    }
}

pub struct DatasetAssembler<'a> {
    rules: &'a dyn Rules,
    cfg: AssemblerConfig,
}

impl<'a> DatasetAssembler<'a> {
    pub fn new(rules: &'a dyn Rules, cfg: AssemblerConfig) -> Self {
        Self { rules, cfg }
    }

    /// 出力順に並べる。index はこの並びの位置になる。
    pub fn order(&self, games: Vec<Selected>, puzzles: Vec<Selected>) -> Vec<Selected> {
        match self.cfg.order {
            AssemblyOrder::GamesFirst => games.into_iter().chain(puzzles).collect(),
            AssemblyOrder::PuzzlesFirst => puzzles.into_iter().chain(games).collect(),
        }
    }

    /// `progress(done, total)` は評価が1件終わるごとに呼ばれる
    pub fn assemble(
        &self,
        ordered: &[Selected],
        factory: &dyn EvaluatorFactory,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<QuestionRecord>, PipelineError> {
        let total = ordered.len();
        let mut tickets = Vec::with_capacity(total);
        for (index, s) in ordered.iter().enumerate() {
            let fen = s.entry.candidate.canonical_fen.clone();
            let legal = self.rules.legal_moves(&fen)?;
            if legal.len() != s.entry.candidate.legal_move_count as usize {
                return Err(PipelineError::EvaluatorMismatch {
                    index,
                    fen,
                    detail: format!(
                        "candidate records {} legal moves, rules report {}",
                        s.entry.candidate.legal_move_count,
                        legal.len()
                    ),
                });
            }
            tickets.push(Ticket {
                index,
                fen: s.entry.candidate.search_fen(),
                legal,
            });
        }

        let mut slots: Vec<Option<BTreeMap<String, Score>>> = vec![None; total];
        if self.cfg.skip_eval || total == 0 {
            log::info!("evaluation skipped for {total} positions");
            slots.iter_mut().for_each(|s| *s = Some(BTreeMap::new()));
            progress(total, total);
        } else {
            let failures = self.evaluate_all(tickets, factory, &mut slots, progress)?;
            if !failures.is_empty() {
                return Err(PipelineError::StratumShortfall(shortfalls_for(ordered, &failures)));
            }
        }

        let mut records = Vec::with_capacity(total);
        for (index, (s, slot)) in ordered.iter().zip(slots).enumerate() {
            let evaluations = slot.ok_or_else(|| PipelineError::EvaluatorMismatch {
                index,
                fen: s.entry.candidate.canonical_fen.clone(),
                detail: "no evaluation was produced".to_string(),
            })?;
            records.push(QuestionRecord {
                index,
                fen: s.entry.candidate.canonical_fen.clone(),
                legal_move_evaluations: evaluations,
                is_private: s.entry.split.is_private(),
            });
        }
        Ok(records)
    }

    /// 失敗した index の一覧を返す。評価器を1つも作れなかった場合はエラー。
    fn evaluate_all(
        &self,
        tickets: Vec<Ticket>,
        factory: &dyn EvaluatorFactory,
        slots: &mut [Option<BTreeMap<String, Score>>],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<usize>, PipelineError> {
        let total = tickets.len();
        let workers = self.cfg.workers.clamp(1, total.max(1));
        let (ticket_tx, ticket_rx) = chan::unbounded::<Ticket>();
        let (result_tx, result_rx) = chan::unbounded::<Outcome>();
        for t in tickets {
            // 受信側はまだ生きているので失敗しない
            let _ = ticket_tx.send(t);
        }
        drop(ticket_tx);

        let depth = self.cfg.depth;
        let retries = self.cfg.retries;
        let mut failures = Vec::new();
        let mut down: Option<EvaluatorError> = None;
        let mut alive = workers;

        thread::scope(|scope| {
            for worker in 0..workers {
                let rx = ticket_rx.clone();
                let tx = result_tx.clone();
                scope.spawn(move || worker_main(worker, factory, depth, retries, rx, tx));
            }
            // メインスレッドは result_tx を持たないので drop
            drop(result_tx);

            let mut done = 0usize;
            for outcome in result_rx.iter() {
                match outcome {
                    Outcome::Done { index, evaluations } => {
                        slots[index] = Some(evaluations);
                        done += 1;
                        progress(done, total);
                    }
                    Outcome::Failed { index, fen, error } => {
                        log::error!(
                            "{}",
                            PipelineError::EvaluatorMismatch {
                                index,
                                fen,
                                detail: error.to_string(),
                            }
                        );
                        failures.push(index);
                        done += 1;
                        progress(done, total);
                    }
                    Outcome::WorkerDown { worker, error } => {
                        log::error!("worker {worker}: failed to start evaluator: {error}");
                        alive -= 1;
                        if down.is_none() {
                            down = Some(error);
                        }
                    }
                }
            }
        });

        if alive == 0 {
            if let Some(error) = down {
                return Err(PipelineError::Evaluator(error));
            }
        }
        failures.sort_unstable();
        Ok(failures)
    }
}

/// 評価に失敗した局面の層ごとの不足
fn shortfalls_for(ordered: &[Selected], failures: &[usize]) -> Vec<Shortfall> {
    let mut per_key: BTreeMap<&StratumKey, (u32, u32)> = BTreeMap::new();
    for s in ordered {
        per_key.entry(&s.key).or_default().0 += 1;
    }
    for &i in failures {
        per_key.entry(&ordered[i].key).or_default().1 += 1;
    }
    per_key
        .into_iter()
        .filter(|(_, (_, failed))| *failed > 0)
        .map(|(key, (target, failed))| Shortfall {
            key: key.clone(),
            target,
            selected: target - failed,
        })
        .collect()
}
