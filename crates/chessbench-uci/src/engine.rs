use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use chessbench_core::{Evaluator, EvaluatorError, EvaluatorFactory, MoveScore};

use crate::info::{MultiPvTable, parse_info_line};

pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// エンジンプロセス起動時の設定。
#[derive(Debug, Clone)]
pub struct UciConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub threads: usize,
    pub hash_mb: u32,
    /// 追加の UCI オプション (name, value)
    pub options: Vec<(String, String)>,
    /// 1局面あたりの探索時間の上限。超えたら `stop` を送る。
    pub search_timeout: Duration,
    /// `stop` 後に `bestmove` を待つ時間
    pub stop_grace: Duration,
    pub ready_timeout: Duration,
}

impl UciConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            threads: 1,
            hash_mb: 64,
            options: Vec::new(),
            search_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(1),
            ready_timeout: ENGINE_READY_TIMEOUT,
        }
    }
}

/// ワーカーごとに別プロセスを起動する
impl EvaluatorFactory for UciConfig {
    fn create(&self, worker: usize) -> Result<Box<dyn Evaluator>, EvaluatorError> {
        let engine = UciEngine::spawn(self.clone(), format!("engine#{worker}"))?;
        Ok(Box::new(engine))
    }
}

/// 1本のエンジンに対する入出力をカプセル化する。
struct EngineProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    opt_names: HashSet<String>,
    multipv: Option<u32>,
    label: String,
}

impl EngineProcess {
    fn spawn(cfg: &UciConfig, label: &str) -> Result<Self, EvaluatorError> {
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                EvaluatorError::Process(format!("failed to spawn engine at {}: {e}", cfg.path.display()))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EvaluatorError::Process(format!("{label}: no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvaluatorError::Process(format!("{label}: no stdout")))?;
        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut proc = Self {
            child,
            stdin: BufWriter::new(stdin),
            rx,
            opt_names: HashSet::new(),
            multipv: None,
            label: label.to_string(),
        };
        proc.initialize(cfg)?;
        Ok(proc)
    }

    fn initialize(&mut self, cfg: &UciConfig) -> Result<(), EvaluatorError> {
        self.write_line("uci")?;
        loop {
            let line = self.recv_line(cfg.ready_timeout)?;
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.opt_names.insert(name);
                }
            } else if line == "uciok" {
                break;
            }
        }
        self.set_option_if_available("Threads", &cfg.threads.to_string())?;
        self.set_option_if_available("Hash", &cfg.hash_mb.to_string())?;
        for (name, value) in &cfg.options {
            self.set_option_if_available(name.trim(), value.trim())?;
        }
        self.sync_ready(cfg.ready_timeout)?;
        log::debug!("{}: ready ({} options)", self.label, self.opt_names.len());
        Ok(())
    }

    fn set_multipv(&mut self, n: u32) -> Result<(), EvaluatorError> {
        if self.multipv != Some(n) {
            self.set_option_if_available("MultiPV", &n.to_string())?;
            self.multipv = Some(n);
        }
        Ok(())
    }

    fn sync_ready(&mut self, timeout: Duration) -> Result<(), EvaluatorError> {
        self.write_line("isready")?;
        loop {
            let line = self.recv_line(timeout)?;
            if line == "readyok" {
                break;
            }
        }
        Ok(())
    }

    fn recv_line(&self, timeout: Duration) -> Result<String, EvaluatorError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => EvaluatorError::Timeout(timeout.as_millis() as u64),
            RecvTimeoutError::Disconnected => {
                EvaluatorError::Process(format!("{}: engine exited unexpectedly", self.label))
            }
        })
    }

    fn set_option_if_available(&mut self, name: &str, value: &str) -> Result<(), EvaluatorError> {
        if self.opt_names.is_empty() || self.opt_names.contains(name) {
            self.write_line(&format!("setoption name {name} value {value}"))?;
        }
        Ok(())
    }

    fn write_line(&mut self, msg: &str) -> Result<(), EvaluatorError> {
        self.stdin.write_all(msg.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        let _ = self.write_line("quit");
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// UCI エンジンによる評価器。
///
/// 局面ごとに `ucinewgame` を送ってから探索するので、どのワーカーが
/// 先に何を評価したかに結果が左右されない。
/// タイムアウトやプロセス異常のあとは、次の呼び出しでエンジンを起動し直す。
pub struct UciEngine {
    cfg: UciConfig,
    label: String,
    proc: Option<EngineProcess>,
}

impl UciEngine {
    pub fn spawn(cfg: UciConfig, label: String) -> Result<Self, EvaluatorError> {
        let proc = EngineProcess::spawn(&cfg, &label)?;
        Ok(Self {
            cfg,
            label,
            proc: Some(proc),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 対応しているオプション名（`uci` への応答から）
    pub fn option_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .proc
            .as_ref()
            .map(|p| p.opt_names.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn process(&mut self) -> Result<&mut EngineProcess, EvaluatorError> {
        if self.proc.is_none() {
            log::warn!("{}: restarting engine", self.label);
            self.proc = Some(EngineProcess::spawn(&self.cfg, &self.label)?);
        }
        self.proc
            .as_mut()
            .ok_or_else(|| EvaluatorError::Process(format!("{}: engine not running", self.cfg.path.display())))
    }

    fn search(&mut self, fen: &str, depth: u32, max_variations: u32) -> Result<Vec<MoveScore>, EvaluatorError> {
        let soft_limit = self.cfg.search_timeout;
        let hard_limit = soft_limit + self.cfg.stop_grace;
        let ready_timeout = self.cfg.ready_timeout;
        let proc = self.process()?;

        proc.set_multipv(max_variations.max(1))?;
        proc.write_line("ucinewgame")?;
        proc.sync_ready(ready_timeout)?;
        proc.write_line(&format!("position fen {}", full_fen(fen)))?;
        proc.write_line(&format!("go depth {depth}"))?;

        let start = Instant::now();
        let mut stop_sent = false;
        let mut table = MultiPvTable::new();

        loop {
            let elapsed = start.elapsed();
            let deadline = if stop_sent { hard_limit } else { soft_limit };
            if elapsed >= deadline {
                if !stop_sent {
                    proc.write_line("stop")?;
                    stop_sent = true;
                    continue;
                }
                return Err(EvaluatorError::Timeout(soft_limit.as_millis() as u64));
            }

            let remaining = deadline.saturating_sub(elapsed);
            match proc.rx.recv_timeout(remaining) {
                Ok(line) => {
                    if let Some(info) = parse_info_line(&line) {
                        table.update(&info);
                        continue;
                    }
                    if line.starts_with("bestmove") {
                        // stop 後の bestmove は指定深さに届いていない
                        if stop_sent {
                            return Err(EvaluatorError::Timeout(soft_limit.as_millis() as u64));
                        }
                        log::trace!("{}: {} lines at depth {} for {fen}", proc.label, table.len(), table.depth());
                        return Ok(table.into_scores(max_variations as usize));
                    }
                }
                // 次のループで stop か失敗に振り分ける
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EvaluatorError::Process(format!("{}: engine exited unexpectedly", proc.label)));
                }
            }
        }
    }
}

impl Evaluator for UciEngine {
    fn evaluate(&mut self, fen: &str, depth: u32, max_variations: u32) -> Result<Vec<MoveScore>, EvaluatorError> {
        let result = self.search(fen, depth, max_variations);
        if let Err(e) = &result {
            // 応答途中の状態を持ち越さない
            if matches!(e, EvaluatorError::Timeout(_) | EvaluatorError::Process(_) | EvaluatorError::Io(_)) {
                log::warn!("{}: {e}; dropping engine process", self.label);
                self.proc = None;
            }
        }
        result
    }
}

/// 手数欄のない4フィールドの FEN だけを補う。6フィールドならカウンタをそのまま送る。
fn full_fen(fen: &str) -> String {
    if fen.split_whitespace().count() == 4 {
        format!("{fen} 0 1")
    } else {
        fen.to_string()
    }
}

pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok == "name" {
            let mut parts = Vec::new();
            while let Some(next) = tokens.next_if(|t| *t != "type") {
                parts.push(next.to_string());
            }
            if !parts.is_empty() {
                return Some(parts.join(" "));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_names_may_contain_spaces() {
        assert_eq!(
            parse_option_name("name Skill Level type spin default 20 min 0 max 20"),
            Some("Skill Level".to_string())
        );
        assert_eq!(parse_option_name("name MultiPV type spin"), Some("MultiPV".to_string()));
        assert_eq!(parse_option_name("type check"), None);
    }

    #[test]
    fn four_field_fen_gets_clocks() {
        assert_eq!(
            full_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -"),
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"
        );
        assert_eq!(full_fen("8/8/8/8/8/8/8/K6k w - - 12 40"), "8/8/8/8/8/8/8/K6k w - - 12 40");
    }

    #[test]
    fn missing_binary_is_a_process_error() {
        let cfg = UciConfig::new("/nonexistent/chess-engine");
        let err = UciEngine::spawn(cfg, "missing".to_string()).err().unwrap();
        assert!(matches!(err, EvaluatorError::Process(msg) if msg.contains("failed to spawn")));
    }
}
