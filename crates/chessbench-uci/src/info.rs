//! `info` 行の解析と MultiPV の集計

use std::collections::BTreeMap;

use chessbench_core::{MoveScore, Score};

/// `score` に付く境界。境界付きの値は確定値ではないので集計に使わない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Exact,
    Lower,
    Upper,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub multipv: Option<u32>,
    pub score: Option<Score>,
    pub bound: Bound,
    pub pv: Vec<String>,
}

/// `info ...` 行を読む。`info` 以外は `None`。
pub fn parse_info_line(line: &str) -> Option<InfoLine> {
    let rest = line.strip_prefix("info")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut depth = None;
    let mut multipv = None;
    let mut score = None;
    let mut bound = Bound::Exact;
    let mut pv = Vec::new();
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "depth" => {
                depth = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "multipv" => {
                multipv = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "score" => {
                let value = tokens.get(i + 2).and_then(|t| t.parse::<i32>().ok());
                score = match (tokens.get(i + 1).copied(), value) {
                    (Some("cp"), Some(v)) => Some(Score::Cp(v)),
                    (Some("mate"), Some(v)) => Some(Score::Mate(v)),
                    _ => None,
                };
                i += 3;
            }
            "lowerbound" => {
                bound = Bound::Lower;
                i += 1;
            }
            "upperbound" => {
                bound = Bound::Upper;
                i += 1;
            }
            "pv" => {
                pv.extend(tokens[i + 1..].iter().map(|s| s.to_string()));
                break;
            }
            // 文字列を取るのはこれだけ。以降は全部読み飛ばす。
            "string" => break,
            _ => i += 1,
        }
    }
    Some(InfoLine {
        depth,
        multipv,
        score,
        bound,
        pv,
    })
}

/// MultiPV 番号ごとに最新の確定行を持つ
#[derive(Debug, Default)]
pub struct MultiPvTable {
    lines: BTreeMap<u32, (u32, MoveScore)>,
}

impl MultiPvTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// 行を取り込む。境界付き・評価値なし・PV なしは無視する。
    pub fn update(&mut self, info: &InfoLine) {
        if info.bound != Bound::Exact {
            return;
        }
        let (Some(score), Some(first)) = (info.score, info.pv.first()) else {
            return;
        };
        let rank = info.multipv.unwrap_or(1);
        let depth = info.depth.unwrap_or(0);
        // 浅い深さの遅れてきた行で上書きしない
        if self.lines.get(&rank).is_some_and(|(seen, _)| *seen > depth) {
            return;
        }
        self.lines.insert(
            rank,
            (
                depth,
                MoveScore {
                    uci: first.clone(),
                    score,
                },
            ),
        );
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 最も深い深さ
    pub fn depth(&self) -> u32 {
        self.lines.values().map(|(d, _)| *d).max().unwrap_or(0)
    }

    /// MultiPV 番号順に最大 `limit` 件。同じ手が複数の番号に出たら最初の1件だけ残す。
    pub fn into_scores(self, limit: usize) -> Vec<MoveScore> {
        let mut out: Vec<MoveScore> = Vec::with_capacity(self.lines.len().min(limit));
        for (_, (_, ms)) in self.lines {
            if out.len() == limit {
                break;
            }
            if out.iter().any(|o| o.uci == ms.uci) {
                continue;
            }
            out.push(ms);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multipv_line() {
        let info = parse_info_line(
            "info depth 18 seldepth 24 multipv 2 score cp -35 nodes 123456 nps 1000 time 120 pv e7e5 g1f3 b8c6",
        )
        .unwrap();
        assert_eq!(info.depth, Some(18));
        assert_eq!(info.multipv, Some(2));
        assert_eq!(info.score, Some(Score::Cp(-35)));
        assert_eq!(info.bound, Bound::Exact);
        assert_eq!(info.pv, vec!["e7e5", "g1f3", "b8c6"]);
    }

    #[test]
    fn parses_mate_and_bounds() {
        let info = parse_info_line("info depth 9 score mate -3 lowerbound pv h7h8").unwrap();
        assert_eq!(info.score, Some(Score::Mate(-3)));
        assert_eq!(info.bound, Bound::Lower);
        assert_eq!(info.multipv, None);
    }

    #[test]
    fn ignores_non_info_and_string_lines() {
        assert!(parse_info_line("bestmove e2e4").is_none());
        assert!(parse_info_line("informative").is_none());
        let info = parse_info_line("info string NNUE evaluation using nn.bin pv").unwrap();
        assert!(info.pv.is_empty());
        assert!(info.score.is_none());
    }

    #[test]
    fn table_keeps_deepest_exact_line_per_rank() {
        let mut table = MultiPvTable::new();
        for line in [
            "info depth 1 multipv 1 score cp 10 pv d2d4",
            "info depth 1 multipv 2 score cp 5 pv e2e4",
            "info depth 2 multipv 1 score cp 30 upperbound pv g1f3",
            "info depth 2 multipv 1 score cp 20 pv e2e4",
            "info depth 2 multipv 2 score cp 15 pv d2d4",
            "info depth 1 multipv 2 score cp 99 pv a2a3",
        ] {
            table.update(&parse_info_line(line).unwrap());
        }
        assert_eq!(table.depth(), 2);
        let scores = table.into_scores(8);
        assert_eq!(
            scores,
            vec![
                MoveScore {
                    uci: "e2e4".into(),
                    score: Score::Cp(20)
                },
                MoveScore {
                    uci: "d2d4".into(),
                    score: Score::Cp(15)
                },
            ]
        );
    }

    #[test]
    fn scores_are_truncated_and_deduplicated() {
        let mut table = MultiPvTable::new();
        for line in [
            "info depth 5 multipv 1 score cp 40 pv e2e4",
            "info depth 5 multipv 2 score cp 40 pv e2e4",
            "info depth 5 multipv 3 score cp 10 pv c2c4",
            "info depth 5 multipv 4 score cp 0 pv a2a3",
        ] {
            table.update(&parse_info_line(line).unwrap());
        }
        let scores = table.into_scores(2);
        let moves: Vec<_> = scores.iter().map(|m| m.uci.as_str()).collect();
        assert_eq!(moves, vec!["e2e4", "c2c4"]);
    }
}
