//! Lichess パズル CSV（`PuzzleId,FEN,Moves,Rating,RatingDeviation,Popularity,NbPlays,Themes,...`）

use std::path::Path;

use anyhow::{Context, Result};
use chessbench_core::{PipelineError, RawPuzzle};

use crate::common::io::open_reader;

const MIN_FIELDS: usize = 8;

fn parse_record(record: &csv::StringRecord) -> Result<RawPuzzle, String> {
    if record.len() < MIN_FIELDS {
        return Err(format!("expected at least {MIN_FIELDS} fields, got {}", record.len()));
    }
    let rating = record[3]
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("rating '{}': {e}", &record[3]))?;
    let moves: Vec<String> = record[2].split_whitespace().map(str::to_string).collect();
    if moves.is_empty() {
        return Err("no solution moves".to_string());
    }
    Ok(RawPuzzle {
        puzzle_id: record[0].trim().to_string(),
        fen: record[1].trim().to_string(),
        moves,
        rating,
        themes: record[7].split_whitespace().map(str::to_string).collect(),
    })
}

/// パズル CSV（`.gz` 可）を読み、1件ずつ `f` に渡す。
///
/// 先頭行が `PuzzleId` ならヘッダとして読み飛ばす。壊れた行はログに残して捨てる。
/// 読めた件数を返す。
pub fn read_puzzles<F>(path: &Path, limit: Option<u64>, mut f: F) -> Result<u64>
where
    F: FnMut(RawPuzzle) -> Result<()>,
{
    let reader = open_reader(path).with_context(|| format!("open {}", path.display()))?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut n = 0u64;
    let mut skipped = 0u64;
    for (line, result) in csv_reader.records().enumerate() {
        if limit.is_some_and(|max| n >= max) {
            break;
        }
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                skipped += 1;
                log::warn!("{}:{}: {}", path.display(), line + 1, PipelineError::MalformedInput(e.to_string()));
                continue;
            }
        };
        if line == 0 && record.get(0) == Some("PuzzleId") {
            continue;
        }
        match parse_record(&record) {
            Ok(p) => {
                n += 1;
                f(p)?;
            }
            Err(msg) => {
                skipped += 1;
                log::warn!("{}:{}: {}", path.display(), line + 1, PipelineError::MalformedInput(msg));
            }
        }
    }
    log::info!("{}: read {n} puzzles ({skipped} malformed rows)", path.display());
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "PuzzleId,FEN,Moves,Rating,RatingDeviation,Popularity,NbPlays,Themes,GameUrl,OpeningTags
00sHx,q3k1nr/1pp1nQpp/3p4/1P2p3/4P3/B1PP1b2/B5PP/5K2 b k - 0 17,e8d7 a2e6 d7d8 f7f8,1760,80,83,72,mate mateIn2 middlegame short,https://lichess.org/yyznGmXs/black#34,Italian_Game
bad,8/8/8/8/8/8/8/8 w - - 0 1,e2e4,notanumber,1,1,1,short
00sJ9,r3r1k1/p4ppp/2p2n2/1p6/3P1qb1/2NQR3/PPB2PP1/R1B3K1 w - - 5 18,e3g3 e8e1 g1h2 e1c1,2671,105,87,325,advantage attraction fork middlegame sacrifice veryLong,https://lichess.org/gyFeQsOE#35,French_Defense
";

    #[test]
    fn parses_rows_and_skips_header_and_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("puzzles.csv");
        std::fs::write(&path, CSV).unwrap();
        let mut puzzles = Vec::new();
        let n = read_puzzles(&path, None, |p| {
            puzzles.push(p);
            Ok(())
        }).unwrap();
        assert_eq!(n, 2);
        assert_eq!(puzzles[0].puzzle_id, "00sHx");
        assert_eq!(puzzles[0].moves.len(), 4);
        assert_eq!(puzzles[0].rating, 1760);
        assert!(puzzles[0].themes.contains(&"mateIn2".to_string()));
        assert_eq!(puzzles[1].puzzle_id, "00sJ9");
        assert_eq!(puzzles[1].moves[0], "e3g3");
    }

    #[test]
    fn headerless_file_keeps_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("puzzles.csv");
        let body: String = CSV.lines().skip(1).map(|l| format!("{l}\n")).collect();
        std::fs::write(&path, body).unwrap();
        let mut ids = Vec::new();
        read_puzzles(&path, Some(5), |p| {
            ids.push(p.puzzle_id);
            Ok(())
        }).unwrap();
        assert_eq!(ids, vec!["00sHx", "00sJ9"]);
    }
}
