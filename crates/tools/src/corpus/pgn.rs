//! PGN から [`RawGame`] を取り出す。変化手順とコメントは読み飛ばす。

use std::path::Path;

use anyhow::{Context, Result};
use chessbench_core::RawGame;
use pgn_reader::{BufferedReader, RawHeader, SanPlus, Skip, Visitor};

use crate::common::io::open_reader;

struct GameCollector {
    current: RawGame,
    site: Option<String>,
}

impl GameCollector {
    fn new() -> Self {
        Self {
            current: RawGame::default(),
            site: None,
        }
    }
}

/// `https://lichess.org/AbCdEf12` → `AbCdEf12`
fn id_from_site(site: &str) -> Option<String> {
    let tail = site.trim_end_matches('/').rsplit('/').next()?;
    (!tail.is_empty() && tail != "?").then(|| tail.to_string())
}

impl Visitor for GameCollector {
    type Result = RawGame;

    fn begin_game(&mut self) {
        self.current = RawGame::default();
        self.site = None;
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match key {
            b"WhiteElo" => self.current.white_elo = value.parse().ok(),
            b"BlackElo" => self.current.black_elo = value.parse().ok(),
            b"TimeControl" => self.current.time_control = Some(value),
            b"Variant" => self.current.variant = Some(value),
            b"Event" => self.current.event = Some(value),
            b"Site" => self.site = Some(value),
            _ => {}
        }
    }

    fn san(&mut self, san_plus: SanPlus) {
        self.current.moves.push(san_plus.to_string());
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn end_game(&mut self) -> Self::Result {
        let mut game = std::mem::take(&mut self.current);
        if let Some(id) = self.site.take().as_deref().and_then(id_from_site) {
            game.game_id = id;
        }
        game
    }
}

/// PGN ファイル（`.gz` 可）を先頭から読み、1局ずつ `f` に渡す。`f` のエラーで打ち切る。
///
/// Site ヘッダから ID が取れない対局は `<ファイル名>#<連番>` を ID にする。
/// 読んだ局数を返す。
pub fn read_games<F>(path: &Path, limit: Option<u64>, mut f: F) -> Result<u64>
where
    F: FnMut(RawGame) -> Result<()>,
{
    let reader = open_reader(path).with_context(|| format!("open {}", path.display()))?;
    let stem = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let mut pgn = BufferedReader::new(reader);
    let mut visitor = GameCollector::new();
    let mut n = 0u64;
    while limit.is_none_or(|max| n < max) {
        let Some(mut game) = pgn
            .read_game(&mut visitor)
            .with_context(|| format!("read {} (game {})", path.display(), n + 1))?
        else {
            break;
        };
        if game.game_id.is_empty() {
            game.game_id = format!("{stem}#{n}");
        }
        n += 1;
        f(game)?;
    }
    log::info!("{}: read {n} games", path.display());
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_GAMES: &str = r#"[Event "Rated Blitz game"]
[Site "https://lichess.org/abcd1234"]
[White "a"]
[Black "b"]
[Result "1-0"]
[WhiteElo "1850"]
[BlackElo "1790"]
[TimeControl "300+0"]
[Variant "Standard"]

1. e4 { [%clk 0:05:00] } e5 2. Nf3 (2. f4 exf4) Nc6 3. Bb5+ 1-0

[Event "Casual Bullet game"]
[WhiteElo "?"]
[BlackElo "1500"]
[TimeControl "60+0"]

1. d4 d5 0-1
"#;

    #[test]
    fn reads_headers_and_mainline_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.pgn");
        std::fs::write(&path, TWO_GAMES).unwrap();
        let mut games = Vec::new();
        let n = read_games(&path, None, |g| {
            games.push(g);
            Ok(())
        }).unwrap();
        assert_eq!(n, 2);

        let first = &games[0];
        assert_eq!(first.game_id, "abcd1234");
        assert_eq!(first.white_elo, Some(1850));
        assert_eq!(first.black_elo, Some(1790));
        assert_eq!(first.time_control.as_deref(), Some("300+0"));
        assert_eq!(first.variant.as_deref(), Some("Standard"));
        assert_eq!(first.moves, vec!["e4", "e5", "Nf3", "Nc6", "Bb5+"]);

        let second = &games[1];
        assert_eq!(second.game_id, "games.pgn#1");
        assert_eq!(second.white_elo, None);
        assert_eq!(second.event.as_deref(), Some("Casual Bullet game"));
    }

    #[test]
    fn limit_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.pgn");
        std::fs::write(&path, TWO_GAMES).unwrap();
        let mut count = 0;
        assert_eq!(read_games(&path, Some(1), |_| {
            count += 1;
            Ok(())
        }).unwrap(), 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn site_id_extraction() {
        assert_eq!(id_from_site("https://lichess.org/XyZ98765"), Some("XyZ98765".to_string()));
        assert_eq!(id_from_site("?"), None);
    }
}
