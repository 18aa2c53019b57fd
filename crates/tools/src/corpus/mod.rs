//! 入力コーパスの読み込み（PGN と Lichess パズル CSV）

pub mod pgn;
pub mod puzzles;

pub use pgn::read_games;
pub use puzzles::read_puzzles;
