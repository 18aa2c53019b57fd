//! Run seed and per-stage random streams

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sha2::{Digest, Sha256};

/// 正規化（リザーバサンプリング）用の名前空間
pub const NS_NORMALIZE_GAMES: &str = "normalize/games";
/// ゲーム局面の層別抽出
pub const NS_SAMPLE_GAMES: &str = "sample/games";
/// パズル抽出
pub const NS_SAMPLE_PUZZLES: &str = "sample/puzzles";

/// 1回の実行につき1つだけ作るシード。
///
/// 各ステージは名前空間ごとに独立したストリームを受け取るので、
/// 途中のステージをスキップしても後段の乱数列はずれない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSeed(u64);

impl RunSeed {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// `SHA-256(seed_le ‖ namespace)` の先頭32バイトで Xoshiro256++ を初期化する
    pub fn stream(self, namespace: &str) -> Xoshiro256PlusPlus {
        let mut hasher = Sha256::new();
        hasher.update(self.0.to_le_bytes());
        hasher.update(namespace.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        Xoshiro256PlusPlus::from_seed(digest)
    }
}
