//! 局面の同一性と公開/非公開の割り当て

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::types::Candidate;

pub const DEFAULT_SALT: &str = "chess_position_salt_v1";
pub const DEFAULT_PUBLIC_CUTOFF: u32 = 80;

/// `SHA-256(salt ‖ canonical_fen)` の16進表記
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    pub fn compute(salt: &str, canonical_fen: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(canonical_fen.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Public,
    Private,
}

impl Split {
    pub fn is_private(self) -> bool {
        self == Split::Private
    }
}

/// FEN の内容だけで決まる分割。並び順・シード・抽出結果には依存しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitAssigner {
    public_cutoff: u32,
}

impl Default for SplitAssigner {
    fn default() -> Self {
        Self {
            public_cutoff: DEFAULT_PUBLIC_CUTOFF,
        }
    }
}

impl SplitAssigner {
    pub fn new(public_cutoff: u32) -> Result<Self, PipelineError> {
        if public_cutoff > 100 {
            return Err(PipelineError::InvalidDistribution(format!(
                "public_fraction_cutoff must be within 0..=100, got {public_cutoff}"
            )));
        }
        Ok(Self { public_cutoff })
    }

    /// SHA-256(fen) の先頭8桁を u32 として読み、100 で割った余り
    pub fn bucket_of(canonical_fen: &str) -> u32 {
        let digest = Sha256::digest(canonical_fen.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % 100
    }

    pub fn assign(&self, canonical_fen: &str) -> Split {
        if Self::bucket_of(canonical_fen) < self.public_cutoff {
            Split::Public
        } else {
            Split::Private
        }
    }
}

/// 重複除去を通過した候補
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: CanonicalId,
    pub split: Split,
    #[serde(flatten)]
    pub candidate: Candidate,
}

/// canonical FEN で重複を落とす。先に来たものが残る。
pub struct Deduplicator {
    salt: String,
    splits: SplitAssigner,
    seen: HashSet<String>,
    dropped: u64,
}

impl Deduplicator {
    pub fn new(salt: impl Into<String>, splits: SplitAssigner) -> Self {
        Self {
            salt: salt.into(),
            splits,
            seen: HashSet::new(),
            dropped: 0,
        }
    }

    /// 初出なら ID と分割を付けて返す。既出なら `None`。
    pub fn admit(&mut self, candidate: Candidate) -> Option<PoolEntry> {
        if !self.seen.insert(candidate.canonical_fen.clone()) {
            self.dropped += 1;
            log::debug!(
                "duplicate position from {} dropped: {}",
                candidate.source_game_id,
                candidate.canonical_fen
            );
            return None;
        }
        Some(PoolEntry {
            id: CanonicalId::compute(&self.salt, &candidate.canonical_fen),
            split: self.splits.assign(&candidate.canonical_fen),
            candidate,
        })
    }

    /// 既に採用済みの局面として登録する（前段の出力を読み直したとき用）
    pub fn remember(&mut self, canonical_fen: impl Into<String>) {
        self.seen.insert(canonical_fen.into());
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
