//! 層別抽出
//!
//! 各層の候補列は一度だけシャッフルし、分布仕様の宣言順に先頭から取っていく。
//! 足りない層は隣の層から借りずにそのまま不足として報告する。

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dedup::PoolEntry;
use crate::distribution::DistributionSpec;
use crate::error::{PipelineError, Shortfall};
use crate::types::{Character, KeyShape, StratumKey};

/// 層キー → シャッフル済みの候補列
#[derive(Debug, Clone)]
pub struct SelectionPool {
    shape: KeyShape,
    pools: BTreeMap<StratumKey, Vec<PoolEntry>>,
}

impl SelectionPool {
    /// 適格な候補を層ごとにまとめ、キー順に1回ずつシャッフルする
    pub fn build<R: Rng + ?Sized>(shape: KeyShape, entries: &[PoolEntry], rng: &mut R) -> Self {
        let mut pools: BTreeMap<StratumKey, Vec<PoolEntry>> = BTreeMap::new();
        for entry in entries {
            let c = &entry.candidate;
            if !c.is_valid() || c.character == Character::Unclassified {
                continue;
            }
            pools.entry(shape.project(c)).or_default().push(entry.clone());
        }
        for list in pools.values_mut() {
            list.shuffle(rng);
        }
        Self { shape, pools }
    }

    pub fn shape(&self) -> KeyShape {
        self.shape
    }

    pub fn get(&self, key: &StratumKey) -> &[PoolEntry] {
        self.pools.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 層ごとの候補数（キー順）
    pub fn sizes(&self) -> impl Iterator<Item = (&StratumKey, usize)> {
        self.pools.iter().map(|(k, v)| (k, v.len()))
    }

    pub fn log_sizes(&self, label: &str) {
        for (key, n) in self.sizes() {
            log::info!("{label} pool {key}: {n}");
        }
    }
}

/// 抽出オプション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerOptions {
    /// 詰みを含む候補の上限（全体に対する %）
    pub mate_cap_percent: Option<u32>,
    /// 1局から高々1局面
    pub one_per_game: bool,
}

/// 選ばれた1局面
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selected {
    pub key: StratumKey,
    #[serde(flatten)]
    pub entry: PoolEntry,
}

/// 抽出結果。`shortfalls` が空でなければ失敗扱い。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<Selected>,
    pub shortfalls: Vec<Shortfall>,
}

impl Selection {
    pub fn into_result(self) -> Result<Vec<Selected>, PipelineError> {
        if self.shortfalls.is_empty() {
            Ok(self.selected)
        } else {
            for s in &self.shortfalls {
                log::error!(
                    "stratum {} short by {} ({}/{})",
                    s.key,
                    s.missing(),
                    s.selected,
                    s.target
                );
            }
            Err(PipelineError::StratumShortfall(self.shortfalls))
        }
    }
}

/// 選択結果の同一性。CanonicalId を順に連結した SHA-256。
pub fn selection_digest(selected: &[Selected]) -> String {
    let mut hasher = Sha256::new();
    for s in selected {
        hasher.update(s.entry.id.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct StratifiedSampler<'a> {
    spec: &'a DistributionSpec,
    options: SamplerOptions,
}

impl<'a> StratifiedSampler<'a> {
    pub fn new(spec: &'a DistributionSpec, options: SamplerOptions) -> Self {
        Self { spec, options }
    }

    /// プールを作って引く
    pub fn select<R: Rng + ?Sized>(&self, entries: &[PoolEntry], rng: &mut R) -> Selection {
        let pool = SelectionPool::build(self.spec.shape(), entries, rng);
        self.draw(&pool)
    }

    /// 宣言順に各層から目標数まで引く。プールは変更しない。
    pub fn draw(&self, pool: &SelectionPool) -> Selection {
        let mate_cap = self
            .options
            .mate_cap_percent
            .map(|pct| (u64::from(self.spec.total()) * u64::from(pct) / 100) as u32);
        let mut mates = 0u32;
        let mut used_games: HashSet<&str> = HashSet::new();
        let mut selected = Vec::with_capacity(self.spec.total() as usize);
        let mut shortfalls = Vec::new();

        for (key, target) in self.spec.iter() {
            let mut taken = 0u32;
            for entry in pool.get(key) {
                if taken == target {
                    break;
                }
                let c = &entry.candidate;
                if self.options.one_per_game && used_games.contains(c.source_game_id.as_str()) {
                    continue;
                }
                if c.is_mate && mate_cap.is_some_and(|cap| mates >= cap) {
                    continue;
                }
                if c.is_mate {
                    mates += 1;
                }
                if self.options.one_per_game {
                    used_games.insert(c.source_game_id.as_str());
                }
                selected.push(Selected {
                    key: key.clone(),
                    entry: entry.clone(),
                });
                taken += 1;
            }
            if taken < target {
                shortfalls.push(Shortfall {
                    key: key.clone(),
                    target,
                    selected: taken,
                });
            }
        }

        Selection {
            selected,
            shortfalls,
        }
    }
}
