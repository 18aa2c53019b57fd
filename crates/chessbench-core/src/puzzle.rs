//! パズルの抽出（rating × phase の2次元）

use crate::dedup::PoolEntry;
use crate::distribution::DistributionSpec;
use crate::error::PipelineError;
use crate::sampler::{SamplerOptions, Selection, StratifiedSampler};
use crate::seed::{NS_SAMPLE_PUZZLES, RunSeed};
use crate::types::{KeyShape, Source};

/// ゲームとは別の名前空間の乱数でパズルを引く
pub struct PuzzleSelector<'a> {
    spec: &'a DistributionSpec,
    mate_cap_percent: Option<u32>,
}

impl<'a> PuzzleSelector<'a> {
    pub fn new(spec: &'a DistributionSpec, mate_cap_percent: Option<u32>) -> Result<Self, PipelineError> {
        if spec.shape() != KeyShape::Puzzles {
            return Err(PipelineError::InvalidDistribution(
                "puzzle distribution must use (rating, phase) strata".to_string(),
            ));
        }
        Ok(Self {
            spec,
            mate_cap_percent,
        })
    }

    pub fn select(&self, entries: &[PoolEntry], seed: RunSeed) -> Selection {
        let puzzles: Vec<PoolEntry> = entries
            .iter()
            .filter(|e| e.candidate.source == Source::Puzzle)
            .cloned()
            .collect();
        let options = SamplerOptions {
            mate_cap_percent: self.mate_cap_percent,
            one_per_game: true,
        };
        let mut rng = seed.stream(NS_SAMPLE_PUZZLES);
        StratifiedSampler::new(self.spec, options).select(&puzzles, &mut rng)
    }
}
