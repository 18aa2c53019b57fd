//! レーティング帯

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::RatingBucket;

/// 1つの帯。`below` 未満のレーティングが入る。最後の帯は `below = None`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingBand {
    pub label: String,
    #[serde(default)]
    pub below: Option<u32>,
}

/// 昇順に並んだレーティング帯の列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatingBands(Vec<RatingBand>);

impl Default for RatingBands {
    fn default() -> Self {
        let band = |label: &str, below: Option<u32>| RatingBand {
            label: label.to_string(),
            below,
        };
        Self(vec![
            band("<1400", Some(1400)),
            band("1400-1800", Some(1800)),
            band("1800-2200", Some(2200)),
            band("2200-2600", Some(2600)),
            band("2600+", None),
        ])
    }
}

impl RatingBands {
    pub fn new(bands: Vec<RatingBand>) -> Result<Self, PipelineError> {
        let bands = Self(bands);
        bands.validate()?;
        Ok(bands)
    }

    /// 上限が狭義単調増加で、最後の帯だけが上限なしであること
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidDistribution(msg));
        let Some((last, rest)) = self.0.split_last() else {
            return invalid("rating bands are empty".to_string());
        };
        if last.below.is_some() {
            return invalid(format!("last rating band '{}' must be open-ended", last.label));
        }
        let mut prev: Option<u32> = None;
        for band in rest {
            let Some(below) = band.below else {
                return invalid(format!("rating band '{}' needs an upper bound", band.label));
            };
            if prev.is_some_and(|p| below <= p) {
                return invalid(format!("rating band '{}' is out of order", band.label));
            }
            prev = Some(below);
        }
        let mut labels: Vec<&str> = self.0.iter().map(|b| b.label.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        if labels.len() != self.0.len() {
            return invalid("rating band labels must be unique".to_string());
        }
        Ok(())
    }

    pub fn labels(&self) -> impl Iterator<Item = RatingBucket> + '_ {
        self.0.iter().map(|b| RatingBucket::new(b.label.clone()))
    }

    /// 該当する帯。帯が空なら `None`。
    pub fn bucket_for(&self, rating: u32) -> Option<RatingBucket> {
        self.0
            .iter()
            .find(|b| b.below.is_none_or(|below| rating < below))
            .map(|b| RatingBucket::new(b.label.clone()))
    }

    pub fn contains(&self, bucket: &RatingBucket) -> bool {
        self.0.iter().any(|b| b.label == bucket.as_str())
    }
}
