//! 層ごとの目標数（分布仕様）
//!
//! 設定は「層を列挙する explicit」か「比率から組み立てる ratios」のどちらか。
//! ratios は段ごとに最大剰余法で整数化するので、合計は必ず total に一致する。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::rating::RatingBands;
use crate::types::{Character, KeyShape, Phase, RatingBucket, Side, StratumKey};

/// 検証済みの分布仕様。宣言順を保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSpec {
    shape: KeyShape,
    total: u32,
    targets: Vec<(StratumKey, u32)>,
}

impl DistributionSpec {
    pub fn new(
        shape: KeyShape,
        total: u32,
        targets: Vec<(StratumKey, u32)>,
    ) -> Result<Self, PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidDistribution(msg));
        let mut seen = HashSet::new();
        for (key, _) in &targets {
            if !shape.conforms(key) {
                return invalid(format!("stratum {key} does not fit {shape:?} keys"));
            }
            if !seen.insert(key.clone()) {
                return invalid(format!("stratum {key} is declared twice"));
            }
        }
        let sum: u64 = targets.iter().map(|(_, n)| u64::from(*n)).sum();
        if sum != u64::from(total) {
            return invalid(format!("targets sum to {sum}, declared total is {total}"));
        }
        Ok(Self {
            shape,
            total,
            targets,
        })
    }

    pub fn shape(&self) -> KeyShape {
        self.shape
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// 宣言順に (キー, 目標数)
    pub fn iter(&self) -> impl Iterator<Item = (&StratumKey, u32)> {
        self.targets.iter().map(|(k, n)| (k, *n))
    }

    pub fn target_of(&self, key: &StratumKey) -> Option<u32> {
        self.targets.iter().find(|(k, _)| k == key).map(|(_, n)| *n)
    }
}

/// 設定ファイル上の分布
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DistributionConfig {
    Explicit(ExplicitDistribution),
    Ratios(RatioDistribution),
}

impl DistributionConfig {
    pub fn total(&self) -> u32 {
        match self {
            DistributionConfig::Explicit(e) => e.total,
            DistributionConfig::Ratios(r) => r.total,
        }
    }

    /// CLI の件数指定で合計を差し替える（explicit は差し替え不可）
    pub fn with_total(mut self, total: u32) -> Result<Self, PipelineError> {
        match &mut self {
            DistributionConfig::Ratios(r) => r.total = total,
            DistributionConfig::Explicit(e) if e.total == total => {}
            DistributionConfig::Explicit(e) => {
                return Err(PipelineError::InvalidDistribution(format!(
                    "explicit distribution totals {}; cannot resize to {total}",
                    e.total
                )));
            }
        }
        Ok(self)
    }

    pub fn build(&self, shape: KeyShape, bands: &RatingBands) -> Result<DistributionSpec, PipelineError> {
        match self {
            DistributionConfig::Explicit(e) => e.build(shape, bands),
            DistributionConfig::Ratios(r) => r.build(shape, bands),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumTarget {
    pub rating: String,
    pub phase: Phase,
    #[serde(default)]
    pub character: Option<Character>,
    #[serde(default)]
    pub side: Option<Side>,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitDistribution {
    pub total: u32,
    pub strata: Vec<StratumTarget>,
}

impl ExplicitDistribution {
    fn build(&self, shape: KeyShape, bands: &RatingBands) -> Result<DistributionSpec, PipelineError> {
        let mut targets = Vec::with_capacity(self.strata.len());
        for s in &self.strata {
            let bucket = RatingBucket::new(s.rating.clone());
            if !bands.contains(&bucket) {
                return Err(PipelineError::InvalidDistribution(format!(
                    "unknown rating band '{}'",
                    s.rating
                )));
            }
            let key = StratumKey {
                rating_bucket: bucket,
                phase: s.phase,
                character: s.character,
                side_to_move: s.side,
            };
            targets.push((key, s.target));
        }
        DistributionSpec::new(shape, self.total, targets)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingShare {
    pub label: String,
    pub share: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseShare {
    pub phase: Phase,
    pub share: f64,
}

fn default_phase_shares() -> Vec<PhaseShare> {
    vec![
        PhaseShare { phase: Phase::Opening, share: 0.2 },
        PhaseShare { phase: Phase::Middlegame, share: 0.6 },
        PhaseShare { phase: Phase::Endgame, share: 0.2 },
    ]
}

fn default_tactical_shares() -> Vec<PhaseShare> {
    vec![
        PhaseShare { phase: Phase::Opening, share: 0.28 },
        PhaseShare { phase: Phase::Middlegame, share: 0.29 },
        PhaseShare { phase: Phase::Endgame, share: 0.28 },
    ]
}

/// 比率指定。rating → phase →（ゲームのみ）tactical/quiet → 手番 の順に割る。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioDistribution {
    pub total: u32,
    /// 空ならレーティング帯に均等
    #[serde(default)]
    pub rating_shares: Vec<RatingShare>,
    #[serde(default = "default_phase_shares")]
    pub phase_shares: Vec<PhaseShare>,
    /// フェーズごとの戦術局面の割合（0.0〜1.0）
    #[serde(default = "default_tactical_shares")]
    pub tactical_shares: Vec<PhaseShare>,
}

impl RatioDistribution {
    fn build(&self, shape: KeyShape, bands: &RatingBands) -> Result<DistributionSpec, PipelineError> {
        let ratings: Vec<(RatingBucket, f64)> = if self.rating_shares.is_empty() {
            bands.labels().map(|b| (b, 1.0)).collect()
        } else {
            let mut v = Vec::with_capacity(self.rating_shares.len());
            for r in &self.rating_shares {
                let bucket = RatingBucket::new(r.label.clone());
                if !bands.contains(&bucket) {
                    return Err(PipelineError::InvalidDistribution(format!(
                        "unknown rating band '{}'",
                        r.label
                    )));
                }
                v.push((bucket, r.share));
            }
            v
        };

        let rating_counts = apportion(self.total, &ratings.iter().map(|(_, s)| *s).collect::<Vec<_>>())?;
        let phase_weights: Vec<f64> = self.phase_shares.iter().map(|p| p.share).collect();

        let mut targets = Vec::new();
        for ((bucket, _), rating_total) in ratings.iter().zip(rating_counts) {
            let phase_counts = apportion(rating_total, &phase_weights)?;
            for (ps, phase_total) in self.phase_shares.iter().zip(phase_counts) {
                match shape {
                    KeyShape::Puzzles => {
                        targets.push((StratumKey::puzzle(bucket.clone(), ps.phase), phase_total));
                    }
                    KeyShape::Games => {
                        let tactical_share = self
                            .tactical_shares
                            .iter()
                            .find(|t| t.phase == ps.phase)
                            .map_or(0.5, |t| t.share);
                        if !(0.0..=1.0).contains(&tactical_share) {
                            return Err(PipelineError::InvalidDistribution(format!(
                                "tactical share for {} must be within 0..=1",
                                ps.phase.label()
                            )));
                        }
                        let split = apportion(phase_total, &[tactical_share, 1.0 - tactical_share])?;
                        for (character, n) in [(Character::Tactical, split[0]), (Character::Quiet, split[1])] {
                            // 手番は白 n/2、黒 (n+1)/2
                            for (side, m) in [(Side::White, n / 2), (Side::Black, n - n / 2)] {
                                targets.push((StratumKey::game(bucket.clone(), ps.phase, character, side), m));
                            }
                        }
                    }
                }
            }
        }
        DistributionSpec::new(shape, self.total, targets)
    }
}

/// 最大剰余法。端数は大きい順、同率なら先に宣言された側へ配る。
pub fn apportion(total: u32, weights: &[f64]) -> Result<Vec<u32>, PipelineError> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(PipelineError::InvalidDistribution(
            "shares must be finite and non-negative".to_string(),
        ));
    }
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        if total == 0 {
            return Ok(vec![0; weights.len()]);
        }
        return Err(PipelineError::InvalidDistribution("shares sum to zero".to_string()));
    }

    let quotas: Vec<f64> = weights.iter().map(|w| f64::from(total) * w / sum).collect();
    let mut counts: Vec<u32> = quotas.iter().map(|q| q.floor() as u32).collect();
    let assigned: u32 = counts.iter().sum();
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.total_cmp(&fa).then(a.cmp(&b))
    });
    for &i in order.iter().take(total.saturating_sub(assigned) as usize) {
        counts[i] += 1;
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apportion_always_sums_to_total() {
        for total in [0, 1, 7, 199, 200, 801] {
            let counts = apportion(total, &[0.1, 0.25, 0.35, 0.2, 0.1]).unwrap();
            assert_eq!(counts.iter().sum::<u32>(), total);
        }
        assert_eq!(apportion(200, &[0.1, 0.25, 0.35, 0.2, 0.1]).unwrap(), vec![20, 50, 70, 40, 20]);
        // 同率の端数は先頭側
        assert_eq!(apportion(1, &[1.0, 1.0]).unwrap(), vec![1, 0]);
        assert!(apportion(3, &[0.0, 0.0]).is_err());
        assert!(apportion(3, &[-1.0, 2.0]).is_err());
    }

    #[test]
    fn explicit_spec_requires_matching_total() {
        let bands = RatingBands::default();
        let cfg = ExplicitDistribution {
            total: 3,
            strata: vec![StratumTarget {
                rating: "<1400".to_string(),
                phase: Phase::Opening,
                character: None,
                side: None,
                target: 2,
            }],
        };
        assert!(cfg.build(KeyShape::Puzzles, &bands).is_err());
    }

    #[test]
    fn explicit_spec_rejects_duplicate_and_misshapen_keys() {
        let bands = RatingBands::default();
        let t = |character: Option<Character>| StratumTarget {
            rating: "<1400".to_string(),
            phase: Phase::Opening,
            character,
            side: Some(Side::White),
            target: 1,
        };
        let dup = ExplicitDistribution {
            total: 2,
            strata: vec![t(Some(Character::Quiet)), t(Some(Character::Quiet))],
        };
        assert!(dup.build(KeyShape::Games, &bands).is_err());
        let unclassified = ExplicitDistribution {
            total: 1,
            strata: vec![t(Some(Character::Unclassified))],
        };
        assert!(unclassified.build(KeyShape::Games, &bands).is_err());
    }

    #[test]
    fn ratio_spec_expands_to_exact_targets() {
        let bands = RatingBands::default();
        let cfg = RatioDistribution {
            total: 200,
            rating_shares: vec![
                RatingShare { label: "<1400".into(), share: 0.1 },
                RatingShare { label: "1400-1800".into(), share: 0.25 },
                RatingShare { label: "1800-2200".into(), share: 0.35 },
                RatingShare { label: "2200-2600".into(), share: 0.2 },
                RatingShare { label: "2600+".into(), share: 0.1 },
            ],
            phase_shares: default_phase_shares(),
            tactical_shares: default_tactical_shares(),
        };
        let spec = cfg.build(KeyShape::Games, &bands).unwrap();
        assert_eq!(spec.total(), 200);
        assert_eq!(spec.len(), 5 * 3 * 2 * 2);
        let sum: u32 = spec.iter().map(|(_, n)| n).sum();
        assert_eq!(sum, 200);
        // 20 局面の帯: opening 4 → tactical 1 / quiet 3 → quiet は白1・黒2
        let key = StratumKey::game(RatingBucket::new("<1400"), Phase::Opening, Character::Quiet, Side::Black);
        assert_eq!(spec.target_of(&key), Some(2));
        let key = StratumKey::game(RatingBucket::new("<1400"), Phase::Opening, Character::Quiet, Side::White);
        assert_eq!(spec.target_of(&key), Some(1));
    }

    #[test]
    fn ratio_config_from_toml() {
        let text = r#"
            mode = "ratios"
            total = 200

            [[phase_shares]]
            phase = "middlegame"
            share = 0.7

            [[phase_shares]]
            phase = "endgame"
            share = 0.3
        "#;
        let cfg: DistributionConfig = toml::from_str(text).unwrap();
        let spec = cfg.build(KeyShape::Puzzles, &RatingBands::default()).unwrap();
        let middle: u32 = spec
            .iter()
            .filter(|(k, _)| k.phase == Phase::Middlegame)
            .map(|(_, n)| n)
            .sum();
        assert_eq!(middle, 140);
        assert_eq!(spec.len(), 10);

        let resized = cfg.with_total(50).unwrap();
        assert_eq!(resized.total(), 50);
    }
}
