//! chessbench-core: 層別サンプリングによるチェス局面ベンチマークの構築
//!
//! 流れ: レコード → [`normalize`] → [`dedup`] → [`classify`] → [`sampler`] / [`puzzle`] → [`assemble`]
//!
//! 盤面ルールは [`rules::Rules`]、評価エンジンは [`evaluator::Evaluator`] の裏に隠す。

pub mod assemble;
pub mod classify;
pub mod dedup;
pub mod distribution;
pub mod error;
pub mod evaluator;
pub mod normalize;
pub mod puzzle;
pub mod rating;
pub mod rules;
pub mod sampler;
pub mod seed;
pub mod types;

pub use assemble::{AssemblerConfig, AssemblyOrder, DatasetAssembler, EvaluatorFactory};
pub use classify::{Classifier, ClassifierConfig};
pub use dedup::{CanonicalId, Deduplicator, PoolEntry, Split, SplitAssigner};
pub use distribution::{DistributionConfig, DistributionSpec};
pub use error::{EvaluatorError, PipelineError, RulesError, Shortfall};
pub use evaluator::{Evaluator, MaterialEvaluator};
pub use normalize::{GameFilter, NormalizeStats, Normalizer, RawGame, RawPuzzle, TimeClass};
pub use puzzle::PuzzleSelector;
pub use rating::{RatingBand, RatingBands};
pub use rules::{ChessRules, Rules};
pub use sampler::{SamplerOptions, Selected, Selection, SelectionPool, StratifiedSampler, selection_digest};
pub use seed::RunSeed;
pub use types::{
    Candidate, Character, KeyShape, MoveScore, Phase, QuestionRecord, RatingBucket, Score, Side,
    Source, StratumKey,
};
