//! UCI エンジンを [`chessbench_core::Evaluator`] として使うためのドライバ
//!
//! エンジンはワーカーごとに別プロセスで起動し、MultiPV の `info` 行から
//! 手ごとの評価値を集める。

pub mod engine;
pub mod info;

pub use engine::{UciConfig, UciEngine};
pub use info::{Bound, InfoLine, MultiPvTable, parse_info_line};
