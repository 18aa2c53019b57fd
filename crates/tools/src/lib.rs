//! chessbench のツール群
//!
//! コーパスの読み込み、実行設定、ステージの記録と `build_dataset` の本体。

pub mod common;
pub mod config;
pub mod corpus;
pub mod pipeline;
pub mod questions;
pub mod stages;
