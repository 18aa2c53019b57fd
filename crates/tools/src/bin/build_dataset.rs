//! 層別サンプリングでベンチマーク用の局面集（questions.csv）を作る
//!
//! 終了コード: 0 成功 / 2 層の不足 / 3 評価器の失敗・不一致 / 4 非決定性 / 1 その他

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tools::config::{Overrides, RunConfig};
use tools::pipeline::{Pipeline, PipelineOptions, exit_code};

#[derive(Parser, Debug)]
#[command(name = "build_dataset")]
#[command(about = "Build a stratified chess position benchmark (questions.csv) from game and puzzle corpora")]
struct Cli {
    /// ゲーム局面の総数（ratios 分布の total を上書き）
    num_samples: Option<u32>,

    /// 乱数シード（設定の seed を上書き）
    seed: Option<u64>,

    /// 記録済みのステージもすべて再実行する
    #[arg(long)]
    force: bool,

    /// 全合法手の評価を省き、expected_output を空にする
    #[arg(long)]
    skip_eval: bool,

    #[arg(long, default_value = "configs/default.toml")]
    config: PathBuf,

    /// 中間ファイルと出力の置き場所
    #[arg(long, default_value = "output")]
    work_dir: PathBuf,

    /// PGN 入力（繰り返し指定可、設定の games.inputs を置き換える）
    #[arg(long = "games")]
    games: Vec<PathBuf>,

    /// パズル CSV 入力（繰り返し指定可）
    #[arg(long = "puzzles-csv")]
    puzzles_csv: Vec<PathBuf>,

    /// パズルの総数（ratios 分布の total を上書き）
    #[arg(long)]
    puzzles: Option<u32>,

    /// UCI エンジンのパス（指定すると engine.kind = "uci"）
    #[arg(long)]
    engine: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<()> {
    let cfg = RunConfig::load(&cli.config)?.apply(Overrides {
        num_samples: cli.num_samples,
        num_puzzles: cli.puzzles,
        seed: cli.seed,
        games: cli.games,
        puzzles: cli.puzzles_csv,
        engine_path: cli.engine,
    })?;
    log::info!(
        "seed {} / work dir {} / engine {:?}{}",
        cfg.seed,
        cli.work_dir.display(),
        cfg.engine.kind,
        if cli.skip_eval { " (evaluation skipped)" } else { "" }
    );

    let opts = PipelineOptions {
        work_dir: cli.work_dir,
        force: cli.force,
        skip_eval: cli.skip_eval,
    };
    let summary = Pipeline::new(&cfg, opts)?.run()?;
    log::info!(
        "done: {} games + {} puzzles selected from pools of {} / {}, {} questions",
        summary.selected_games,
        summary.selected_puzzles,
        summary.pooled_games,
        summary.pooled_puzzles,
        summary.questions
    );
    if !summary.reused.is_empty() {
        log::info!("reused stages: {}", summary.reused.join(", "));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
