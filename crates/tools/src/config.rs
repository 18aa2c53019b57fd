//! 実行設定（TOML）

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chessbench_core::dedup::{DEFAULT_PUBLIC_CUTOFF, DEFAULT_SALT};
use chessbench_core::{
    AssemblerConfig, AssemblyOrder, ClassifierConfig, DistributionConfig, DistributionSpec, GameFilter,
    KeyShape, RatingBands, RunSeed, SplitAssigner,
};
use chessbench_uci::UciConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Uci,
    /// 組み込みの駒得評価器（エンジン不要）
    #[default]
    Material,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub kind: EngineKind,
    pub path: Option<PathBuf>,
    pub args: Vec<String>,
    pub threads: usize,
    pub hash_mb: u32,
    /// 追加の UCI オプション。値は文字列・数値・真偽値のいずれでもよい。
    pub options: BTreeMap<String, toml::Value>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            kind: EngineKind::Material,
            path: None,
            args: Vec::new(),
            threads: 1,
            hash_mb: 64,
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    pub depth: u32,
    pub workers: usize,
    pub retries: u32,
    pub timeout_ms: u64,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            depth: 20,
            workers: 1,
            retries: 2,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusSection {
    /// 入力ファイル（PGN / CSV、`.gz` 可）。設定ファイルからの相対パス。
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// ファイルごとの読み込み上限
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub mate_cap_percent: Option<u32>,
    pub distribution: DistributionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_salt")]
    pub salt: String,
    #[serde(default = "default_cutoff")]
    pub public_fraction_cutoff: u32,
    #[serde(default)]
    pub order: AssemblyOrder,
    #[serde(default)]
    pub rating_bands: RatingBands,
    #[serde(default)]
    pub game_filter: GameFilter,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub evaluation: EvaluationSection,
    pub games: CorpusSection,
    pub puzzles: CorpusSection,
}

fn default_salt() -> String {
    DEFAULT_SALT.to_string()
}

fn default_cutoff() -> u32 {
    DEFAULT_PUBLIC_CUTOFF
}

/// CLI からの上書き
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub num_samples: Option<u32>,
    pub num_puzzles: Option<u32>,
    pub seed: Option<u64>,
    pub games: Vec<PathBuf>,
    pub puzzles: Vec<PathBuf>,
    pub engine_path: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: RunConfig = toml::from_str(text).context("invalid run config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 読み込んで、入力パスを設定ファイルの場所から解決する
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let mut cfg = Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        cfg.games.inputs.iter_mut().for_each(resolve);
        cfg.puzzles.inputs.iter_mut().for_each(resolve);
        if let Some(p) = cfg.engine.path.as_mut() {
            resolve(p);
        }
        Ok(cfg)
    }

    pub fn apply(mut self, o: Overrides) -> Result<Self> {
        if let Some(seed) = o.seed {
            self.seed = seed;
        }
        if let Some(n) = o.num_samples {
            self.games.distribution = self.games.distribution.with_total(n)?;
        }
        if let Some(n) = o.num_puzzles {
            self.puzzles.distribution = self.puzzles.distribution.with_total(n)?;
        }
        if !o.games.is_empty() {
            self.games.inputs = o.games;
        }
        if !o.puzzles.is_empty() {
            self.puzzles.inputs = o.puzzles;
        }
        if let Some(p) = o.engine_path {
            self.engine.kind = EngineKind::Uci;
            self.engine.path = Some(p);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.rating_bands.validate()?;
        self.classifier.validate()?;
        SplitAssigner::new(self.public_fraction_cutoff)?;
        if self.evaluation.workers == 0 {
            bail!("evaluation.workers must be at least 1");
        }
        if self.engine.kind == EngineKind::Uci && self.engine.path.is_none() {
            bail!("engine.kind = \"uci\" needs engine.path");
        }
        for pct in [self.games.mate_cap_percent, self.puzzles.mate_cap_percent].into_iter().flatten() {
            if pct > 100 {
                bail!("mate_cap_percent must be within 0..=100, got {pct}");
            }
        }
        Ok(())
    }

    pub fn run_seed(&self) -> RunSeed {
        RunSeed::new(self.seed)
    }

    pub fn splits(&self) -> Result<SplitAssigner> {
        Ok(SplitAssigner::new(self.public_fraction_cutoff)?)
    }

    pub fn games_spec(&self) -> Result<DistributionSpec> {
        Ok(self.games.distribution.build(KeyShape::Games, &self.rating_bands)?)
    }

    pub fn puzzles_spec(&self) -> Result<DistributionSpec> {
        Ok(self.puzzles.distribution.build(KeyShape::Puzzles, &self.rating_bands)?)
    }

    pub fn assembler(&self, skip_eval: bool) -> AssemblerConfig {
        AssemblerConfig {
            depth: self.evaluation.depth,
            workers: self.evaluation.workers,
            retries: self.evaluation.retries,
            order: self.order,
            skip_eval,
        }
    }

    /// `engine.kind = "uci"` のときのエンジン設定
    pub fn uci(&self) -> Option<UciConfig> {
        let path = self.engine.path.as_ref()?;
        let mut cfg = UciConfig::new(path);
        cfg.args = self.engine.args.clone();
        cfg.threads = self.engine.threads;
        cfg.hash_mb = self.engine.hash_mb;
        cfg.search_timeout = Duration::from_millis(self.evaluation.timeout_ms);
        cfg.options = self
            .engine
            .options
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();
        Some(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chessbench_core::DistributionConfig;

    const MINIMAL: &str = r#"
seed = 7

[games]
inputs = ["games.pgn"]
[games.distribution]
mode = "ratios"
total = 60

[puzzles]
inputs = ["puzzles.csv.gz"]
mate_cap_percent = 10
[puzzles.distribution]
mode = "explicit"
total = 3
strata = [
  { rating = "<1400", phase = "middlegame", target = 2 },
  { rating = "2600+", phase = "endgame", target = 1 },
]
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = RunConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.salt, DEFAULT_SALT);
        assert_eq!(cfg.public_fraction_cutoff, 80);
        assert_eq!(cfg.engine.kind, EngineKind::Material);
        assert_eq!(cfg.evaluation, EvaluationSection::default());
        assert_eq!(cfg.games_spec().unwrap().total(), 60);
        assert_eq!(cfg.puzzles_spec().unwrap().len(), 2);
        assert!(cfg.uci().is_none());
    }

    #[test]
    fn overrides_resize_ratio_totals_only() {
        let cfg = RunConfig::from_toml_str(MINIMAL).unwrap();
        let resized = cfg
            .clone()
            .apply(Overrides {
                num_samples: Some(24),
                seed: Some(99),
                ..Overrides::default()
            })
            .unwrap();
        assert_eq!(resized.seed, 99);
        assert!(matches!(resized.games.distribution, DistributionConfig::Ratios(ref r) if r.total == 24));
        assert_eq!(resized.games_spec().unwrap().total(), 24);

        let err = cfg
            .apply(Overrides {
                num_puzzles: Some(10),
                ..Overrides::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("explicit"));
    }

    #[test]
    fn uci_engine_needs_a_path() {
        let text = MINIMAL.replace("seed = 7", "seed = 7\n[engine]\nkind = \"uci\"\n");
        assert!(RunConfig::from_toml_str(&text).is_err());
        let text = MINIMAL.replace(
            "seed = 7",
            "seed = 7\n[engine]\nkind = \"uci\"\npath = \"/usr/bin/stockfish\"\nthreads = 2\noptions = { \"Skill Level\" = 20, UCI_ShowWDL = false }\n",
        );
        let cfg = RunConfig::from_toml_str(&text).unwrap();
        let uci = cfg.uci().unwrap();
        assert_eq!(uci.threads, 2);
        assert_eq!(
            uci.options,
            vec![
                ("Skill Level".to_string(), "20".to_string()),
                ("UCI_ShowWDL".to_string(), "false".to_string()),
            ]
        );
    }
}
