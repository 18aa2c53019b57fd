//! ステージごとの実行記録（`status.json`）
//!
//! ファイルの有無ではなく、パラメータのダイジェストと出力の SHA-256 が
//! 記録と一致するときだけステージを飛ばす。

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::io::{sha256_file, write_atomic};

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Games,
    Puzzles,
    Selection,
    Questions,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Games => "games",
            Stage::Puzzles => "puzzles",
            Stage::Selection => "selection",
            Stage::Questions => "questions",
        }
    }

    /// 作業ディレクトリ内の出力ファイル名
    pub fn output(self) -> &'static str {
        match self {
            Stage::Games => "games.jsonl",
            Stage::Puzzles => "puzzles.jsonl",
            Stage::Selection => "selection.jsonl",
            Stage::Questions => "questions.csv",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub state: StageState,
    pub params_digest: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// パラメータのダイジェストを作る。要素ごとに区切って連結した SHA-256。
pub fn params_digest<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatusFile {
    stages: BTreeMap<String, StageEntry>,
}

#[derive(Debug)]
pub struct StageStatus {
    dir: PathBuf,
    file: StatusFile,
}

impl StageStatus {
    /// `status.json` を読む。無ければ空、壊れていれば警告して空から始める。
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATUS_FILE);
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("{}: unreadable status ({e}); all stages will run", path.display());
                StatusFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusFile::default(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
        })
    }

    pub fn output_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(stage.output())
    }

    pub fn entry(&self, stage: Stage) -> Option<&StageEntry> {
        self.file.stages.get(stage.name())
    }

    /// 記録どおりの出力が残っていて、同じパラメータで完了しているか
    pub fn is_fresh(&self, stage: Stage, params: &str) -> bool {
        let Some(entry) = self.entry(stage) else {
            return false;
        };
        if entry.state != StageState::Done || entry.params_digest != params {
            return false;
        }
        let Some(recorded) = entry.output_sha256.as_deref() else {
            return false;
        };
        match sha256_file(&self.dir.join(&entry.output)) {
            Ok(actual) if actual == recorded => true,
            Ok(_) => {
                log::warn!("{stage}: {} changed since it was written; re-running", entry.output);
                false
            }
            Err(_) => false,
        }
    }

    /// 同じパラメータで前回記録された選択ダイジェスト
    pub fn recorded_selection(&self, params: &str) -> Option<&str> {
        self.entry(Stage::Selection)
            .filter(|e| e.state == StageState::Done && e.params_digest == params)
            .and_then(|e| e.selection_digest.as_deref())
    }

    /// 完了を記録する。出力の SHA-256 はここで計算する。
    pub fn mark_done(&mut self, stage: Stage, params: &str, selection_digest: Option<String>) -> Result<()> {
        let output = self.output_path(stage);
        let sha = sha256_file(&output).with_context(|| format!("hash {}", output.display()))?;
        self.file.stages.insert(
            stage.name().to_string(),
            StageEntry {
                state: StageState::Done,
                params_digest: params.to_string(),
                output: stage.output().to_string(),
                output_sha256: Some(sha),
                finished_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                selection_digest,
                error: None,
            },
        );
        self.save()
    }

    /// 実行開始を記録する。途中で落ちたら pending のまま残る。
    pub fn mark_pending(&mut self, stage: Stage, params: &str) -> Result<()> {
        self.file.stages.insert(
            stage.name().to_string(),
            StageEntry {
                state: StageState::Pending,
                params_digest: params.to_string(),
                output: stage.output().to_string(),
                output_sha256: None,
                finished_at: None,
                selection_digest: None,
                error: None,
            },
        );
        self.save()
    }

    pub fn mark_failed(&mut self, stage: Stage, params: &str, error: &str) -> Result<()> {
        self.file.stages.insert(
            stage.name().to_string(),
            StageEntry {
                state: StageState::Failed,
                params_digest: params.to_string(),
                output: stage.output().to_string(),
                output_sha256: None,
                finished_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                selection_digest: None,
                error: Some(error.to_string()),
            },
        );
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.file)?;
        write_atomic(&self.dir.join(STATUS_FILE), &text)
    }
}
