//! `questions.csv`（`index,input,expected_output,private`）の読み書き

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chessbench_core::{QuestionRecord, Score};
use serde::{Deserialize, Serialize};

use crate::common::io::{open_reader, write_atomic};

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    index: usize,
    input: String,
    /// 指し手 → `{"cp":n}` / `{"mate":n}` の JSON
    expected_output: String,
    private: String,
}

pub fn write_questions(path: &Path, records: &[QuestionRecord]) -> Result<()> {
    let mut w = csv::Writer::from_writer(Vec::new());
    for r in records {
        w.serialize(Row {
            index: r.index,
            input: r.fen.clone(),
            expected_output: serde_json::to_string(&r.legal_move_evaluations)?,
            private: r.is_private.to_string(),
        })?;
    }
    let bytes = w
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flush questions: {}", e.error()))?;
    let text = String::from_utf8(bytes).context("questions are not UTF-8")?;
    write_atomic(path, &text)
}

pub fn read_questions(path: &Path) -> Result<Vec<QuestionRecord>> {
    let reader = open_reader(path).with_context(|| format!("open {}", path.display()))?;
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut out = Vec::new();
    for row in csv_reader.deserialize::<Row>() {
        let row = row.with_context(|| format!("read {}", path.display()))?;
        let is_private = match row.private.as_str() {
            "true" => true,
            "false" => false,
            other => bail!("row {}: private must be true/false, got '{other}'", row.index),
        };
        let legal_move_evaluations: BTreeMap<String, Score> = serde_json::from_str(&row.expected_output)
            .with_context(|| format!("row {}: invalid expected_output", row.index))?;
        out.push(QuestionRecord {
            index: row.index,
            fen: row.input,
            legal_move_evaluations,
            is_private,
        });
    }
    Ok(out)
}
