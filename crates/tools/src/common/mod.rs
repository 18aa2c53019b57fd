//! コーパス読み込み・成果物書き出しの共通モジュール

pub mod io;
