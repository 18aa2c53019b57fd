//! ファイルI/Oユーティリティ（gzip対応）と成果物の書き出し

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

fn is_gz(p: &Path) -> bool {
    p.extension().and_then(OsStr::to_str).is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// `.gz` なら展開しながら読む
pub fn open_reader<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead>> {
    let p = path.as_ref();
    let f = File::open(p)?;
    if is_gz(p) {
        let dec = flate2::read::GzDecoder::new(f);
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, dec)));
    }
    Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, f)))
}

/// Writer wrapper to propagate finish/close errors for compressed outputs.
#[must_use = "call .close() to propagate compression/IO errors"]
pub enum Writer {
    Plain(BufWriter<File>),
    Gz(flate2::write::GzEncoder<File>),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::Plain(f) => f.write(buf),
            Writer::Gz(e) => e.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::Plain(f) => f.flush(),
            Writer::Gz(e) => e.flush(),
        }
    }
}

impl Writer {
    /// Finalize the stream and sync the file.
    pub fn close(self) -> io::Result<()> {
        let file = match self {
            Writer::Plain(f) => f.into_inner().map_err(|e| e.into_error())?,
            Writer::Gz(e) => e.finish()?,
        };
        file.sync_all()
    }
}

pub fn open_writer<P: AsRef<Path>>(path: P) -> io::Result<Writer> {
    let p = path.as_ref();
    let f = File::create(p)?;
    if is_gz(p) {
        let enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        return Ok(Writer::Gz(enc));
    }
    Ok(Writer::Plain(BufWriter::new(f)))
}

/// Compute SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 一時ファイルに書いてから rename する
pub fn write_atomic(path: &Path, s: &str) -> Result<()> {
    let pid = std::process::id();
    let tmp = {
        let ext = path.extension().and_then(OsStr::to_str).unwrap_or("tmp");
        path.with_extension(format!("{ext}.tmp.{pid}"))
    };
    fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
    #[cfg(windows)]
    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// 1行1レコードの JSON で書き出す。書いた件数を返す。
pub fn write_jsonl<'a, T, I>(path: &Path, records: I) -> Result<usize>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut w = open_writer(path).with_context(|| format!("create {}", path.display()))?;
    let mut n = 0usize;
    for r in records {
        serde_json::to_writer(&mut w, r)?;
        w.write_all(b"\n")?;
        n += 1;
    }
    w.close().with_context(|| format!("close {}", path.display()))?;
    Ok(n)
}

pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = open_reader(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))?;
        out.push(rec);
    }
    Ok(out)
}
