//! Hash-chained JSONL audit trail with daily rotation.
//!
//! Every committed decision becomes one line `{"hash": ..., "record": {...}}`
//! in `<stem>-YYYY-MM-DD.<ext>` next to the configured base path, where
//! `hash` is the SHA-256 of the exact `record` text. Each record carries the
//! hash of its predecessor, across day boundaries; the first record ever
//! links to [`GENESIS_HASH`].

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use folio::{ObjectiveKind, Symbol};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

use crate::error::AuditError;

/// Predecessor hash of the very first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One rebalancing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub timestamp: DateTime<Utc>,
    pub weights: BTreeMap<Symbol, f64>,
    pub expected_return: f64,
    pub expected_volatility: f64,
    pub sharpe_ratio: f64,
    pub objective: ObjectiveKind,
    pub target_sharpe: Option<f64>,
    pub execution_time_ms: f64,
    pub input_data_hash: String,
    pub config_hash: String,
    /// Filled in by [`AuditLogger::log_rebalance_decision`].
    pub previous_record_hash: String,
}

#[derive(Deserialize)]
struct AuditLine<'a> {
    hash: String,
    #[serde(borrow)]
    record: &'a RawValue,
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Append-only, hash-chained audit logger.
pub struct AuditLogger {
    base: PathBuf,
    head: String,
    current: Option<(NaiveDate, File)>,
}

impl AuditLogger {
    /// Recover the chain head from existing rotation files. Files are
    /// opened lazily on the first write.
    pub fn open(base: &Path) -> Result<Self, AuditError> {
        let head = recover_head(base)?;
        debug!("audit chain head for {}: {head}", base.display());
        Ok(Self {
            base: base.to_path_buf(),
            head,
            current: None,
        })
    }

    /// Hash of the last committed record.
    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Link `record` to the chain head, then hash and durably append it.
    /// Returns its hash.
    ///
    /// The chain head only advances once the line is flushed and synced.
    pub fn log_rebalance_decision(
        &mut self,
        record: &mut RebalanceRecord,
    ) -> Result<String, AuditError> {
        record.previous_record_hash = self.head.clone();
        let json = serde_json::to_string(record)?;
        let hash = sha256_hex(&json);
        let line = format!("{{\"hash\":\"{hash}\",\"record\":{json}}}\n");

        let date = record.timestamp.date_naive();
        let path = rotation_path(&self.base, date);
        let file = self.file_for(date, &path)?;
        let written = append_or_rollback(file, |f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            self.current = None;
            return Err(AuditError::io(path, e));
        }

        self.head = hash.clone();
        Ok(hash)
    }

    fn file_for(&mut self, date: NaiveDate, path: &Path) -> Result<&mut File, AuditError> {
        if self.current.as_ref().is_none_or(|(d, _)| *d != date) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| AuditError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AuditError::io(path, e))?;
            info!("audit log now writing {}", path.display());
            self.current = Some((date, file));
        }
        match &mut self.current {
            Some((_, file)) => Ok(file),
            None => Err(AuditError::io(
                path,
                std::io::Error::other("audit file not open"),
            )),
        }
    }

    /// Sync and release the current file.
    pub fn close(&mut self) -> Result<(), AuditError> {
        if let Some((date, file)) = self.current.take() {
            file.sync_all()
                .map_err(|e| AuditError::io(rotation_path(&self.base, date), e))?;
        }
        Ok(())
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Run `write`, then flush and sync. On any failure the file is truncated
/// back to its previous length so no partial line is left behind.
fn append_or_rollback<F>(file: &mut File, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let len = file.metadata()?.len();
    let result = write(&mut *file)
        .and_then(|()| file.flush())
        .and_then(|()| file.sync_data());
    if let Err(e) = result {
        if let Err(undo) = file.set_len(len).and_then(|()| file.sync_data()) {
            warn!("audit rollback to {len} bytes failed: {undo}");
        }
        return Err(e);
    }
    Ok(())
}

/// `<dir>/<stem>-YYYY-MM-DD.<ext>` for `base = <dir>/<stem>.<ext>`.
pub fn rotation_path(base: &Path, date: NaiveDate) -> PathBuf {
    let stem = base
        .file_stem()
        .map_or("audit".into(), |s| s.to_string_lossy());
    let name = match base.extension() {
        Some(ext) => format!("{stem}-{date}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{date}"),
    };
    base.with_file_name(name)
}

/// Existing rotation files for `base`, oldest first.
pub fn rotation_files(base: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, AuditError> {
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let stem = base
        .file_stem()
        .map_or("audit".into(), |s| s.to_string_lossy())
        .into_owned();
    let suffix = base
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let prefix = format!("{stem}-");

    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| AuditError::io(&dir, e))? {
        let entry = entry.map_err(|e| AuditError::io(&dir, e))?;
        let name = entry.file_name();
        let Some(date) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|n| n.strip_suffix(suffix.as_str()))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        files.push((date, entry.path()));
    }
    files.sort();
    Ok(files)
}

fn parse_line<'a>(path: &Path, lineno: usize, line: &'a str) -> Result<AuditLine<'a>, AuditError> {
    let corrupt = |reason: String| AuditError::Corrupt {
        path: path.to_path_buf(),
        line: lineno,
        reason,
    };
    let parsed: AuditLine = serde_json::from_str(line).map_err(|e| corrupt(e.to_string()))?;
    let actual = sha256_hex(parsed.record.get());
    if actual != parsed.hash {
        return Err(corrupt(format!(
            "stored hash {} does not match record hash {actual}",
            parsed.hash
        )));
    }
    Ok(parsed)
}

fn recover_head(base: &Path) -> Result<String, AuditError> {
    for (_, path) in rotation_files(base)?.into_iter().rev() {
        let contents = fs::read_to_string(&path).map_err(|e| AuditError::io(&path, e))?;
        let last = contents
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .last();
        if let Some((i, line)) = last {
            return Ok(parse_line(&path, i + 1, line)?.hash);
        }
    }
    Ok(GENESIS_HASH.to_string())
}

/// Outcome of a successful [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub files: usize,
    pub records: usize,
    pub head: String,
}

/// Walk every record in order, checking each hash and each back-link.
pub fn verify_chain(base: &Path) -> Result<ChainReport, AuditError> {
    walk(base, |_| {})
}

/// Every record in chain order, verified.
pub fn read_records(base: &Path) -> Result<Vec<RebalanceRecord>, AuditError> {
    let mut records = Vec::new();
    walk(base, |record| records.push(record))?;
    Ok(records)
}

fn walk<F>(base: &Path, mut visit: F) -> Result<ChainReport, AuditError>
where
    F: FnMut(RebalanceRecord),
{
    let mut report = ChainReport {
        files: 0,
        records: 0,
        head: GENESIS_HASH.to_string(),
    };
    for (_, path) in rotation_files(base)? {
        report.files += 1;
        let contents = fs::read_to_string(&path).map_err(|e| AuditError::io(&path, e))?;
        for (i, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = parse_line(&path, i + 1, line)?;
            let record: RebalanceRecord =
                serde_json::from_str(parsed.record.get()).map_err(|e| AuditError::Corrupt {
                    path: path.clone(),
                    line: i + 1,
                    reason: e.to_string(),
                })?;
            if record.previous_record_hash != report.head {
                return Err(AuditError::Corrupt {
                    path: path.clone(),
                    line: i + 1,
                    reason: format!(
                        "links to {} but previous record is {}",
                        record.previous_record_hash, report.head
                    ),
                });
            }
            visit(record);
            report.records += 1;
            report.head = parsed.hash;
        }
    }
    Ok(report)
}
