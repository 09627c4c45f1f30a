// store.rs — Durable receipt stores.
//
// The ledger needs exactly one guarantee from storage: once `append` returns
// Ok, the receipt can be read back, including after a crash. The backing
// technology is pluggable through `ReceiptStore`.
//
// `JsonlReceiptStore` keeps one JSON receipt per line in an append-only file
// and calls `sync_data` before acknowledging a write. A write that fails
// partway is truncated away; if that is impossible the store stops accepting
// writes, since a stray line would fork the episode's chain. `MemoryReceiptStore` is
// for tests and ephemeral deployments.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::LedgerError;
use crate::receipt::Receipt;

/// Append-only, read-after-write durable receipt storage.
pub trait ReceiptStore: Send + Sync {
    /// Persist a receipt. Must not return Ok until the write is durable.
    fn append(&self, receipt: &Receipt) -> Result<(), LedgerError>;

    /// Every stored receipt, in append order.
    fn read_all(&self) -> Result<Vec<Receipt>, LedgerError>;

    /// The receipts of one episode, in append order.
    fn read_episode(&self, episode_id: &str) -> Result<Vec<Receipt>, LedgerError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.episode_id == episode_id)
            .collect())
    }
}

/// A receipt store backed by a JSONL file.
///
/// Each receipt is written with a single unbuffered `write_all` and then
/// `sync_data`, so nothing from a failed append lingers in memory to be
/// flushed by the next one.
pub struct JsonlReceiptStore {
    path: PathBuf,
    writer: Mutex<JsonlWriter>,
}

struct JsonlWriter {
    file: File,
    failed: bool,
}

impl JsonlReceiptStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| LedgerError::OpenFailed {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        // Open in append mode — this ensures we never overwrite existing data.
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            writer: Mutex::new(JsonlWriter {
                file,
                failed: false,
            }),
        })
    }

    /// Read every receipt from a JSONL file without opening it for writing.
    ///
    /// Returns them in order (oldest first). Skips blank lines gracefully.
    pub fn read_path(path: impl AsRef<Path>) -> Result<Vec<Receipt>, LedgerError> {
        let file = File::open(path.as_ref()).map_err(|source| LedgerError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut receipts = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let receipt: Receipt =
                serde_json::from_str(&line).map_err(|e| LedgerError::CorruptStore {
                    line: line_num + 1,
                    reason: e.to_string(),
                })?;
            receipts.push(receipt);
        }

        Ok(receipts)
    }

    /// Return the path to the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReceiptStore for JsonlReceiptStore {
    fn append(&self, receipt: &Receipt) -> Result<(), LedgerError> {
        // Serialize to a single JSON line (no pretty-printing).
        let mut line = serde_json::to_string(receipt)?;
        line.push('\n');

        let mut writer = self.writer.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let JsonlWriter { file, failed } = &mut *writer;
        if *failed {
            return Err(LedgerError::StoreFailed {
                path: self.path.clone(),
            });
        }

        let before = file.metadata()?.len();
        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            if let Err(truncate) = file.set_len(before) {
                *failed = true;
                tracing::error!(
                    path = %self.path.display(),
                    error = %truncate,
                    "could not roll back a failed receipt write; store disabled"
                );
            }
            return Err(LedgerError::WriteFailed(e));
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Receipt>, LedgerError> {
        // Hold the writer lock so we never observe a half-written line.
        let _guard = self.writer.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Self::read_path(&self.path)
    }
}

/// In-memory receipt store.
#[derive(Default)]
pub struct MemoryReceiptStore {
    receipts: Mutex<Vec<Receipt>>,
}

impl MemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReceiptStore for MemoryReceiptStore {
    fn append(&self, receipt: &Receipt) -> Result<(), LedgerError> {
        self.receipts
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?
            .push(receipt.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Receipt>, LedgerError> {
        Ok(self
            .receipts
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?
            .clone())
    }
}
