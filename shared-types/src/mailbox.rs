//! Filesystem mailbox for a live worker.
//!
//! Layout under the mailbox root:
//!
//! ```text
//! <root>/01J9Z3...json   one record per follow-up message, ULID-named
//! <root>/_close          close sentinel, no required content
//! ```
//!
//! The hypervisor only publishes records and the close sentinel; the worker
//! only drains and removes them. Records are written to a dotfile first and
//! renamed into place so a drain never observes a half-written record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};
use ulid::Generator;

use crate::{MailboxMessage, MailboxMessageKind};

pub const CLOSE_SENTINEL: &str = "_close";
const RECORD_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode mailbox record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record name generator exhausted for this millisecond")]
    NameExhausted,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MailboxError + '_ {
    move |source| MailboxError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Monotonic record names shared by every mailbox in this process.
fn next_record_name() -> Result<String, MailboxError> {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut guard = generator.lock().unwrap_or_else(|e| e.into_inner());
    let ulid = guard
        .generate()
        .map_err(|_| MailboxError::NameExhausted)?;
    Ok(format!("{ulid}.{RECORD_EXTENSION}"))
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
}

impl Mailbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sentinel_path(&self) -> PathBuf {
        self.root.join(CLOSE_SENTINEL)
    }

    async fn ensure_root(&self) -> Result<(), MailboxError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))
    }

    /// Publish one follow-up message. Returns the record path.
    pub async fn publish(&self, text: &str) -> Result<PathBuf, MailboxError> {
        self.ensure_root().await?;

        let name = next_record_name()?;
        let body = serde_json::to_vec(&MailboxMessage::text(text))?;
        let tmp = self.root.join(format!(".{name}.tmp"));
        let path = self.root.join(&name);

        tokio::fs::write(&tmp, &body).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_err(&path))?;

        debug!(mailbox = %self.root.display(), record = %name, "mailbox message published");
        Ok(path)
    }

    /// Take every pending message in publish order.
    ///
    /// Each record is read and deleted before it is parsed; malformed records
    /// are logged and skipped, never retried. A record that cannot be read or
    /// removed is left in place and skipped so the rest still come through.
    pub async fn drain(&self) -> Result<Vec<String>, MailboxError> {
        let mut names = self.record_names().await?;
        names.sort();

        let mut texts = Vec::with_capacity(names.len());
        for name in names {
            let path = self.root.join(&name);
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(record = %name, error = %e, "skipping unreadable mailbox record");
                    continue;
                }
            };
            if let Err(e) = remove_if_present(&path).await {
                warn!(record = %name, error = %e, "skipping mailbox record that cannot be removed");
                continue;
            }

            match serde_json::from_slice::<MailboxMessage>(&raw) {
                Ok(msg) if msg.kind == MailboxMessageKind::Message => texts.push(msg.text),
                Ok(_) => debug!(record = %name, "skipping mailbox record of unknown type"),
                Err(e) => warn!(record = %name, error = %e, "dropping malformed mailbox record"),
            }
        }
        Ok(texts)
    }

    /// Create the close sentinel. Creating it twice is harmless.
    pub async fn request_close(&self) -> Result<(), MailboxError> {
        self.ensure_root().await?;
        let path = self.sentinel_path();
        tokio::fs::write(&path, b"").await.map_err(io_err(&path))?;
        debug!(mailbox = %self.root.display(), "close sentinel written");
        Ok(())
    }

    /// Consume the close sentinel, returning whether it was present.
    pub async fn poll_close(&self) -> Result<bool, MailboxError> {
        let path = self.sentinel_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Remove the sentinel and every pending record left by a previous worker.
    /// Returns the number of message records discarded.
    pub async fn reset(&self) -> Result<usize, MailboxError> {
        let names = self.record_names().await?;
        for name in &names {
            remove_if_present(&self.root.join(name)).await?;
        }
        remove_if_present(&self.sentinel_path()).await?;
        Ok(names.len())
    }

    async fn record_names(&self) -> Result<Vec<String>, MailboxError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.ensure_root().await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.root))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == CLOSE_SENTINEL {
                continue;
            }
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                warn!(mailbox = %self.root.display(), entry = %name, "ignoring directory in mailbox");
                continue;
            }
            if Path::new(&name).extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), MailboxError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}
