//! Per-user persisted documents behind a small load/save-by-key seam.
//!
//! Each document is one JSON value, atomically replaced on save
//! (write `<name>.json.tmp`, flush, fsync, rename).  Documents are
//! independent: there is no cross-file transaction.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use confidant_config::MoodConfig;

use crate::facts::FactsFile;
use crate::metadata::SessionMetadata;
use crate::mood::Mood;
use crate::summaries::SummariesFile;

/// The four per-user documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    Metadata,
    Facts,
    Summaries,
    ProactiveQueue,
}

impl Document {
    pub fn key(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Facts => "facts",
            Self::Summaries => "summaries",
            Self::ProactiveQueue => "proactive",
        }
    }
}

/// Raw byte storage keyed by `(user, document)`.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `Ok(None)` when the document has never been written.
    async fn read(&self, user: &str, doc: Document) -> Result<Option<Vec<u8>>>;
    async fn write(&self, user: &str, doc: Document, bytes: &[u8]) -> Result<()>;
    /// Users that have at least one stored document.
    async fn list_users(&self) -> Result<Vec<String>>;
}

// ── File backend ─────────────────────────────────────────────────────────────

/// `{root}/users/{user}/{document}.json`
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    fn path_for(&self, user: &str, doc: Document) -> Result<PathBuf> {
        if user.is_empty() {
            bail!("empty user id");
        }
        Ok(self
            .users_dir()
            .join(encode_segment(user))
            .join(format!("{}.json", doc.key())))
    }
}

/// Bytes left as-is in a user directory name; everything else, `.` and
/// `%` included, is percent-encoded so distinct ids never share a folder.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

fn encode_segment(user: &str) -> String {
    utf8_percent_encode(user, SEGMENT).to_string()
}

fn decode_segment(name: &str) -> Option<String> {
    percent_decode_str(name).decode_utf8().ok().map(|s| s.into_owned())
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn read(&self, user: &str, doc: Document) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(user, doc)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write(&self, user: &str, doc: Document, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(user, doc)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = path.with_file_name(format!("{}.json.tmp", doc.key()));
        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err).with_context(|| format!("failed to write {}", tmp_path.display()));
        }

        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "state document saved");
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        let dir = self.users_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()));
            }
        };

        let mut users = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match decode_segment(&name.to_string_lossy()) {
                Some(user) if !user.is_empty() => users.push(user),
                _ => warn!(dir = %name.to_string_lossy(), "skipping undecodable user directory"),
            }
        }
        users.sort();
        Ok(users)
    }
}

// ── Typed store ──────────────────────────────────────────────────────────────

/// Typed load/save over any [`StateBackend`].
pub struct StateStore {
    backend: Box<dyn StateBackend>,
    baseline_mood: Mood,
}

impl StateStore {
    pub fn new(backend: impl StateBackend + 'static, mood: &MoodConfig) -> Self {
        Self {
            backend: Box::new(backend),
            baseline_mood: Mood::baseline(mood),
        }
    }

    /// File-backed store rooted at `state_dir`.
    pub fn open(state_dir: impl Into<PathBuf>, mood: &MoodConfig) -> Self {
        Self::new(FileBackend::new(state_dir), mood)
    }

    /// Load a document; missing or undecodable content yields `T::default()`.
    pub async fn load<T>(&self, user: &str, doc: Document) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let Some(bytes) = self.backend.read(user, doc).await? else {
            return Ok(T::default());
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(user, doc = doc.key(), %err, "corrupt state document, using empty value");
                Ok(T::default())
            }
        }
    }

    pub async fn save<T: Serialize + Sync>(
        &self,
        user: &str,
        doc: Document,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to encode {} for {user}", doc.key()))?;
        self.backend.write(user, doc, &bytes).await
    }

    pub async fn load_metadata(&self, user: &str) -> Result<SessionMetadata> {
        let mut meta: SessionMetadata = self.load(user, Document::Metadata).await?;
        if meta.baseline_mood.is_none() {
            meta.baseline_mood = Some(self.baseline_mood);
        }
        Ok(meta)
    }

    pub async fn save_metadata(&self, user: &str, meta: &SessionMetadata) -> Result<()> {
        self.save(user, Document::Metadata, meta).await
    }

    pub async fn load_facts(&self, user: &str) -> Result<FactsFile> {
        self.load(user, Document::Facts).await
    }

    pub async fn save_facts(&self, user: &str, facts: &FactsFile) -> Result<()> {
        self.save(user, Document::Facts, facts).await
    }

    pub async fn load_summaries(&self, user: &str) -> Result<SummariesFile> {
        self.load(user, Document::Summaries).await
    }

    pub async fn save_summaries(&self, user: &str, summaries: &SummariesFile) -> Result<()> {
        self.save(user, Document::Summaries, summaries).await
    }

    pub async fn known_users(&self) -> Result<Vec<String>> {
        self.backend.list_users().await
    }
}
