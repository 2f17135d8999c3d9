//! Per-agent postbox store: inbox, outbox, and append-only task log.
//!
//! Layout under the postbox root:
//!
//! ```text
//! <root>/<AGENT>/inbox/<seq>_<message_id>.json
//! <root>/<AGENT>/outbox/<seq>_<message_id>.json
//! <root>/<AGENT>/task_log.jsonl
//! ```
//!
//! Each message is one file; `<seq>` is a zero-padded nanosecond timestamp
//! plus a process-local counter, so lexicographic filename order is arrival
//! order. Message writes go to a dot-prefixed temp file in the same
//! directory and are renamed into place, so a reader listing the directory
//! never observes a partially written message and a crash mid-write leaves
//! the previous contents intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::envelope::{is_agent_token, Envelope, EnvelopeError};

/// Errors from postbox storage operations.
#[derive(Debug, Error)]
pub enum PostboxError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed message at {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: EnvelopeError,
    },

    #[error("invalid agent name {0:?} (expected an uppercase token)")]
    InvalidAgent(String),
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PostboxError {
    let path = path.into();
    move |source| PostboxError::Io { path, source }
}

/// A raw message file in an inbox or outbox, before decoding.
#[derive(Debug, Clone)]
pub struct MessageFile {
    pub path: PathBuf,
    pub contents: String,
}

/// File-backed postbox store rooted at a directory.
///
/// The store is cheap to clone-by-reopen and safe to share between the
/// orchestrator, the router, and external agent processes; every mutation
/// is a single atomic rename or an appending write.
#[derive(Debug, Clone)]
pub struct PostboxStore {
    root: PathBuf,
}

/// Process-local tie-breaker for messages written within the same
/// nanosecond.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

impl PostboxStore {
    /// Open (and create if absent) a postbox store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PostboxError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory skeleton for an agent.
    pub fn ensure_agent(&self, agent: &str) -> Result<(), PostboxError> {
        let dir = self.agent_dir(agent)?;
        fs::create_dir_all(dir.join("inbox")).map_err(io_err(dir.join("inbox")))?;
        fs::create_dir_all(dir.join("outbox")).map_err(io_err(dir.join("outbox")))?;
        Ok(())
    }

    /// Agents that currently have a postbox directory, sorted by name.
    pub fn list_agents(&self) -> Result<Vec<String>, PostboxError> {
        let mut agents = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && is_agent_token(&name) {
                agents.push(name);
            }
        }
        agents.sort();
        Ok(agents)
    }

    /// Append an envelope to the agent's inbox.
    pub fn enqueue_inbox(&self, agent: &str, envelope: &Envelope) -> Result<(), PostboxError> {
        self.write_message(agent, "inbox", envelope)
    }

    /// Append an envelope to the agent's outbox.
    pub fn enqueue_outbox(&self, agent: &str, envelope: &Envelope) -> Result<(), PostboxError> {
        self.write_message(agent, "outbox", envelope)
    }

    /// Atomically return and remove all pending inbox messages, oldest
    /// first.
    pub fn drain_inbox(&self, agent: &str) -> Result<Vec<Envelope>, PostboxError> {
        self.drain(agent, "inbox")
    }

    /// Atomically return and remove all pending outbox messages, oldest
    /// first.
    pub fn drain_outbox(&self, agent: &str) -> Result<Vec<Envelope>, PostboxError> {
        self.drain(agent, "outbox")
    }

    /// List the agent's outbox without consuming it, oldest first. Used by
    /// the router, which must leave undeliverable messages in place.
    pub fn outbox_files(&self, agent: &str) -> Result<Vec<MessageFile>, PostboxError> {
        let dir = self.agent_dir(agent)?.join("outbox");
        self.read_message_files(&dir)
    }

    /// Remove and return the first outbox message matching `pred`, leaving
    /// everything else untouched. Malformed files are skipped.
    pub fn take_outbox_where(
        &self,
        agent: &str,
        pred: impl Fn(&Envelope) -> bool,
    ) -> Result<Option<Envelope>, PostboxError> {
        let dir = self.agent_dir(agent)?.join("outbox");
        for file in self.read_message_files(&dir)? {
            let Ok(envelope) = Envelope::decode(&file.contents) else {
                tracing::warn!(path = %file.path.display(), "skipping malformed outbox message");
                continue;
            };
            if pred(&envelope) {
                self.remove(&file.path)?;
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }

    /// Remove a message file previously returned by [`Self::outbox_files`].
    pub fn remove(&self, path: &Path) -> Result<(), PostboxError> {
        fs::remove_file(path).map_err(io_err(path))
    }

    /// Durable append to the agent's task log (one JSON object per line).
    pub fn append_task_log(
        &self,
        agent: &str,
        entry: &serde_json::Value,
    ) -> Result<(), PostboxError> {
        let dir = self.agent_dir(agent)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join("task_log.jsonl");
        let mut line = entry.to_string();
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.write_all(line.as_bytes()).map_err(io_err(&path))?;
        file.sync_data().map_err(io_err(&path))?;
        Ok(())
    }

    /// Read the agent's task log back as parsed JSON lines.
    pub fn read_task_log(&self, agent: &str) -> Result<Vec<serde_json::Value>, PostboxError> {
        let path = self.agent_dir(agent)?.join("task_log.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).map_err(io_err(&path))?;
        let mut entries = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let value = serde_json::from_str(line).map_err(|source| PostboxError::Codec {
                path: path.clone(),
                source: EnvelopeError::Json(source),
            })?;
            entries.push(value);
        }
        Ok(entries)
    }

    // -- internals ----------------------------------------------------------

    fn agent_dir(&self, agent: &str) -> Result<PathBuf, PostboxError> {
        if !is_agent_token(agent) {
            return Err(PostboxError::InvalidAgent(agent.to_owned()));
        }
        Ok(self.root.join(agent))
    }

    fn write_message(
        &self,
        agent: &str,
        stream: &str,
        envelope: &Envelope,
    ) -> Result<(), PostboxError> {
        let dir = self.agent_dir(agent)?.join(stream);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let encoded = envelope.encode().map_err(|source| PostboxError::Codec {
            path: dir.clone(),
            source,
        })?;

        let name = message_file_name(&envelope.message_id);
        let tmp = dir.join(format!(".tmp-{}", envelope.message_id));
        let dest = dir.join(name);

        fs::write(&tmp, encoded).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &dest).map_err(io_err(&dest))?;
        Ok(())
    }

    fn drain(&self, agent: &str, stream: &str) -> Result<Vec<Envelope>, PostboxError> {
        let dir = self.agent_dir(agent)?.join(stream);
        let files = self.read_message_files(&dir)?;
        let mut envelopes = Vec::with_capacity(files.len());
        for file in files {
            let envelope =
                Envelope::decode(&file.contents).map_err(|source| PostboxError::Codec {
                    path: file.path.clone(),
                    source,
                })?;
            self.remove(&file.path)?;
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    fn read_message_files(&self, dir: &Path) -> Result<Vec<MessageFile>, PostboxError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Dot-prefixed files are in-progress writes.
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            paths.push(entry.path());
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = fs::read_to_string(&path).map_err(io_err(&path))?;
            files.push(MessageFile { path, contents });
        }
        Ok(files)
    }
}

/// Filename whose lexicographic order is arrival order: zero-padded
/// nanosecond timestamp, a process-local counter, and the message id.
fn message_file_name(message_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:020}_{seq:06}_{message_id}.json")
}
