//! Collaborators consumed by sessions: credentials, mailing lists, the
//! message spool and the relay queue.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Clear-text password of a user, needed to recompute CRAM-MD5 digests.
    async fn password(&self, username: &str) -> Option<String>;

    async fn authenticate(&self, username: &str, password: &str) -> bool {
        match self.password(username).await {
            Some(stored) => stored == password,
            None => false,
        }
    }

    async fn exists(&self, username: &str) -> bool {
        self.password(username).await.is_some()
    }
}

/// A JSON array of `{ "username", "password" }` records, re-read on every
/// lookup so edits take effect without a restart.
#[derive(Debug, Clone, Default)]
pub struct JsonUserStore {
    path: Option<PathBuf>,
}

impl JsonUserStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    async fn load(&self) -> Vec<UserRecord> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        read_json(path, "user store").await.unwrap_or_default()
    }
}

#[async_trait]
impl UserStore for JsonUserStore {
    async fn password(&self, username: &str) -> Option<String> {
        self.load()
            .await
            .into_iter()
            .find(|user| user.username == username)
            .map(|user| user.password)
    }
}

/// Mailing lists for EXPN, a JSON object mapping list name to members.
#[derive(Debug, Clone, Default)]
pub struct MailingLists {
    path: Option<PathBuf>,
}

impl MailingLists {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub async fn members(&self, list: &str) -> Option<Vec<String>> {
        let path = self.path.as_ref()?;
        let lists: HashMap<String, Vec<String>> = read_json(path, "mailing lists").await?;
        lists
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(list))
            .map(|(_, members)| members)
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Option<T> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("No {} at {:?}", what, path);
            return None;
        }
        Err(e) => {
            error!("Failed to read {} {:?}: {}", what, path, e);
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Malformed {} {:?}: {}", what, path, e);
            None
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a finished message and returns where it was written.
    async fn store(&self, message: &str) -> io::Result<PathBuf>;
}

/// Writes each message to `<uuid>.eml` under a spool directory.
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    root: PathBuf,
}

impl FileMessageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn store(&self, message: &str) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(format!("{}.eml", Uuid::new_v4()));
        tokio::fs::write(&path, message).await?;
        Ok(path)
    }
}

/// Hands persisted messages to the outbound relay.
pub trait RelayQueue: Send + Sync {
    fn enqueue(&self, path: PathBuf);
}

impl RelayQueue for UnboundedSender<PathBuf> {
    fn enqueue(&self, path: PathBuf) {
        if let Err(e) = self.send(path) {
            warn!("Relay queue closed, dropping {:?}", e.0);
        }
    }
}
