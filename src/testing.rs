//! In-memory stand-ins for the ssh executor, transfers and prompts.

use crate::bookmarks::{BookmarkMap, BookmarkStore};
use crate::connection::ResolvedHost;
use crate::error::{RemoteError, RemoteResult};
use crate::models::ConnectionParams;
use crate::remote::cache::Listing;
use crate::remote::lister::{listing_command, UNLISTABLE_SENTINEL};
use crate::remote::{
    DirectoryEntry, ProgressSender, RemoteExecutor, RemoteFileSystemCache, TransferClient,
    TransferEvent,
};
use crate::session::{Connection, Connector};
use crate::upload::ConflictPrompt;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Answers commands from a table and records every call.
///
/// Unknown listing commands report an unlistable directory; any other
/// unknown command succeeds with empty output.
#[derive(Default)]
pub struct FakeExecutor {
    responses: Mutex<HashMap<String, Result<String, String>>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(self, path: &str, raw: &str) -> Self {
        self.set_listing(path, raw);
        self
    }

    pub fn failing(self, command: &str, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), Err(message.to_string()));
        self
    }

    pub fn set_listing(&self, path: &str, raw: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(listing_command(path), Ok(raw.to_string()));
    }

    /// Block listings of `path` until the returned handle is notified.
    pub fn hold_listing(&self, path: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.held
            .lock()
            .unwrap()
            .insert(listing_command(path), notify.clone());
        notify
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn listing_calls(&self, path: &str) -> usize {
        let cmd = listing_command(path);
        self.calls.lock().unwrap().iter().filter(|c| **c == cmd).count()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, command: &str) -> RemoteResult<String> {
        self.calls.lock().unwrap().push(command.to_string());

        let held = self.held.lock().unwrap().remove(command);
        if let Some(notify) = held {
            notify.notified().await;
        }

        let response = self.responses.lock().unwrap().get(command).cloned();
        match response {
            Some(Ok(out)) => Ok(out),
            Some(Err(msg)) => Err(RemoteError::Transport(msg)),
            None if command.starts_with("cd ") => Ok(format!("{}\n", UNLISTABLE_SENTINEL)),
            None => Ok(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCall {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf, is_dir: bool },
}

/// Records transfers; uploads to paths listed in `fail_remote` fail.
#[derive(Default)]
pub struct FakeTransfer {
    calls: Mutex<Vec<TransferCall>>,
    fail_remote: Mutex<Vec<String>>,
}

impl FakeTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upload_to(self, remote: &str) -> Self {
        self.fail_remote.lock().unwrap().push(remote.to_string());
        self
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferClient for FakeTransfer {
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: &ProgressSender,
    ) -> RemoteResult<()> {
        self.calls.lock().unwrap().push(TransferCall::Upload {
            local: local_path.to_path_buf(),
            remote: remote_path.to_string(),
        });
        let _ = progress.try_send(TransferEvent::Progress {
            item: local_path.display().to_string(),
            text: "100%".to_string(),
        });
        if self.fail_remote.lock().unwrap().iter().any(|r| r == remote_path) {
            return Err(RemoteError::Transfer {
                path: local_path.display().to_string(),
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }

    async fn download(
        &self,
        remote_path: &str,
        local_dest: &Path,
        is_dir: bool,
        _progress: &ProgressSender,
    ) -> RemoteResult<()> {
        self.calls.lock().unwrap().push(TransferCall::Download {
            remote: remote_path.to_string(),
            local: local_dest.to_path_buf(),
            is_dir,
        });
        Ok(())
    }
}

/// Replies to conflict prompts from a fixed script; `None` once exhausted.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<Option<String>>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<Option<&str>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(|a| a.map(String::from)).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConflictPrompt for ScriptedPrompt {
    async fn ask_new_name(&self, _target_dir: &str, conflicting: &str) -> Option<String> {
        self.asked.lock().unwrap().push(conflicting.to_string());
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

/// Hands out prepared executors and transfers per alias.
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, (Arc<FakeExecutor>, Arc<FakeTransfer>)>>,
    remaps: Mutex<HashMap<String, (u16, u16)>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, alias: &str, executor: Arc<FakeExecutor>, transfer: Arc<FakeTransfer>) -> Self {
        self.hosts
            .lock()
            .unwrap()
            .insert(alias.to_string(), (executor, transfer));
        self
    }

    /// Report that `alias` was moved from port `from` to `to`.
    pub fn with_remap(self, alias: &str, from: u16, to: u16) -> Self {
        self.remaps.lock().unwrap().insert(alias.to_string(), (from, to));
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, alias: &str) -> anyhow::Result<Connection> {
        let (executor, transfer) = self
            .hosts
            .lock()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Host '{}' not found in SSH config", alias))?;
        let remap = self.remaps.lock().unwrap().get(alias).copied();
        let host = ResolvedHost {
            alias: alias.to_string(),
            params: ConnectionParams {
                hostname: alias.to_string(),
                port: remap.map(|(_, to)| to).unwrap_or(22),
                user: "root".to_string(),
                identity: None,
            },
            remapped_from: remap.map(|(from, _)| from),
        };
        Ok(Connection {
            host,
            executor,
            transfer,
        })
    }
}

/// Bookmark store that never touches the disk.
#[derive(Default)]
pub struct MemoryBookmarkStore {
    map: Mutex<BookmarkMap>,
}

impl BookmarkStore for MemoryBookmarkStore {
    fn load(&self) -> anyhow::Result<BookmarkMap> {
        Ok(self.map.lock().unwrap().clone())
    }

    fn save(&self, map: &BookmarkMap) -> anyhow::Result<()> {
        *self.map.lock().unwrap() = map.clone();
        Ok(())
    }
}

/// Serve `path` from `cache`, fetching and committing inline on a miss.
pub async fn list_through(
    cache: &mut RemoteFileSystemCache,
    path: &str,
) -> RemoteResult<Vec<DirectoryEntry>> {
    match cache.list(path) {
        Listing::Cached(entries) => Ok(entries),
        Listing::Fetch(fetch) => {
            let (ticket, result) = fetch.run().await;
            let entries = result?;
            cache.commit(&ticket, entries.clone());
            Ok(entries)
        }
    }
}
