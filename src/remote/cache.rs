use super::executor::RemoteExecutor;
use super::lister::{self, listing_command};
use super::path::{normalize, shell_quote};
use super::types::{CacheEntry, DirectoryEntry};
use crate::error::RemoteResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Proof that a fetch was started against a particular state of one cache key.
///
/// A result is only committed when the cache was not cleared, the key was
/// not invalidated, and no later fetch of the key was committed since the
/// ticket was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub path: String,
    generation: u64,
    issued: u64,
}

/// Answer to a listing request.
pub enum Listing {
    Cached(Vec<DirectoryEntry>),
    /// Not cached: run the fetch, then hand the result to `commit`.
    Fetch(PendingFetch),
}

/// A listing fetch that owns everything it needs, so it can run on any task.
pub struct PendingFetch {
    pub ticket: FetchTicket,
    executor: Arc<dyn RemoteExecutor>,
}

impl PendingFetch {
    pub async fn run(self) -> (FetchTicket, RemoteResult<Vec<DirectoryEntry>>) {
        let result = fetch_listing(self.executor.as_ref(), &self.ticket.path).await;
        (self.ticket, result)
    }
}

struct Stored {
    issued: u64,
    entry: CacheEntry,
}

/// Path → listing cache in front of the remote executor.
///
/// Entries never expire on their own; staleness is resolved only by
/// `invalidate` or a forced refresh.
pub struct RemoteFileSystemCache {
    executor: Arc<dyn RemoteExecutor>,
    entries: HashMap<String, Stored>,
    /// Clock value of the last invalidation, for keys with no newer entry
    invalidated: HashMap<String, u64>,
    clock: u64,
    generation: u64,
}

impl RemoteFileSystemCache {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            entries: HashMap::new(),
            invalidated: HashMap::new(),
            clock: 0,
            generation: 0,
        }
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        Arc::clone(&self.executor)
    }

    /// Point the cache at a different host. Drops every entry.
    pub fn reset(&mut self, executor: Arc<dyn RemoteExecutor>) {
        self.executor = executor;
        self.invalidate(None);
    }

    pub fn get(&self, path: &str) -> Option<&CacheEntry> {
        self.entries.get(&normalize(path)).map(|stored| &stored.entry)
    }

    pub fn cached(&self, path: &str) -> Option<Vec<DirectoryEntry>> {
        self.get(path).map(|entry| entry.entries.clone())
    }

    /// Cached entries for `path`, or the fetch that will produce them.
    /// The fetch result is stored by `commit`.
    pub fn list(&mut self, path: &str) -> Listing {
        let key = normalize(path);
        if let Some(stored) = self.entries.get(&key) {
            debug!(
                "Cache hit for {} ({:?} old)",
                stored.entry.path,
                stored.entry.fetched_at.elapsed()
            );
            return Listing::Cached(stored.entry.entries.clone());
        }
        debug!("Cache miss for {}", key);
        Listing::Fetch(PendingFetch {
            ticket: self.ticket(&key),
            executor: self.executor(),
        })
    }

    pub fn ticket(&mut self, path: &str) -> FetchTicket {
        let issued = self.clock;
        self.clock += 1;
        FetchTicket {
            path: normalize(path),
            generation: self.generation,
            issued,
        }
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation
            && self
                .invalidated
                .get(&ticket.path)
                .map_or(true, |&at| ticket.issued >= at)
            && self
                .entries
                .get(&ticket.path)
                .map_or(true, |stored| stored.issued <= ticket.issued)
    }

    /// Store a fetched listing if its ticket is still current.
    pub fn commit(&mut self, ticket: &FetchTicket, entries: Vec<DirectoryEntry>) -> bool {
        if !self.is_current(ticket) {
            debug!("Discarding stale listing for {}", ticket.path);
            return false;
        }
        // The new entry now rejects anything issued before it
        self.invalidated.remove(&ticket.path);
        self.entries.insert(
            ticket.path.clone(),
            Stored {
                issued: ticket.issued,
                entry: CacheEntry {
                    path: ticket.path.clone(),
                    entries,
                    fetched_at: Instant::now(),
                },
            },
        );
        true
    }

    /// Evict one path, or everything when `path` is `None`.
    pub fn invalidate(&mut self, path: Option<&str>) {
        match path {
            Some(path) => {
                let key = normalize(path);
                debug!("Invalidating cache for {}", key);
                self.entries.remove(&key);
                self.clock += 1;
                self.invalidated.insert(key, self.clock);
            }
            None => {
                debug!("Clearing remote cache");
                self.entries.clear();
                self.invalidated.clear();
                self.generation += 1;
            }
        }
    }

    /// Move `old_path` to `new_path`. Callers invalidate the parents.
    pub fn rename(
        &self,
        old_path: &str,
        new_path: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send + 'static {
        let executor = self.executor();
        let cmd = format!("mv {} {}", shell_quote(old_path), shell_quote(new_path));
        async move { executor.run(&cmd).await.map(|_| ()) }
    }

    /// Recursively remove `path`. Callers invalidate the parent.
    pub fn delete(&self, path: &str) -> impl Future<Output = RemoteResult<()>> + Send + 'static {
        let executor = self.executor();
        let path = path.to_string();
        async move { delete_path(executor.as_ref(), &path).await }
    }
}

/// Fetch a listing straight from the host, bypassing any cache.
pub async fn fetch_listing(
    executor: &dyn RemoteExecutor,
    path: &str,
) -> RemoteResult<Vec<DirectoryEntry>> {
    let output = executor.run(&listing_command(path)).await?;
    Ok(lister::parse(&output))
}

pub async fn delete_path(executor: &dyn RemoteExecutor, path: &str) -> RemoteResult<()> {
    let cmd = format!("rm -rf {}", shell_quote(path));
    executor.run(&cmd).await.map(|_| ())
}
