//! Session coordinator
//!
//! A single task owns the listing cache, the folder tree, the flat view and
//! the bookmarks of the active connection. Callers talk to it through
//! [`SessionHandle`], which sends commands over an mpsc channel and waits on a
//! oneshot reply.
//!
//! Remote work (listings, mutations, transfers, connecting) runs in a
//! `JoinSet` owned by the task, and completions come back through the same
//! loop, so cache and tree writes never overlap. Every completion carries the
//! connection generation it was started under; a host switch aborts the set
//! and bumps the generation, so anything that still arrives late is dropped.
//! Only one listing per path is in flight at a time; later requests for the
//! same path wait on it.

use crate::bookmarks::Bookmarks;
use crate::config::AppConfig;
use crate::connection::{ConnectionResolver, ResolvedHost};
use crate::error::{RemoteError, RemoteResult};
use crate::remote::cache::{self, FetchTicket, Listing};
use crate::remote::path;
use crate::remote::{
    DirectoryEntry, EntryKind, PendingTransfer, ProgressSender, RemoteExecutor,
    RemoteFileSystemCache, RsyncTransfer, SshExecutor, SshOptions, TransferClient, TransferEvent,
};
use crate::tree::{ExpandTicket, LoadState, TreeSyncController};
use crate::upload::{ConflictPrompt, UploadConflictResolver};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Executor and transfer client for one connected host.
pub struct Connection {
    pub host: ResolvedHost,
    pub executor: Arc<dyn RemoteExecutor>,
    pub transfer: Arc<dyn TransferClient>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, alias: &str) -> Result<Connection>;
}

/// Connects through the system ssh client and rsync.
pub struct SshConnector {
    resolver: ConnectionResolver,
    options: SshOptions,
    skip_compress: Vec<String>,
}

impl SshConnector {
    pub fn new(resolver: ConnectionResolver, config: &AppConfig) -> Self {
        Self {
            resolver,
            options: SshOptions::new(
                &config.ssh_binary,
                config.command_timeout(),
                config.control_persist_secs,
            ),
            skip_compress: config.skip_compress.clone(),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, alias: &str) -> Result<Connection> {
        let host = self.resolver.resolve(alias).await?;
        info!(
            "Connecting to {} ({} port {})",
            alias,
            host.params.destination(),
            host.params.port
        );

        let executor = SshExecutor::new(host.params.clone(), self.options.clone());
        // Opens the control master so later commands reuse it
        executor
            .run("true")
            .await
            .with_context(|| format!("Could not reach {}", alias))?;

        let transfer = RsyncTransfer::new(
            host.params.clone(),
            self.options.clone(),
            self.skip_compress.clone(),
        );
        Ok(Connection {
            host,
            executor: Arc::new(executor),
            transfer: Arc::new(transfer),
        })
    }
}

/// Stands in for the executor until a host is connected.
struct NotConnected;

#[async_trait]
impl RemoteExecutor for NotConnected {
    async fn run(&self, _command: &str) -> RemoteResult<String> {
        Err(RemoteError::Transport("Not connected".to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connecting(String),
    Connected(ResolvedHost),
    /// Informational, e.g. a port remap
    Notice(String),
    Error(String),
    /// The flat view now shows `entries` for `path`
    Listing {
        path: String,
        entries: Vec<DirectoryEntry>,
    },
    TreeChanged {
        path: String,
    },
    Transfer(TransferEvent),
}

/// Per-item outcome of one upload batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub completed: Vec<PendingTransfer>,
    pub failed: Vec<(PendingTransfer, String)>,
    pub skipped: Vec<PathBuf>,
    pub overwritten: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub depth: usize,
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub state: LoadState,
    pub expandable: bool,
}

/// Where a tree walk towards a path ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreePosition {
    pub reached: String,
    pub complete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub host: Option<String>,
    pub current_path: String,
    pub entries: Vec<DirectoryEntry>,
}

type Reply<T> = oneshot::Sender<T>;
type ListingReply = Reply<RemoteResult<Vec<DirectoryEntry>>>;

enum SessionCommand {
    SwitchHost {
        alias: String,
        reply: Reply<Result<ResolvedHost>>,
    },
    Navigate {
        path: String,
        reply: ListingReply,
    },
    GoUp {
        reply: ListingReply,
    },
    Refresh {
        force: bool,
        reply: ListingReply,
    },
    List {
        path: String,
        reply: ListingReply,
    },
    Invalidate {
        path: Option<String>,
    },
    Cached {
        path: String,
        reply: Reply<Option<Vec<DirectoryEntry>>>,
    },
    Expand {
        path: String,
        reply: Reply<RemoteResult<bool>>,
    },
    Collapse {
        path: String,
    },
    TreeNavigate {
        path: String,
        reply: Reply<TreePosition>,
    },
    TreeRows {
        reply: Reply<Vec<TreeRow>>,
    },
    Rename {
        path: String,
        new_name: String,
        reply: Reply<RemoteResult<String>>,
    },
    Delete {
        path: String,
        reply: Reply<RemoteResult<String>>,
    },
    Upload {
        items: Vec<PathBuf>,
        target_dir: String,
        reply: Reply<RemoteResult<UploadReport>>,
    },
    Download {
        remote_path: String,
        local_dest: PathBuf,
        is_dir: bool,
        reply: Reply<RemoteResult<()>>,
    },
    AddBookmark {
        path: Option<String>,
        reply: Reply<Result<bool>>,
    },
    RemoveBookmark {
        path: String,
        reply: Reply<Result<bool>>,
    },
    Bookmarks {
        reply: Reply<Vec<String>>,
    },
    View {
        reply: Reply<ViewState>,
    },
    Shutdown,
}

/// Output of a worker, applied by the coordinator.
enum Completion {
    Connected {
        generation: u64,
        alias: String,
        result: Result<Connection>,
        reply: Reply<Result<ResolvedHost>>,
    },
    Listing {
        generation: u64,
        ticket: FetchTicket,
        result: RemoteResult<Vec<DirectoryEntry>>,
    },
    Mutated {
        generation: u64,
        /// Directories whose contents changed
        touched: Vec<String>,
        /// Path that no longer exists on success
        gone: String,
        outcome: RemoteResult<String>,
        reply: Reply<RemoteResult<String>>,
    },
    Uploaded {
        generation: u64,
        target_dir: String,
        result: RemoteResult<UploadReport>,
        reply: Reply<RemoteResult<UploadReport>>,
    },
    Downloaded {
        generation: u64,
        result: RemoteResult<()>,
        reply: Reply<RemoteResult<()>>,
    },
}

/// Someone waiting on a listing.
enum Waiter {
    List(ListingReply),
    /// Show the result in the flat view if its path is still current
    View(Option<ListingReply>),
    /// Finish a tree load; `None` just waits for the in-flight one
    Tree {
        ticket: Option<ExpandTicket>,
        reply: Option<Reply<RemoteResult<bool>>>,
    },
}

struct InFlight {
    ticket: FetchTicket,
    waiters: Vec<Waiter>,
}

struct Coordinator {
    remote_root: String,
    connector: Arc<dyn Connector>,
    prompt: Arc<dyn ConflictPrompt>,
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: u64,
    host: Option<String>,
    transfer: Option<Arc<dyn TransferClient>>,
    cache: RemoteFileSystemCache,
    tree: TreeSyncController,
    current_path: String,
    entries: Vec<DirectoryEntry>,
    bookmarks: Bookmarks,
    in_flight: HashMap<String, InFlight>,
    workers: JoinSet<Completion>,
}

/// Start the coordinator task. No host is connected until `switch_host`.
pub fn spawn_session(
    config: &AppConfig,
    connector: Arc<dyn Connector>,
    prompt: Arc<dyn ConflictPrompt>,
    bookmarks: Bookmarks,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let remote_root = path::normalize(&config.remote_root);

    let coordinator = Coordinator {
        connector,
        prompt,
        events: event_tx,
        generation: 0,
        host: None,
        transfer: None,
        cache: RemoteFileSystemCache::new(Arc::new(NotConnected)),
        tree: TreeSyncController::new(&remote_root),
        current_path: remote_root.clone(),
        entries: Vec::new(),
        bookmarks,
        in_flight: HashMap::new(),
        workers: JoinSet::new(),
        remote_root,
    };
    tokio::spawn(coordinator.run(cmd_rx));

    (SessionHandle { cmd_tx }, event_rx)
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("Session coordinator started");
        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => match joined {
                    Ok(done) => self.handle_completion(done),
                    Err(e) if e.is_cancelled() => debug!("Worker cancelled"),
                    Err(e) => error!("Worker failed: {}", e),
                },
            }
        }
        self.workers.abort_all();
        self.in_flight.clear();
        info!("Session coordinator stopped");
    }

    fn emit(&self, event: SessionEvent) {
        // No receiver just means nobody is watching
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SwitchHost { alias, reply } => self.switch_host(alias, reply),
            SessionCommand::Navigate { path, reply } => self.navigate(&path, Some(reply)),
            SessionCommand::GoUp { reply } => {
                if self.current_path == "/" {
                    let _ = reply.send(Ok(self.entries.clone()));
                } else {
                    let parent = path::parent(&self.current_path);
                    self.navigate(&parent, Some(reply));
                }
            }
            SessionCommand::Refresh { force, reply } => {
                let current = self.current_path.clone();
                if force {
                    self.cache.invalidate(Some(&current));
                    self.reload_tree_node(&current);
                }
                self.request_listing(&current, Waiter::View(Some(reply)));
            }
            SessionCommand::List { path, reply } => self.request_listing(&path, Waiter::List(reply)),
            // In-flight fetches stay put; their results no longer reach the cache
            SessionCommand::Invalidate { path } => self.cache.invalidate(path.as_deref()),
            SessionCommand::Cached { path, reply } => {
                let _ = reply.send(self.cache.cached(&path));
            }
            SessionCommand::Expand { path, reply } => self.expand(&path, reply),
            SessionCommand::Collapse { path } => {
                if let Some(id) = self.tree.find(&path) {
                    self.tree.collapse(id);
                    self.emit(SessionEvent::TreeChanged {
                        path: path::normalize(&path),
                    });
                }
            }
            SessionCommand::TreeNavigate { path, reply } => {
                let position = self.sync_tree(&path);
                let _ = reply.send(position);
            }
            SessionCommand::TreeRows { reply } => {
                let rows = self
                    .tree
                    .walk(self.tree.root())
                    .into_iter()
                    .map(|(depth, node)| TreeRow {
                        depth,
                        path: node.path.clone(),
                        name: node.name.clone(),
                        kind: node.kind,
                        state: node.state,
                        expandable: node.is_expandable(),
                    })
                    .collect();
                let _ = reply.send(rows);
            }
            SessionCommand::Rename {
                path,
                new_name,
                reply,
            } => self.rename(&path, &new_name, reply),
            SessionCommand::Delete { path, reply } => self.delete(&path, reply),
            SessionCommand::Upload {
                items,
                target_dir,
                reply,
            } => self.upload(items, &target_dir, reply),
            SessionCommand::Download {
                remote_path,
                local_dest,
                is_dir,
                reply,
            } => self.download(remote_path, local_dest, is_dir, reply),
            SessionCommand::AddBookmark { path, reply } => {
                let path = path.unwrap_or_else(|| self.current_path.clone());
                let result = match &self.host {
                    Some(host) => self.bookmarks.add(host, &path),
                    None => Err(anyhow!("No host selected")),
                };
                let _ = reply.send(result);
            }
            SessionCommand::RemoveBookmark { path, reply } => {
                let result = match &self.host {
                    Some(host) => self.bookmarks.remove(host, &path),
                    None => Err(anyhow!("No host selected")),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Bookmarks { reply } => {
                let paths = self
                    .host
                    .as_deref()
                    .map(|host| self.bookmarks.for_host(host))
                    .unwrap_or_default();
                let _ = reply.send(paths);
            }
            SessionCommand::View { reply } => {
                let _ = reply.send(ViewState {
                    host: self.host.clone(),
                    current_path: self.current_path.clone(),
                    entries: self.entries.clone(),
                });
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Connected {
                generation,
                alias,
                result,
                reply,
            } => {
                if generation != self.generation {
                    debug!("Dropping connection to {} from an earlier switch", alias);
                    return;
                }
                self.finish_connect(alias, result, reply);
            }
            Completion::Listing {
                generation,
                ticket,
                result,
            } => {
                if generation != self.generation {
                    debug!("Discarding listing of {} from an earlier connection", ticket.path);
                    return;
                }
                self.finish_listing(ticket, result);
            }
            Completion::Mutated {
                generation,
                touched,
                gone,
                outcome,
                reply,
            } => {
                if generation != self.generation {
                    return;
                }
                match &outcome {
                    Ok(_) => {
                        for dir in &touched {
                            self.resync(dir);
                        }
                        if path::is_within(&self.current_path, &gone) {
                            let parent = path::parent(&gone);
                            self.navigate(&parent, None);
                        }
                    }
                    Err(e) => warn!("Change to {} failed: {}", gone, e),
                }
                let _ = reply.send(outcome);
            }
            Completion::Uploaded {
                generation,
                target_dir,
                result,
                reply,
            } => {
                if generation != self.generation {
                    return;
                }
                if let Ok(report) = &result {
                    info!(
                        "Upload to {}: {} completed, {} failed, {} skipped",
                        target_dir,
                        report.completed.len(),
                        report.failed.len(),
                        report.skipped.len()
                    );
                    let changed = !report.completed.is_empty()
                        || !report.failed.is_empty()
                        || !report.overwritten.is_empty();
                    if changed {
                        self.resync(&target_dir);
                    }
                }
                let _ = reply.send(result);
            }
            Completion::Downloaded {
                generation,
                result,
                reply,
            } => {
                if generation == self.generation {
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn switch_host(&mut self, alias: String, reply: Reply<Result<ResolvedHost>>) {
        info!("Switching to host {}", alias);
        self.workers.abort_all();
        self.generation += 1;
        // Dropping the waiters tells their callers the work was cancelled
        self.in_flight.clear();
        self.cache.reset(Arc::new(NotConnected));
        self.transfer = None;
        self.tree.reset(&self.remote_root);
        self.current_path = self.remote_root.clone();
        self.entries.clear();
        self.host = Some(alias.clone());
        self.bookmarks.reload();
        self.emit(SessionEvent::Connecting(alias.clone()));

        let connector = Arc::clone(&self.connector);
        let generation = self.generation;
        self.workers.spawn(async move {
            let result = connector.connect(&alias).await;
            Completion::Connected {
                generation,
                alias,
                result,
                reply,
            }
        });
    }

    fn finish_connect(
        &mut self,
        alias: String,
        result: Result<Connection>,
        reply: Reply<Result<ResolvedHost>>,
    ) {
        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to connect to {}: {:#}", alias, e);
                self.emit(SessionEvent::Error(format!("{:#}", e)));
                let _ = reply.send(Err(e));
                return;
            }
        };

        let host = connection.host;
        if let Some(configured) = host.remapped_from {
            self.emit(SessionEvent::Notice(format!(
                "{}: port {} remapped to {}",
                alias, configured, host.params.port
            )));
        }
        info!("Connected to {}", alias);
        self.cache.reset(connection.executor);
        self.transfer = Some(connection.transfer);
        self.emit(SessionEvent::Connected(host.clone()));

        let root = self.tree.root();
        if let Some(ticket) = self.tree.begin_expand(root) {
            let root_path = ticket.path.clone();
            self.request_listing(
                &root_path,
                Waiter::Tree {
                    ticket: Some(ticket),
                    reply: None,
                },
            );
        }
        let current = self.current_path.clone();
        self.request_listing(&current, Waiter::View(None));

        let _ = reply.send(Ok(host));
    }

    /// Serve `path` from the cache, join its in-flight fetch, or start one.
    fn request_listing(&mut self, path: &str, waiter: Waiter) {
        let key = path::normalize(path);
        let fetch = match self.cache.list(&key) {
            Listing::Cached(entries) => {
                self.deliver(&key, waiter, Ok(entries));
                return;
            }
            Listing::Fetch(fetch) => fetch,
        };

        if let Some(pending) = self.in_flight.get_mut(&key) {
            if self.cache.is_current(&pending.ticket) {
                debug!("Joining in-flight listing of {}", key);
                pending.waiters.push(waiter);
                return;
            }
        }

        // An in-flight fetch started before an invalidation is superseded;
        // its waiters get the new result.
        let mut waiters = self
            .in_flight
            .remove(&key)
            .map(|pending| pending.waiters)
            .unwrap_or_default();
        waiters.push(waiter);

        self.in_flight.insert(
            key,
            InFlight {
                ticket: fetch.ticket.clone(),
                waiters,
            },
        );

        let generation = self.generation;
        self.workers.spawn(async move {
            let (ticket, result) = fetch.run().await;
            Completion::Listing {
                generation,
                ticket,
                result,
            }
        });
    }

    fn finish_listing(&mut self, ticket: FetchTicket, result: RemoteResult<Vec<DirectoryEntry>>) {
        let owns_marker = self
            .in_flight
            .get(&ticket.path)
            .is_some_and(|pending| pending.ticket == ticket);
        if !owns_marker {
            debug!("Discarding superseded listing of {}", ticket.path);
            return;
        }
        let waiters = self
            .in_flight
            .remove(&ticket.path)
            .map(|pending| pending.waiters)
            .unwrap_or_default();

        let result = match result {
            Ok(entries) => {
                self.cache.commit(&ticket, entries.clone());
                Ok(entries)
            }
            Err(e) => {
                warn!("Listing {} failed: {}", ticket.path, e);
                Err(e)
            }
        };

        for waiter in waiters {
            self.deliver(&ticket.path, waiter, result.clone());
        }
    }

    fn deliver(&mut self, path: &str, waiter: Waiter, result: RemoteResult<Vec<DirectoryEntry>>) {
        match waiter {
            Waiter::List(reply) => {
                let _ = reply.send(result);
            }
            Waiter::View(reply) => {
                if path == self.current_path {
                    match &result {
                        Ok(entries) => {
                            self.entries = entries.clone();
                            self.emit(SessionEvent::Listing {
                                path: path.to_string(),
                                entries: entries.clone(),
                            });
                        }
                        Err(e) => self.emit(SessionEvent::Error(format!("{}: {}", path, e))),
                    }
                } else {
                    debug!("Not showing {}, view moved to {}", path, self.current_path);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Waiter::Tree { ticket, reply } => {
                let outcome = match ticket {
                    Some(ticket) => match self.tree.complete_expand(&ticket, result) {
                        Ok(applied) => {
                            if applied {
                                self.emit(SessionEvent::TreeChanged {
                                    path: path.to_string(),
                                });
                            }
                            Ok(true)
                        }
                        Err(e) => {
                            warn!("Could not expand {}: {}", path, e);
                            if reply.is_none() {
                                self.emit(SessionEvent::Error(format!("{}: {}", path, e)));
                            }
                            Err(e)
                        }
                    },
                    None => result.map(|_| true),
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    fn navigate(&mut self, target: &str, reply: Option<ListingReply>) {
        let target = path::normalize(target);
        info!("Navigating to {}", target);
        if target != self.current_path {
            self.current_path = target.clone();
            self.entries.clear();
        }
        self.sync_tree(&target);
        self.request_listing(&target, Waiter::View(reply));
    }

    /// Best-effort walk of the tree towards `target`, loading what it passes.
    fn sync_tree(&mut self, target: &str) -> TreePosition {
        let nav = self.tree.navigate_to(target);
        for ticket in nav.pending {
            let node_path = ticket.path.clone();
            self.request_listing(
                &node_path,
                Waiter::Tree {
                    ticket: Some(ticket),
                    reply: None,
                },
            );
        }
        TreePosition {
            reached: self
                .tree
                .node(nav.reached)
                .map(|node| node.path.clone())
                .unwrap_or_else(|| self.remote_root.clone()),
            complete: nav.complete,
        }
    }

    fn expand(&mut self, target: &str, reply: Reply<RemoteResult<bool>>) {
        let Some(id) = self.tree.find(target) else {
            let _ = reply.send(Ok(false));
            return;
        };
        match self.tree.state(id) {
            Some(LoadState::Unloaded) => {
                if let Some(ticket) = self.tree.begin_expand(id) {
                    let node_path = ticket.path.clone();
                    self.request_listing(
                        &node_path,
                        Waiter::Tree {
                            ticket: Some(ticket),
                            reply: Some(reply),
                        },
                    );
                }
            }
            Some(LoadState::Loading) => {
                let key = path::normalize(target);
                match self.in_flight.get_mut(&key) {
                    Some(pending) => pending.waiters.push(Waiter::Tree {
                        ticket: None,
                        reply: Some(reply),
                    }),
                    None => {
                        let _ = reply.send(Ok(true));
                    }
                }
            }
            Some(LoadState::Loaded) | None => {
                let _ = reply.send(Ok(true));
            }
        }
    }

    fn reload_tree_node(&mut self, dir: &str) {
        let Some(id) = self.tree.find(dir) else {
            return;
        };
        if let Some(ticket) = self.tree.begin_reload(id) {
            let node_path = ticket.path.clone();
            self.request_listing(
                &node_path,
                Waiter::Tree {
                    ticket: Some(ticket),
                    reply: None,
                },
            );
        }
    }

    /// `dir` changed on the host: drop its listing and reload whatever shows it.
    fn resync(&mut self, dir: &str) {
        let dir = path::normalize(dir);
        self.cache.invalidate(Some(&dir));
        self.reload_tree_node(&dir);
        if dir == self.current_path {
            self.request_listing(&dir, Waiter::View(None));
        }
    }

    fn rename(&mut self, from: &str, new_name: &str, reply: Reply<RemoteResult<String>>) {
        let from = path::normalize(from);
        let new_name = new_name.trim().to_string();
        if from == "/" || !path::is_valid_name(&new_name) {
            let _ = reply.send(Err(RemoteError::InvalidName(new_name)));
            return;
        }

        let parent = path::parent(&from);
        let to = path::join(&parent, &new_name);
        if to == from {
            let _ = reply.send(Ok(to));
            return;
        }

        info!("Renaming {} to {}", from, to);
        let rename = self.cache.rename(&from, &to);
        let generation = self.generation;
        self.workers.spawn(async move {
            let result = rename.await;
            let outcome = result.map(|()| to);
            Completion::Mutated {
                generation,
                touched: vec![parent],
                gone: from,
                outcome,
                reply,
            }
        });
    }

    fn delete(&mut self, target: &str, reply: Reply<RemoteResult<String>>) {
        let target = path::normalize(target);
        if target == "/" {
            let _ = reply.send(Err(RemoteError::InvalidName(target)));
            return;
        }

        info!("Deleting {}", target);
        let delete = self.cache.delete(&target);
        let generation = self.generation;
        self.workers.spawn(async move {
            let result = delete.await;
            let outcome = result.map(|()| target.clone());
            Completion::Mutated {
                generation,
                touched: vec![path::parent(&target)],
                gone: target,
                outcome,
                reply,
            }
        });
    }

    fn upload(
        &mut self,
        items: Vec<PathBuf>,
        target_dir: &str,
        reply: Reply<RemoteResult<UploadReport>>,
    ) {
        let Some(transfer) = self.transfer.clone() else {
            let _ = reply.send(Err(RemoteError::Transport("Not connected".to_string())));
            return;
        };
        let target_dir = path::normalize(target_dir);
        info!("Uploading {} item(s) to {}", items.len(), target_dir);

        let executor = self.cache.executor();
        let prompt = Arc::clone(&self.prompt);
        let events = self.events.clone();
        let generation = self.generation;
        self.workers.spawn(async move {
            let result =
                run_upload(executor, transfer, prompt, events, &target_dir, &items).await;
            Completion::Uploaded {
                generation,
                target_dir,
                result,
                reply,
            }
        });
    }

    fn download(
        &mut self,
        remote_path: String,
        local_dest: PathBuf,
        is_dir: bool,
        reply: Reply<RemoteResult<()>>,
    ) {
        let Some(transfer) = self.transfer.clone() else {
            let _ = reply.send(Err(RemoteError::Transport("Not connected".to_string())));
            return;
        };
        info!("Downloading {} to {}", remote_path, local_dest.display());

        let (progress, forward) = progress_channel(self.events.clone());
        let generation = self.generation;
        self.workers.spawn(async move {
            let work = async move {
                let result = transfer
                    .download(&remote_path, &local_dest, is_dir, &progress)
                    .await;
                let _ = progress.send(finished_event(&remote_path, &result)).await;
                result
            };
            let ((), result) = tokio::join!(forward, work);
            Completion::Downloaded {
                generation,
                result,
                reply,
            }
        });
    }
}

/// Progress sender for one job, and the future forwarding it to session events.
/// The future ends once every sender clone is dropped.
fn progress_channel(
    events: mpsc::UnboundedSender<SessionEvent>,
) -> (ProgressSender, impl Future<Output = ()>) {
    let (tx, mut rx) = mpsc::channel(64);
    let forward = async move {
        while let Some(event) = rx.recv().await {
            let _ = events.send(SessionEvent::Transfer(event));
        }
    };
    (tx, forward)
}

fn finished_event(item: &str, result: &RemoteResult<()>) -> TransferEvent {
    match result {
        Ok(()) => TransferEvent::Complete {
            item: item.to_string(),
        },
        Err(e) => TransferEvent::Failed {
            item: item.to_string(),
            message: e.to_string(),
        },
    }
}

async fn run_upload(
    executor: Arc<dyn RemoteExecutor>,
    transfer: Arc<dyn TransferClient>,
    prompt: Arc<dyn ConflictPrompt>,
    events: mpsc::UnboundedSender<SessionEvent>,
    target_dir: &str,
    items: &[PathBuf],
) -> RemoteResult<UploadReport> {
    // Conflicts are decided against the host as it is now, not the cache
    let existing = cache::fetch_listing(executor.as_ref(), target_dir).await?;
    let resolved = UploadConflictResolver::new(
        target_dir,
        existing,
        prompt.as_ref(),
        executor.as_ref(),
    )
    .resolve(items)
    .await;

    let mut report = UploadReport {
        skipped: resolved.skipped,
        overwritten: resolved.overwritten,
        ..Default::default()
    };

    let (progress, forward) = progress_channel(events);
    let pending = resolved.transfers;
    let work = async move {
        let mut set = JoinSet::new();
        for (index, item) in pending.into_iter().enumerate() {
            let transfer = Arc::clone(&transfer);
            let progress = progress.clone();
            set.spawn(async move {
                let result = transfer
                    .upload(&item.local_path, &item.remote_path, &progress)
                    .await;
                let name = item.local_path.display().to_string();
                let _ = progress.send(finished_event(&name, &result)).await;
                (index, item, result)
            });
        }
        drop(progress);

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Upload task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);
        outcomes
    };
    let ((), outcomes) = tokio::join!(forward, work);

    for (_, item, result) in outcomes {
        match result {
            Ok(()) => {
                info!("Uploaded {} to {}", item.local_path.display(), item.remote_path);
                report.completed.push(item);
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", item.local_path.display(), e);
                report.failed.push((item, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Cloneable front end of the coordinator task.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn query<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(make(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<RemoteResult<T>>) -> SessionCommand,
    ) -> RemoteResult<T> {
        self.query(make).await.unwrap_or(Err(RemoteError::Cancelled))
    }

    /// Drop all state, connect to `alias`, then load its root.
    pub async fn switch_host(&self, alias: &str) -> Result<ResolvedHost> {
        let alias = alias.to_string();
        self.query(|reply| SessionCommand::SwitchHost { alias, reply })
            .await
            .unwrap_or_else(|| Err(anyhow!("Connection attempt was cancelled")))
    }

    pub async fn navigate(&self, path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        let path = path.to_string();
        self.call(|reply| SessionCommand::Navigate { path, reply }).await
    }

    pub async fn go_up(&self) -> RemoteResult<Vec<DirectoryEntry>> {
        self.call(|reply| SessionCommand::GoUp { reply }).await
    }

    pub async fn refresh(&self, force: bool) -> RemoteResult<Vec<DirectoryEntry>> {
        self.call(|reply| SessionCommand::Refresh { force, reply }).await
    }

    /// Listing of `path` through the cache, without moving the view.
    pub async fn list(&self, path: &str) -> RemoteResult<Vec<DirectoryEntry>> {
        let path = path.to_string();
        self.call(|reply| SessionCommand::List { path, reply }).await
    }

    pub async fn invalidate(&self, path: Option<&str>) {
        let path = path.map(String::from);
        let _ = self.cmd_tx.send(SessionCommand::Invalidate { path }).await;
    }

    pub async fn cached(&self, path: &str) -> Option<Vec<DirectoryEntry>> {
        let path = path.to_string();
        self.query(|reply| SessionCommand::Cached { path, reply })
            .await
            .flatten()
    }

    /// Load the children of a tree node. `Ok(false)` when `path` has no node.
    pub async fn expand(&self, path: &str) -> RemoteResult<bool> {
        let path = path.to_string();
        self.call(|reply| SessionCommand::Expand { path, reply }).await
    }

    pub async fn collapse(&self, path: &str) {
        let path = path.to_string();
        let _ = self.cmd_tx.send(SessionCommand::Collapse { path }).await;
    }

    /// Walk the tree towards `path` as far as it is materialized.
    pub async fn tree_navigate(&self, path: &str) -> RemoteResult<TreePosition> {
        let path = path.to_string();
        self.query(|reply| SessionCommand::TreeNavigate { path, reply })
            .await
            .ok_or(RemoteError::Cancelled)
    }

    /// Load every tree node between the root and `path`, then `path` itself.
    /// `Ok(false)` when some segment does not exist.
    pub async fn reveal(&self, path: &str) -> RemoteResult<bool> {
        let mut previous: Option<String> = None;
        loop {
            let position = self.tree_navigate(path).await?;
            self.expand(&position.reached).await?;
            if position.complete {
                return Ok(true);
            }
            if previous.as_deref() == Some(position.reached.as_str()) {
                return Ok(false);
            }
            previous = Some(position.reached);
        }
    }

    pub async fn tree_rows(&self) -> Vec<TreeRow> {
        self.query(|reply| SessionCommand::TreeRows { reply })
            .await
            .unwrap_or_default()
    }

    /// Rename within the same directory. Returns the new path.
    pub async fn rename(&self, path: &str, new_name: &str) -> RemoteResult<String> {
        let path = path.to_string();
        let new_name = new_name.to_string();
        self.call(|reply| SessionCommand::Rename {
            path,
            new_name,
            reply,
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> RemoteResult<()> {
        let path = path.to_string();
        self.call(|reply| SessionCommand::Delete { path, reply })
            .await
            .map(|_| ())
    }

    pub async fn upload(&self, items: Vec<PathBuf>, target_dir: &str) -> RemoteResult<UploadReport> {
        let target_dir = target_dir.to_string();
        self.call(|reply| SessionCommand::Upload {
            items,
            target_dir,
            reply,
        })
        .await
    }

    pub async fn download(
        &self,
        remote_path: &str,
        local_dest: PathBuf,
        is_dir: bool,
    ) -> RemoteResult<()> {
        let remote_path = remote_path.to_string();
        self.call(|reply| SessionCommand::Download {
            remote_path,
            local_dest,
            is_dir,
            reply,
        })
        .await
    }

    /// Bookmark `path`, or the current path when `None`.
    pub async fn add_bookmark(&self, path: Option<&str>) -> Result<bool> {
        let path = path.map(String::from);
        self.query(|reply| SessionCommand::AddBookmark { path, reply })
            .await
            .unwrap_or_else(|| Err(anyhow!("Session closed")))
    }

    pub async fn remove_bookmark(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.query(|reply| SessionCommand::RemoveBookmark { path, reply })
            .await
            .unwrap_or_else(|| Err(anyhow!("Session closed")))
    }

    pub async fn bookmarks(&self) -> Vec<String> {
        self.query(|reply| SessionCommand::Bookmarks { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn view(&self) -> ViewState {
        self.query(|reply| SessionCommand::View { reply })
            .await
            .unwrap_or_default()
    }

    /// Abort in-flight work and stop the coordinator.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }
}
