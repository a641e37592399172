//! Name conflict resolution for uploads dropped into a remote directory.

use crate::remote::cache::delete_path;
use crate::remote::path;
use crate::remote::{DirectoryEntry, PendingTransfer, RemoteExecutor};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Asks the operator for a replacement name when an upload collides.
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    /// `None` or an empty answer cancels the item. Answering with
    /// `conflicting` itself means overwrite.
    async fn ask_new_name(&self, target_dir: &str, conflicting: &str) -> Option<String>;
}

/// Placement decisions for one drop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedBatch {
    pub transfers: Vec<PendingTransfer>,
    /// Items the operator declined to place
    pub skipped: Vec<PathBuf>,
    /// Remote paths removed ahead of an overwrite
    pub overwritten: Vec<String>,
}

pub struct UploadConflictResolver<'a> {
    target_dir: String,
    /// Names present on the host when resolution started
    remote_names: HashSet<String>,
    /// Everything occupied so far, including names claimed by this batch
    known: Vec<DirectoryEntry>,
    prompt: &'a dyn ConflictPrompt,
    executor: &'a dyn RemoteExecutor,
}

impl<'a> UploadConflictResolver<'a> {
    /// `existing` should be a fresh listing of `target_dir`, not a cached one.
    pub fn new(
        target_dir: &str,
        existing: Vec<DirectoryEntry>,
        prompt: &'a dyn ConflictPrompt,
        executor: &'a dyn RemoteExecutor,
    ) -> Self {
        Self {
            target_dir: path::normalize(target_dir),
            remote_names: existing.iter().map(|e| e.name.clone()).collect(),
            known: existing,
            prompt,
            executor,
        }
    }

    fn is_occupied(&self, name: &str) -> bool {
        self.known.iter().any(|e| e.name == name)
    }

    fn accept(&mut self, local: &Path, name: &str, batch: &mut ResolvedBatch) {
        let remote_path = path::join(&self.target_dir, name);
        info!("Placing {} at {}", local.display(), remote_path);
        self.known.push(DirectoryEntry::placeholder(name));
        batch.transfers.push(PendingTransfer {
            local_path: local.to_path_buf(),
            remote_path,
        });
    }

    /// Decide where each item goes, in batch order.
    pub async fn resolve(&mut self, items: &[PathBuf]) -> ResolvedBatch {
        let mut batch = ResolvedBatch::default();

        for local in items {
            let Some(mut name) = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
            else {
                warn!("Cannot derive a name from {}, skipping", local.display());
                batch.skipped.push(local.clone());
                continue;
            };

            loop {
                if !self.is_occupied(&name) {
                    self.accept(local, &name, &mut batch);
                    break;
                }

                let answer = self
                    .prompt
                    .ask_new_name(&self.target_dir, &name)
                    .await
                    .map(|a| a.trim().to_string())
                    .unwrap_or_default();

                if answer.is_empty() {
                    info!("Conflict on {} abandoned, skipping {}", name, local.display());
                    batch.skipped.push(local.clone());
                    break;
                }

                if answer == name {
                    if self.remote_names.contains(&name) {
                        let existing = path::join(&self.target_dir, &name);
                        match delete_path(self.executor, &existing).await {
                            Ok(()) => {
                                info!("Removed {} before overwrite", existing);
                                batch.overwritten.push(existing);
                            }
                            Err(e) => warn!("Could not remove {} before overwrite: {}", existing, e),
                        }
                    }
                    self.accept(local, &name, &mut batch);
                    break;
                }

                if !path::is_valid_name(&answer) {
                    warn!("Rejected invalid name {:?}", answer);
                    continue;
                }

                name = answer;
            }
        }

        batch
    }
}
