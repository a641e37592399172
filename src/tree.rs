//! Lazily expanded remote folder tree kept in sync with the listing cache.
//!
//! Each node is `Unloaded`, `Loading` or `Loaded`. Only a successful fetch
//! marks a node `Loaded`; collapsing discards its children so the next expand
//! fetches again. Loads are split into `begin_expand` / `complete_expand` so
//! the fetch itself can run elsewhere; a completion whose ticket no longer
//! matches the node (collapsed, reloaded or removed meanwhile) is dropped.

use crate::error::RemoteResult;
use crate::remote::path;
use crate::remote::{DirectoryEntry, EntryKind};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub state: LoadState,
    pub children: Vec<NodeId>,
    load_seq: u64,
}

impl TreeNode {
    /// Unloaded nodes are drawn with an expander even though no children are known.
    pub fn is_expandable(&self) -> bool {
        self.state != LoadState::Loaded || !self.children.is_empty()
    }
}

/// Issued when a node starts loading; hand it back with the fetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandTicket {
    pub node: NodeId,
    pub path: String,
    seq: u64,
}

/// Result of walking towards a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Deepest materialized node on the way to the target
    pub reached: NodeId,
    /// Whether `reached` is the target itself
    pub complete: bool,
    /// Loads started along the way
    pub pending: Vec<ExpandTicket>,
}

#[derive(Debug)]
pub struct TreeSyncController {
    nodes: HashMap<NodeId, TreeNode>,
    root: NodeId,
    next_id: usize,
    next_seq: u64,
}

impl TreeSyncController {
    pub fn new(root_path: &str) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            root: NodeId(0),
            next_id: 0,
            next_seq: 0,
        };
        tree.reset(root_path);
        tree
    }

    /// Drop every node and start over with a single unloaded root.
    pub fn reset(&mut self, root_path: &str) {
        self.nodes.clear();
        let root_path = path::normalize(root_path);
        let name = if root_path == "/" {
            "/".to_string()
        } else {
            path::base_name(&root_path).to_string()
        };
        self.root = self.insert(TreeNode {
            path: root_path,
            name,
            kind: EntryKind::Directory,
            state: LoadState::Unloaded,
            children: Vec::new(),
            load_seq: 0,
        });
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn state(&self, id: NodeId) -> Option<LoadState> {
        self.node(id).map(|n| n.state)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    fn child_named(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
    }

    /// Find the materialized node for `path`, if any.
    pub fn find(&self, target: &str) -> Option<NodeId> {
        let parts = self.relative_components(target)?;
        let mut current = self.root;
        for part in parts {
            current = self.child_named(current, &part)?;
        }
        Some(current)
    }

    fn relative_components(&self, target: &str) -> Option<Vec<String>> {
        let root_path = &self.nodes.get(&self.root)?.path;
        let target = path::normalize(target);
        let rest = if root_path == "/" {
            target.as_str()
        } else if target == *root_path {
            ""
        } else {
            target.strip_prefix(root_path.as_str())?.strip_prefix('/')?
        };
        Some(path::components(rest).into_iter().map(String::from).collect())
    }

    /// Start loading `id`. Returns `None` when it is already loading or loaded.
    pub fn begin_expand(&mut self, id: NodeId) -> Option<ExpandTicket> {
        let seq = self.next_seq + 1;
        let node = self.nodes.get_mut(&id)?;
        if node.state != LoadState::Unloaded {
            return None;
        }
        self.next_seq = seq;
        node.state = LoadState::Loading;
        node.load_seq = seq;
        debug!("Loading tree node {}", node.path);
        Some(ExpandTicket {
            node: id,
            path: node.path.clone(),
            seq,
        })
    }

    /// Discard the children of a loaded node and load it again.
    pub fn begin_reload(&mut self, id: NodeId) -> Option<ExpandTicket> {
        match self.state(id)? {
            LoadState::Unloaded => None,
            LoadState::Loading | LoadState::Loaded => {
                self.remove_children(id);
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.state = LoadState::Unloaded;
                }
                self.begin_expand(id)
            }
        }
    }

    /// Apply a fetch result. `Ok(false)` means the ticket was stale and
    /// nothing changed; an error puts the node back to `Unloaded`.
    pub fn complete_expand(
        &mut self,
        ticket: &ExpandTicket,
        result: RemoteResult<Vec<DirectoryEntry>>,
    ) -> RemoteResult<bool> {
        let current = self
            .nodes
            .get(&ticket.node)
            .is_some_and(|n| n.state == LoadState::Loading && n.load_seq == ticket.seq);
        if !current {
            debug!("Dropping stale tree load for {}", ticket.path);
            return Ok(false);
        }

        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                if let Some(node) = self.nodes.get_mut(&ticket.node) {
                    node.state = LoadState::Unloaded;
                }
                return Err(e);
            }
        };

        let mut children = Vec::new();
        for entry in entries.into_iter().filter(|e| e.kind.is_folder_like()) {
            let child = self.insert(TreeNode {
                path: path::join(&ticket.path, &entry.name),
                name: entry.name,
                kind: entry.kind,
                state: LoadState::Unloaded,
                children: Vec::new(),
                load_seq: 0,
            });
            children.push(child);
        }

        if let Some(node) = self.nodes.get_mut(&ticket.node) {
            node.children = children;
            node.state = LoadState::Loaded;
        }
        Ok(true)
    }

    /// Discard all children of `id` and mark it unloaded.
    pub fn collapse(&mut self, id: NodeId) {
        self.remove_children(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = LoadState::Unloaded;
            debug!("Collapsed tree node {}", node.path);
        }
    }

    /// Walk from the root towards `target`, expanding each materialized
    /// ancestor. Stops at the first segment that has no node yet.
    pub fn navigate_to(&mut self, target: &str) -> Navigation {
        let mut pending = Vec::new();
        let mut current = self.root;
        pending.extend(self.begin_expand(current));

        let Some(parts) = self.relative_components(target) else {
            return Navigation {
                reached: current,
                complete: false,
                pending,
            };
        };

        let mut complete = true;
        for part in parts {
            match self.child_named(current, &part) {
                Some(child) => {
                    current = child;
                    pending.extend(self.begin_expand(current));
                }
                None => {
                    complete = false;
                    break;
                }
            }
        }

        Navigation {
            reached: current,
            complete,
            pending,
        }
    }

    /// Depth-first list of materialized nodes under `id`, with depth.
    pub fn walk(&self, id: NodeId) -> Vec<(usize, &TreeNode)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, id)];
        while let Some((depth, id)) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                out.push((depth, node));
                for child in node.children.iter().rev() {
                    stack.push((depth + 1, *child));
                }
            }
        }
        out
    }

    fn insert(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    fn remove_children(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let mut stack = std::mem::take(&mut node.children);
        while let Some(child) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&child) {
                stack.extend(removed.children);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::RemoteFileSystemCache;
    use crate::testing::{list_through, FakeExecutor};
    use std::sync::Arc;

    const ROOT: &str = "total 12
drwxr-xr-x 2 root root 4096 2024-03-01T10:15:00 home
lrwxrwxrwx 1 root root    7 2024-03-01T10:15:00 bin -> usr/bin
-rw-r--r-- 1 root root   10 2024-03-01T10:15:00 README
";
    const HOME: &str = "total 4
drwxr-xr-x 2 user user 4096 2024-03-01T10:15:00 user
";

    fn entries(raw: &str) -> Vec<DirectoryEntry> {
        crate::remote::lister::parse(raw)
    }

    async fn expand(tree: &mut TreeSyncController, id: NodeId, cache: &mut RemoteFileSystemCache) {
        if let Some(ticket) = tree.begin_expand(id) {
            let result = list_through(cache, &ticket.path).await;
            tree.complete_expand(&ticket, result).unwrap();
        }
    }

    fn names(tree: &TreeSyncController, id: NodeId) -> Vec<String> {
        tree.children(id)
            .iter()
            .map(|c| tree.node(*c).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn test_expand_adds_only_folder_like_children() {
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        let ticket = tree.begin_expand(root).unwrap();
        assert_eq!(tree.state(root), Some(LoadState::Loading));

        assert!(tree.complete_expand(&ticket, Ok(entries(ROOT))).unwrap());

        assert_eq!(tree.state(root), Some(LoadState::Loaded));
        assert_eq!(names(&tree, root), vec!["home", "bin"]);
        let home = tree.find("/home").unwrap();
        let node = tree.node(home).unwrap();
        assert_eq!(node.state, LoadState::Unloaded);
        assert!(node.children.is_empty());
        assert!(node.is_expandable());
    }

    #[test]
    fn test_expand_is_noop_while_loading_or_loaded() {
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        let ticket = tree.begin_expand(root).unwrap();
        assert!(tree.begin_expand(root).is_none());
        tree.complete_expand(&ticket, Ok(entries(ROOT))).unwrap();
        assert!(tree.begin_expand(root).is_none());
    }

    #[test]
    fn test_failed_expand_returns_to_unloaded() {
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        let ticket = tree.begin_expand(root).unwrap();

        let err = tree
            .complete_expand(&ticket, Err(RemoteError::Transport("denied".into())))
            .unwrap_err();

        assert!(matches!(err, RemoteError::Transport(_)));
        assert_eq!(tree.state(root), Some(LoadState::Unloaded));
        assert!(tree.begin_expand(root).is_some());
    }

    #[test]
    fn test_result_after_collapse_is_discarded() {
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        let stale = tree.begin_expand(root).unwrap();
        tree.collapse(root);
        let fresh = tree.begin_expand(root).unwrap();

        assert!(!tree.complete_expand(&stale, Ok(entries(ROOT))).unwrap());
        assert_eq!(tree.state(root), Some(LoadState::Loading));
        assert!(tree.complete_expand(&fresh, Ok(entries(HOME))).unwrap());
        assert_eq!(names(&tree, root), vec!["user"]);
    }

    #[tokio::test]
    async fn test_collapse_then_expand_refetches() {
        let executor = Arc::new(FakeExecutor::new().with_listing("/", ROOT));
        let mut cache = RemoteFileSystemCache::new(executor.clone());
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();

        expand(&mut tree, root, &mut cache).await;
        let home = tree.find("/home").unwrap();
        tree.collapse(root);
        assert_eq!(tree.state(root), Some(LoadState::Unloaded));
        assert!(tree.node(home).is_none());
        assert!(tree.children(root).is_empty());

        expand(&mut tree, root, &mut cache).await;
        let rebuilt = tree.find("/home").unwrap();
        assert_ne!(rebuilt, home);
        assert_eq!(names(&tree, root), vec!["home", "bin"]);

        cache.invalidate(Some("/"));
        executor.set_listing("/", HOME);
        tree.collapse(root);
        expand(&mut tree, root, &mut cache).await;

        assert_eq!(names(&tree, root), vec!["user"]);
        assert_eq!(executor.listing_calls("/"), 2);
    }

    #[tokio::test]
    async fn test_navigate_stops_at_first_unmaterialized_ancestor() {
        let executor = Arc::new(
            FakeExecutor::new()
                .with_listing("/", ROOT)
                .with_listing("/home", HOME),
        );
        let mut cache = RemoteFileSystemCache::new(executor.clone());
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        expand(&mut tree, root, &mut cache).await;

        let nav = tree.navigate_to("/home/user/projects");
        let home = tree.find("/home").unwrap();
        assert_eq!(nav.reached, home);
        assert!(!nav.complete);
        assert_eq!(nav.pending.len(), 1);
        assert_eq!(nav.pending[0].path, "/home");

        let result = list_through(&mut cache, "/home").await;
        tree.complete_expand(&nav.pending[0], result).unwrap();

        let nav = tree.navigate_to("/home/user");
        assert!(nav.complete);
        assert_eq!(nav.reached, tree.find("/home/user").unwrap());
        assert_eq!(nav.pending[0].path, "/home/user");
    }

    #[test]
    fn test_navigate_outside_root() {
        let mut tree = TreeSyncController::new("/srv/data");
        let nav = tree.navigate_to("/etc");
        assert_eq!(nav.reached, tree.root());
        assert!(!nav.complete);
        assert_eq!(tree.find("/srv/data"), Some(tree.root()));
    }

    #[test]
    fn test_reload_replaces_children() {
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        let t = tree.begin_expand(root).unwrap();
        tree.complete_expand(&t, Ok(entries(ROOT))).unwrap();

        let t = tree.begin_reload(root).unwrap();
        assert!(tree.children(root).is_empty());
        tree.complete_expand(&t, Ok(entries(HOME))).unwrap();
        assert_eq!(names(&tree, root), vec!["user"]);

        let home = tree.find("/user").unwrap();
        assert!(tree.begin_reload(home).is_none());
    }

    #[test]
    fn test_walk_is_depth_first() {
        let mut tree = TreeSyncController::new("/");
        let root = tree.root();
        let t = tree.begin_expand(root).unwrap();
        tree.complete_expand(&t, Ok(entries(ROOT))).unwrap();
        let home = tree.find("/home").unwrap();
        let t = tree.begin_expand(home).unwrap();
        tree.complete_expand(&t, Ok(entries(HOME))).unwrap();

        let rows: Vec<(usize, &str)> = tree
            .walk(root)
            .into_iter()
            .map(|(d, n)| (d, n.path.as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![(0, "/"), (1, "/home"), (2, "/home/user"), (1, "/bin")]
        );
    }
}
