//! Remote filesystem access over ssh: listing, caching and transfers

pub mod cache;
pub mod executor;
pub mod lister;
pub mod path;
pub mod transfer;
pub mod types;

pub use cache::RemoteFileSystemCache;
pub use executor::{RemoteExecutor, SshExecutor, SshOptions};
pub use transfer::{ProgressSender, RsyncTransfer, TransferClient};
pub use types::{DirectoryEntry, EntryKind, PendingTransfer, TransferEvent};
