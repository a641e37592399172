use crate::config::AppConfig;
use crate::remote::path;
use crate::remote::{DirectoryEntry, TransferEvent};
use crate::session::{SessionEvent, SessionHandle, TreeRow};
use crate::tree::LoadState;
use crate::upload::ConflictPrompt;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueHint};
use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Browse, upload, download and organize files on hosts from your ssh config.
#[derive(Parser, Debug)]
#[command(name = "sshdrop", version, about)]
pub struct Args {
    /// Host alias from the ssh config (defaults to the first listed host)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Directory for log files
    #[arg(long, global = true, default_value = "logs", value_hint = ValueHint::DirPath)]
    pub log_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List hosts from the ssh config
    Hosts,
    /// List a remote directory
    Ls { path: Option<String> },
    /// Show the folder tree down to a remote path
    Tree { path: Option<String> },
    /// Upload local files or folders into a remote directory
    Upload {
        #[arg(required = true, value_hint = ValueHint::AnyPath)]
        items: Vec<PathBuf>,
        /// Target directory (defaults to the configured remote root)
        #[arg(long)]
        to: Option<String>,
    },
    /// Download a remote file or folder
    Download {
        remote: String,
        /// Local destination (defaults to the Downloads folder)
        #[arg(value_hint = ValueHint::AnyPath)]
        local: Option<PathBuf>,
    },
    /// Rename a remote entry within its directory
    Mv { path: String, new_name: String },
    /// Delete a remote file or folder recursively
    Rm {
        path: String,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Manage bookmarks for the host
    Bookmark {
        #[command(subcommand)]
        action: BookmarkAction,
    },
    /// Browse the host interactively
    Shell,
}

#[derive(Subcommand, Debug)]
pub enum BookmarkAction {
    /// Bookmark a path (defaults to the remote root)
    Add { path: Option<String> },
    Rm { path: String },
    Ls,
}

/// One line typed at the `shell` prompt.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
enum ShellCommand {
    /// Change the current directory
    Cd { path: String },
    /// Go to the parent directory
    Up,
    /// List the current directory, or another one
    Ls { path: Option<String> },
    /// Show the current directory
    Pwd,
    /// Fetch the current directory again
    Refresh,
    /// Load a folder in the tree
    Expand { path: String },
    /// Hide a folder's children in the tree
    Collapse { path: String },
    /// Show the folder tree
    Tree,
    /// Drop cached listings (all of them without a path)
    Forget { path: Option<String> },
    #[command(alias = "quit")]
    Exit,
}

/// Asks for replacement names on the terminal.
pub struct StdinPrompt;

#[async_trait]
impl ConflictPrompt for StdinPrompt {
    async fn ask_new_name(&self, target_dir: &str, conflicting: &str) -> Option<String> {
        let question = format!(
            "'{}' already exists in {}. New name (same name overwrites, empty skips): ",
            conflicting, target_dir
        );
        tokio::task::spawn_blocking(move || read_answer(&question))
            .await
            .ok()
            .flatten()
    }
}

fn read_answer(question: &str) -> Option<String> {
    eprint!("{}", question);
    io::stderr().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim().to_string())
}

fn confirm(question: &str) -> bool {
    read_answer(&format!("{} [y/N] ", question))
        .is_some_and(|a| a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes"))
}

/// Print session events to stderr until the session ends.
pub async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connecting(alias) => eprintln!("Connecting to {}...", alias),
            SessionEvent::Connected(host) => eprintln!(
                "Connected to {} ({}:{})",
                host.alias,
                host.params.destination(),
                host.params.port
            ),
            SessionEvent::Notice(text) => eprintln!("note: {}", text),
            SessionEvent::Error(text) => eprintln!("error: {}", text),
            SessionEvent::Transfer(TransferEvent::Progress { item, text }) => {
                eprint!("\r{}: {}", path::base_name(&item), text);
            }
            SessionEvent::Transfer(TransferEvent::Complete { item }) => {
                eprintln!("\rdone: {}", item);
            }
            SessionEvent::Transfer(TransferEvent::Failed { item, message }) => {
                eprintln!("\rfailed: {}: {}", item, message);
            }
            SessionEvent::Listing { .. } | SessionEvent::TreeChanged { .. } => {}
        }
    }
}

/// Size in the largest unit that keeps the value at or above one, e.g. `     2 KB`.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:>6} {:>2}", size.round() as u64, UNITS[unit])
}

fn format_mtime(modified: Option<DateTime<Utc>>) -> String {
    match modified {
        Some(t) => format_mtime_in(&t, &Local),
        None => "-".to_string(),
    }
}

fn format_mtime_in<Tz: TimeZone>(modified: &DateTime<Utc>, zone: &Tz) -> String
where
    Tz::Offset: Display,
{
    modified
        .with_timezone(zone)
        .format("%B %-d, %H:%M")
        .to_string()
}

fn print_entries(entries: &[DirectoryEntry]) {
    for entry in entries {
        println!(
            "{:<10} {:>9} {:<20} {}",
            entry.permissions,
            human_size(entry.size_bytes),
            format_mtime(entry.modified_at),
            entry.display_name()
        );
    }
}

fn print_tree(rows: &[TreeRow]) {
    for row in rows {
        let marker = if row.expandable && row.state != LoadState::Loaded {
            " +"
        } else {
            ""
        };
        println!("{}{}{}", "  ".repeat(row.depth), row.name, marker);
    }
}

/// Resolve `input` against `current`, handling `.` and `..` segments.
fn resolve_path(current: &str, input: &str) -> String {
    let mut resolved = if input.starts_with('/') {
        "/".to_string()
    } else {
        path::normalize(current)
    };
    for segment in path::components(input) {
        match segment {
            "." => {}
            ".." => resolved = path::parent(&resolved),
            name => resolved = path::join(&resolved, name),
        }
    }
    resolved
}

async fn shell(session: &SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let view = session.view().await;
        print!("{}:{}> ", view.host.as_deref().unwrap_or("?"), view.current_path);
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match ShellLine::try_parse_from(line.split_whitespace()) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        if command == ShellCommand::Exit {
            return Ok(());
        }
        // A failed command leaves the shell open
        if let Err(e) = shell_command(session, &view.current_path, command).await {
            eprintln!("error: {:#}", e);
        }
    }
}

async fn shell_command(session: &SessionHandle, current: &str, command: ShellCommand) -> Result<()> {
    match command {
        ShellCommand::Cd { path } => {
            session.navigate(&resolve_path(current, &path)).await?;
        }
        ShellCommand::Up => {
            session.go_up().await?;
        }
        ShellCommand::Ls { path: None } => print_entries(&session.view().await.entries),
        ShellCommand::Ls { path: Some(path) } => {
            let target = resolve_path(current, &path);
            let entries = match session.cached(&target).await {
                Some(entries) => entries,
                None => session.list(&target).await?,
            };
            print_entries(&entries);
        }
        ShellCommand::Pwd => println!("{}", current),
        ShellCommand::Refresh => print_entries(&session.refresh(true).await?),
        ShellCommand::Expand { path } => {
            let target = resolve_path(current, &path);
            if !session.expand(&target).await? {
                bail!("{} is not in the tree", target);
            }
            print_tree(&session.tree_rows().await);
        }
        ShellCommand::Collapse { path } => {
            session.collapse(&resolve_path(current, &path)).await;
            print_tree(&session.tree_rows().await);
        }
        ShellCommand::Tree => print_tree(&session.tree_rows().await),
        ShellCommand::Forget { path } => {
            let target = path.map(|p| resolve_path(current, &p));
            session.invalidate(target.as_deref()).await;
        }
        ShellCommand::Exit => {}
    }
    Ok(())
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub async fn run(session: &SessionHandle, config: &AppConfig, command: Command) -> Result<()> {
    match command {
        Command::Hosts => {}
        Command::Ls { path } => {
            let path = path.unwrap_or_else(|| config.remote_root.clone());
            let entries = session.navigate(&path).await?;
            print_entries(&entries);
        }
        Command::Tree { path } => {
            let path = path.unwrap_or_else(|| config.remote_root.clone());
            if !session.reveal(&path).await? {
                eprintln!("{} is not a folder on this host; showing what was reached", path);
            }
            print_tree(&session.tree_rows().await);
        }
        Command::Upload { items, to } => {
            let target = to.unwrap_or_else(|| config.remote_root.clone());
            let report = session.upload(items, &target).await?;
            for item in &report.completed {
                println!("{} -> {}", item.local_path.display(), item.remote_path);
            }
            for item in &report.skipped {
                println!("skipped {}", item.display());
            }
            if !report.failed.is_empty() {
                for (item, message) in &report.failed {
                    eprintln!("{} -> {}: {}", item.local_path.display(), item.remote_path, message);
                }
                bail!("{} upload(s) failed", report.failed.len());
            }
        }
        Command::Download { remote, local } => {
            let remote = path::normalize(&remote);
            let name = path::base_name(&remote).to_string();
            let listing = session.list(&path::parent(&remote)).await?;
            let entry = listing
                .iter()
                .find(|e| e.name == name)
                .with_context(|| format!("{} not found on the host", remote))?;
            let local = local.unwrap_or_else(|| default_download_dir().join(&name));
            session
                .download(&remote, local.clone(), entry.kind.is_folder_like())
                .await?;
            println!("{} -> {}", remote, local.display());
        }
        Command::Mv { path, new_name } => {
            let renamed = session.rename(&path, &new_name).await?;
            println!("{} -> {}", path, renamed);
        }
        Command::Rm { path, yes } => {
            if !yes && !confirm(&format!("Delete {} and everything under it?", path)) {
                println!("Cancelled");
                return Ok(());
            }
            session.delete(&path).await?;
            println!("Deleted {}", path);
        }
        Command::Bookmark { action } => match action {
            BookmarkAction::Add { path } => {
                let path = path.unwrap_or_else(|| config.remote_root.clone());
                if session.add_bookmark(Some(&path)).await? {
                    println!("Bookmarked {}", path);
                } else {
                    println!("{} is already bookmarked", path);
                }
            }
            BookmarkAction::Rm { path } => {
                if !session.remove_bookmark(&path).await? {
                    println!("{} was not bookmarked", path);
                }
            }
            BookmarkAction::Ls => {
                for path in session.bookmarks().await {
                    println!("{}", path);
                }
            }
        },
        Command::Shell => shell(session).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload() {
        let args = Args::parse_from(["sshdrop", "--host", "gpu", "upload", "a.txt", "b", "--to", "/data"]);
        assert_eq!(args.host.as_deref(), Some("gpu"));
        match args.command {
            Command::Upload { items, to } => {
                assert_eq!(items, vec![PathBuf::from("a.txt"), PathBuf::from("b")]);
                assert_eq!(to.as_deref(), Some("/data"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_upload_needs_items() {
        assert!(Args::try_parse_from(["sshdrop", "upload"]).is_err());
    }

    #[test]
    fn test_bookmark_subcommands() {
        let args = Args::parse_from(["sshdrop", "bookmark", "rm", "/data"]);
        assert!(matches!(
            args.command,
            Command::Bookmark {
                action: BookmarkAction::Rm { ref path }
            } if path == "/data"
        ));
        assert_eq!(args.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_shell_lines() {
        let parse = |line: &str| ShellLine::try_parse_from(line.split_whitespace()).map(|l| l.command);
        assert_eq!(
            parse("cd ../srv").unwrap(),
            ShellCommand::Cd {
                path: "../srv".to_string()
            }
        );
        assert_eq!(parse("ls").unwrap(), ShellCommand::Ls { path: None });
        assert_eq!(parse("forget").unwrap(), ShellCommand::Forget { path: None });
        assert_eq!(parse("quit").unwrap(), ShellCommand::Exit);
        assert!(parse("cd").is_err());
        assert!(parse("upload a.txt").is_err());
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/home/ana", "docs"), "/home/ana/docs");
        assert_eq!(resolve_path("/home/ana", "../bob/./x"), "/home/bob/x");
        assert_eq!(resolve_path("/home/ana", "/srv//data/"), "/srv/data");
        assert_eq!(resolve_path("/", ".."), "/");
        assert_eq!(resolve_path("/home", "."), "/home");
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "     0  B");
        assert_eq!(human_size(1023), "  1023  B");
        assert_eq!(human_size(1536), "     2 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "     5 MB");
        assert_eq!(human_size(3 * 1024u64.pow(5)), "  3072 TB");
    }

    #[test]
    fn test_format_mtime() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap();
        assert_eq!(format_mtime_in(&t, &Utc), "March 1, 09:05");
        assert_eq!(format_mtime(None), "-");
    }
}
