//! Turns raw `ls -l` output from the remote host into directory entries.

use super::path::shell_quote;
use super::types::{DirectoryEntry, EntryKind};
use chrono::NaiveDateTime;
use std::collections::HashSet;
use tracing::debug;

/// Printed by the listing command when the path cannot be entered or listed.
pub const UNLISTABLE_SENTINEL: &str = "__SSHDROP_UNLISTABLE__";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const LINK_SEPARATOR: &str = " -> ";

/// Shell command that lists `path` directories-first with UTC ISO timestamps.
pub fn listing_command(path: &str) -> String {
    format!(
        "cd {} 2>/dev/null && TZ=UTC ls -lA --time-style=+{} --group-directories-first 2>/dev/null || echo '{}'",
        shell_quote(path),
        TIMESTAMP_FORMAT,
        UNLISTABLE_SENTINEL
    )
}

/// Parse listing output. Malformed lines are skipped; an unlistable path
/// yields an empty listing.
pub fn parse(raw: &str) -> Vec<DirectoryEntry> {
    if raw.trim() == UNLISTABLE_SENTINEL {
        debug!("Listing reported an unreadable directory");
        return Vec::new();
    }

    let mut entries: Vec<DirectoryEntry> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with("total") || line.trim() == UNLISTABLE_SENTINEL {
            continue;
        }
        match parse_line(line) {
            Some(entry) => {
                if !seen.insert(entry.name.clone()) {
                    debug!("Duplicate listing entry skipped: {}", entry.name);
                    continue;
                }
                entries.push(entry);
            }
            None => debug!("Skipping unparsable listing line: {:?}", line),
        }
    }
    entries
}

fn parse_line(line: &str) -> Option<DirectoryEntry> {
    // permissions, links, owner, group, size, timestamp, name (rest of line)
    let fields = split_fields(line, 7)?;
    let perms = fields[0];
    let raw_name = fields[6];

    if raw_name == "." || raw_name == ".." {
        return None;
    }

    let kind = EntryKind::from_permissions(perms);
    let (name, link_target) = match kind {
        EntryKind::Symlink => match raw_name.split_once(LINK_SEPARATOR) {
            Some((name, target)) => (name.to_string(), Some(target.to_string())),
            None => (raw_name.to_string(), None),
        },
        _ => (raw_name.to_string(), None),
    };

    let modified_at = NaiveDateTime::parse_from_str(fields[5], TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc());

    Some(DirectoryEntry {
        name,
        kind,
        link_target,
        permissions: perms.to_string(),
        size_bytes: fields[4].parse::<u64>().unwrap_or(0),
        modified_at,
    })
}

/// Split on runs of whitespace into at most `n` fields, the last one taking
/// the remainder of the line. Returns `None` when fewer than `n` fields exist.
fn split_fields(line: &str, n: usize) -> Option<Vec<&str>> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() + 1 < n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        return None;
    }
    fields.push(rest);
    Some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const LISTING: &str = "total 24
drwxr-xr-x 2 user user 4096 2024-03-01T10:15:00 data
drwxr-xr-x 3 user user 4096 2024-03-02T08:00:00 my photos
lrwxrwxrwx 1 user user   11 2024-01-05T12:00:00 latest -> data/run-42
-rw-r--r-- 1 user user 1536 2024-02-28T23:59:59 notes.txt
";

    #[test]
    fn test_parse_listing() {
        let entries = parse(LISTING);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["data", "my photos", "latest", "notes.txt"]);

        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[3].kind, EntryKind::File);
        assert_eq!(entries[3].size_bytes, 1536);
        assert_eq!(
            entries[3].modified_at,
            Some(Utc.with_ymd_and_hms(2024, 2, 28, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn test_symlink_name_and_target() {
        let entries = parse(LISTING);
        let link = &entries[2];
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.name, "latest");
        assert_eq!(link.link_target.as_deref(), Some("data/run-42"));
        assert_eq!(link.display_name(), "latest -> data/run-42");
    }

    #[test]
    fn test_sentinel_yields_empty_listing() {
        assert!(parse(&format!("{}\n", UNLISTABLE_SENTINEL)).is_empty());
        assert!(parse(&format!("total 0\n{}\n", UNLISTABLE_SENTINEL)).is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let raw = "total 8
garbage
-rw-r--r-- 1 user user
drwxr-xr-x 2 user user 4096 2024-03-01T10:15:00 .
drwxr-xr-x 2 user user 4096 2024-03-01T10:15:00 ..
-rw-r--r-- 1 user user nan not-a-date odd.bin
";
        let entries = parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "odd.bin");
        assert_eq!(entries[0].size_bytes, 0);
        assert_eq!(entries[0].modified_at, None);
    }

    #[test]
    fn test_kind_follows_first_permission_char() {
        let raw = "prw-r--r-- 1 u g 0 2024-01-01T00:00:00 fifo
srwxr-xr-x 1 u g 0 2024-01-01T00:00:00 sock
";
        assert!(parse(raw).iter().all(|e| e.kind == EntryKind::File));
    }

    #[test]
    fn test_large_listing_keeps_order_and_drops_duplicates() {
        let mut raw = String::from("total 0\n");
        for i in 0..50_000 {
            raw.push_str(&format!("-rw-r--r-- 1 u g {} 2024-01-01T00:00:00 shard-{:05}.bin\n", i, i));
        }
        raw.push_str("-rw-r--r-- 1 u g 7 2024-01-01T00:00:00 shard-00000.bin\n");

        let entries = parse(&raw);

        assert_eq!(entries.len(), 50_000);
        assert_eq!(entries[0].name, "shard-00000.bin");
        assert_eq!(entries[0].size_bytes, 0);
        assert_eq!(entries[49_999].name, "shard-49999.bin");
    }

    #[test]
    fn test_listing_command_quotes_path() {
        let cmd = listing_command("/srv/it's here");
        assert!(cmd.starts_with("cd '/srv/it'\\''s here'"));
        assert!(cmd.contains("--group-directories-first"));
        assert!(cmd.ends_with(&format!("echo '{}'", UNLISTABLE_SENTINEL)));
    }
}
