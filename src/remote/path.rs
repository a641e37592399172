//! Remote path helpers
//!
//! Remote paths always use `/` regardless of the local OS. Cache keys are
//! normalized: absolute, no duplicate separators, no trailing `/` except root.

/// Normalize a remote path into cache-key form.
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Join a remote directory and a single name.
pub fn join(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Parent directory of a remote path. The parent of `/` is `/`.
pub fn parent(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Final path segment; empty for `/`.
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Path segments below root, in order.
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// A single path segment usable as an entry name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Whether `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = normalize(path);
    let ancestor = normalize(ancestor);
    if ancestor == "/" {
        return true;
    }
    path == ancestor || path.starts_with(&format!("{}/", ancestor))
}

/// Quote a string for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
