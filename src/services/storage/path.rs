//! Path normalization at the provider boundary.

use serde::{Deserialize, Serialize};

/// How a backend spells its paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStyle {
    /// Flat object keys: no leading slash, root is the empty string.
    ObjectKey,
    /// Hierarchical paths: always a leading slash, root is `/`.
    Posix,
}

impl PathStyle {
    /// Normalize a caller-supplied path.
    ///
    /// Collapses repeated slashes, drops `.` segments and resolves `..`
    /// without ever escaping the root. A trailing slash is removed.
    pub fn normalize(&self, path: &str) -> String {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        let joined = segments.join("/");
        match self {
            PathStyle::ObjectKey => joined,
            PathStyle::Posix => format!("/{}", joined),
        }
    }

    /// Root of the namespace.
    pub fn root(&self) -> &'static str {
        match self {
            PathStyle::ObjectKey => "",
            PathStyle::Posix => "/",
        }
    }

    pub fn is_root(&self, normalized: &str) -> bool {
        normalized == self.root()
    }

    /// Join a child name onto an already-normalized parent.
    pub fn join(&self, parent: &str, child: &str) -> String {
        let child = child.trim_matches('/');
        if child.is_empty() {
            return parent.to_string();
        }
        if parent.is_empty() || parent == "/" {
            return self.normalize(child);
        }
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }

    /// Path of `path` relative to `base`, or `None` when outside of it.
    pub fn relative<'a>(&self, base: &str, path: &'a str) -> Option<&'a str> {
        if self.is_root(base) {
            return Some(path.trim_start_matches('/'));
        }
        let rest = path.strip_prefix(base)?;
        if rest.is_empty() {
            Some("")
        } else {
            rest.strip_prefix('/')
        }
    }

    /// Directory-prefix form used by object listings (`a/b/`). Root stays
    /// empty.
    pub fn as_prefix(&self, normalized: &str) -> String {
        let trimmed = normalized.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        }
    }
}

/// Parent of a normalized path, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => Some(""),
    }
}

/// Number of segments, used to order directories deepest-first.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}
