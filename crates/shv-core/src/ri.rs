//! RPC Resource Identifiers: `path:method:signal` glob triplets.
//!
//! Subscriptions and access rules both match resources with these patterns.
//! Path patterns are matched segment by segment with `*`, `?` and `[...]`
//! wildcards (POSIX 3.13) plus `**`, which spans zero or more whole
//! segments. Method and signal patterns are single-segment globs.

use std::fmt;

/// Single-segment glob match: `*`, `?` and `[...]` character classes with
/// leading `!` negation. A `/` in the text never matches a wildcard because
/// segments are split before matching.
pub fn wildcard_match(text: &str, pattern: &str) -> bool {
    fn inner(t: &[u8], p: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => {
                // Zero or more characters: greedy with backtracking.
                (0..=t.len()).any(|skip| inner(&t[skip..], &p[1..]))
            }
            Some(b'?') => !t.is_empty() && inner(&t[1..], &p[1..]),
            Some(b'[') => {
                let Some(end) = class_end(p) else { return false };
                let Some(&c) = t.first() else { return false };
                class_matches(&p[1..end], c) && inner(&t[1..], &p[end + 1..])
            }
            Some(&pc) => t.first() == Some(&pc) && inner(&t[1..], &p[1..]),
        }
    }
    inner(text.as_bytes(), pattern.as_bytes())
}

/// Index of the closing `]` of a class starting at `p[0] == b'['`. A `]` as
/// the first member (after optional `!`) is a literal.
fn class_end(p: &[u8]) -> Option<usize> {
    let mut i = 1;
    if p.get(i) == Some(&b'!') {
        i += 1;
    }
    if p.get(i) == Some(&b']') {
        i += 1;
    }
    while let Some(&c) = p.get(i) {
        if c == b']' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn class_matches(class: &[u8], c: u8) -> bool {
    let (negated, class) = match class.first() {
        Some(b'!') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut found = false;
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == b'-' {
            if class[i] <= c && c <= class[i + 2] {
                found = true;
            }
            i += 3;
        } else {
            if class[i] == c {
                found = true;
            }
            i += 1;
        }
    }
    found != negated
}

/// Matches `path` against a `/`-separated `pattern`, where `**` spans zero
/// or more segments. Returns how many pattern segments were consumed, or
/// `None` when a segment mismatches.
fn match_segments(path: &str, pattern: &[&str]) -> Option<usize> {
    let mut i = 0;
    for node in path.split('/') {
        if i >= pattern.len() {
            return None;
        }
        if pattern[i] == "**" {
            if pattern.len() == i + 1 {
                return Some(i + 1); // matches everything that remains
            }
            if pattern[i + 1] == "**" {
                i += 1;
            } else if wildcard_match(node, pattern[i + 1]) {
                i += 2;
            }
            continue;
        }
        if !wildcard_match(node, pattern[i]) {
            return None;
        }
        i += 1;
    }
    Some(i)
}

/// Whole-path match against a glob pattern with `**` support.
pub fn path_match(path: &str, pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('/').collect();
    match_segments(path, &segments) == Some(segments.len())
}

/// Resource identifier pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcRi {
    pub path: String,
    pub method: String,
    pub signal: String,
}

impl Default for RpcRi {
    fn default() -> Self {
        Self { path: "**".into(), method: "*".into(), signal: "*".into() }
    }
}

impl RpcRi {
    pub fn new(path: impl Into<String>, method: impl Into<String>, signal: impl Into<String>) -> Self {
        Self { path: path.into(), method: method.into(), signal: signal.into() }
    }

    /// Parses `PATH[:METHOD[:SIGNAL]]`. An empty METHOD with a SIGNAL given
    /// defaults to `get`, the signal source of value changes.
    pub fn parse(value: &str) -> Self {
        let mut parts = value.splitn(3, ':');
        let path = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (Some(method), Some(signal)) => Self::new(
                path,
                if method.is_empty() { "get" } else { method },
                if signal.is_empty() { "*" } else { signal },
            ),
            (Some(method), None) => Self::new(path, method, "*"),
            _ => Self::new(path, "*", "*"),
        }
    }

    /// Checks a signal resource.
    pub fn match_signal(&self, path: &str, method: &str, signal: &str) -> bool {
        path_match(path, &self.path)
            && wildcard_match(method, &self.method)
            && wildcard_match(signal, &self.signal)
    }

    /// Checks a method call resource; the signal part must match the empty
    /// string, which the default `*` does.
    pub fn match_method(&self, path: &str, method: &str) -> bool {
        self.match_signal(path, method, "")
    }
}

impl fmt::Display for RpcRi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.signal == "*" {
            if self.method == "*" {
                write!(f, "{}", self.path)
            } else {
                write!(f, "{}:{}", self.path, self.method)
            }
        } else {
            let method = if self.method == "get" { "" } else { &self.method };
            write!(f, "{}:{}:{}", self.path, method, self.signal)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
