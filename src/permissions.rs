//! Capability model and per-skill permission registry.
//!
//! Every skill runs behind a [`RestrictedContext`](crate::runtime::restricted)
//! that checks a capability before performing a class of operations.
//! Unknown skills get the read-only default set; skills on the write list
//! additionally get store-write and event-publish.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A named permission checked by the restricted context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    StoreRead,
    StoreWrite,
    EventPublish,
    EventSubscribe,
    SkillCall,
    FsRead,
    FsWrite,
    Network,
    Subprocess,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::StoreRead => "STORE_READ",
            Capability::StoreWrite => "STORE_WRITE",
            Capability::EventPublish => "EVENT_PUBLISH",
            Capability::EventSubscribe => "EVENT_SUBSCRIBE",
            Capability::SkillCall => "SKILL_CALL",
            Capability::FsRead => "FS_READ",
            Capability::FsWrite => "FS_WRITE",
            Capability::Network => "NETWORK",
            Capability::Subprocess => "SUBPROCESS",
        };
        f.write_str(s)
    }
}

/// Default grants for a skill nobody has vouched for.
pub fn default_grants() -> HashSet<Capability> {
    [
        Capability::StoreRead,
        Capability::EventSubscribe,
        Capability::SkillCall,
    ]
    .into_iter()
    .collect()
}

/// Grants for skills on the write list: defaults plus store-write and
/// event-publish.
pub fn write_grants() -> HashSet<Capability> {
    let mut set = default_grants();
    set.insert(Capability::StoreWrite);
    set.insert(Capability::EventPublish);
    set
}

/// Process-wide map of skill name to granted capabilities.
///
/// Effectively read-only after boot; mutations stay mutex-guarded so the
/// daemon can re-register on skill reload.
#[derive(Default, Debug)]
pub struct PermissionRegistry {
    grants: Mutex<HashMap<String, HashSet<Capability>>>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill with an explicit capability set.
    pub fn register(&self, skill: &str, caps: HashSet<Capability>) {
        debug!(skill, caps = caps.len(), "registered skill permissions");
        self.grants
            .lock()
            .expect("permission registry poisoned")
            .insert(skill.to_string(), caps);
    }

    /// Register a skill with defaults, or the write set when `writes` is
    /// true.
    pub fn register_default(&self, skill: &str, writes: bool) {
        let caps = if writes {
            write_grants()
        } else {
            default_grants()
        };
        self.register(skill, caps);
    }

    /// Check whether `skill` holds `cap`. Unregistered skills fall back to
    /// the default set.
    pub fn is_granted(&self, skill: &str, cap: Capability) -> bool {
        let grants = self.grants.lock().expect("permission registry poisoned");
        match grants.get(skill) {
            Some(caps) => caps.contains(&cap),
            None => default_grants().contains(&cap),
        }
    }

    /// Snapshot of a skill's grants (defaults when unregistered).
    pub fn grants_for(&self, skill: &str) -> HashSet<Capability> {
        let grants = self.grants.lock().expect("permission registry poisoned");
        grants.get(skill).cloned().unwrap_or_else(default_grants)
    }
}

// ── Statement classification ────────────────────────────────

/// Class of a SQL statement as seen by the permission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Read,
    Write,
}

/// Classify a SQL statement by its first syntactic token.
///
/// This is a real scanner, not a substring match: leading whitespace,
/// `-- line` comments and `/* block */` comments are skipped before the
/// keyword is read, so `/* DROP */ SELECT 1` classifies as a read.
///
/// `PRAGMA name = value` and `PRAGMA name(value)` are writes; a bare
/// `PRAGMA name` is a read.
pub fn classify_statement(sql: &str) -> StatementClass {
    let rest = skip_trivia(sql);
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_uppercase();

    match token.as_str() {
        "SELECT" | "EXPLAIN" | "VALUES" => StatementClass::Read,
        // A CTE prefix can front either a query or a DML statement; the
        // class is decided by the keyword that follows the definitions.
        "WITH" => classify_after_cte(&rest[token.len()..]),
        "PRAGMA" => classify_pragma(&rest[token.len()..]),
        // Everything unrecognized is treated as a write so a typo can
        // never bypass the gate.
        _ => StatementClass::Write,
    }
}

/// Scan past the CTE definitions for the first top-level keyword.
///
/// Tracks parenthesis depth and skips string literals so `WITH x AS
/// (SELECT ...) INSERT ...` classifies by the `INSERT`.
fn classify_after_cte(rest: &str) -> StatementClass {
    let mut depth = 0usize;
    let mut chars = rest.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '\'' | '"' => {
                // Skip to the closing quote; doubled quotes escape.
                while let Some((_, q)) = chars.next() {
                    if q == c {
                        if chars.peek().map(|(_, n)| *n) == Some(c) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            _ if depth == 0 && c.is_ascii_alphabetic() => {
                let word: String = rest[idx..]
                    .chars()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
                    .collect::<String>()
                    .to_ascii_uppercase();
                match word.as_str() {
                    "SELECT" => return StatementClass::Read,
                    "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => return StatementClass::Write,
                    // Anything else here is part of the CTE grammar
                    // (names, AS, RECURSIVE, NOT, MATERIALIZED, ...).
                    _ => {
                        for _ in 1..word.len() {
                            chars.next();
                        }
                    }
                }
            }
            _ => {}
        }
    }
    StatementClass::Write
}

/// A pragma that carries an assignment or a call argument mutates engine
/// state; a bare pragma only reads it.
fn classify_pragma(after_keyword: &str) -> StatementClass {
    let rest = skip_trivia(after_keyword);
    // Skip the pragma name (possibly schema-qualified).
    let name_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .count();
    let tail = skip_trivia(&rest[name_len..]);
    if tail.starts_with('=') || tail.starts_with('(') {
        StatementClass::Write
    } else {
        StatementClass::Read
    }
}

/// Skip whitespace and SQL comments, returning the remaining slice.
fn skip_trivia(mut s: &str) -> &str {
    loop {
        let trimmed = s.trim_start();
        if let Some(rest) = trimmed.strip_prefix("--") {
            s = match rest.find('\n') {
                Some(idx) => &rest[idx + 1..],
                None => "",
            };
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            s = match rest.find("*/") {
                Some(idx) => &rest[idx + 2..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}
