//! Configuration resolution.
//!
//! Resolves the data folder, per-agent store paths, skills search
//! directory, optional API token and daemon bind address.  First
//! non-empty source wins:
//! 1. Environment variable (`SKILLET_DATA_FOLDER`, alias `DATA_FOLDER`).
//! 2. A `.env` file at the nearest project root (marker: `.git` or
//!    `skills/`), parsed with `dotenvy` without mutating the process
//!    environment.
//! 3. Built-in default `~/.skillet`.
//!
//! A process-lifetime singleton is initialized lazily behind a mutex;
//! [`Config::reset`] drops it so tests can re-resolve.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::errors::{FrameworkError, Result};

/// Default daemon bind address; loopback only.
pub const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:7737";

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all on-disk state (`active_agent`, `agents/`, `daemon.pid`).
    pub data_folder: PathBuf,
    /// Directory scanned for local skill packages (`<dir>/*/skill.json`).
    pub skills_dir: PathBuf,
    /// Optional bearer token; when set, all daemon routes except
    /// `/health` require it.
    pub api_token: Option<String>,
    /// Daemon bind address.
    pub daemon_addr: String,
}

static CURRENT: Mutex<Option<Arc<Config>>> = Mutex::new(None);

impl Config {
    /// Return the process-wide config, resolving it on first use.
    pub fn current() -> Result<Arc<Config>> {
        let mut guard = CURRENT.lock().expect("config singleton poisoned");
        if let Some(cfg) = guard.as_ref() {
            return Ok(cfg.clone());
        }
        let cfg = Arc::new(Self::resolve()?);
        *guard = Some(cfg.clone());
        Ok(cfg)
    }

    /// Drop the singleton so the next [`Config::current`] re-resolves.
    /// Intended for tests that change the environment.
    pub fn reset() {
        let mut guard = CURRENT.lock().expect("config singleton poisoned");
        *guard = None;
    }

    /// Resolve a fresh config from environment, dotenv and defaults.
    pub fn resolve() -> Result<Config> {
        let dotenv = load_project_dotenv();

        let data_folder = lookup(&dotenv, &["SKILLET_DATA_FOLDER", "DATA_FOLDER"])
            .map(PathBuf::from)
            .unwrap_or_else(crate::data_home);

        let skills_dir = lookup(&dotenv, &["SKILLET_SKILLS_DIR"])
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("skills"));

        let api_token = lookup(&dotenv, &["SKILLET_API_TOKEN"]);

        let daemon_addr = lookup(&dotenv, &["SKILLET_DAEMON_ADDR"])
            .unwrap_or_else(|| DEFAULT_DAEMON_ADDR.to_string());

        debug!(
            data_folder = %data_folder.display(),
            skills_dir = %skills_dir.display(),
            auth = api_token.is_some(),
            "config resolved"
        );

        Ok(Config {
            data_folder,
            skills_dir,
            api_token,
            daemon_addr,
        })
    }

    /// Ensure the data folder and `agents/` subdirectory exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.data_folder.join("agents"))
            .map_err(|e| FrameworkError::Config(format!("cannot create data folder: {e}")))?;
        Ok(())
    }

    /// Path of the active-identity pointer file.
    pub fn active_agent_path(&self) -> PathBuf {
        self.data_folder.join("active_agent")
    }

    /// Per-agent unified store path.
    pub fn agent_db_path(&self, code: &str) -> PathBuf {
        self.data_folder.join("agents").join(code).join("agent.db")
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.data_folder.join("daemon.pid")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.data_folder.join("daemon.log")
    }
}

/// First non-empty hit across the real environment, then the dotenv map.
fn lookup(dotenv: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    for key in keys {
        if let Some(v) = dotenv.get(*key) {
            if !v.is_empty() {
                return Some(v.clone());
            }
        }
    }
    None
}

/// Parse `.env` at the nearest project root into a map.
///
/// The process environment is deliberately left untouched so tests and
/// embedding applications see no side effects.
fn load_project_dotenv() -> HashMap<String, String> {
    let Some(root) = find_project_root() else {
        return HashMap::new();
    };
    let path = root.join(".env");
    if !path.is_file() {
        return HashMap::new();
    }
    match dotenvy::from_path_iter(&path) {
        Ok(iter) => {
            let map: HashMap<String, String> = iter.flatten().collect();
            debug!(path = %path.display(), vars = map.len(), "loaded project dotenv");
            map
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring unreadable .env");
            HashMap::new()
        }
    }
}

/// Walk up from the current directory looking for a project marker.
fn find_project_root() -> Option<PathBuf> {
    let start = std::env::current_dir().ok()?;
    let mut dir: &Path = &start;
    loop {
        if dir.join(".git").exists() || dir.join("skills").is_dir() || dir.join(".env").is_file() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}
