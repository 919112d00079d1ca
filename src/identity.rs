//! Agent identities and the active-identity pointer.
//!
//! Each identity owns one unified store at `agents/<code>/agent.db`; the
//! identity row itself lives inside that store (`_identity`), so listing
//! identities scans the `agents/` directory.  The active pointer is a
//! one-line file whose content is the code; it always references an
//! existing identity or is absent.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{FrameworkError, Result};
use crate::store::{EngineRegistry, StoreEngine};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub code: String,
    pub name: String,
    pub role: Option<String>,
    pub project_id: Option<String>,
    pub created_at: String,
}

/// Create the `_identity` table. Idempotent.
pub fn ensure_schema(engine: &StoreEngine) -> Result<()> {
    engine.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _identity (
                code       TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                role       TEXT,
                project_id TEXT,
                created_at TEXT NOT NULL
            );",
        )
    })
}

/// Insert the identity row if this store has none yet (used when boot
/// runs against a store created out-of-band).
pub fn ensure_registered(engine: &StoreEngine, code: &str) -> Result<()> {
    let created_at = chrono::Utc::now().to_rfc3339();
    engine.execute(
        "INSERT OR IGNORE INTO _identity (code, name, created_at) VALUES (?1, ?1, ?2)",
        &[&code, &created_at],
    )?;
    Ok(())
}

fn validate_code(code: &str) -> Result<()> {
    let ok = !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !code.starts_with('-')
        && !code.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(FrameworkError::InvalidArgument(format!(
            "agent code '{code}' must be a kebab-case slug"
        )))
    }
}

/// Register a new identity: create its store, write the identity row,
/// and point the active-identity file at it when none is set.
pub fn register(
    config: &Config,
    code: &str,
    name: &str,
    role: Option<&str>,
    project_id: Option<&str>,
) -> Result<AgentIdentity> {
    validate_code(code)?;
    config.ensure_dirs()?;

    let db_path = config.agent_db_path(code);
    if db_path.exists() {
        return Err(FrameworkError::InvalidArgument(format!(
            "agent '{code}' is already registered"
        )));
    }

    let url = db_path.to_string_lossy().into_owned();
    let engine = EngineRegistry::global().get_engine(&url)?;
    ensure_schema(&engine)?;

    let identity = AgentIdentity {
        code: code.to_string(),
        name: name.to_string(),
        role: role.map(str::to_string),
        project_id: project_id.map(str::to_string),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    engine.execute(
        "INSERT INTO _identity (code, name, role, project_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        &[
            &identity.code,
            &identity.name,
            &identity.role,
            &identity.project_id,
            &identity.created_at,
        ],
    )?;

    if active_code(config)?.is_none() {
        set_active(config, code)?;
    }
    debug!(code, "registered agent identity");
    Ok(identity)
}

/// Point the active-identity file at `code`; the identity must exist.
pub fn set_active(config: &Config, code: &str) -> Result<()> {
    validate_code(code)?;
    if !config.agent_db_path(code).exists() {
        return Err(FrameworkError::InvalidArgument(format!(
            "unknown agent '{code}'"
        )));
    }
    std::fs::write(config.active_agent_path(), code)
        .map_err(|e| FrameworkError::Config(format!("cannot write active_agent: {e}")))?;
    Ok(())
}

/// Read the active-identity pointer. A pointer at a missing identity is
/// treated as absent.
pub fn active_code(config: &Config) -> Result<Option<String>> {
    let path = config.active_agent_path();
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(FrameworkError::Config(format!(
                "cannot read active_agent: {e}"
            )))
        }
    };
    let code = content.trim().to_string();
    if code.is_empty() {
        return Ok(None);
    }
    if !config.agent_db_path(&code).exists() {
        warn!(code, "active_agent points at a missing identity; ignoring");
        return Ok(None);
    }
    Ok(Some(code))
}

/// The active identity's full record, if any.
pub fn whoami(config: &Config) -> Result<Option<AgentIdentity>> {
    let Some(code) = active_code(config)? else {
        return Ok(None);
    };
    read_identity(&config.agent_db_path(&code), &code)
}

/// All registered identities, discovered from the `agents/` directory.
pub fn list(config: &Config) -> Result<Vec<AgentIdentity>> {
    let agents_dir = config.data_folder.join("agents");
    let mut identities = Vec::new();
    let entries = match std::fs::read_dir(&agents_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(identities),
        Err(e) => {
            return Err(FrameworkError::Config(format!(
                "cannot read agents dir: {e}"
            )))
        }
    };
    for entry in entries {
        let entry =
            entry.map_err(|e| FrameworkError::Config(format!("cannot read dir entry: {e}")))?;
        let code = entry.file_name().to_string_lossy().into_owned();
        let db_path = entry.path().join("agent.db");
        if !db_path.is_file() {
            continue;
        }
        if let Some(identity) = read_identity(&db_path, &code)? {
            identities.push(identity);
        }
    }
    identities.sort_by(|a, b| a.code.cmp(&b.code));
    Ok(identities)
}

/// Remove an identity and its store; clears the pointer when it was
/// active.
pub fn remove(config: &Config, code: &str) -> Result<()> {
    validate_code(code)?;
    let dir = config.data_folder.join("agents").join(code);
    if !dir.is_dir() {
        return Err(FrameworkError::InvalidArgument(format!(
            "unknown agent '{code}'"
        )));
    }
    let db_url = config.agent_db_path(code).to_string_lossy().into_owned();
    EngineRegistry::global().dispose(&db_url);
    std::fs::remove_dir_all(&dir)
        .map_err(|e| FrameworkError::Config(format!("cannot remove {}: {e}", dir.display())))?;

    if let Ok(content) = std::fs::read_to_string(config.active_agent_path()) {
        if content.trim() == code {
            let _ = std::fs::remove_file(config.active_agent_path());
        }
    }
    debug!(code, "removed agent identity");
    Ok(())
}

/// Read one identity row with a transient connection, so listing does
/// not pin every agent store in the engine cache.
fn read_identity(db_path: &Path, code: &str) -> Result<Option<AgentIdentity>> {
    let conn = rusqlite::Connection::open(db_path).map_err(FrameworkError::from_store)?;
    let row = conn
        .query_row(
            "SELECT code, name, role, project_id, created_at FROM _identity WHERE code = ?1",
            [code],
            |row| {
                Ok(AgentIdentity {
                    code: row.get(0)?,
                    name: row.get(1)?,
                    role: row.get(2)?,
                    project_id: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(FrameworkError::from_store(other)),
        })?;
    Ok(row)
}
