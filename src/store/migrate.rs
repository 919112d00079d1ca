//! Per-skill schema application and forward-only migrations.
//!
//! State lives in the framework table `_migrations`; one row per applied
//! migration, inserted in the same transaction that applies the SQL and
//! never updated afterwards.  A changed file under an already-applied
//! version is detected by sha256 and is fatal.
//!
//! Down migrations are not supported; a revert is written as a new
//! forward migration.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{FrameworkError, Result};
use crate::manifest::SkillManifest;
use crate::store::StoreEngine;

/// Create the `_migrations` ledger. Idempotent; safe to run from two
/// concurrently starting processes.
pub fn ensure_ledger(engine: &StoreEngine) -> Result<()> {
    engine.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                skill_name TEXT NOT NULL,
                version    INTEGER NOT NULL,
                filename   TEXT NOT NULL,
                sha256     TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (skill_name, version)
            );",
        )
    })
}

/// One migration file on disk, parsed from `<version>_<slug>.sql`.
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub version: i64,
    pub filename: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// A row from the `_migrations` ledger.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppliedMigration {
    pub skill_name: String,
    pub version: i64,
    pub filename: String,
    pub sha256: String,
    pub applied_at: String,
}

/// Parse `<version:int>_<slug:[a-z0-9_-]+>.sql`, or `None` for files that
/// do not match the grammar.
pub fn parse_migration_filename(name: &str) -> Option<(i64, &str)> {
    let stem = name.strip_suffix(".sql")?;
    let (version, slug) = stem.split_once('_')?;
    if slug.is_empty()
        || !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return None;
    }
    let version: i64 = version.parse().ok()?;
    if version < 1 {
        return None;
    }
    Some((version, slug))
}

/// Enumerate a skill's migration files, sorted by version.
///
/// Duplicate versions violate the strictly-increasing rule and are
/// reported against the second file.
pub fn enumerate_migrations(dir: &Path) -> Result<Vec<MigrationFile>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| FrameworkError::Config(format!("cannot read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| FrameworkError::Config(format!("cannot read dir entry: {e}")))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((version, _slug)) = parse_migration_filename(&name) else {
            debug!(file = %name, "skipping non-migration file");
            continue;
        };
        let path = entry.path();
        let content = std::fs::read(&path)
            .map_err(|e| FrameworkError::Config(format!("cannot read {}: {e}", path.display())))?;
        files.push(MigrationFile {
            version,
            filename: name,
            path,
            sha256: sha256_hex(&content),
        });
    }
    files.sort_by_key(|f| f.version);
    for pair in files.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(FrameworkError::Config(format!(
                "duplicate migration version {} in {} ({} and {})",
                pair[1].version,
                dir.display(),
                pair[0].filename,
                pair[1].filename,
            )));
        }
    }
    Ok(files)
}

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Ledger rows for one skill, ordered by version.
pub fn applied_for(engine: &StoreEngine, skill: &str) -> Result<Vec<AppliedMigration>> {
    engine.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT skill_name, version, filename, sha256, applied_at
             FROM _migrations WHERE skill_name = ?1 ORDER BY version",
        )?;
        let rows = stmt.query_map([skill], |row| {
            Ok(AppliedMigration {
                skill_name: row.get(0)?,
                version: row.get(1)?,
                filename: row.get(2)?,
                sha256: row.get(3)?,
                applied_at: row.get(4)?,
            })
        })?;
        rows.collect()
    })
}

/// Highest applied version for a skill, or `None` when nothing applied.
pub fn current_applied(engine: &StoreEngine, skill: &str) -> Result<Option<i64>> {
    engine.with_conn(|conn| {
        conn.query_row(
            "SELECT MAX(version) FROM _migrations WHERE skill_name = ?1",
            [skill],
            |row| row.get::<_, Option<i64>>(0),
        )
    })
}

/// Apply a skill's schema or pending migrations. Returns the number of
/// migrations applied in this call.
///
/// Invoked once per skill per boot, in dependency order:
/// - With `migrations_dir`: verify checksums of everything at or below
///   the current version, then apply newer files one transaction each.
/// - With only `schema_file`: apply it once as version 1.
/// - With neither: no-op.
pub fn apply_skill(engine: &StoreEngine, manifest: &SkillManifest, root: &Path) -> Result<u32> {
    if let Some(ref migrations_dir) = manifest.migrations_dir {
        return apply_migrations_dir(engine, &manifest.name, &root.join(migrations_dir));
    }
    if let Some(ref schema_file) = manifest.schema_file {
        return apply_schema_file(engine, &manifest.name, &root.join(schema_file));
    }
    debug!(skill = %manifest.name, "no schema or migrations declared");
    Ok(0)
}

fn apply_migrations_dir(engine: &StoreEngine, skill: &str, dir: &Path) -> Result<u32> {
    let files = enumerate_migrations(dir)?;
    let applied = applied_for(engine, skill)?;
    let current = applied.iter().map(|m| m.version).max().unwrap_or(0);

    // Checksum guard: every file at or below the current version must
    // match the ledger byte for byte.
    for file in files.iter().filter(|f| f.version <= current) {
        let recorded = applied.iter().find(|m| m.version == file.version);
        let matches = recorded.map(|m| m.sha256 == file.sha256).unwrap_or(false);
        if !matches {
            return Err(FrameworkError::MigrationChecksumMismatch {
                skill: skill.to_string(),
                version: file.version,
                filename: file.filename.clone(),
            });
        }
    }

    let mut count = 0u32;
    for file in files.iter().filter(|f| f.version > current) {
        let sql = std::fs::read_to_string(&file.path)
            .map_err(|e| FrameworkError::Config(format!("cannot read {}: {e}", file.path.display())))?;
        apply_one(engine, skill, file, &sql)?;
        info!(skill, version = file.version, file = %file.filename, "applied migration");
        count += 1;
    }
    Ok(count)
}

fn apply_schema_file(engine: &StoreEngine, skill: &str, path: &Path) -> Result<u32> {
    if current_applied(engine, skill)?.is_some() {
        debug!(skill, "schema already applied");
        return Ok(0);
    }
    let sql = std::fs::read_to_string(path)
        .map_err(|e| FrameworkError::Config(format!("cannot read {}: {e}", path.display())))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "schema.sql".to_string());
    let file = MigrationFile {
        version: 1,
        filename,
        path: path.to_path_buf(),
        sha256: sha256_hex(sql.as_bytes()),
    };
    apply_one(engine, skill, &file, &sql)?;
    info!(skill, file = %file.filename, "applied schema");
    Ok(1)
}

/// Apply one migration and record it, atomically.
fn apply_one(engine: &StoreEngine, skill: &str, file: &MigrationFile, sql: &str) -> Result<()> {
    let applied_at = chrono::Utc::now().to_rfc3339();
    engine
        .transaction(|tx| {
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO _migrations (skill_name, version, filename, sha256, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![skill, file.version, file.filename, file.sha256, applied_at],
            )?;
            Ok(())
        })
        .map_err(|e| match e {
            FrameworkError::StoreIo(source) => FrameworkError::MigrationApplyFailed {
                skill: skill.to_string(),
                filename: file.filename.clone(),
                source,
            },
            other => other,
        })
}

/// Apply embedded schema SQL for an installed skill that ships no files
/// on disk. Recorded as version 1 under a synthetic filename.
pub fn apply_embedded_schema(engine: &StoreEngine, skill: &str, sql: &str) -> Result<u32> {
    if current_applied(engine, skill)?.is_some() {
        debug!(skill, "embedded schema already applied");
        return Ok(0);
    }
    let file = MigrationFile {
        version: 1,
        filename: format!("{skill}.embedded.sql"),
        path: PathBuf::new(),
        sha256: sha256_hex(sql.as_bytes()),
    };
    apply_one(engine, skill, &file, sql)?;
    info!(skill, "applied embedded schema");
    Ok(1)
}

/// Files newer than the current applied version (for `skills doctor`).
pub fn pending_for(engine: &StoreEngine, manifest: &SkillManifest, root: &Path) -> Result<Vec<MigrationFile>> {
    let Some(ref migrations_dir) = manifest.migrations_dir else {
        return Ok(Vec::new());
    };
    let files = enumerate_migrations(&root.join(migrations_dir))?;
    let current = current_applied(engine, &manifest.name)?.unwrap_or(0);
    Ok(files.into_iter().filter(|f| f.version > current).collect())
}
