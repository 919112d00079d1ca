//! Framework subcommand handlers.
//!
//! Keeps `main.rs` slim: clap parsing stays there, heavy logic lives
//! here.  Every handler returns a framework result so `main` can map
//! failures onto the exit-code convention.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::daemon::pidfile::PidFile;
use crate::errors::{FrameworkError, Result};
use crate::manifest;
use crate::runtime::{self, RuntimeContext};
use crate::search::{self, SearchOptions};
use crate::store::{migrate, EngineRegistry};

// ── init / info ─────────────────────────────────────────────

/// Initialize the workspace: create directories and a default identity
/// when none exists.
pub fn init(config: &Config) -> Result<()> {
    config.ensure_dirs()?;
    if crate::identity::active_code(config)?.is_none() {
        crate::identity::register(config, "default", "default", None, None)?;
        println!("registered identity 'default'");
    }
    println!("workspace ready at {}", config.data_folder.display());
    Ok(())
}

/// Print workspace facts: paths, active identity, daemon liveness,
/// discovered skills.
pub fn info(config: &Config) -> Result<()> {
    println!("data folder   {}", config.data_folder.display());
    println!("skills dir    {}", config.skills_dir.display());

    match crate::identity::whoami(config)? {
        Some(me) => println!("active agent  {} ({})", me.code, me.name),
        None => println!("active agent  (none)"),
    }

    let pid_file = PidFile::new(&config.daemon_pid_path());
    if pid_file.is_running() {
        println!("daemon        running (pid {})", pid_file.read().unwrap_or_default());
    } else {
        println!("daemon        not running");
    }

    let packages = manifest::discover(&config.skills_dir)?;
    println!("skills        {}", packages.len());
    for package in packages.values() {
        let source = if package.root.is_some() { "local" } else { "installed" };
        println!(
            "  {:<16} {:<10} {}",
            package.manifest.name, package.manifest.version, source
        );
    }
    Ok(())
}

// ── search ──────────────────────────────────────────────────

pub fn search_cmd(runtime: &Arc<RuntimeContext>, query: &str, limit: usize, json: bool) -> Result<()> {
    let opts = SearchOptions {
        total_limit: limit,
        ..SearchOptions::default()
    };
    let hits = search::aggregate(runtime, query, &opts);
    if json {
        let out = serde_json::to_string_pretty(&hits)
            .map_err(|e| FrameworkError::Internal(e.to_string()))?;
        println!("{out}");
    } else if hits.is_empty() {
        println!("no results");
    } else {
        for hit in hits {
            println!(
                "{:.2}  {:<10} {:<6} {}",
                hit.score,
                hit.skill,
                hit.id,
                first_line(&hit.content)
            );
        }
    }
    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

// ── identity ────────────────────────────────────────────────

pub fn identity_register(
    config: &Config,
    code: &str,
    name: Option<&str>,
    role: Option<&str>,
    project: Option<&str>,
) -> Result<()> {
    let identity =
        crate::identity::register(config, code, name.unwrap_or(code), role, project)?;
    println!("registered '{}'", identity.code);
    Ok(())
}

pub fn identity_use(config: &Config, code: &str) -> Result<()> {
    crate::identity::set_active(config, code)?;
    println!("active agent is now '{code}'");
    Ok(())
}

pub fn identity_whoami(config: &Config) -> Result<()> {
    match crate::identity::whoami(config)? {
        Some(me) => {
            println!("{}", me.code);
            debug!(name = %me.name, role = ?me.role, "active identity");
        }
        None => println!("(no active agent)"),
    }
    Ok(())
}

pub fn identity_list(config: &Config) -> Result<()> {
    let identities = crate::identity::list(config)?;
    if identities.is_empty() {
        println!("no identities registered; run `skillet init`");
        return Ok(());
    }
    let active = crate::identity::active_code(config)?;
    for identity in identities {
        let marker = if Some(&identity.code) == active.as_ref() {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<16} {:<20} {}",
            identity.code,
            identity.name,
            identity.role.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub fn identity_remove(config: &Config, code: &str) -> Result<()> {
    crate::identity::remove(config, code)?;
    println!("removed '{code}'");
    Ok(())
}

// ── skills ──────────────────────────────────────────────────

pub fn skills_list(config: &Config, json: bool) -> Result<()> {
    let packages = manifest::discover(&config.skills_dir)?;
    let order = manifest::resolve_order(&packages)?;
    if json {
        let list: Vec<&crate::manifest::SkillManifest> = order
            .iter()
            .filter_map(|n| packages.get(n).map(|p| &p.manifest))
            .collect();
        let out = serde_json::to_string_pretty(&list)
            .map_err(|e| FrameworkError::Internal(e.to_string()))?;
        println!("{out}");
        return Ok(());
    }
    for name in &order {
        let Some(package) = packages.get(name) else {
            continue;
        };
        println!(
            "{:<16} {:<10} {}",
            package.manifest.name, package.manifest.version, package.manifest.description
        );
    }
    Ok(())
}

pub fn skills_describe(config: &Config, name: &str) -> Result<()> {
    let packages = manifest::discover(&config.skills_dir)?;
    let package = packages
        .get(name)
        .ok_or_else(|| FrameworkError::SkillNotFound(name.to_string()))?;
    let out = serde_json::to_string_pretty(&package.manifest)
        .map_err(|e| FrameworkError::Internal(e.to_string()))?;
    println!("{out}");
    Ok(())
}

pub fn skills_export(config: &Config) -> Result<()> {
    let packages = manifest::discover(&config.skills_dir)?;
    let manifests: Vec<&crate::manifest::SkillManifest> =
        packages.values().map(|p| &p.manifest).collect();
    let out = serde_json::to_string_pretty(&manifests)
        .map_err(|e| FrameworkError::Internal(e.to_string()))?;
    println!("{out}");
    Ok(())
}

/// Validate manifests and dependency resolution without touching the
/// store.
pub fn skills_check(config: &Config) -> Result<()> {
    let packages = manifest::discover(&config.skills_dir)?;
    let order = manifest::resolve_order(&packages)?;
    println!("ok: {} skill(s), load order: {}", order.len(), order.join(", "));
    Ok(())
}

/// Reload: tear the runtime down and boot again, reporting what loaded.
pub fn skills_reload(config: &Arc<Config>) -> Result<()> {
    runtime::teardown();
    let ctx = runtime::boot(config.clone())?;
    println!("reloaded {} skill(s)", ctx.registry.len());
    Ok(())
}

pub fn skills_config(config: &Config, name: &str) -> Result<()> {
    let packages = manifest::discover(&config.skills_dir)?;
    let package = packages
        .get(name)
        .ok_or_else(|| FrameworkError::SkillNotFound(name.to_string()))?;
    match &package.manifest.config_schema {
        Some(schema) => {
            let out = serde_json::to_string_pretty(schema)
                .map_err(|e| FrameworkError::Internal(e.to_string()))?;
            println!("{out}");
        }
        None => println!("skill '{name}' declares no config schema"),
    }
    Ok(())
}

/// Store-level diagnostics: reachability, applied and pending migrations
/// per skill, checksum drift.
pub fn skills_doctor(config: &Config) -> Result<()> {
    let packages = manifest::discover(&config.skills_dir)?;
    manifest::resolve_order(&packages)?;
    println!("manifests ok ({} skills)", packages.len());

    let Some(code) = crate::identity::active_code(config)? else {
        println!("no active agent; store checks skipped");
        return Ok(());
    };
    let url = config.agent_db_path(&code).to_string_lossy().into_owned();
    let engine = EngineRegistry::global().get_engine(&url)?;
    migrate::ensure_ledger(&engine)?;
    println!("store ok ({url})");

    let mut problems = 0usize;
    for package in packages.values() {
        let name = &package.manifest.name;
        let applied = migrate::applied_for(&engine, name)?;
        let Some(root) = &package.root else {
            println!("  {:<16} applied={}", name, applied.len());
            continue;
        };
        let pending = migrate::pending_for(&engine, &package.manifest, root)?;
        let mut drift = Vec::new();
        if let Some(dir) = &package.manifest.migrations_dir {
            for file in migrate::enumerate_migrations(&root.join(dir))? {
                if let Some(row) = applied.iter().find(|m| m.version == file.version) {
                    if row.sha256 != file.sha256 {
                        drift.push(file.filename.clone());
                    }
                }
            }
        }
        println!(
            "  {:<16} applied={} pending={} drift={}",
            name,
            applied.len(),
            pending.len(),
            if drift.is_empty() {
                "none".to_string()
            } else {
                drift.join(",")
            }
        );
        problems += drift.len();
    }
    if problems > 0 {
        return Err(FrameworkError::Config(format!(
            "{problems} migration file(s) changed after being applied"
        )));
    }
    Ok(())
}

/// Apply pending schema work. Forward-only: `--down` never executes SQL.
pub fn skills_migrate(config: &Arc<Config>, down: bool) -> Result<()> {
    if down {
        println!(
            "down migrations are not executed; write a new forward migration \
             (the ledger in `_migrations` is append-only)"
        );
        return Ok(());
    }
    let ctx = runtime::boot(config.clone())?;
    println!("migrations up to date for {} skill(s)", ctx.registry.len());
    Ok(())
}

// ── skill dispatch ──────────────────────────────────────────

/// Dispatch `skillet <skill-name> <args…>` to the skill's command root.
pub fn dispatch_skill(runtime: &Arc<RuntimeContext>, name: &str, args: &[String]) -> Result<()> {
    let package = runtime
        .registry
        .get(name)
        .ok_or_else(|| FrameworkError::SkillNotFound(name.to_string()))?;
    let entry = package
        .entry
        .clone()
        .ok_or_else(|| FrameworkError::SkillNotFound(name.to_string()))?;

    let mut argv = vec![name.to_string()];
    argv.extend(args.iter().cloned());
    let matches = entry
        .command()
        .try_get_matches_from(&argv)
        .map_err(|e| FrameworkError::InvalidArgument(e.to_string()))?;

    let ctx = runtime.restricted_for(name);
    entry
        .run(&ctx, &matches)
        .map_err(|e| FrameworkError::Internal(e.to_string()))
}
