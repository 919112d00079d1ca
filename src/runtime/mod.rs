//! Skill registry, runtime context and the boot/teardown pair.
//!
//! Boot order: engine → framework schema → discovery and resolution →
//! per-skill schema in dependency order → permission registration →
//! registry → runtime context singleton → init hooks in dependency
//! order.  Teardown disposes engines and clears the singleton; both are
//! idempotent and safe at process exit.
//!
//! The context singleton exists so signal handlers and the daemon can
//! reach the running state; skills never touch it directly — each gets a
//! [`RestrictedContext`](restricted::RestrictedContext) passed into its
//! hooks.

pub mod restricted;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::errors::{FrameworkError, Result};
use crate::manifest::{self, SkillPackage};
use crate::permissions::PermissionRegistry;
use crate::skills::MethodArgs;
use crate::store::{migrate, EngineRegistry, StoreEngine};
use restricted::RestrictedContext;

/// Skills whose write patterns are known to the framework; they get
/// store-write and event-publish on top of the default grants.
pub const WRITE_LIST: &[&str] = &["notes"];

/// Registry of loaded skills, keyed by name, with the dependency order
/// preserved from resolution.
pub struct SkillRegistry {
    skills: BTreeMap<String, SkillPackage>,
    order: Vec<String>,
}

impl std::fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("skills", &self.skills)
            .field("order", &self.order)
            .finish()
    }
}

impl SkillRegistry {
    /// Build a registry from already-resolved packages.  Boot uses this
    /// internally; embedders and tests may assemble one directly.
    pub fn from_parts(skills: BTreeMap<String, SkillPackage>, order: Vec<String>) -> Self {
        Self { skills, order }
    }

    pub fn get(&self, name: &str) -> Option<&SkillPackage> {
        self.skills.get(name)
    }

    /// Skill names in dependency order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Packages in dependency order.
    pub fn iter(&self) -> impl Iterator<Item = &SkillPackage> {
        self.order.iter().filter_map(|n| self.skills.get(n))
    }
}

/// The process-wide runtime state handed (wrapped) to every skill.
pub struct RuntimeContext {
    pub config: Arc<Config>,
    pub engine: Arc<StoreEngine>,
    pub bus: Arc<EventBus>,
    pub permissions: Arc<PermissionRegistry>,
    pub registry: SkillRegistry,
    /// Code of the agent identity this runtime is bound to.
    pub agent_code: String,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("bus", &self.bus)
            .field("permissions", &self.permissions)
            .field("registry", &self.registry)
            .field("agent_code", &self.agent_code)
            .finish()
    }
}

impl RuntimeContext {
    /// The permission-filtered wrapper a skill operates through.
    pub fn restricted_for(self: &Arc<Self>, skill: &str) -> RestrictedContext {
        RestrictedContext::new(self.clone(), skill)
    }

    /// Dispatch an RPC-style call to a skill method, executing under the
    /// target skill's own capability set.
    pub fn invoke(
        self: &Arc<Self>,
        skill: &str,
        method: &str,
        args: &MethodArgs,
    ) -> Result<serde_json::Value> {
        let package = self
            .registry
            .get(skill)
            .ok_or_else(|| FrameworkError::SkillNotFound(skill.to_string()))?;
        let entry = package
            .entry
            .clone()
            .ok_or_else(|| FrameworkError::SkillNotFound(skill.to_string()))?;
        let ctx = self.restricted_for(skill);
        entry.invoke(&ctx, method, args)
    }
}

static CURRENT: Mutex<Option<Arc<RuntimeContext>>> = Mutex::new(None);

/// The running context, if boot has completed.
pub fn current() -> Option<Arc<RuntimeContext>> {
    CURRENT.lock().expect("runtime singleton poisoned").clone()
}

/// Full boot per the runtime contract. Idempotent per process: a second
/// boot returns the existing context.
pub fn boot(config: Arc<Config>) -> Result<Arc<RuntimeContext>> {
    {
        let guard = CURRENT.lock().expect("runtime singleton poisoned");
        if let Some(ctx) = guard.as_ref() {
            debug!("runtime already booted");
            return Ok(ctx.clone());
        }
    }

    config.ensure_dirs()?;

    // Engine for the active identity's unified store.
    let agent_code =
        crate::identity::active_code(&config)?.unwrap_or_else(|| "default".to_string());
    let db_path = config.agent_db_path(&agent_code);
    let url = db_path.to_string_lossy().into_owned();
    let engine = EngineRegistry::global().get_engine(&url)?;

    // Framework tables before any skill schema.
    migrate::ensure_ledger(&engine)?;
    crate::identity::ensure_schema(&engine)?;
    crate::links::ensure_schema(&engine)?;
    crate::identity::ensure_registered(&engine, &agent_code)?;

    // Discover, resolve, apply schemas in dependency order.
    let packages = manifest::discover(&config.skills_dir)?;
    let order = manifest::resolve_order(&packages)?;
    info!(skills = order.len(), agent = %agent_code, "booting runtime");

    let permissions = Arc::new(PermissionRegistry::new());
    for name in &order {
        let package = packages.get(name).expect("resolved name is discovered");
        apply_package_schema(&engine, package)?;
        permissions.register_default(name, WRITE_LIST.contains(&name.as_str()));
    }

    let registry = SkillRegistry::from_parts(packages, order.clone());

    let ctx = Arc::new(RuntimeContext {
        config,
        engine,
        bus: Arc::new(EventBus::new()),
        permissions,
        registry,
        agent_code,
    });

    *CURRENT.lock().expect("runtime singleton poisoned") = Some(ctx.clone());

    // Init hooks run last, once per skill, with store and bus live.
    for name in &order {
        let Some(package) = ctx.registry.get(name) else {
            continue;
        };
        if let Some(entry) = package.entry.clone() {
            let restricted = ctx.restricted_for(name);
            if let Err(e) = entry.init_context(&restricted) {
                warn!(skill = %name, error = %e, "init hook failed");
            } else {
                debug!(skill = %name, "init hook completed");
            }
        }
    }

    Ok(ctx)
}

/// Apply a package's schema: migration files or schema file for local
/// packages, embedded SQL for installed ones.
fn apply_package_schema(engine: &StoreEngine, package: &SkillPackage) -> Result<()> {
    let manifest = &package.manifest;
    if !manifest.requires_db {
        return Ok(());
    }
    match &package.root {
        Some(root) => {
            migrate::apply_skill(engine, manifest, root)?;
        }
        None => {
            if let Some(sql) = package.entry.as_ref().and_then(|e| e.schema_sql()) {
                migrate::apply_embedded_schema(engine, &manifest.name, sql)?;
            }
        }
    }
    Ok(())
}

/// Tear the runtime down: drop the singleton and dispose every engine.
/// Safe to call repeatedly and without a prior boot.
pub fn teardown() {
    let had = CURRENT
        .lock()
        .expect("runtime singleton poisoned")
        .take()
        .is_some();
    EngineRegistry::global().dispose_all();
    if had {
        info!("runtime torn down");
    }
}
