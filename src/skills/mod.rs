//! Skill entry points and the installed-skill registry.
//!
//! A skill's executable side implements [`SkillEntry`]: a clap command
//! root the framework binds under the skill name, an optional one-time
//! init hook, an RPC method table, and an optional search provider.  The
//! loader depends only on this capability set.
//!
//! Installed skills are compiled into the binary and registered in
//! [`installed_packages`]; local `skill.json` packages shadow them by
//! name.  A local manifest whose entry point names a registered skill
//! reuses that implementation (the manifest overrides metadata only).

pub mod notes;

use std::sync::Arc;

use serde::Deserialize;

use crate::errors::{FrameworkError, Result};
use crate::manifest::SkillPackage;
use crate::runtime::restricted::RestrictedContext;
use crate::search::SearchHit;

/// Positional and keyword arguments for an RPC-style method call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MethodArgs {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl MethodArgs {
    /// Positional argument at `idx`, or a named kwarg as fallback.
    pub fn get(&self, idx: usize, name: &str) -> Option<&serde_json::Value> {
        self.args.get(idx).or_else(|| self.kwargs.get(name))
    }

    pub fn get_str(&self, idx: usize, name: &str) -> Option<&str> {
        self.get(idx, name).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, idx: usize, name: &str) -> Option<i64> {
        self.get(idx, name).and_then(|v| v.as_i64())
    }
}

/// The capability set every skill entry point exposes to the loader.
pub trait SkillEntry: Send + Sync {
    /// The clap command root, bound under the skill name by the CLI.
    fn command(&self) -> clap::Command;

    /// Execute a CLI invocation against this skill.
    fn run(&self, ctx: &RestrictedContext, matches: &clap::ArgMatches) -> anyhow::Result<()>;

    /// One-time init hook; called exactly once per boot, after the
    /// skill's schema (and that of everything it requires) is applied.
    fn init_context(&self, _ctx: &RestrictedContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// RPC dispatch table. The default knows no methods.
    fn invoke(
        &self,
        ctx: &RestrictedContext,
        method: &str,
        _args: &MethodArgs,
    ) -> Result<serde_json::Value> {
        Err(FrameworkError::MethodNotFound {
            skill: ctx.skill_name().to_string(),
            method: method.to_string(),
        })
    }

    /// Search provider; `None` when the skill does not participate in
    /// universal search.
    fn search(
        &self,
        _ctx: &RestrictedContext,
        _query: &str,
        _limit: usize,
    ) -> Option<anyhow::Result<Vec<SearchHit>>> {
        None
    }

    /// Embedded schema SQL for installed skills that ship no files on
    /// disk. Applied once as migration version 1.
    fn schema_sql(&self) -> Option<&'static str> {
        None
    }
}

/// All compiled-in skill packages.
///
/// The Rust analog of entry-point group discovery: each builtin
/// contributes a manifest plus its [`SkillEntry`].
pub fn installed_packages() -> Vec<SkillPackage> {
    vec![notes::package()]
}

/// Resolve an entry implementation by skill name, for local manifests
/// that shadow an installed skill.
pub fn lookup_entry(name: &str) -> Option<Arc<dyn SkillEntry>> {
    installed_packages()
        .into_iter()
        .find(|p| p.manifest.name == name)
        .and_then(|p| p.entry)
}
