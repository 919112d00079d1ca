//! Skill manifests, package discovery and dependency resolution.
//!
//! Discovery merges two sources keyed by manifest name:
//! 1. **Local packages** — `<skills_dir>/*/skill.json` on disk.
//! 2. **Installed packages** — the compiled-in builtin registry
//!    (`crate::skills`), skillet's analog of entry-point discovery.
//!
//! Local wins on a name conflict; a warning is emitted.  Dependencies
//! (`requires: ["name", "name@^1.2"]`) are checked for presence and
//! semver compatibility, then topologically ordered with Kahn's
//! algorithm.  Cycles are fatal and name their members.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{FrameworkError, Result};
use crate::skills::SkillEntry;

/// Declarative skill metadata, read-only at runtime (`skill.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Unique kebab-case identifier.
    pub name: String,
    /// Semver version of the skill package.
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Dependencies: `"name"` or `"name@<semver range>"`.
    #[serde(default)]
    pub requires: Vec<String>,
    /// One-shot schema, applied once as version 1 when no
    /// `migrations_dir` is declared.
    #[serde(default)]
    pub schema_file: Option<String>,
    /// Directory of `<version>_<slug>.sql` files.
    #[serde(default)]
    pub migrations_dir: Option<String>,
    /// `package.module:symbol` — resolved against the installed registry.
    pub entry_point: String,
    #[serde(default = "default_true")]
    pub requires_db: bool,
    #[serde(default)]
    pub internal_doc: Option<String>,
    #[serde(default)]
    pub external_doc: Option<String>,
    /// JSON-Schema for the skill's own configuration, if any.
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// A parsed `requires` entry.
#[derive(Debug, Clone)]
pub struct RequiresSpec {
    pub name: String,
    pub constraint: Option<VersionReq>,
}

impl SkillManifest {
    /// Parse and validate a manifest from JSON text.
    pub fn from_json(raw: &str) -> Result<Self> {
        let manifest: SkillManifest = serde_json::from_str(raw)
            .map_err(|e| FrameworkError::Config(format!("invalid manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load `skill.json` from a skill directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FrameworkError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
            .map_err(|e| FrameworkError::Config(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> Result<()> {
        if !is_kebab_case(&self.name) {
            return Err(FrameworkError::Config(format!(
                "skill name '{}' is not kebab-case",
                self.name
            )));
        }
        Version::parse(&self.version).map_err(|e| {
            FrameworkError::Config(format!(
                "skill '{}' version '{}' is not semver: {e}",
                self.name, self.version
            ))
        })?;
        if !self.entry_point.contains(':') {
            return Err(FrameworkError::Config(format!(
                "skill '{}' entry_point '{}' must be 'module:symbol'",
                self.name, self.entry_point
            )));
        }
        for entry in &self.requires {
            parse_requires(entry)?;
        }
        Ok(())
    }

    /// Parsed dependency specs.
    pub fn requires_specs(&self) -> Vec<RequiresSpec> {
        // Entries were validated at load time.
        self.requires
            .iter()
            .filter_map(|e| parse_requires(e).ok())
            .collect()
    }
}

/// `name` or `name@<range>`.
pub fn parse_requires(entry: &str) -> Result<RequiresSpec> {
    let (name, constraint) = match entry.split_once('@') {
        Some((name, range)) => {
            let req = VersionReq::parse(range).map_err(|e| {
                FrameworkError::Config(format!("bad constraint '{range}' in '{entry}': {e}"))
            })?;
            (name, Some(req))
        }
        None => (entry, None),
    };
    if !is_kebab_case(name) {
        return Err(FrameworkError::Config(format!(
            "dependency name '{name}' is not kebab-case"
        )));
    }
    Ok(RequiresSpec {
        name: name.to_string(),
        constraint,
    })
}

fn is_kebab_case(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

// ── Packages & discovery ────────────────────────────────────

/// A discovered skill: manifest plus where it came from.
#[derive(Clone)]
pub struct SkillPackage {
    pub manifest: SkillManifest,
    /// Package directory for local skills; `None` for installed ones
    /// (their schema ships through the registry).
    pub root: Option<PathBuf>,
    /// The executable side, when the entry point resolves.
    pub entry: Option<Arc<dyn SkillEntry>>,
}

impl std::fmt::Debug for SkillPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillPackage")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("root", &self.root)
            .field("entry", &self.entry.is_some())
            .finish()
    }
}

/// Scan `<skills_dir>/*/skill.json` and merge with the installed
/// registry. Local wins on conflict.
pub fn discover(skills_dir: &Path) -> Result<BTreeMap<String, SkillPackage>> {
    let mut packages: BTreeMap<String, SkillPackage> = BTreeMap::new();

    for package in crate::skills::installed_packages() {
        debug!(skill = %package.manifest.name, "discovered installed skill");
        packages.insert(package.manifest.name.clone(), package);
    }

    if skills_dir.is_dir() {
        let entries = std::fs::read_dir(skills_dir).map_err(|e| {
            FrameworkError::Config(format!("cannot read {}: {e}", skills_dir.display()))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| FrameworkError::Config(format!("cannot read dir entry: {e}")))?;
            let dir = entry.path();
            let manifest_path = dir.join("skill.json");
            if !dir.is_dir() || !manifest_path.is_file() {
                continue;
            }
            let manifest = SkillManifest::load(&manifest_path)?;
            if packages.contains_key(&manifest.name) {
                warn!(
                    skill = %manifest.name,
                    path = %dir.display(),
                    "local skill shadows installed skill"
                );
            }
            debug!(skill = %manifest.name, path = %dir.display(), "discovered local skill");
            let entry_impl = crate::skills::lookup_entry(&manifest.name);
            packages.insert(
                manifest.name.clone(),
                SkillPackage {
                    manifest,
                    root: Some(dir),
                    entry: entry_impl,
                },
            );
        }
    } else {
        debug!(dir = %skills_dir.display(), "no local skills directory");
    }

    Ok(packages)
}

// ── Dependency resolution ───────────────────────────────────

/// Check dependency presence and version constraints, then return the
/// skill names in dependency order (Kahn's algorithm, ties broken by
/// name for determinism).
pub fn resolve_order(packages: &BTreeMap<String, SkillPackage>) -> Result<Vec<String>> {
    // Presence and constraint check first, so the error names the
    // offending edge rather than a generic sort failure.
    for package in packages.values() {
        for spec in package.manifest.requires_specs() {
            let Some(dep) = packages.get(&spec.name) else {
                return Err(FrameworkError::UnmetDependency {
                    skill: package.manifest.name.clone(),
                    dep: spec.name,
                });
            };
            if let Some(ref constraint) = spec.constraint {
                let found = Version::parse(&dep.manifest.version)
                    .map_err(|e| FrameworkError::Config(format!("bad version: {e}")))?;
                if !constraint.matches(&found) {
                    return Err(FrameworkError::VersionConstraintFailed {
                        skill: package.manifest.name.clone(),
                        dep: spec.name,
                        constraint: constraint.to_string(),
                        found: found.to_string(),
                    });
                }
            }
        }
    }

    // name -> unresolved dependency count; dep -> dependents.
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for package in packages.values() {
        let name = package.manifest.name.as_str();
        let specs = package.manifest.requires_specs();
        in_degree.insert(name, specs.len());
        for spec in &specs {
            let dep = packages
                .get_key_value(&spec.name)
                .map(|(k, _)| k.as_str())
                .unwrap_or_default();
            dependents.entry(dep).or_default().push(name);
        }
    }

    // Ready list is kept sorted descending so `pop` always emits the
    // lexicographically smallest ready name.
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    ready.reverse();
    let mut order = Vec::with_capacity(packages.len());
    while let Some(name) = ready.pop() {
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for dependent in deps.clone() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent tracked in in_degree");
                *degree -= 1;
                if *degree == 0 {
                    let pos = ready
                        .binary_search_by(|probe| dependent.cmp(probe))
                        .unwrap_or_else(|p| p);
                    ready.insert(pos, dependent);
                }
            }
        }
    }

    if order.len() < packages.len() {
        let remaining: HashSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        return Err(FrameworkError::DependencyCycle {
            cycle: extract_cycle(packages, &remaining),
        });
    }
    Ok(order)
}

/// Walk `requires` edges inside the unresolved set until a node repeats,
/// then return that loop for the error message.
fn extract_cycle(
    packages: &BTreeMap<String, SkillPackage>,
    remaining: &HashSet<&str>,
) -> Vec<String> {
    let Some(start) = remaining.iter().min().copied() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut seen: HashSet<&str> = HashSet::from([start]);
    let mut current = start;
    loop {
        let next = packages
            .get(current)
            .into_iter()
            .flat_map(|p| p.manifest.requires_specs())
            .map(|s| s.name)
            .find(|dep| remaining.contains(dep.as_str()));
        let Some(next) = next else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        let next_ref = packages
            .get_key_value(&next)
            .map(|(k, _)| k.as_str())
            .unwrap_or(current);
        if !seen.insert(next_ref) {
            // Trim the tail that leads into the loop.
            let loop_start = path.iter().position(|n| *n == next_ref).unwrap_or(0);
            let mut cycle: Vec<String> =
                path[loop_start..].iter().map(|s| s.to_string()).collect();
            cycle.push(next_ref.to_string());
            return cycle;
        }
        path.push(next_ref);
        current = next_ref;
    }
}
