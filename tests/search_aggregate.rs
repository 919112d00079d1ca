//! Universal search aggregation across well-behaved, failing and
//! panicking providers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use skillet::bus::EventBus;
use skillet::config::Config;
use skillet::manifest::{SkillManifest, SkillPackage};
use skillet::permissions::PermissionRegistry;
use skillet::runtime::restricted::RestrictedContext;
use skillet::runtime::{RuntimeContext, SkillRegistry};
use skillet::search::{aggregate, SearchHit, SearchOptions};
use skillet::skills::SkillEntry;
use skillet::store::EngineRegistry;

/// A provider with canned hits, or a canned failure mode.
struct FixtureSkill {
    name: &'static str,
    hits: Vec<SearchHit>,
    mode: Mode,
}

enum Mode {
    Ok,
    Error,
    Panic,
    NoProvider,
}

impl SkillEntry for FixtureSkill {
    fn command(&self) -> clap::Command {
        clap::Command::new(self.name)
    }
    fn run(&self, _ctx: &RestrictedContext, _matches: &clap::ArgMatches) -> anyhow::Result<()> {
        Ok(())
    }
    fn search(
        &self,
        _ctx: &RestrictedContext,
        _query: &str,
        _limit: usize,
    ) -> Option<anyhow::Result<Vec<SearchHit>>> {
        match self.mode {
            Mode::Ok => Some(Ok(self.hits.clone())),
            Mode::Error => Some(Err(anyhow::anyhow!("provider backend unavailable"))),
            Mode::Panic => panic!("provider blew up"),
            Mode::NoProvider => None,
        }
    }
}

fn hit(skill: &str, id: &str, score: f64, importance: i64) -> SearchHit {
    SearchHit {
        skill: skill.into(),
        id: id.into(),
        kind: "item".into(),
        content: format!("{skill} {id}"),
        metadata: serde_json::json!({ "importance": importance }),
        score,
    }
}

fn runtime_with(dir: &Path, fixtures: Vec<FixtureSkill>) -> Arc<RuntimeContext> {
    let config = Arc::new(Config {
        data_folder: dir.join("data"),
        skills_dir: dir.join("skills"),
        api_token: None,
        daemon_addr: "127.0.0.1:0".into(),
    });
    let url = dir.join("data").join("agent.db").to_string_lossy().into_owned();
    let engine = EngineRegistry::new().get_engine(&url).unwrap();

    let mut packages: BTreeMap<String, SkillPackage> = BTreeMap::new();
    let mut order = Vec::new();
    for fixture in fixtures {
        let name = fixture.name.to_string();
        packages.insert(
            name.clone(),
            SkillPackage {
                manifest: SkillManifest {
                    name: name.clone(),
                    version: "1.0.0".into(),
                    description: String::new(),
                    requires: vec![],
                    schema_file: None,
                    migrations_dir: None,
                    entry_point: format!("{name}:main"),
                    requires_db: false,
                    internal_doc: None,
                    external_doc: None,
                    config_schema: None,
                },
                root: None,
                entry: Some(Arc::new(fixture)),
            },
        );
        order.push(name);
    }

    Arc::new(RuntimeContext {
        config,
        engine,
        bus: Arc::new(EventBus::new()),
        permissions: Arc::new(PermissionRegistry::new()),
        registry: SkillRegistry::from_parts(packages, order),
        agent_code: "default".into(),
    })
}

#[test]
fn merges_and_sorts_across_skills() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = runtime_with(
        tmp.path(),
        vec![
            FixtureSkill {
                name: "alpha",
                hits: vec![hit("alpha", "1", 0.9, 0), hit("alpha", "2", 0.3, 0)],
                mode: Mode::Ok,
            },
            FixtureSkill {
                name: "beta",
                hits: vec![hit("beta", "1", 0.6, 0)],
                mode: Mode::Ok,
            },
        ],
    );

    let hits = aggregate(&runtime, "anything", &SearchOptions::default());
    let keys: Vec<(String, String)> = hits.iter().map(|h| (h.skill.clone(), h.id.clone())).collect();
    assert_eq!(
        keys,
        vec![
            ("alpha".into(), "1".into()),
            ("beta".into(), "1".into()),
            ("alpha".into(), "2".into()),
        ]
    );
}

#[test]
fn importance_boost_reorders() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = runtime_with(
        tmp.path(),
        vec![FixtureSkill {
            name: "alpha",
            hits: vec![hit("alpha", "plain", 0.6, 0), hit("alpha", "critical", 0.5, 2)],
            mode: Mode::Ok,
        }],
    );

    let hits = aggregate(&runtime, "q", &SearchOptions::default());
    // 0.5 + 2*0.15 = 0.8 beats 0.6.
    assert_eq!(hits[0].id, "critical");
    assert_eq!(hits[0].score, 0.8);
}

#[test]
fn failing_and_panicking_providers_are_omitted() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = runtime_with(
        tmp.path(),
        vec![
            FixtureSkill {
                name: "good",
                hits: vec![hit("good", "1", 0.5, 0)],
                mode: Mode::Ok,
            },
            FixtureSkill {
                name: "flaky",
                hits: vec![],
                mode: Mode::Error,
            },
            FixtureSkill {
                name: "bomb",
                hits: vec![],
                mode: Mode::Panic,
            },
            FixtureSkill {
                name: "mute",
                hits: vec![],
                mode: Mode::NoProvider,
            },
        ],
    );

    let hits = aggregate(&runtime, "q", &SearchOptions::default());
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].skill, "good");
}

#[test]
fn ties_break_on_skill_then_id() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = runtime_with(
        tmp.path(),
        vec![
            FixtureSkill {
                name: "zeta",
                hits: vec![hit("zeta", "1", 0.5, 0)],
                mode: Mode::Ok,
            },
            FixtureSkill {
                name: "alpha",
                hits: vec![hit("alpha", "2", 0.5, 0), hit("alpha", "1", 0.5, 0)],
                mode: Mode::Ok,
            },
        ],
    );

    let hits = aggregate(&runtime, "q", &SearchOptions::default());
    let keys: Vec<(String, String)> = hits.iter().map(|h| (h.skill.clone(), h.id.clone())).collect();
    assert_eq!(
        keys,
        vec![
            ("alpha".into(), "1".into()),
            ("alpha".into(), "2".into()),
            ("zeta".into(), "1".into()),
        ]
    );
}

#[test]
fn limits_are_applied_globally_and_per_skill() {
    let tmp = tempfile::tempdir().unwrap();
    let many: Vec<SearchHit> = (0..30).map(|i| hit("alpha", &format!("{i:02}"), 0.9, 0)).collect();
    let runtime = runtime_with(
        tmp.path(),
        vec![
            FixtureSkill {
                name: "alpha",
                hits: many,
                mode: Mode::Ok,
            },
            FixtureSkill {
                name: "beta",
                hits: vec![hit("beta", "1", 0.95, 0)],
                mode: Mode::Ok,
            },
        ],
    );

    let opts = SearchOptions {
        total_limit: 5,
        per_skill_limit: Some(3),
        ..SearchOptions::default()
    };
    let hits = aggregate(&runtime, "q", &opts);
    assert_eq!(hits.len(), 4, "3 from alpha + 1 from beta");
    assert_eq!(hits[0].skill, "beta");
}
