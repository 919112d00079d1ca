//! Built-in note-keeping skill.
//!
//! The reference implementation of the skill contract: a schema, an init
//! hook, RPC methods, a search provider and a command root.  Publishes
//! `note_created` / `note_removed` events.

use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};
use tracing::debug;

use crate::errors::{FrameworkError, Result};
use crate::manifest::{SkillManifest, SkillPackage};
use crate::runtime::restricted::RestrictedContext;
use crate::search::SearchHit;
use crate::skills::{MethodArgs, SkillEntry};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS notes (
    id         INTEGER PRIMARY KEY,
    body       TEXT NOT NULL,
    tags       TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notes_created ON notes (created_at);
";

pub struct NotesSkill;

/// Package descriptor for the installed-skill registry.
pub fn package() -> SkillPackage {
    SkillPackage {
        manifest: SkillManifest {
            name: "notes".into(),
            version: "0.3.0".into(),
            description: "Keep and search short notes".into(),
            requires: vec![],
            schema_file: None,
            migrations_dir: None,
            entry_point: "skillet.skills.notes:register".into(),
            requires_db: true,
            internal_doc: None,
            external_doc: None,
            config_schema: None,
        },
        root: None,
        entry: Some(Arc::new(NotesSkill)),
    }
}

impl NotesSkill {
    fn add(&self, ctx: &RestrictedContext, body: &str, tags: &[String]) -> Result<i64> {
        let store = ctx.store();
        let tags_json = serde_json::to_string(tags)
            .map_err(|e| FrameworkError::Internal(e.to_string()))?;
        let created_at = chrono::Utc::now().to_rfc3339();
        store.execute(
            "INSERT INTO notes (body, tags, created_at) VALUES (?1, ?2, ?3)",
            &[&body, &tags_json, &created_at],
        )?;
        let id = store.last_insert_rowid()?;
        ctx.publish("note_created", &serde_json::json!({ "id": id }))?;
        Ok(id)
    }

    fn get(&self, ctx: &RestrictedContext, id: i64) -> Result<Option<serde_json::Value>> {
        let rows = ctx.store().query(
            "SELECT id, body, tags, created_at FROM notes WHERE id = ?1",
            &[&id],
        )?;
        Ok(rows.into_iter().next())
    }

    fn list(&self, ctx: &RestrictedContext, limit: i64) -> Result<Vec<serde_json::Value>> {
        ctx.store().query(
            "SELECT id, body, tags, created_at FROM notes ORDER BY created_at DESC LIMIT ?1",
            &[&limit],
        )
    }

    fn remove(&self, ctx: &RestrictedContext, id: i64) -> Result<bool> {
        let removed = ctx
            .store()
            .execute("DELETE FROM notes WHERE id = ?1", &[&id])?;
        if removed > 0 {
            ctx.publish("note_removed", &serde_json::json!({ "id": id }))?;
        }
        Ok(removed > 0)
    }
}

impl SkillEntry for NotesSkill {
    fn command(&self) -> Command {
        Command::new("notes")
            .about("Keep and search short notes")
            .subcommand_required(true)
            .subcommand(
                Command::new("add")
                    .about("Add a note")
                    .arg(Arg::new("body").required(true))
                    .arg(
                        Arg::new("tag")
                            .long("tag")
                            .action(clap::ArgAction::Append),
                    ),
            )
            .subcommand(
                Command::new("list").about("List recent notes").arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(i64))
                        .default_value("20"),
                ),
            )
            .subcommand(
                Command::new("remove")
                    .about("Remove a note by id")
                    .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64))),
            )
    }

    fn run(&self, ctx: &RestrictedContext, matches: &ArgMatches) -> anyhow::Result<()> {
        match matches.subcommand() {
            Some(("add", sub)) => {
                let body = sub.get_one::<String>("body").expect("required");
                let tags: Vec<String> = sub
                    .get_many::<String>("tag")
                    .map(|v| v.cloned().collect())
                    .unwrap_or_default();
                let id = self.add(ctx, body, &tags)?;
                println!("{id}");
            }
            Some(("list", sub)) => {
                let limit = *sub.get_one::<i64>("limit").expect("defaulted");
                for note in self.list(ctx, limit)? {
                    println!(
                        "{:>5}  {}",
                        note["id"],
                        note["body"].as_str().unwrap_or_default()
                    );
                }
            }
            Some(("remove", sub)) => {
                let id = *sub.get_one::<i64>("id").expect("required");
                if !self.remove(ctx, id)? {
                    anyhow::bail!("no note with id {id}");
                }
            }
            _ => unreachable!("subcommand required"),
        }
        Ok(())
    }

    fn init_context(&self, ctx: &RestrictedContext) -> anyhow::Result<()> {
        debug!(agent = %ctx.agent_code(), "notes skill initialized");
        Ok(())
    }

    fn invoke(
        &self,
        ctx: &RestrictedContext,
        method: &str,
        args: &MethodArgs,
    ) -> Result<serde_json::Value> {
        match method {
            "add" => {
                let body = args.get_str(0, "body").ok_or_else(|| {
                    FrameworkError::InvalidArgument("add requires a body".into())
                })?;
                let tags: Vec<String> = args
                    .get(1, "tags")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let id = self.add(ctx, body, &tags)?;
                Ok(serde_json::json!({ "id": id }))
            }
            "get" => {
                let id = args.get_i64(0, "id").ok_or_else(|| {
                    FrameworkError::InvalidArgument("get requires an id".into())
                })?;
                self.get(ctx, id)?.ok_or_else(|| {
                    FrameworkError::InvalidArgument(format!("no note with id {id}"))
                })
            }
            "list" => {
                let limit = args.get_i64(0, "limit").unwrap_or(20);
                Ok(serde_json::Value::Array(self.list(ctx, limit)?))
            }
            "remove" => {
                let id = args.get_i64(0, "id").ok_or_else(|| {
                    FrameworkError::InvalidArgument("remove requires an id".into())
                })?;
                Ok(serde_json::json!({ "removed": self.remove(ctx, id)? }))
            }
            other => Err(FrameworkError::MethodNotFound {
                skill: ctx.skill_name().to_string(),
                method: other.to_string(),
            }),
        }
    }

    fn search(
        &self,
        ctx: &RestrictedContext,
        query: &str,
        limit: usize,
    ) -> Option<anyhow::Result<Vec<SearchHit>>> {
        Some(search_notes(ctx, query, limit))
    }

    fn schema_sql(&self) -> Option<&'static str> {
        Some(SCHEMA)
    }
}

fn search_notes(
    ctx: &RestrictedContext,
    query: &str,
    limit: usize,
) -> anyhow::Result<Vec<SearchHit>> {
    let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
    let rows = ctx.store().query(
        "SELECT id, body, tags FROM notes WHERE body LIKE ?1 ESCAPE '\\'
         ORDER BY created_at DESC LIMIT ?2",
        &[&pattern, &(limit as i64)],
    )?;
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .collect();
    let hits = rows
        .into_iter()
        .map(|row| {
            let body = row["body"].as_str().unwrap_or_default().to_string();
            let tags: Vec<String> = row["tags"]
                .as_str()
                .and_then(|t| serde_json::from_str(t).ok())
                .unwrap_or_default();
            SearchHit {
                skill: "notes".into(),
                id: row["id"].to_string(),
                kind: "note".into(),
                score: term_score(&body, &terms),
                metadata: serde_json::json!({ "importance": importance_of(&tags) }),
                content: body,
            }
        })
        .collect();
    Ok(hits)
}

/// Fraction of query terms present in the body.
fn term_score(body: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = body.to_ascii_lowercase();
    let matched = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    matched as f64 / terms.len() as f64
}

fn importance_of(tags: &[String]) -> i64 {
    if tags.iter().any(|t| t == "critical") {
        2
    } else if tags.iter().any(|t| t == "important") {
        1
    } else {
        0
    }
}
