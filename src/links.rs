//! Cross-skill entity links.
//!
//! A framework-level graph table connecting `(skill, id)` pairs with a
//! kind and a weight.  Traversal follows outgoing edges breadth-first,
//! bounded by depth and a visited set, so link cycles terminate.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::store::StoreEngine;

/// One side of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub skill: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(skill: &str, id: &str) -> Self {
        Self {
            skill: skill.to_string(),
            id: id.to_string(),
        }
    }
}

/// A stored edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub from: EntityRef,
    pub to: EntityRef,
    pub kind: String,
    pub weight: f64,
}

/// Create the `_links` table. Idempotent.
pub fn ensure_schema(engine: &StoreEngine) -> Result<()> {
    engine.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _links (
                from_skill TEXT NOT NULL,
                from_id    TEXT NOT NULL,
                to_skill   TEXT NOT NULL,
                to_id      TEXT NOT NULL,
                kind       TEXT NOT NULL,
                weight     REAL NOT NULL DEFAULT 1.0,
                created_at TEXT NOT NULL,
                PRIMARY KEY (from_skill, from_id, to_skill, to_id, kind)
            );
            CREATE INDEX IF NOT EXISTS idx_links_from ON _links (from_skill, from_id);
            CREATE INDEX IF NOT EXISTS idx_links_to   ON _links (to_skill, to_id);",
        )
    })
}

/// Insert or update an edge.
pub fn link(
    engine: &StoreEngine,
    from: &EntityRef,
    to: &EntityRef,
    kind: &str,
    weight: f64,
) -> Result<()> {
    let created_at = chrono::Utc::now().to_rfc3339();
    engine.execute(
        "INSERT INTO _links (from_skill, from_id, to_skill, to_id, kind, weight, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (from_skill, from_id, to_skill, to_id, kind)
         DO UPDATE SET weight = ?6",
        &[
            &from.skill,
            &from.id,
            &to.skill,
            &to.id,
            &kind,
            &weight,
            &created_at,
        ],
    )?;
    Ok(())
}

/// Delete an edge. Returns whether one existed.
pub fn unlink(engine: &StoreEngine, from: &EntityRef, to: &EntityRef, kind: &str) -> Result<bool> {
    let removed = engine.execute(
        "DELETE FROM _links
         WHERE from_skill = ?1 AND from_id = ?2 AND to_skill = ?3 AND to_id = ?4 AND kind = ?5",
        &[&from.skill, &from.id, &to.skill, &to.id, &kind],
    )?;
    Ok(removed > 0)
}

/// Outgoing edges from an entity, heaviest first.
pub fn neighbors(engine: &StoreEngine, of: &EntityRef) -> Result<Vec<Link>> {
    engine.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT from_skill, from_id, to_skill, to_id, kind, weight
             FROM _links WHERE from_skill = ?1 AND from_id = ?2
             ORDER BY weight DESC, to_skill, to_id",
        )?;
        let rows = stmt.query_map([&of.skill, &of.id], |row| {
            Ok(Link {
                from: EntityRef {
                    skill: row.get(0)?,
                    id: row.get(1)?,
                },
                to: EntityRef {
                    skill: row.get(2)?,
                    id: row.get(3)?,
                },
                kind: row.get(4)?,
                weight: row.get(5)?,
            })
        })?;
        rows.collect()
    })
}

/// Breadth-first traversal of outgoing edges from `start`, up to
/// `max_depth` hops.  Returns visited entities with their distance,
/// excluding `start` itself.
pub fn traverse(
    engine: &StoreEngine,
    start: &EntityRef,
    max_depth: u32,
) -> Result<Vec<(EntityRef, u32)>> {
    let mut visited = std::collections::HashSet::new();
    visited.insert(start.clone());
    let mut frontier = vec![start.clone()];
    let mut out = Vec::new();

    for depth in 1..=max_depth {
        let mut next = Vec::new();
        for entity in &frontier {
            for edge in neighbors(engine, entity)? {
                if visited.insert(edge.to.clone()) {
                    out.push((edge.to.clone(), depth));
                    next.push(edge.to);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EngineRegistry;
    use std::sync::Arc;

    fn engine() -> (tempfile::TempDir, Arc<StoreEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let url = dir.path().join("links.db").to_string_lossy().into_owned();
        let engine = EngineRegistry::new().get_engine(&url).unwrap();
        ensure_schema(&engine).unwrap();
        (dir, engine)
    }

    #[test]
    fn link_unlink_round_trip() {
        let (_dir, engine) = engine();
        let note = EntityRef::new("notes", "1");
        let issue = EntityRef::new("issues", "42");
        link(&engine, &note, &issue, "references", 0.8).unwrap();

        let out = neighbors(&engine, &note).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, issue);
        assert_eq!(out[0].weight, 0.8);

        assert!(unlink(&engine, &note, &issue, "references").unwrap());
        assert!(!unlink(&engine, &note, &issue, "references").unwrap());
        assert!(neighbors(&engine, &note).unwrap().is_empty());
    }

    #[test]
    fn relink_updates_weight() {
        let (_dir, engine) = engine();
        let a = EntityRef::new("notes", "1");
        let b = EntityRef::new("notes", "2");
        link(&engine, &a, &b, "related", 0.5).unwrap();
        link(&engine, &a, &b, "related", 0.9).unwrap();
        let out = neighbors(&engine, &a).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].weight, 0.9);
    }

    #[test]
    fn traversal_is_depth_bounded() {
        let (_dir, engine) = engine();
        let chain: Vec<EntityRef> = (0..4).map(|i| EntityRef::new("n", &i.to_string())).collect();
        for pair in chain.windows(2) {
            link(&engine, &pair[0], &pair[1], "next", 1.0).unwrap();
        }

        let reached = traverse(&engine, &chain[0], 2).unwrap();
        assert_eq!(reached.len(), 2);
        assert_eq!(reached[0], (chain[1].clone(), 1));
        assert_eq!(reached[1], (chain[2].clone(), 2));
    }

    #[test]
    fn traversal_terminates_on_cycles() {
        let (_dir, engine) = engine();
        let a = EntityRef::new("n", "a");
        let b = EntityRef::new("n", "b");
        link(&engine, &a, &b, "next", 1.0).unwrap();
        link(&engine, &b, &a, "next", 1.0).unwrap();

        let reached = traverse(&engine, &a, 10).unwrap();
        // Only b is new; a is the visited start.
        assert_eq!(reached.len(), 1);
        assert_eq!(reached[0].0, b);
    }
}
