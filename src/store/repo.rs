//! Optional typed-access layer: generic repository, unit of work and the
//! base-skill helper.
//!
//! Additive on top of the raw store handle — skills that prefer typed
//! entities over raw statements implement [`Entity`] and go through a
//! [`Repository`]; a [`UnitOfWork`] scopes a set of operations into one
//! transaction that commits on clean exit and rolls back otherwise.

use std::marker::PhantomData;
use std::sync::{Arc, MutexGuard};

use rusqlite::types::Value;
use rusqlite::Connection;
use tracing::debug;

use crate::errors::{FrameworkError, Result};
use crate::store::StoreEngine;

/// A table-backed entity with an integer rowid primary key.
///
/// `columns()` excludes `id`; `values()` returns one value per column in
/// the same order; `from_row` reads `SELECT id, <columns...>`.
pub trait Entity: Sized {
    fn table() -> &'static str;
    fn columns() -> &'static [&'static str];
    fn id(&self) -> Option<i64>;
    fn set_id(&mut self, id: i64);
    fn values(&self) -> Vec<Value>;
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

/// Generic CRUD over one entity type, bound to a live session.
pub struct Repository<'c, T: Entity> {
    conn: &'c Connection,
    _marker: PhantomData<T>,
}

impl<'c, T: Entity> Repository<'c, T> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            _marker: PhantomData,
        }
    }

    fn select_prefix() -> String {
        format!("SELECT id, {} FROM {}", T::columns().join(", "), T::table())
    }

    /// Insert and return the entity with its assigned id.
    pub fn add(&self, mut entity: T) -> Result<T> {
        let placeholders: Vec<String> =
            (1..=T::columns().len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            T::table(),
            T::columns().join(", "),
            placeholders.join(", ")
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(entity.values()))
            .map_err(FrameworkError::from_store)?;
        entity.set_id(self.conn.last_insert_rowid());
        Ok(entity)
    }

    pub fn get(&self, id: i64) -> Result<Option<T>> {
        let sql = format!("{} WHERE id = ?1", Self::select_prefix());
        self.conn
            .query_row(&sql, [id], |row| T::from_row(row))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(FrameworkError::from_store(other)),
            })
    }

    pub fn get_all(&self, limit: usize, offset: usize) -> Result<Vec<T>> {
        let sql = format!(
            "{} ORDER BY id LIMIT ?1 OFFSET ?2",
            Self::select_prefix()
        );
        let mut stmt = self.conn.prepare(&sql).map_err(FrameworkError::from_store)?;
        let rows = stmt
            .query_map([limit as i64, offset as i64], |row| T::from_row(row))
            .map_err(FrameworkError::from_store)?;
        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(FrameworkError::from_store)
    }

    /// Update by id; the entity must have been persisted.
    pub fn update(&self, entity: T) -> Result<T> {
        let id = entity.id().ok_or_else(|| {
            FrameworkError::InvalidArgument(format!(
                "cannot update unsaved {} entity",
                T::table()
            ))
        })?;
        let assignments: Vec<String> = T::columns()
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            T::table(),
            assignments.join(", "),
            T::columns().len() + 1
        );
        let mut params = entity.values();
        params.push(Value::Integer(id));
        let changed = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(params))
            .map_err(FrameworkError::from_store)?;
        if changed == 0 {
            return Err(FrameworkError::InvalidArgument(format!(
                "no {} row with id {id}",
                T::table()
            )));
        }
        Ok(entity)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", T::table());
        let removed = self
            .conn
            .execute(&sql, [id])
            .map_err(FrameworkError::from_store)?;
        Ok(removed > 0)
    }

    /// Equality filters over known columns, ANDed together.
    pub fn search(&self, filters: &[(&str, Value)]) -> Result<Vec<T>> {
        for (col, _) in filters {
            if *col != "id" && !T::columns().contains(col) {
                return Err(FrameworkError::InvalidArgument(format!(
                    "unknown column '{col}' on {}",
                    T::table()
                )));
            }
        }
        let mut sql = Self::select_prefix();
        if !filters.is_empty() {
            let clauses: Vec<String> = filters
                .iter()
                .enumerate()
                .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        let mut stmt = self.conn.prepare(&sql).map_err(FrameworkError::from_store)?;
        let params: Vec<Value> = filters.iter().map(|(_, v)| v.clone()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| T::from_row(row))
            .map_err(FrameworkError::from_store)?;
        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(FrameworkError::from_store)
    }
}

/// A transactional scope over the shared session.
///
/// Holds the engine's connection for its lifetime: commit explicitly
/// with [`UnitOfWork::commit`]; dropping without committing rolls back.
pub struct UnitOfWork<'e> {
    guard: MutexGuard<'e, Connection>,
    committed: bool,
}

impl<'e> UnitOfWork<'e> {
    pub fn begin(engine: &'e StoreEngine) -> Result<Self> {
        let guard = engine.lock();
        guard
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(FrameworkError::from_store)?;
        Ok(Self {
            guard,
            committed: false,
        })
    }

    /// The raw session; raw statements and repositories may be mixed
    /// inside one unit of work.
    pub fn session(&self) -> &Connection {
        &self.guard
    }

    /// A repository bound to this unit's session.
    pub fn repo<T: Entity>(&self) -> Repository<'_, T> {
        Repository::new(&self.guard)
    }

    pub fn commit(mut self) -> Result<()> {
        self.guard
            .execute_batch("COMMIT")
            .map_err(FrameworkError::from_store)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!("unit of work dropped without commit; rolling back");
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

/// Engine-backed helper for skills built on the typed layer.
pub struct BaseSkill {
    engine: Arc<StoreEngine>,
}

impl BaseSkill {
    pub fn new(engine: Arc<StoreEngine>) -> Self {
        Self { engine }
    }

    /// Open a unit of work on the shared store.
    pub fn unit_of_work(&self) -> Result<UnitOfWork<'_>> {
        UnitOfWork::begin(&self.engine)
    }

    /// Run `f` inside a unit of work: commit on `Ok`, roll back on
    /// `Err`.  The session is released on every exit path.
    pub fn scoped<R>(
        &self,
        f: impl FnOnce(&UnitOfWork<'_>) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let uow = self.unit_of_work()?;
        match f(&uow) {
            Ok(out) => {
                uow.commit()?;
                Ok(out)
            }
            Err(e) => {
                drop(uow);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EngineRegistry;

    #[derive(Debug, Clone, PartialEq)]
    struct Task {
        id: Option<i64>,
        title: String,
        done: bool,
    }

    impl Entity for Task {
        fn table() -> &'static str {
            "tasks"
        }
        fn columns() -> &'static [&'static str] {
            &["title", "done"]
        }
        fn id(&self) -> Option<i64> {
            self.id
        }
        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
        fn values(&self) -> Vec<Value> {
            vec![
                Value::Text(self.title.clone()),
                Value::Integer(self.done as i64),
            ]
        }
        fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
            Ok(Task {
                id: Some(row.get(0)?),
                title: row.get(1)?,
                done: row.get::<_, i64>(2)? != 0,
            })
        }
    }

    fn engine() -> (tempfile::TempDir, Arc<StoreEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let url = dir.path().join("repo.db").to_string_lossy().into_owned();
        let engine = EngineRegistry::new().get_engine(&url).unwrap();
        engine
            .execute(
                "CREATE TABLE tasks (id INTEGER PRIMARY KEY, title TEXT NOT NULL, done INTEGER NOT NULL DEFAULT 0)",
                &[],
            )
            .unwrap();
        (dir, engine)
    }

    fn task(title: &str) -> Task {
        Task {
            id: None,
            title: title.into(),
            done: false,
        }
    }

    #[test]
    fn add_assigns_id_and_get_round_trips() {
        let (_dir, engine) = engine();
        let base = BaseSkill::new(engine);
        base.scoped(|uow| {
            let repo = uow.repo::<Task>();
            let saved = repo.add(task("write tests"))?;
            let id = saved.id.unwrap();
            assert_eq!(repo.get(id)?.unwrap(), saved);
            assert!(repo.get(id + 100)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_and_delete() {
        let (_dir, engine) = engine();
        let base = BaseSkill::new(engine);
        base.scoped(|uow| {
            let repo = uow.repo::<Task>();
            let mut saved = repo.add(task("draft"))?;
            saved.done = true;
            let updated = repo.update(saved)?;
            assert!(repo.get(updated.id.unwrap())?.unwrap().done);

            assert!(repo.delete(updated.id.unwrap())?);
            assert!(!repo.delete(updated.id.unwrap())?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_unsaved_entity_fails() {
        let (_dir, engine) = engine();
        let uow = UnitOfWork::begin(&engine).unwrap();
        let repo = uow.repo::<Task>();
        assert!(repo.update(task("never saved")).is_err());
    }

    #[test]
    fn search_filters_by_column() {
        let (_dir, engine) = engine();
        let base = BaseSkill::new(engine);
        base.scoped(|uow| {
            let repo = uow.repo::<Task>();
            repo.add(task("a"))?;
            let mut b = task("b");
            b.done = true;
            repo.add(b)?;

            let done = repo.search(&[("done", Value::Integer(1))])?;
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].title, "b");

            assert!(repo.search(&[("nope", Value::Null)]).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn get_all_paginates() {
        let (_dir, engine) = engine();
        let base = BaseSkill::new(engine);
        base.scoped(|uow| {
            let repo = uow.repo::<Task>();
            for i in 0..5 {
                repo.add(task(&format!("t{i}")))?;
            }
            let page = repo.get_all(2, 2)?;
            assert_eq!(page.len(), 2);
            assert_eq!(page[0].title, "t2");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn scoped_rolls_back_on_error() {
        let (_dir, engine) = engine();
        let base = BaseSkill::new(engine.clone());
        let res: anyhow::Result<()> = base.scoped(|uow| {
            uow.repo::<Task>().add(task("doomed"))?;
            anyhow::bail!("abort the scope")
        });
        assert!(res.is_err());

        let rows = engine
            .query_json("SELECT COUNT(*) AS n FROM tasks", &[])
            .unwrap();
        assert_eq!(rows[0]["n"], 0);
    }

    #[test]
    fn dropped_unit_of_work_rolls_back() {
        let (_dir, engine) = engine();
        {
            let uow = UnitOfWork::begin(&engine).unwrap();
            uow.repo::<Task>().add(task("uncommitted")).unwrap();
            // dropped here without commit
        }
        let rows = engine
            .query_json("SELECT COUNT(*) AS n FROM tasks", &[])
            .unwrap();
        assert_eq!(rows[0]["n"], 0);
    }

    #[test]
    fn mixing_raw_and_typed_in_one_unit() {
        let (_dir, engine) = engine();
        let base = BaseSkill::new(engine.clone());
        base.scoped(|uow| {
            uow.session()
                .execute("INSERT INTO tasks (title) VALUES ('raw')", [])?;
            let all = uow.repo::<Task>().get_all(10, 0)?;
            assert_eq!(all.len(), 1);
            Ok(())
        })
        .unwrap();
        let rows = engine
            .query_json("SELECT COUNT(*) AS n FROM tasks", &[])
            .unwrap();
        assert_eq!(rows[0]["n"], 1);
    }
}
