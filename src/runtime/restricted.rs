//! The permission-filtered wrapper every skill operates through.
//!
//! Wraps the shared runtime context and checks a capability before each
//! class of operation: store statements are classified by a real
//! statement scanner, publish/subscribe hit the event gates, and
//! cross-skill calls need `SKILL_CALL`.  A denied operation fails with
//! `PERMISSION_DENIED` and has no side effects.  The wrapped store
//! handle cannot be closed from inside a skill.

use std::sync::Arc;

use tracing::debug;

use crate::bus::EventHandler;
use crate::errors::{FrameworkError, Result};
use crate::permissions::{classify_statement, Capability, StatementClass};
use crate::runtime::RuntimeContext;
use crate::skills::MethodArgs;

/// Per-skill view of the runtime.
#[derive(Clone)]
pub struct RestrictedContext {
    runtime: Arc<RuntimeContext>,
    skill: String,
}

impl RestrictedContext {
    pub(crate) fn new(runtime: Arc<RuntimeContext>, skill: &str) -> Self {
        Self {
            runtime,
            skill: skill.to_string(),
        }
    }

    pub fn skill_name(&self) -> &str {
        &self.skill
    }

    pub fn agent_code(&self) -> &str {
        &self.runtime.agent_code
    }

    /// Fail with `PERMISSION_DENIED` unless this skill holds `cap`.
    pub fn require(&self, cap: Capability) -> Result<()> {
        if self.runtime.permissions.is_granted(&self.skill, cap) {
            Ok(())
        } else {
            Err(FrameworkError::PermissionDenied {
                skill: self.skill.clone(),
                capability: cap,
            })
        }
    }

    /// The typed-access helper over the shared store.  Opening a unit of
    /// work takes a write transaction, so this requires `STORE_WRITE`.
    pub fn base_skill(&self) -> Result<crate::store::repo::BaseSkill> {
        self.require(Capability::StoreWrite)?;
        Ok(crate::store::repo::BaseSkill::new(
            self.runtime.engine.clone(),
        ))
    }

    /// The capability-gated store handle.
    pub fn store(&self) -> RestrictedStore {
        RestrictedStore {
            ctx: self.clone(),
        }
    }

    /// Publish an event; requires `EVENT_PUBLISH`. Returns the number of
    /// handlers that observed it.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<usize> {
        self.require(Capability::EventPublish)?;
        Ok(self.runtime.bus.publish(topic, payload))
    }

    /// Subscribe to a topic; requires `EVENT_SUBSCRIBE` (granted by
    /// default).
    pub fn subscribe(&self, topic: &str, handler: EventHandler) -> Result<()> {
        self.require(Capability::EventSubscribe)?;
        self.runtime.bus.subscribe(topic, &self.skill, handler);
        Ok(())
    }

    /// Invoke a method on another skill; requires `SKILL_CALL`.  The
    /// callee executes under its own capability set, not the caller's.
    pub fn call_skill(
        &self,
        skill: &str,
        method: &str,
        args: &MethodArgs,
    ) -> Result<serde_json::Value> {
        self.require(Capability::SkillCall)?;
        self.runtime.invoke(skill, method, args)
    }
}

/// Store handle with statement-class gating.
///
/// Reads (`SELECT`, `EXPLAIN`) need `STORE_READ`; write-class statements
/// need `STORE_WRITE`. `close()` is a no-op — the runtime owns the
/// shared handle's lifetime.
#[derive(Clone)]
pub struct RestrictedStore {
    ctx: RestrictedContext,
}

impl RestrictedStore {
    fn gate(&self, sql: &str) -> Result<()> {
        match classify_statement(sql) {
            StatementClass::Read => self.ctx.require(Capability::StoreRead),
            StatementClass::Write => self.ctx.require(Capability::StoreWrite),
        }
    }

    /// Execute one statement, returning the affected row count.
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        self.gate(sql)?;
        self.ctx.runtime.engine.execute(sql, params)
    }

    /// Run a query, collecting rows as JSON objects.
    pub fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<serde_json::Value>> {
        self.gate(sql)?;
        self.ctx.runtime.engine.query_json(sql, params)
    }

    /// Id of the most recently inserted row on this connection.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        self.ctx.require(Capability::StoreRead)?;
        self.ctx
            .runtime
            .engine
            .with_conn(|conn| Ok(conn.last_insert_rowid()))
    }

    /// Skills cannot close the shared handle; logged and ignored.
    pub fn close(&self) {
        debug!(skill = %self.ctx.skill, "ignored close() on shared store handle");
    }
}
