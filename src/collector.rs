//! Nested profiling scopes for one logical thread of execution.
//!
//! Every `enter` appends a fresh slot and remembers where it starts; records
//! always land in the newest slot. `exit` folds all slots from its own start
//! to the end, so a scope sees everything recorded since it was entered,
//! nested scopes included, while enclosing scopes keep accumulating
//! undisturbed. Slots are only dropped when the outermost scope exits.
//!
//! A collector is owned by exactly one unit of work and is passed around
//! explicitly; nothing here is shared between logical threads.

use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use crate::model::{ProfiledData, ProfilerLevel, QuerySignature, QuerySignatureStatistics};
use crate::sql::collapse_placeholders;
use crate::stack::{self, FrameSource, LiveFrames};
use blake3::Hasher;
use serde_json::Value;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

/// One executed statement as reported by the execution hook.
#[derive(Debug, Clone, Copy)]
pub struct QueryEvent<'a> {
    /// SQL with placeholders, exactly as sent to the driver.
    pub sql: &'a str,
    pub params: Option<&'a Value>,
    /// Target database identifier.
    pub target: &'a str,
    pub exec_time_micros: u64,
    /// `None` when the driver cannot report a count. Error sentinels are
    /// passed through as-is.
    pub row_count: Option<i64>,
}

impl<'a> QueryEvent<'a> {
    pub fn new(sql: &'a str, target: &'a str) -> Self {
        Self {
            sql,
            params: None,
            target,
            exec_time_micros: 0,
            row_count: None,
        }
    }

    pub fn params(mut self, params: &'a Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn exec_time_micros(mut self, micros: u64) -> Self {
        self.exec_time_micros = micros;
        self
    }

    pub fn row_count(mut self, row_count: Option<i64>) -> Self {
        self.row_count = row_count;
        self
    }
}

pub struct Collector {
    config: ProfilerConfig,
    frames: Arc<dyn FrameSource>,
    scope_slots: Vec<ProfiledData>,
    entry_stack: Vec<usize>,
    level_stack: Vec<ProfilerLevel>,
    effective_level: Option<ProfilerLevel>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("slots", &self.scope_slots.len())
            .field("entry_stack", &self.entry_stack)
            .field("level_stack", &self.level_stack)
            .field("effective_level", &self.effective_level)
            .finish()
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::with_config(ProfilerConfig::global().clone())
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ProfilerConfig) -> Self {
        Self {
            config,
            frames: Arc::new(LiveFrames),
            scope_slots: Vec::new(),
            entry_stack: Vec::new(),
            level_stack: Vec::new(),
            effective_level: None,
        }
    }

    /// Replace the live stack walker, e.g. with recorded frames.
    pub fn with_frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = frames;
        self
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Strictest level across all open scopes, `None` when none are open.
    pub fn effective_level(&self) -> Option<ProfilerLevel> {
        self.effective_level
    }

    /// Number of scopes currently open.
    pub fn depth(&self) -> usize {
        self.entry_stack.len()
    }

    pub fn enter(&mut self, level: ProfilerLevel) {
        self.entry_stack.push(self.scope_slots.len());
        self.scope_slots.push(ProfiledData::empty());
        self.level_stack.push(level);
        self.effective_level = ProfilerLevel::join_all(self.level_stack.iter().copied());
        tracing::debug!(
            depth = self.entry_stack.len(),
            ?level,
            effective = ?self.effective_level,
            "profiling scope entered"
        );
    }

    /// Record into the innermost open scope using the collector's frame source.
    pub fn record(&mut self, event: &QueryEvent<'_>) {
        let frames = Arc::clone(&self.frames);
        self.record_with_source(event, frames.as_ref());
    }

    /// Record into the innermost open scope, taking the stack from `source`.
    /// Does nothing when no scope is open or profiling is disabled.
    pub fn record_with_source(&mut self, event: &QueryEvent<'_>, source: &dyn FrameSource) {
        let level = match self.effective_level {
            Some(level) if self.config.enabled => level,
            _ => return,
        };
        let start = Instant::now();

        let normalized_sql = if level.normalize_sql() && params_present(event.params) {
            collapse_placeholders(event.sql)
        } else {
            event.sql.to_string()
        };
        let (app_trace, owner_trace) = stack::capture(
            source,
            &self.config.app_modules_to_exclude,
            &self.config.owner_modules_to_include,
            level.stack_depth(),
        );
        let signature = QuerySignature::new(normalized_sql, app_trace, owner_trace, event.target);
        let statistics =
            QuerySignatureStatistics::single(event.exec_time_micros, event.row_count);
        let hash = dedup_hash(event.sql, event.params, event.target);
        let profiling_micros = start.elapsed().as_micros() as u64;
        let single = ProfiledData::single(signature, statistics, hash, profiling_micros);

        if let Some(slot) = self.scope_slots.last_mut() {
            *slot = std::mem::take(slot).merged(&single);
        }
    }

    /// Close the innermost scope and return everything recorded since its
    /// `enter`, including nested scopes.
    pub fn exit(&mut self) -> Result<ProfiledData> {
        let start = self
            .entry_stack
            .pop()
            .ok_or(ProfilerError::UnbalancedExit {
                slots: self.scope_slots.len(),
            })?;
        let data = ProfiledData::merge_all(&self.scope_slots[start..]);

        if self.entry_stack.is_empty() {
            self.clear();
        } else {
            self.level_stack.pop();
            self.effective_level = ProfilerLevel::join_all(self.level_stack.iter().copied());
        }
        tracing::debug!(
            depth = self.entry_stack.len(),
            signatures = data.signature_statistics().len(),
            "profiling scope exited"
        );
        Ok(data)
    }

    /// Drop all state, open scopes included. Call before a new unit of work
    /// on a reused collector.
    pub fn reset(&mut self) {
        if !self.entry_stack.is_empty() {
            tracing::warn!(
                open_scopes = self.entry_stack.len(),
                "resetting collector with open scopes"
            );
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.scope_slots.clear();
        self.entry_stack.clear();
        self.level_stack.clear();
        self.effective_level = None;
    }

    /// Open a scope that is closed when the guard is finished or dropped.
    pub fn scope(&mut self, level: ProfilerLevel) -> ScopeGuard<'_> {
        self.enter(level);
        ScopeGuard {
            collector: self,
            open: true,
        }
    }

    /// Run `f` inside a scope and return its output with the scope's data.
    pub fn profile<T>(
        &mut self,
        level: ProfilerLevel,
        f: impl FnOnce(&mut Collector) -> T,
    ) -> Result<(T, ProfiledData)> {
        let mut guard = self.scope(level);
        let output = f(&mut guard);
        let data = guard.finish()?;
        Ok((output, data))
    }
}

/// An open scope on a borrowed collector.
///
/// Derefs to the collector so queries and nested scopes go through it.
/// Dropping an unfinished guard exits the scope and discards its data.
pub struct ScopeGuard<'a> {
    collector: &'a mut Collector,
    open: bool,
}

impl ScopeGuard<'_> {
    pub fn finish(mut self) -> Result<ProfiledData> {
        self.open = false;
        self.collector.exit()
    }
}

impl Deref for ScopeGuard<'_> {
    type Target = Collector;

    fn deref(&self) -> &Collector {
        &*self.collector
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Collector {
        &mut *self.collector
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.collector.exit() {
                tracing::warn!("dropping profiling scope: {err}");
            }
        }
    }
}

/// Falsy parameters (null, `false`, zero, empty) count as no parameters.
fn params_present(params: Option<&Value>) -> bool {
    match params {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(number)) => number.as_f64() != Some(0.0),
        Some(Value::Array(values)) => !values.is_empty(),
        Some(Value::Object(values)) => !values.is_empty(),
        Some(Value::String(value)) => !value.is_empty(),
        Some(_) => true,
    }
}

/// Hash of the raw statement, its parameters and target, used to spot exact
/// repeats.
fn dedup_hash(sql: &str, params: Option<&Value>, target: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(sql.as_bytes());
    hasher.update(b"\x00");
    if let Some(params) = params.filter(|params| params_present(Some(params))) {
        hasher.update(params.to_string().as_bytes());
    }
    hasher.update(b"\x00");
    hasher.update(target.as_bytes());
    hasher.finalize().to_hex().to_string()
}
