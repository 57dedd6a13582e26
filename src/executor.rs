//! Hooking query execution into a collector.
//!
//! Hosts expose their driver through [`QueryExecutor`]; wrapping it in a
//! [`ProfiledExecutor`] times every call and records it into a collector
//! shared within one logical thread. Row counts come from an injected
//! [`RowCountExtractor`] because drivers disagree on how to report them.

use crate::collector::{Collector, QueryEvent};
use crate::error::{ProfilerError, Result};
use crate::model::{ProfiledData, ProfilerLevel};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Row count recorded when the driver reports an error state instead of a count.
pub const ROW_COUNT_ERROR: i64 = -1;

/// Capability to run a statement against one target database.
pub trait QueryExecutor {
    type Output;
    type Error;

    /// Identifier of the database this executor talks to.
    fn target(&self) -> &str;

    fn execute(&mut self, sql: &str, params: Option<&Value>) -> std::result::Result<Self::Output, Self::Error>;
}

pub trait RowCountExtractor<O> {
    fn row_count(&self, output: &O) -> Option<i64>;
}

impl<O, F> RowCountExtractor<O> for F
where
    F: Fn(&O) -> Option<i64>,
{
    fn row_count(&self, output: &O) -> Option<i64> {
        self(output)
    }
}

/// For drivers that never report a row count (SQLite).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRowCount;

impl<O> RowCountExtractor<O> for NoRowCount {
    fn row_count(&self, _output: &O) -> Option<i64> {
        None
    }
}

/// For drivers that flag an error state next to the count (MySQL): a flagged
/// output records [`ROW_COUNT_ERROR`] rather than whatever count it carries.
#[derive(Debug, Clone, Copy)]
pub struct ErrorAware<C, F> {
    count: C,
    failed: F,
}

impl<C, F> ErrorAware<C, F> {
    pub fn new(count: C, failed: F) -> Self {
        Self { count, failed }
    }
}

impl<O, C, F> RowCountExtractor<O> for ErrorAware<C, F>
where
    C: RowCountExtractor<O>,
    F: Fn(&O) -> bool,
{
    fn row_count(&self, output: &O) -> Option<i64> {
        if (self.failed)(output) {
            Some(ROW_COUNT_ERROR)
        } else {
            self.count.row_count(output)
        }
    }
}

/// Collector handle shared by everything running in one unit of work.
pub type SharedCollector = Rc<RefCell<Collector>>;

pub fn shared(collector: Collector) -> SharedCollector {
    Rc::new(RefCell::new(collector))
}

/// Executor decorator that records every statement it runs.
pub struct ProfiledExecutor<E, R> {
    inner: E,
    row_counts: R,
    collector: SharedCollector,
}

impl<E, R> ProfiledExecutor<E, R>
where
    E: QueryExecutor,
    R: RowCountExtractor<E::Output>,
{
    pub fn new(inner: E, row_counts: R, collector: SharedCollector) -> Self {
        Self {
            inner,
            row_counts,
            collector,
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    /// Run one statement per parameter set and record the batch as a single
    /// query. Stops at the first failure.
    pub fn execute_many(
        &mut self,
        sql: &str,
        batch: &[Value],
    ) -> std::result::Result<Vec<E::Output>, E::Error> {
        let start = Instant::now();
        let mut outputs = Vec::with_capacity(batch.len());
        let mut failure = None;
        for params in batch {
            match self.inner.execute(sql, Some(params)) {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let elapsed = start.elapsed().as_micros() as u64;

        let row_count = if failure.is_some() {
            None
        } else {
            outputs.iter().try_fold(0i64, |total, output| {
                self.row_counts
                    .row_count(output)
                    .and_then(|rows| total.checked_add(rows))
            })
        };
        let params = Value::Array(batch.to_vec());
        self.record(sql, Some(&params), elapsed, row_count);

        match failure {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    fn record(&self, sql: &str, params: Option<&Value>, exec_time_micros: u64, row_count: Option<i64>) {
        let event = QueryEvent {
            sql,
            params,
            target: self.inner.target(),
            exec_time_micros,
            row_count,
        };
        match self.collector.try_borrow_mut() {
            Ok(mut collector) => collector.record(&event),
            Err(_) => tracing::warn!("collector is borrowed elsewhere, query not recorded"),
        }
    }
}

impl<E, R> QueryExecutor for ProfiledExecutor<E, R>
where
    E: QueryExecutor,
    R: RowCountExtractor<E::Output>,
{
    type Output = E::Output;
    type Error = E::Error;

    fn target(&self) -> &str {
        self.inner.target()
    }

    fn execute(&mut self, sql: &str, params: Option<&Value>) -> std::result::Result<Self::Output, Self::Error> {
        let start = Instant::now();
        let result = self.inner.execute(sql, params);
        let elapsed = start.elapsed().as_micros() as u64;
        // A failed statement is still recorded, with an unknown row count.
        let row_count = match &result {
            Ok(output) => self.row_counts.row_count(output),
            Err(_) => None,
        };
        self.record(sql, params, elapsed, row_count);
        result
    }
}

/// A scope opened on a shared collector. The collector is only borrowed
/// while entering and exiting, so executors can record in between. Both fail
/// with [`ProfilerError::CollectorBusy`] instead of panicking when someone
/// else holds a borrow.
pub struct SharedScope {
    collector: SharedCollector,
    open: bool,
}

impl SharedScope {
    pub fn open(collector: &SharedCollector, level: ProfilerLevel) -> Result<Self> {
        collector
            .try_borrow_mut()
            .map_err(|_| ProfilerError::CollectorBusy)?
            .enter(level);
        Ok(Self {
            collector: Rc::clone(collector),
            open: true,
        })
    }

    /// On `CollectorBusy` the drop retries the exit once; if the borrow is
    /// still held the collector keeps the scope open.
    pub fn finish(mut self) -> Result<ProfiledData> {
        let data = self
            .collector
            .try_borrow_mut()
            .map_err(|_| ProfilerError::CollectorBusy)?
            .exit();
        self.open = false;
        data
    }
}

impl Drop for SharedScope {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        match self.collector.try_borrow_mut() {
            Ok(mut collector) => {
                if let Err(err) = collector.exit() {
                    tracing::warn!("dropping shared profiling scope: {err}");
                }
            }
            Err(_) => tracing::warn!("collector is borrowed elsewhere, scope left open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerConfig;
    use crate::stack::FixedFrames;
    use serde_json::json;
    use std::sync::Arc;

    struct FakeDb {
        target: String,
        rows: i64,
        fail_on: Option<&'static str>,
        executed: Vec<String>,
    }

    impl FakeDb {
        fn new(rows: i64) -> Self {
            Self {
                target: "default".to_string(),
                rows,
                fail_on: None,
                executed: Vec::new(),
            }
        }
    }

    impl QueryExecutor for FakeDb {
        type Output = i64;
        type Error = String;

        fn target(&self) -> &str {
            &self.target
        }

        fn execute(&mut self, sql: &str, _params: Option<&Value>) -> std::result::Result<i64, String> {
            self.executed.push(sql.to_string());
            if self.fail_on == Some(sql) {
                return Err(format!("failed: {sql}"));
            }
            Ok(self.rows)
        }
    }

    fn shared_collector() -> SharedCollector {
        let collector = Collector::with_config(ProfilerConfig::default())
            .with_frame_source(Arc::new(FixedFrames::default()));
        shared(collector)
    }

    #[test]
    fn records_through_decorator() {
        let collector = shared_collector();
        let mut db = ProfiledExecutor::new(FakeDb::new(2), |rows: &i64| Some(*rows), Rc::clone(&collector));

        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        assert_eq!(db.execute("SELECT 1", None), Ok(2));
        assert_eq!(db.execute("SELECT 1", None), Ok(2));
        let data = scope.finish().unwrap();

        assert_eq!(data.summary().total_query_count(), 2);
        assert_eq!(data.summary().total_row_count, Some(4));
        assert_eq!(data.summary().exact_duplicate_count, 2);
        assert_eq!(db.inner().executed.len(), 2);
    }

    #[test]
    fn failed_statement_is_recorded_and_returned() {
        let collector = shared_collector();
        let mut fake = FakeDb::new(1);
        fake.fail_on = Some("DELETE FROM t");
        let mut db = ProfiledExecutor::new(fake, |rows: &i64| Some(*rows), Rc::clone(&collector));

        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        assert!(db.execute("DELETE FROM t", None).is_err());
        let data = scope.finish().unwrap();
        assert_eq!(data.summary().total_query_count(), 1);
        assert_eq!(data.summary().total_row_count, None);
    }

    #[test]
    fn sqlite_style_row_counts_are_unknown() {
        let collector = shared_collector();
        let mut db = ProfiledExecutor::new(FakeDb::new(5), NoRowCount, Rc::clone(&collector));
        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        db.execute("SELECT 1", None).unwrap();
        let data = scope.finish().unwrap();
        assert_eq!(data.summary().total_row_count, None);
    }

    #[test]
    fn error_sentinel_flows_through() {
        let extractor = ErrorAware::new(|rows: &i64| Some(*rows), |rows: &i64| *rows < 0);
        assert_eq!(extractor.row_count(&-7i64), Some(ROW_COUNT_ERROR));
        assert_eq!(extractor.row_count(&3i64), Some(3));

        let collector = shared_collector();
        let mut db = ProfiledExecutor::new(FakeDb::new(-7), extractor, Rc::clone(&collector));
        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        db.execute("UPDATE t SET a = 1", None).unwrap();
        let data = scope.finish().unwrap();
        assert_eq!(data.summary().total_row_count, Some(ROW_COUNT_ERROR));
    }

    #[test]
    fn batch_is_one_record() {
        let collector = shared_collector();
        let mut db = ProfiledExecutor::new(FakeDb::new(1), |rows: &i64| Some(*rows), Rc::clone(&collector));
        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        let outputs = db
            .execute_many("INSERT INTO t VALUES (%s)", &[json!([1]), json!([2]), json!([3])])
            .unwrap();
        let data = scope.finish().unwrap();
        assert_eq!(outputs, vec![1, 1, 1]);
        assert_eq!(data.summary().total_query_count(), 1);
        assert_eq!(data.summary().total_row_count, Some(3));
    }

    #[test]
    fn outside_any_scope_nothing_is_recorded() {
        let collector = shared_collector();
        let mut db = ProfiledExecutor::new(FakeDb::new(1), NoRowCount, Rc::clone(&collector));
        db.execute("SELECT 1", None).unwrap();
        assert!(collector.borrow_mut().exit().is_err());
    }

    #[test]
    fn busy_collector_is_an_error_not_a_panic() {
        let collector = shared_collector();
        {
            let _held = collector.borrow();
            assert!(matches!(
                SharedScope::open(&collector, ProfilerLevel::Query),
                Err(ProfilerError::CollectorBusy)
            ));
        }
        assert_eq!(collector.borrow().depth(), 0);

        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        let held = Rc::clone(&collector);
        let guard = held.borrow();
        assert_eq!(scope.finish().unwrap_err(), ProfilerError::CollectorBusy);
        assert_eq!(guard.depth(), 1);
        drop(guard);
    }

    #[test]
    fn batch_row_count_overflow_is_unknown() {
        let collector = shared_collector();
        let mut db = ProfiledExecutor::new(FakeDb::new(i64::MAX), |rows: &i64| Some(*rows), Rc::clone(&collector));
        let scope = SharedScope::open(&collector, ProfilerLevel::Query).unwrap();
        db.execute_many("UPDATE t SET a = %s", &[json!([1]), json!([2])]).unwrap();
        let data = scope.finish().unwrap();
        assert_eq!(data.summary().total_row_count, None);
    }

    #[test]
    fn dropped_shared_scope_closes() {
        let collector = shared_collector();
        {
            let _scope = SharedScope::open(&collector, ProfilerLevel::QuerySignature).unwrap();
            assert_eq!(collector.borrow().depth(), 1);
        }
        assert_eq!(collector.borrow().depth(), 0);
    }
}
