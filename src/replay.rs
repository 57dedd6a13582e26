//! Drive a collector from a recorded JSONL trace.
//!
//! Each line is one event: `enter` opens a scope at a level, `record` reports
//! an executed statement together with the frames that were on the stack
//! (innermost first), `exit` closes the innermost scope and yields a report.

use crate::analyze::{RecommendationTag, SignatureAnalyzer};
use crate::collector::{Collector, QueryEvent};
use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use crate::model::{FlameNode, ProfiledData, ProfilerLevel};
use crate::stack::{FixedFrames, RawFrame};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Enter {
        level: ProfilerLevel,
    },
    Record {
        sql: String,
        #[serde(default)]
        params: Option<Value>,
        #[serde(default = "default_target")]
        target: String,
        #[serde(default)]
        exec_time_micros: u64,
        #[serde(default)]
        row_count: Option<i64>,
        #[serde(default)]
        frames: Vec<RawFrame>,
    },
    Exit {
        #[serde(default)]
        label: Option<String>,
    },
}

fn default_target() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct SignatureReport {
    pub query: String,
    pub target: String,
    pub frequency: u64,
    pub execution_time_micros: u64,
    pub row_count: Option<i64>,
    pub recommendation: RecommendationTag,
    pub actionable: bool,
}

/// What one `exit` produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeReport {
    pub label: Option<String>,
    /// Scopes still open after this one closed.
    pub depth: usize,
    pub summary: BTreeMap<String, Value>,
    pub signatures: Vec<SignatureReport>,
    pub flame_graph: FlameNode,
}

impl ScopeReport {
    fn build(
        label: Option<String>,
        depth: usize,
        data: &ProfiledData,
        analyzer: &SignatureAnalyzer,
    ) -> Self {
        let mut signatures: Vec<SignatureReport> = data
            .signature_statistics()
            .iter()
            .map(|(signature, statistics)| {
                let recommendation = analyzer.analyze(signature);
                SignatureReport {
                    query: signature.normalized_sql().to_string(),
                    target: signature.target().to_string(),
                    frequency: statistics.frequency,
                    execution_time_micros: statistics.execution_time_micros,
                    row_count: statistics.row_count,
                    recommendation,
                    actionable: recommendation.visible_in_ui(),
                }
            })
            .collect();
        signatures.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.query.cmp(&b.query))
        });

        Self {
            label,
            depth,
            summary: data.summary().as_map(),
            signatures,
            flame_graph: data.flame_graph(),
        }
    }
}

/// Replay every event from `reader`, returning one report per `exit` in the
/// order the scopes closed. Blank lines are skipped.
pub fn replay<R: BufRead>(reader: R, config: &ProfilerConfig) -> Result<Vec<ScopeReport>> {
    let analyzer = SignatureAnalyzer::new(config.markers.clone());
    let mut collector =
        Collector::with_config(config.clone()).with_frame_source(Arc::new(FixedFrames::default()));
    let mut reports = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|err| ProfilerError::Replay {
            line: line_no,
            message: err.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event: TraceEvent =
            serde_json::from_str(&line).map_err(|err| ProfilerError::Replay {
                line: line_no,
                message: err.to_string(),
            })?;

        match event {
            TraceEvent::Enter { level } => collector.enter(level),
            TraceEvent::Record {
                sql,
                params,
                target,
                exec_time_micros,
                row_count,
                frames,
            } => {
                let event = QueryEvent {
                    sql: &sql,
                    params: params.as_ref(),
                    target: &target,
                    exec_time_micros,
                    row_count,
                };
                collector.record_with_source(&event, &FixedFrames(frames));
            }
            TraceEvent::Exit { label } => {
                let data = collector.exit()?;
                reports.push(ScopeReport::build(label, collector.depth(), &data, &analyzer));
            }
        }
    }

    if collector.depth() > 0 {
        tracing::warn!(open_scopes = collector.depth(), "trace ended with open scopes");
    }
    Ok(reports)
}

pub fn replay_path(path: &Path, config: &ProfilerConfig) -> anyhow::Result<Vec<ScopeReport>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reports = replay(BufReader::new(file), config)
        .with_context(|| format!("replay {}", path.display()))?;
    Ok(reports)
}
