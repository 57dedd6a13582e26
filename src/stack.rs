//! Call-stack capture split into an owner-domain trace and an application trace.
//!
//! Membership decisions are prefix matches on module paths. They are cached in
//! process-wide tables keyed by the exact prefix set, so collectors configured
//! differently never read each other's answers. The tables hold nothing that
//! depends on scope state and are safe to share across threads.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// One frame of a captured trace.
///
/// Owner-domain frames carry no line number, so two calls into the same
/// framework function compare equal whichever physical call site produced
/// them. Application frames keep their line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackFrameDescriptor {
    pub domain_path: String,
    pub function_name: String,
    pub line_number: Option<u32>,
}

impl StackFrameDescriptor {
    pub fn owner(domain_path: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            domain_path: domain_path.into(),
            function_name: function_name.into(),
            line_number: None,
        }
    }

    pub fn app(
        domain_path: impl Into<String>,
        function_name: impl Into<String>,
        line_number: u32,
    ) -> Self {
        Self {
            domain_path: domain_path.into(),
            function_name: function_name.into(),
            line_number: Some(line_number),
        }
    }
}

impl fmt::Display for StackFrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line_number {
            Some(line) => write!(f, "{}#{} {}()", self.domain_path, line, self.function_name),
            None => write!(f, "{}# {}()", self.domain_path, self.function_name),
        }
    }
}

/// A resolved frame before it has been classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub line: Option<u32>,
}

impl RawFrame {
    pub fn new(module: impl Into<String>, function: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            line,
        }
    }
}

/// Where frames come from. Frames are returned innermost first.
pub trait FrameSource: Send + Sync {
    fn frames(&self, max_depth: usize) -> Vec<RawFrame>;
}

/// Walks the live stack of the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveFrames;

impl FrameSource for LiveFrames {
    fn frames(&self, max_depth: usize) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        if max_depth == 0 {
            return frames;
        }
        backtrace::trace(|frame| {
            backtrace::resolve_frame(frame, |symbol| {
                if frames.len() >= max_depth {
                    return;
                }
                if let Some(name) = symbol.name() {
                    // `{:#}` drops the trailing `::h<hash>` from demangled names
                    let path = format!("{name:#}");
                    let (module, function) = split_symbol_path(&path);
                    frames.push(RawFrame {
                        module,
                        function,
                        line: symbol.lineno(),
                    });
                }
            });
            frames.len() < max_depth
        });
        frames
    }
}

/// A pre-recorded stack, used for replayed traces and tests.
#[derive(Debug, Default, Clone)]
pub struct FixedFrames(pub Vec<RawFrame>);

impl FrameSource for FixedFrames {
    fn frames(&self, max_depth: usize) -> Vec<RawFrame> {
        self.0.iter().take(max_depth).cloned().collect()
    }
}

fn split_symbol_path(path: &str) -> (String, String) {
    let path = path.trim_start_matches('<');
    match path.rsplit_once("::") {
        Some((module, function)) => (module.to_string(), function.to_string()),
        None => (String::new(), path.to_string()),
    }
}

type DecisionTable = Arc<DashMap<String, bool>>;
type DecisionRegistry = DashMap<Vec<String>, DecisionTable>;

fn owner_decisions() -> &'static DecisionRegistry {
    static OWNER: OnceLock<DecisionRegistry> = OnceLock::new();
    OWNER.get_or_init(DashMap::new)
}

fn app_decisions() -> &'static DecisionRegistry {
    static APP: OnceLock<DecisionRegistry> = OnceLock::new();
    APP.get_or_init(DashMap::new)
}

fn decision_table(registry: &DecisionRegistry, prefixes: &[String]) -> DecisionTable {
    if let Some(table) = registry.get(prefixes) {
        return Arc::clone(&table);
    }
    Arc::clone(&registry.entry(prefixes.to_vec()).or_default())
}

fn decide(table: &DecisionTable, module: &str, compute: impl FnOnce() -> bool) -> bool {
    if let Some(decision) = table.get(module) {
        return *decision;
    }
    let decision = compute();
    table.insert(module.to_string(), decision);
    decision
}

fn matches_any_prefix(module: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| module.starts_with(prefix.as_str()))
}

/// Captured traces, application first, each innermost frame first.
pub type Traces = (Vec<StackFrameDescriptor>, Vec<StackFrameDescriptor>);

/// Split up to `max_depth` frames from `source` into `(app_trace, owner_trace)`.
///
/// A frame whose module matches `include_owner_prefixes` goes to the owner
/// trace only; otherwise it goes to the app trace unless it matches
/// `exclude_app_prefixes`. A depth of zero returns two empty traces without
/// touching the source.
pub fn capture(
    source: &dyn FrameSource,
    exclude_app_prefixes: &[String],
    include_owner_prefixes: &[String],
    max_depth: usize,
) -> Traces {
    let mut app_trace = Vec::new();
    let mut owner_trace = Vec::new();
    if max_depth == 0 {
        return (app_trace, owner_trace);
    }

    let owner_table = decision_table(owner_decisions(), include_owner_prefixes);
    let app_table = decision_table(app_decisions(), exclude_app_prefixes);

    for frame in source.frames(max_depth).into_iter().take(max_depth) {
        let is_owner = decide(&owner_table, &frame.module, || {
            matches_any_prefix(&frame.module, include_owner_prefixes)
        });
        if is_owner {
            owner_trace.push(StackFrameDescriptor::owner(frame.module, frame.function));
            continue;
        }
        let is_app = decide(&app_table, &frame.module, || {
            !matches_any_prefix(&frame.module, exclude_app_prefixes)
        });
        if is_app {
            app_trace.push(StackFrameDescriptor {
                domain_path: frame.module,
                function_name: frame.function,
                line_number: frame.line,
            });
        }
    }
    (app_trace, owner_trace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn sample_stack() -> FixedFrames {
        FixedFrames(vec![
            RawFrame::new("orm::sql::compiler", "execute_sql", Some(1100)),
            RawFrame::new("orm::query", "fetch_all", Some(1300)),
            RawFrame::new("shop::views", "order_list", Some(42)),
            RawFrame::new("std::rt", "lang_start", Some(7)),
        ])
    }

    struct PanickingSource;

    impl FrameSource for PanickingSource {
        fn frames(&self, _max_depth: usize) -> Vec<RawFrame> {
            panic!("stack must not be walked at depth 0");
        }
    }

    #[test]
    fn splits_owner_and_app_frames() {
        let (app, owner) = capture(
            &sample_stack(),
            &prefixes(&["std::"]),
            &prefixes(&["orm::"]),
            10,
        );
        assert_eq!(
            owner,
            vec![
                StackFrameDescriptor::owner("orm::sql::compiler", "execute_sql"),
                StackFrameDescriptor::owner("orm::query", "fetch_all"),
            ]
        );
        assert_eq!(app, vec![StackFrameDescriptor::app("shop::views", "order_list", 42)]);
    }

    #[test]
    fn owner_membership_wins_over_app_membership() {
        // Nothing excluded, so every frame would qualify for the app trace.
        let (app, owner) = capture(&sample_stack(), &[], &prefixes(&["orm::query"]), 10);
        assert_eq!(owner, vec![StackFrameDescriptor::owner("orm::query", "fetch_all")]);
        assert_eq!(app.len(), 3);
        assert!(app.iter().all(|frame| frame.domain_path != "orm::query"));
    }

    #[test]
    fn depth_bounds_the_walk() {
        let (app, owner) = capture(&sample_stack(), &[], &prefixes(&["orm::"]), 1);
        assert_eq!(owner.len(), 1);
        assert!(app.is_empty());
    }

    #[test]
    fn zero_depth_skips_the_source() {
        let (app, owner) = capture(&PanickingSource, &[], &prefixes(&["orm::"]), 0);
        assert!(app.is_empty());
        assert!(owner.is_empty());
    }

    #[test]
    fn decisions_are_keyed_by_prefix_set() {
        let stack = sample_stack();
        let (_, owner_a) = capture(&stack, &[], &prefixes(&["orm::sql"]), 10);
        let (_, owner_b) = capture(&stack, &[], &prefixes(&["orm::query"]), 10);
        assert_eq!(owner_a, vec![StackFrameDescriptor::owner("orm::sql::compiler", "execute_sql")]);
        assert_eq!(owner_b, vec![StackFrameDescriptor::owner("orm::query", "fetch_all")]);

        // Same answers on the cached second pass.
        let (_, again) = capture(&stack, &[], &prefixes(&["orm::sql"]), 10);
        assert_eq!(again, owner_a);
    }

    #[test]
    fn owner_frames_compare_without_lines() {
        let a = StackFrameDescriptor::owner("orm::query", "fetch_all");
        let b = StackFrameDescriptor::owner("orm::query", "fetch_all");
        assert_eq!(a, b);
        let c = StackFrameDescriptor::app("shop::views", "order_list", 10);
        let d = StackFrameDescriptor::app("shop::views", "order_list", 11);
        assert_ne!(c, d);
    }

    #[test]
    fn live_frames_resolve_something() {
        let frames = LiveFrames.frames(64);
        assert!(frames.len() <= 64);
    }

    #[test]
    fn symbol_paths_split_on_last_separator() {
        assert_eq!(
            split_symbol_path("shop::views::order_list"),
            ("shop::views".to_string(), "order_list".to_string())
        );
        assert_eq!(
            split_symbol_path("main"),
            (String::new(), "main".to_string())
        );
    }

    #[test]
    fn display_includes_line_for_app_frames() {
        let frame = StackFrameDescriptor::app("shop::views", "order_list", 42);
        assert_eq!(frame.to_string(), "shop::views#42 order_list()");
    }
}
