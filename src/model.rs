use crate::analyze::{RecommendationTag, SignatureAnalyzer};
use crate::sql::StatementKind;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

pub use crate::stack::StackFrameDescriptor;

/// How much work a scope asks the collector to do per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfilerLevel {
    /// Count queries only. No stack capture, no SQL normalization.
    Query,
    /// Group queries by normalized SQL and call-site shape.
    QuerySignature,
}

impl ProfilerLevel {
    pub fn stack_depth(self) -> usize {
        match self {
            ProfilerLevel::Query => 0,
            ProfilerLevel::QuerySignature => 500,
        }
    }

    pub fn normalize_sql(self) -> bool {
        matches!(self, ProfilerLevel::QuerySignature)
    }

    /// The stricter of the two levels.
    pub fn join(self, other: ProfilerLevel) -> ProfilerLevel {
        if self == ProfilerLevel::QuerySignature || other == ProfilerLevel::QuerySignature {
            ProfilerLevel::QuerySignature
        } else {
            ProfilerLevel::Query
        }
    }

    /// Join of every level in `levels`, `None` when there are none.
    pub fn join_all(levels: impl IntoIterator<Item = ProfilerLevel>) -> Option<ProfilerLevel> {
        levels.into_iter().reduce(ProfilerLevel::join)
    }
}

#[derive(Debug, Serialize)]
struct SignatureInner {
    normalized_sql: String,
    app_trace: Vec<StackFrameDescriptor>,
    owner_trace: Vec<StackFrameDescriptor>,
    target: String,
    #[serde(skip)]
    analysis: OnceLock<RecommendationTag>,
}

impl SignatureInner {
    fn key(&self) -> (&str, &[StackFrameDescriptor], &[StackFrameDescriptor], &str) {
        (
            &self.normalized_sql,
            &self.app_trace,
            &self.owner_trace,
            &self.target,
        )
    }
}

/// Grouping key for query statistics.
///
/// Equality, ordering and hashing are structural over the four key fields.
/// Clones share one memoized analysis result.
#[derive(Debug, Clone)]
pub struct QuerySignature {
    inner: Arc<SignatureInner>,
}

impl QuerySignature {
    pub fn new(
        normalized_sql: impl Into<String>,
        app_trace: Vec<StackFrameDescriptor>,
        owner_trace: Vec<StackFrameDescriptor>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SignatureInner {
                normalized_sql: normalized_sql.into(),
                app_trace,
                owner_trace,
                target: target.into(),
                analysis: OnceLock::new(),
            }),
        }
    }

    pub fn normalized_sql(&self) -> &str {
        &self.inner.normalized_sql
    }

    pub fn app_trace(&self) -> &[StackFrameDescriptor] {
        &self.inner.app_trace
    }

    pub fn owner_trace(&self) -> &[StackFrameDescriptor] {
        &self.inner.owner_trace
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// No stack was captured, so grouping by this signature says nothing
    /// about repeated call sites.
    pub fn is_fake(&self) -> bool {
        self.inner.app_trace.is_empty() && self.inner.owner_trace.is_empty()
    }

    pub fn statement_kind(&self) -> StatementKind {
        StatementKind::classify(&self.inner.normalized_sql)
    }

    /// Recommendation from the default (Django) analyzer, computed once per
    /// signature. `ProfilerConfig::markers` is not consulted here; with custom
    /// markers call [`SignatureAnalyzer::analyze`] on an analyzer built from
    /// them, as replay does.
    pub fn analysis(&self) -> RecommendationTag {
        *self
            .inner
            .analysis
            .get_or_init(|| SignatureAnalyzer::default().analyze(self))
    }
}

impl PartialEq for QuerySignature {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.key() == other.inner.key()
    }
}

impl Eq for QuerySignature {}

impl PartialOrd for QuerySignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QuerySignature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.key().cmp(&other.inner.key())
    }
}

impl Hash for QuerySignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key().hash(state);
    }
}

impl Serialize for QuerySignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "##".repeat(20);
        writeln!(f, "Query:\n {}", self.normalized_sql())?;
        writeln!(f, "{rule}\napp-stack-trace:")?;
        for frame in self.app_trace() {
            writeln!(f, " {frame}")?;
        }
        writeln!(f, "{rule}\nowner-stack-trace:")?;
        for frame in self.owner_trace() {
            writeln!(f, " {frame}")?;
        }
        write!(f, "{}", "**".repeat(40))
    }
}

/// Per-signature counters. Merging adds; an unknown row count on either side
/// makes the merged row count unknown, and so does a sum that overflows.
/// The other counters saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct QuerySignatureStatistics {
    pub frequency: u64,
    pub execution_time_micros: u64,
    pub row_count: Option<i64>,
}

impl QuerySignatureStatistics {
    /// Statistics for one executed query.
    pub fn single(execution_time_micros: u64, row_count: Option<i64>) -> Self {
        Self {
            frequency: 1,
            execution_time_micros,
            row_count,
        }
    }

    pub fn merge(&self, other: &Self) -> Self {
        let row_count = match (self.row_count, other.row_count) {
            (Some(a), Some(b)) => a.checked_add(b),
            _ => None,
        };
        Self {
            frequency: self.frequency.saturating_add(other.frequency),
            execution_time_micros: self
                .execution_time_micros
                .saturating_add(other.execution_time_micros),
            row_count,
        }
    }
}

/// Everything collected in one profiling scope.
///
/// Values are never changed after they are handed out; merging builds a new
/// value. The empty value is the identity of [`ProfiledData::merge`].
#[derive(Debug, Clone, Default)]
pub struct ProfiledData {
    signature_statistics: BTreeMap<QuerySignature, QuerySignatureStatistics>,
    time_spent_profiling_micros: u64,
    dedup_hash_counter: BTreeMap<String, u64>,
    summary: OnceLock<SummaryData>,
}

impl ProfiledData {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Data for exactly one recorded query.
    pub fn single(
        signature: QuerySignature,
        statistics: QuerySignatureStatistics,
        dedup_hash: String,
        time_spent_profiling_micros: u64,
    ) -> Self {
        Self {
            signature_statistics: BTreeMap::from([(signature, statistics)]),
            time_spent_profiling_micros,
            dedup_hash_counter: BTreeMap::from([(dedup_hash, 1)]),
            summary: OnceLock::new(),
        }
    }

    pub fn signature_statistics(&self) -> &BTreeMap<QuerySignature, QuerySignatureStatistics> {
        &self.signature_statistics
    }

    pub fn statistics_for(&self, signature: &QuerySignature) -> Option<&QuerySignatureStatistics> {
        self.signature_statistics.get(signature)
    }

    pub fn time_spent_profiling_micros(&self) -> u64 {
        self.time_spent_profiling_micros
    }

    pub fn dedup_hash_counter(&self) -> &BTreeMap<String, u64> {
        &self.dedup_hash_counter
    }

    pub fn is_empty(&self) -> bool {
        self.signature_statistics.is_empty() && self.time_spent_profiling_micros == 0
    }

    /// Combine two values into a new one.
    pub fn merge(&self, other: &ProfiledData) -> ProfiledData {
        self.clone().merged(other)
    }

    /// Same as [`ProfiledData::merge`], reusing `self`'s storage.
    pub fn merged(self, other: &ProfiledData) -> ProfiledData {
        let mut signature_statistics = self.signature_statistics;
        for (signature, statistics) in &other.signature_statistics {
            signature_statistics
                .entry(signature.clone())
                .and_modify(|existing| *existing = existing.merge(statistics))
                .or_insert(*statistics);
        }
        let mut dedup_hash_counter = self.dedup_hash_counter;
        for (hash, count) in &other.dedup_hash_counter {
            let entry = dedup_hash_counter.entry(hash.clone()).or_insert(0);
            *entry = entry.saturating_add(*count);
        }
        ProfiledData {
            signature_statistics,
            time_spent_profiling_micros: self
                .time_spent_profiling_micros
                .saturating_add(other.time_spent_profiling_micros),
            dedup_hash_counter,
            summary: OnceLock::new(),
        }
    }

    /// Left fold of [`ProfiledData::merge`] starting from the empty value.
    pub fn merge_all<'a>(values: impl IntoIterator<Item = &'a ProfiledData>) -> ProfiledData {
        values
            .into_iter()
            .fold(ProfiledData::empty(), |acc, value| acc.merged(value))
    }

    /// Summary counts, computed on first use.
    pub fn summary(&self) -> &SummaryData {
        self.summary.get_or_init(|| SummaryData::from_data(self))
    }

    /// Application call tree weighted by query frequency.
    pub fn flame_graph(&self) -> FlameNode {
        let mut root = FlameNode::new("<request>");
        for (signature, statistics) in &self.signature_statistics {
            let mut current = &mut root;
            for frame in signature.app_trace().iter().rev() {
                let name = format!("{}:{}", frame.domain_path, frame.function_name);
                current = current.add_child(name, statistics.frequency);
            }
        }
        if root.children.len() == 1 {
            return root.children.remove(0);
        }
        root.value = root.children.iter().map(|child| child.value).sum();
        root
    }
}

impl PartialEq for ProfiledData {
    fn eq(&self, other: &Self) -> bool {
        self.signature_statistics == other.signature_statistics
            && self.time_spent_profiling_micros == other.time_spent_profiling_micros
            && self.dedup_hash_counter == other.dedup_hash_counter
    }
}

impl Eq for ProfiledData {}

impl Hash for ProfiledData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signature_statistics.hash(state);
        self.time_spent_profiling_micros.hash(state);
        self.dedup_hash_counter.hash(state);
    }
}

#[derive(Serialize)]
struct SignatureEntry<'a> {
    signature: &'a QuerySignature,
    statistics: &'a QuerySignatureStatistics,
}

impl Serialize for ProfiledData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<SignatureEntry<'_>> = self
            .signature_statistics
            .iter()
            .map(|(signature, statistics)| SignatureEntry {
                signature,
                statistics,
            })
            .collect();
        let mut state = serializer.serialize_struct("ProfiledData", 3)?;
        state.serialize_field("signatures", &entries)?;
        state.serialize_field(
            "time_spent_profiling_micros",
            &self.time_spent_profiling_micros,
        )?;
        state.serialize_field("dedup_hash_counter", &self.dedup_hash_counter)?;
        state.end()
    }
}

/// Totals derived from a [`ProfiledData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryData {
    pub statement_kind_counts: BTreeMap<StatementKind, u64>,
    /// Every occurrence of a (sql, params, target) triple seen at least twice,
    /// the first occurrence included.
    pub exact_duplicate_count: u64,
    pub total_execution_time_micros: u64,
    /// `None` once any signature's row count is unknown.
    pub total_row_count: Option<i64>,
    /// Queries in signatures that ran more than once. `None` when any
    /// signature was recorded without a stack.
    pub potential_n_plus_one_count: Option<u64>,
}

impl SummaryData {
    fn from_data(data: &ProfiledData) -> Self {
        let exact_duplicate_count = data
            .dedup_hash_counter
            .values()
            .filter(|count| **count > 1)
            .fold(0u64, |total, count| total.saturating_add(*count));

        let mut statement_kind_counts = BTreeMap::new();
        let mut total_execution_time_micros = 0u64;
        let mut total_row_count = Some(0i64);
        let mut potential_n_plus_one_count = 0u64;
        let mut any_fake = false;
        for (signature, statistics) in &data.signature_statistics {
            let kind_count = statement_kind_counts
                .entry(signature.statement_kind())
                .or_insert(0u64);
            *kind_count = kind_count.saturating_add(statistics.frequency);
            total_execution_time_micros =
                total_execution_time_micros.saturating_add(statistics.execution_time_micros);
            total_row_count = match (total_row_count, statistics.row_count) {
                (Some(total), Some(rows)) => total.checked_add(rows),
                _ => None,
            };
            if statistics.frequency > 1 {
                potential_n_plus_one_count =
                    potential_n_plus_one_count.saturating_add(statistics.frequency);
            }
            any_fake |= signature.is_fake();
        }

        SummaryData {
            statement_kind_counts,
            exact_duplicate_count,
            total_execution_time_micros,
            total_row_count,
            potential_n_plus_one_count: if any_fake {
                None
            } else {
                Some(potential_n_plus_one_count)
            },
        }
    }

    pub fn total_query_count(&self) -> u64 {
        self.statement_kind_counts
            .values()
            .fold(0, |total, count| total.saturating_add(*count))
    }

    pub fn kind_count(&self, kind: StatementKind) -> u64 {
        self.statement_kind_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Flat field map for presentation layers. Unknown values are `null`.
    pub fn as_map(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert(
            "total_query_execution_time_in_micros".to_string(),
            Value::from(self.total_execution_time_micros),
        );
        map.insert(
            "total_db_row_count".to_string(),
            self.total_row_count.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert(
            "potential_n_plus1_query_count".to_string(),
            self.potential_n_plus_one_count
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        map.insert(
            "exact_query_duplicates".to_string(),
            Value::from(self.exact_duplicate_count),
        );
        for kind in StatementKind::ALL {
            map.insert(kind.as_str().to_string(), Value::from(self.kind_count(kind)));
        }
        map
    }
}

impl fmt::Display for SummaryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.as_map()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Node of a frequency-weighted call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlameNode {
    pub name: String,
    pub value: u64,
    pub children: Vec<FlameNode>,
}

impl FlameNode {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 0,
            children: Vec::new(),
        }
    }

    fn add_child(&mut self, name: String, count: u64) -> &mut FlameNode {
        let index = match self.children.iter().position(|child| child.name == name) {
            Some(index) => index,
            None => {
                self.children.push(FlameNode::new(name));
                self.children.len() - 1
            }
        };
        let child = &mut self.children[index];
        child.value += count;
        child
    }
}
