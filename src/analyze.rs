//! Heuristic recommendations for repeated query signatures.
//!
//! The analyzer looks at the owner-domain (ORM) frames of a signature and at
//! the shape of its SQL to guess which ORM-level change would remove the
//! repetition. Frame markers are configurable; the default set describes the
//! Django ORM, whose traces are what most recorded sessions contain.

use crate::model::QuerySignature;
use crate::sql::{StatementKind, parse_select_shape};
use crate::stack::StackFrameDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the analyzer thinks a signature is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationTag {
    Unknown,
    /// Related object loaded lazily, one row at a time.
    MissingEagerSingle,
    /// Related collection loaded lazily per parent row.
    MissingEagerCollection,
    /// Collection was already eagerly prefetched.
    PrefetchedCollection,
    /// Single-row primary key lookup.
    SimpleLookup,
    /// Filtering that could be pushed into one query.
    FilterInDb,
}

impl RecommendationTag {
    /// Whether presentation layers should surface the tag as actionable.
    pub fn visible_in_ui(self) -> bool {
        !matches!(
            self,
            RecommendationTag::Unknown
                | RecommendationTag::SimpleLookup
                | RecommendationTag::FilterInDb
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecommendationTag::Unknown => "UNKNOWN",
            RecommendationTag::MissingEagerSingle => "MISSING_EAGER_SINGLE",
            RecommendationTag::MissingEagerCollection => "MISSING_EAGER_COLLECTION",
            RecommendationTag::PrefetchedCollection => "PREFETCHED_COLLECTION",
            RecommendationTag::SimpleLookup => "SIMPLE_LOOKUP",
            RecommendationTag::FilterInDb => "FILTER_IN_DB",
        }
    }
}

impl fmt::Display for RecommendationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner-domain frames the analyzer keys its rules on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmMarkers {
    pub prefetched_collection: StackFrameDescriptor,
    pub lazy_single_fetch: StackFrameDescriptor,
    pub primary_key_lookup: StackFrameDescriptor,
    /// Literal the primary key lookup path puts in its SQL.
    pub lookup_limit_marker: String,
    pub lazy_collection_fetch: StackFrameDescriptor,
    /// Substring that makes a column look like a foreign key.
    pub foreign_key_marker: String,
    /// Terminal operations (count, exists, iteration, ...).
    pub filter_terminals: Vec<StackFrameDescriptor>,
}

impl OrmMarkers {
    pub fn django() -> Self {
        const QUERY: &str = "django.db.models.query";
        Self {
            prefetched_collection: StackFrameDescriptor::owner(QUERY, "_prefetch_related_objects"),
            lazy_single_fetch: StackFrameDescriptor::owner(
                "django.db.models.fields.related_descriptors",
                "get_object",
            ),
            primary_key_lookup: StackFrameDescriptor::owner(QUERY, "get"),
            lookup_limit_marker: "LIMIT 21".to_string(),
            lazy_collection_fetch: StackFrameDescriptor::owner(QUERY, "_fetch_all"),
            foreign_key_marker: "_id".to_string(),
            filter_terminals: ["count", "exists", "first", "last", "__iter__"]
                .into_iter()
                .map(|function| StackFrameDescriptor::owner(QUERY, function))
                .collect(),
        }
    }
}

impl Default for OrmMarkers {
    fn default() -> Self {
        Self::django()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignatureAnalyzer {
    markers: OrmMarkers,
}

impl SignatureAnalyzer {
    pub fn new(markers: OrmMarkers) -> Self {
        Self { markers }
    }

    pub fn markers(&self) -> &OrmMarkers {
        &self.markers
    }

    /// Rules are checked in order and the first match wins.
    pub fn analyze(&self, signature: &QuerySignature) -> RecommendationTag {
        let sql = signature.normalized_sql();
        let owner_trace = signature.owner_trace();
        let markers = &self.markers;

        if StatementKind::classify(sql) != StatementKind::Select || signature.is_fake() {
            return RecommendationTag::Unknown;
        }
        if owner_trace.contains(&markers.prefetched_collection) {
            return RecommendationTag::PrefetchedCollection;
        }
        if owner_trace.contains(&markers.lazy_single_fetch) {
            return RecommendationTag::MissingEagerSingle;
        }
        if owner_trace.contains(&markers.primary_key_lookup)
            && sql.contains(markers.lookup_limit_marker.as_str())
        {
            return RecommendationTag::SimpleLookup;
        }

        // The parser does not cover every dialect the host can emit.
        let shape = match parse_select_shape(sql) {
            Ok(shape) => shape,
            Err(err) => {
                tracing::debug!("signature analysis skipped unparsable sql: {err}");
                return RecommendationTag::Unknown;
            }
        };

        let key = shape.equality_key.as_str();
        let missing_eager_collection = owner_trace.contains(&markers.lazy_collection_fetch)
            && !shape.tables.is_empty()
            && !key.is_empty()
            && key.contains(markers.foreign_key_marker.as_str())
            && shape.tables.iter().any(|table| key.contains(table.as_str()));
        if missing_eager_collection {
            return RecommendationTag::MissingEagerCollection;
        }

        if shape.has_where
            && owner_trace
                .iter()
                .any(|frame| markers.filter_terminals.contains(frame))
        {
            return RecommendationTag::FilterInDb;
        }
        RecommendationTag::Unknown
    }
}
