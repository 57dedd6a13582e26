pub mod analyze;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod model;
pub mod replay;
pub mod sql;
pub mod stack;

pub use analyze::{OrmMarkers, RecommendationTag, SignatureAnalyzer};
pub use collector::{Collector, QueryEvent, ScopeGuard};
pub use config::ProfilerConfig;
pub use error::{ProfilerError, Result};
pub use executor::{ProfiledExecutor, QueryExecutor, RowCountExtractor, SharedScope};
pub use model::{
    ProfiledData, ProfilerLevel, QuerySignature, QuerySignatureStatistics, StackFrameDescriptor,
    SummaryData,
};
pub use sql::StatementKind;
