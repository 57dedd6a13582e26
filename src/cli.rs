use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "qscope",
    version,
    about = "N+1 query profiler",
    after_help = r#"Examples:
  qscope replay --input trace.jsonl
  qscope replay --input trace.jsonl --config qscope.yaml --text
  qscope analyze --sql 'SELECT child.id FROM child WHERE child.parent_id = %s' \
      --owner-frame django.db.models.query:_fetch_all
  qscope classify --sql 'BEGIN'
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Replay a JSONL trace and print one report per closed scope.
    Replay {
        #[arg(long, value_name = "PATH")]
        input: PathBuf,
        /// YAML profiler configuration; defaults plus QSCOPE_* env otherwise.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Print plain-text summaries instead of JSON.
        #[arg(long)]
        text: bool,
    },
    /// Run the signature analyzer on one query.
    Analyze {
        #[arg(long)]
        sql: String,
        /// Owner-domain frame as module:function, innermost first.
        #[arg(long = "owner-frame", value_name = "MODULE:FUNCTION")]
        owner_frames: Vec<String>,
        #[arg(long, default_value = "default")]
        target: String,
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Print the statement kind of a query.
    Classify {
        #[arg(long)]
        sql: String,
    },
}
