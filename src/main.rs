use anyhow::{Result, bail};
use clap::Parser;
use qscope::analyze::SignatureAnalyzer;
use qscope::config::ProfilerConfig;
use qscope::model::{QuerySignature, StackFrameDescriptor};
use qscope::sql::StatementKind;
use qscope::{cli, format, replay};
use serde_json::json;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn load_config(path: Option<&Path>) -> Result<ProfilerConfig> {
    match path {
        Some(path) => ProfilerConfig::from_path(path),
        None => Ok(ProfilerConfig::global().clone()),
    }
}

fn parse_owner_frame(raw: &str) -> Result<StackFrameDescriptor> {
    match raw.rsplit_once(':') {
        Some((module, function))
            if !module.is_empty() && !module.ends_with(':') && !function.is_empty() =>
        {
            Ok(StackFrameDescriptor::owner(module, function))
        }
        _ => bail!("owner frame must look like module:function, got {raw:?}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    match args.command {
        cli::Command::Replay {
            input,
            config,
            text,
        } => {
            let config = load_config(config.as_deref())?;
            let reports = replay::replay_path(&input, &config)?;
            if text {
                for report in &reports {
                    println!("== {}", report.label.as_deref().unwrap_or("<scope>"));
                    for signature in report.signatures.iter().filter(|s| s.actionable) {
                        println!(
                            "  {} x{} [{}]",
                            format::truncate_sql(&signature.query, 120),
                            signature.frequency,
                            signature.recommendation
                        );
                    }
                    println!("{}", format::summary_text(&report.summary));
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            Ok(())
        }
        cli::Command::Analyze {
            sql,
            owner_frames,
            target,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let owner_trace = owner_frames
                .iter()
                .map(|raw| parse_owner_frame(raw))
                .collect::<Result<Vec<_>>>()?;
            let signature = QuerySignature::new(sql, Vec::new(), owner_trace, target);
            let tag = SignatureAnalyzer::new(config.markers).analyze(&signature);
            let out = json!({
                "query": signature.normalized_sql(),
                "statement_kind": signature.statement_kind(),
                "recommendation": tag,
                "actionable": tag.visible_in_ui(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        cli::Command::Classify { sql } => {
            let kind = StatementKind::classify(&sql);
            println!("{}", serde_json::to_string_pretty(&json!({ "statement_kind": kind }))?);
            Ok(())
        }
    }
}
