use qscope::analyze::RecommendationTag;
use qscope::config::ProfilerConfig;
use qscope::replay;
use serde_json::json;
use std::io::Write;

const TRACE: &str = r#"{"event":"enter","level":"QUERY_SIGNATURE"}
{"event":"record","sql":"SELECT author.id, author.name FROM author","exec_time_micros":120,"row_count":3,"frames":[{"module":"django.db.models.query","function":"__iter__"},{"module":"shop.views","function":"author_list","line":12}]}
{"event":"record","sql":"SELECT book.id FROM book WHERE book.author_id = %s","params":[1],"exec_time_micros":40,"row_count":2,"frames":[{"module":"django.db.models.query","function":"_fetch_all"},{"module":"django.db.models.query","function":"__iter__"},{"module":"shop.views","function":"author_list","line":14}]}
{"event":"record","sql":"SELECT book.id FROM book WHERE book.author_id = %s","params":[2],"exec_time_micros":35,"row_count":1,"frames":[{"module":"django.db.models.query","function":"_fetch_all"},{"module":"django.db.models.query","function":"__iter__"},{"module":"shop.views","function":"author_list","line":14}]}
{"event":"record","sql":"SELECT book.id FROM book WHERE book.author_id = %s","params":[2],"exec_time_micros":30,"row_count":1,"frames":[{"module":"django.db.models.query","function":"_fetch_all"},{"module":"django.db.models.query","function":"__iter__"},{"module":"shop.views","function":"author_list","line":14}]}
{"event":"exit","label":"GET /authors"}
"#;

fn django_config() -> ProfilerConfig {
    ProfilerConfig {
        owner_modules_to_include: vec!["django.".to_string()],
        ..ProfilerConfig::default()
    }
}

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn replayed_request_flags_the_repeated_lookup() {
    let trace = write_temp(TRACE);
    let reports = replay::replay_path(trace.path(), &django_config()).unwrap();
    assert_eq!(reports.len(), 1);

    let report = &reports[0];
    assert_eq!(report.label.as_deref(), Some("GET /authors"));
    assert_eq!(report.depth, 0);
    assert_eq!(report.summary["SELECT"], json!(4));
    assert_eq!(report.summary["potential_n_plus1_query_count"], json!(3));
    assert_eq!(report.summary["exact_query_duplicates"], json!(2));
    assert_eq!(report.summary["total_db_row_count"], json!(7));
    assert_eq!(report.summary["total_query_execution_time_in_micros"], json!(225));

    let top = &report.signatures[0];
    assert_eq!(top.frequency, 3);
    assert_eq!(top.recommendation, RecommendationTag::MissingEagerCollection);
    assert!(top.actionable);
    assert_eq!(report.signatures[1].recommendation, RecommendationTag::Unknown);

    assert_eq!(report.flame_graph.name, "shop.views:author_list");
    assert_eq!(report.flame_graph.value, 4);
}

#[test]
fn config_file_drives_owner_split() {
    let config_file = write_temp("owner_modules_to_include:\n  - django.\n");
    let config = ProfilerConfig::from_path(config_file.path()).unwrap();
    assert_eq!(config, django_config());

    let reports = replay::replay(TRACE.as_bytes(), &config).unwrap();
    let top = &reports[0].signatures[0];
    assert_eq!(top.recommendation, RecommendationTag::MissingEagerCollection);
}

const RUST_ORM_TRACE: &str = r#"{"event":"enter","level":"QUERY_SIGNATURE"}
{"event":"record","sql":"SELECT author.name FROM author WHERE author.id = %s","params":[1],"frames":[{"module":"orm::relation","function":"load_one"},{"module":"shop::views","function":"book_list","line":30}]}
{"event":"record","sql":"SELECT author.name FROM author WHERE author.id = %s","params":[2],"frames":[{"module":"orm::relation","function":"load_one"},{"module":"shop::views","function":"book_list","line":30}]}
{"event":"exit","label":"books"}
"#;

#[test]
fn configured_markers_drive_replay_recommendations() {
    let config_file = write_temp(
        r#"owner_modules_to_include:
  - "orm::"
markers:
  lazy_single_fetch:
    domain_path: "orm::relation"
    function_name: load_one
"#,
    );
    let config = ProfilerConfig::from_path(config_file.path()).unwrap();
    assert_eq!(config.owner_modules_to_include, vec!["orm::".to_string()]);

    let reports = replay::replay(RUST_ORM_TRACE.as_bytes(), &config).unwrap();
    let top = &reports[0].signatures[0];
    assert_eq!(top.frequency, 2);
    assert_eq!(top.recommendation, RecommendationTag::MissingEagerSingle);

    // With the built-in markers the same frame means nothing.
    let reports = replay::replay(
        RUST_ORM_TRACE.as_bytes(),
        &ProfilerConfig {
            owner_modules_to_include: vec!["orm::".to_string()],
            ..ProfilerConfig::default()
        },
    )
    .unwrap();
    assert_eq!(reports[0].signatures[0].recommendation, RecommendationTag::Unknown);
}

#[test]
fn without_owner_prefixes_nothing_is_recommended() {
    let reports = replay::replay(TRACE.as_bytes(), &ProfilerConfig::default()).unwrap();
    assert!(
        reports[0]
            .signatures
            .iter()
            .all(|signature| signature.recommendation == RecommendationTag::Unknown)
    );
}

#[test]
fn missing_trace_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.jsonl");
    let err = replay::replay_path(&path, &ProfilerConfig::default()).unwrap_err();
    assert!(format!("{err:#}").contains("missing.jsonl"));
}

#[test]
fn disabled_profiler_reports_empty_scopes() {
    let config = ProfilerConfig {
        enabled: false,
        ..django_config()
    };
    let reports = replay::replay(TRACE.as_bytes(), &config).unwrap();
    assert!(reports[0].signatures.is_empty());
    assert_eq!(reports[0].summary["SELECT"], json!(0));
}
