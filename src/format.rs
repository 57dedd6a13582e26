use crate::sql::StatementKind;
use serde_json::Value;
use std::collections::BTreeMap;

/// Thousands-separated integer, `-` when the value is unknown.
pub fn commafy(value: Option<i64>) -> String {
    let Some(value) = value else {
        return "-".to_string();
    };
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Cut `value` to at most `max_bytes`, on a char boundary, marking the cut.
pub fn truncate_sql(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

const SUMMARY_LABELS: [(&str, &str); 4] = [
    ("total_query_execution_time_in_micros", "execution time (us)"),
    ("total_db_row_count", "rows"),
    ("potential_n_plus1_query_count", "potential n+1"),
    ("exact_query_duplicates", "exact duplicates"),
];

/// Plain-text rendering of [`SummaryData::as_map`](crate::model::SummaryData::as_map), one `label: value` per
/// line. Statement kinds that never ran are left out.
pub fn summary_text(summary: &BTreeMap<String, Value>) -> String {
    let count = |key: &str| summary.get(key).and_then(Value::as_i64);
    let queries: i64 = StatementKind::ALL
        .iter()
        .filter_map(|kind| count(kind.as_str()))
        .sum();

    let mut lines = vec![format!("queries: {}", commafy(Some(queries)))];
    for (key, label) in SUMMARY_LABELS {
        lines.push(format!("{label}: {}", commafy(count(key))));
    }
    for kind in StatementKind::ALL {
        if let Some(n) = count(kind.as_str()).filter(|n| *n > 0) {
            lines.push(format!("{}: {}", kind.as_str().to_lowercase(), commafy(Some(n))));
        }
    }
    lines.join("\n")
}
