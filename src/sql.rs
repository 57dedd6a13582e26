use regex::Regex;
use serde::Serialize;
use sqlparser::ast::{BinaryOperator, Expr, ObjectName, SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use std::sync::OnceLock;

/// Coarse statement kind, taken from the leading keyword of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Transactional,
    Other,
}

impl StatementKind {
    pub const ALL: [StatementKind; 6] = [
        StatementKind::Select,
        StatementKind::Insert,
        StatementKind::Update,
        StatementKind::Delete,
        StatementKind::Transactional,
        StatementKind::Other,
    ];

    /// Classify by the first whitespace-delimited token. Never fails: anything
    /// unrecognised (including an empty query) is `Other`.
    pub fn classify(sql: &str) -> StatementKind {
        let token = match sql.split_whitespace().next() {
            Some(token) => token.to_ascii_uppercase(),
            None => return StatementKind::Other,
        };
        match token.as_str() {
            "SELECT" => StatementKind::Select,
            "INSERT" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "BEGIN" | "END" => StatementKind::Transactional,
            _ => StatementKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Transactional => "TRANSACTIONAL",
            StatementKind::Other => "OTHER",
        }
    }
}

fn repeated_placeholders() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%s(, %s)+").expect("static placeholder pattern"))
}

/// Collapse runs like `%s, %s, %s` into a single `%s`, so `IN (...)` lists of
/// different lengths group under one signature.
pub fn collapse_placeholders(sql: &str) -> String {
    repeated_placeholders().replace_all(sql, "%s").into_owned()
}

/// Shape of a SELECT as far as the signature analyzer cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectShape {
    /// Tables in FROM, including joined ones, in query order.
    pub tables: Vec<String>,
    pub has_where: bool,
    /// Left-hand side of the WHERE clause when it is a single `a = b`,
    /// otherwise empty.
    pub equality_key: String,
}

/// Parse a query with `%s` placeholders and pull out its tables and WHERE
/// shape. Callers are expected to treat an error as "unknown".
pub fn parse_select_shape(sql: &str) -> Result<SelectShape, ParserError> {
    let with_fake_params = sql.replace("%s", "1");
    let statements = Parser::parse_sql(&GenericDialect {}, &with_fake_params)?;
    let mut shape = SelectShape::default();
    let query = match statements.first() {
        Some(Statement::Query(query)) => query,
        _ => return Ok(shape),
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return Ok(shape),
    };

    for table in &select.from {
        if let Some(name) = table_factor_name(&table.relation) {
            shape.tables.push(name);
        }
        for join in &table.joins {
            if let Some(name) = table_factor_name(&join.relation) {
                shape.tables.push(name);
            }
        }
    }

    if let Some(selection) = &select.selection {
        shape.has_where = true;
        shape.equality_key = equality_key(selection).unwrap_or_default();
    }
    Ok(shape)
}

fn table_factor_name(factor: &TableFactor) -> Option<String> {
    match factor {
        TableFactor::Table { name, .. } => Some(object_name_text(name)),
        _ => None,
    }
}

fn object_name_text(name: &ObjectName) -> String {
    name.to_string()
        .chars()
        .filter(|ch| !matches!(ch, '"' | '`' | '[' | ']'))
        .collect()
}

fn equality_key(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Nested(inner) => equality_key(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            ..
        } => column_text(left),
        _ => None,
    }
}

fn column_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => Some(
            parts
                .iter()
                .map(|part| part.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        ),
        Expr::Nested(inner) => column_text(inner),
        _ => None,
    }
}
