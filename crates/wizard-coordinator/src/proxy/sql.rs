// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statement preparation and row conversion.
//!
//! Callers write psycopg-style statements (`%s` placeholders). They are
//! rewritten to PostgreSQL's numbered form before binding.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use thiserror::Error;
use tracing::debug;

/// Errors raised while preparing a statement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlError {
    /// Placeholder and parameter counts differ.
    #[error("statement has {expected} placeholders but {got} parameters were given")]
    ParamCount {
        /// Placeholders found in the statement.
        expected: usize,
        /// Parameters supplied.
        got: usize,
    },
}

/// A statement rewritten to numbered placeholders with the values to bind.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    /// Statement text using `$1..$n`.
    pub sql: String,
    /// Values bound in order. `null` parameters are inlined and never appear here.
    pub binds: Vec<Value>,
}

/// Rewrite `%s` placeholders to `$n`.
///
/// Quoted literals and identifiers are copied verbatim apart from `%%`,
/// which becomes `%` everywhere. `null` parameters are written as `NULL`
/// so PostgreSQL never has to infer a type for them.
pub fn prepare(sql: &str, params: &[Value]) -> Result<Prepared, SqlError> {
    let mut out = String::with_capacity(sql.len() + params.len() * 2);
    let mut binds = Vec::new();
    let mut used = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                match quote {
                    None => quote = Some(c),
                    Some(q) if q == c => quote = None,
                    Some(_) => {}
                }
                out.push(c);
            }
            '%' => match chars.peek() {
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                Some('s') if quote.is_none() => {
                    chars.next();
                    match params.get(used) {
                        Some(Value::Null) => out.push_str("NULL"),
                        Some(value) => {
                            binds.push(value.clone());
                            out.push('$');
                            out.push_str(&binds.len().to_string());
                        }
                        None => {}
                    }
                    used += 1;
                }
                _ => out.push('%'),
            },
            _ => out.push(c),
        }
    }

    if used != params.len() {
        return Err(SqlError::ParamCount {
            expected: used,
            got: params.len(),
        });
    }
    Ok(Prepared { sql: out, binds })
}

/// Bind prepared values onto a query.
pub fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for value in binds {
        query = match value {
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.as_str()),
            // Containers travel as their JSON text.
            Value::Array(_) | Value::Object(_) => query.bind(value.to_string()),
            Value::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

/// Convert one column of a row to JSON by its PostgreSQL type.
fn column_value(row: &PgRow, index: usize) -> Value {
    let column = &row.columns()[index];
    let type_name = column.type_info().name();

    macro_rules! get {
        ($ty:ty) => {
            row.try_get::<Option<$ty>, _>(index)
                .ok()
                .flatten()
        };
    }

    match type_name {
        "BOOL" => get!(bool).map(Value::Bool),
        "INT2" => get!(i16).map(Value::from),
        "INT4" => get!(i32).map(Value::from),
        "INT8" => get!(i64).map(Value::from),
        "FLOAT4" => get!(f32).map(|f| Value::from(f as f64)),
        "FLOAT8" => get!(f64).map(Value::from),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" => {
            get!(String).map(Value::String)
        }
        "JSON" | "JSONB" => get!(Value),
        "TIMESTAMPTZ" => get!(DateTime<Utc>).map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => get!(NaiveDateTime).map(|t| Value::String(t.and_utc().to_rfc3339())),
        "DATE" => get!(NaiveDate).map(|d| Value::String(d.to_string())),
        other => {
            debug!(
                column = column.name(),
                sql_type = other,
                "Unsupported column type, returning null"
            );
            None
        }
    }
    .unwrap_or(Value::Null)
}

/// Row as a JSON array, in column order.
pub fn row_to_array(row: &PgRow) -> Value {
    Value::Array((0..row.columns().len()).map(|i| column_value(row, i)).collect())
}

/// Row as a JSON object keyed by column name.
pub fn row_to_object(row: &PgRow) -> Value {
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), column_value(row, i));
    }
    Value::Object(map)
}

/// Convert a row in the caller's requested shape.
pub fn convert_row(row: &PgRow, as_dict: bool) -> Value {
    if as_dict {
        row_to_object(row)
    } else {
        row_to_array(row)
    }
}
