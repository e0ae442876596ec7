//! SQL statement construction and result-row reassembly.
//!
//! Everything in this module is pure: functions map table metadata, filters,
//! and mutation values to parameterized SQL text plus positional parameters,
//! and map flat result rows back to nested items. No I/O happens here.

pub mod build;
pub mod rows;

use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::resource::FieldKind;

/// A typed positional parameter. Nulls carry the column type so the driver
/// can bind them unambiguously.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Json(Option<Value>),
}

/// A column the statement returns, identified by its dot-qualified alias.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub alias: String,
    pub kind: FieldKind,
}

/// A built statement: SQL text, positional parameters, and the shape of the
/// rows it returns (empty for statements without a result set).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<SqlParam>,
    pub columns: Vec<SelectColumn>,
}

/// Convert a JSON value into a parameter of the given column type.
pub fn param_from(column: &str, kind: FieldKind, value: &Value) -> Result<SqlParam> {
    let mismatch = || QueryError::TypeMismatch {
        column: column.to_string(),
        kind,
    };
    Ok(match (kind, value) {
        (FieldKind::String, Value::Null) => SqlParam::Text(None),
        (FieldKind::String, Value::String(s)) => SqlParam::Text(Some(s.clone())),
        (FieldKind::Integer, Value::Null) => SqlParam::Int(None),
        (FieldKind::Integer, v) => SqlParam::Int(Some(v.as_i64().ok_or_else(mismatch)?)),
        (FieldKind::Float, Value::Null) => SqlParam::Float(None),
        (FieldKind::Float, v) => SqlParam::Float(Some(v.as_f64().ok_or_else(mismatch)?)),
        (FieldKind::Boolean, Value::Null) => SqlParam::Bool(None),
        (FieldKind::Boolean, Value::Bool(b)) => SqlParam::Bool(Some(*b)),
        (FieldKind::Json, Value::Null) => SqlParam::Json(None),
        (FieldKind::Json, v) => SqlParam::Json(Some(v.clone())),
        _ => return Err(mismatch().into()),
    })
}

/// Infer a parameter type from a bare value, for statements against tables
/// whose definitions are not in hand (aggregation counter targets).
pub fn infer_param(value: &Value) -> SqlParam {
    match value {
        Value::Bool(b) => SqlParam::Bool(Some(*b)),
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            SqlParam::Int(n.as_i64().map(Some).unwrap_or(None))
        }
        Value::Number(n) => SqlParam::Float(n.as_f64().map(Some).unwrap_or(None)),
        Value::String(s) => SqlParam::Text(Some(s.clone())),
        Value::Null => SqlParam::Text(None),
        other => SqlParam::Json(Some(other.clone())),
    }
}
