//! Discovered table schema and schema-driven value handling.

use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};
use crate::query::{InsertSpec, UpdateSpec, Value};

/// One column as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub has_default: bool,
}

/// Coarse type family used to coerce bound values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Real,
    Boolean,
    Text,
    Blob,
    Other,
}

impl ColumnInfo {
    pub fn family(&self) -> TypeFamily {
        let t = self.data_type.to_ascii_lowercase();
        if t.contains("bool") {
            TypeFamily::Boolean
        } else if t.contains("int") && !t.contains("interval") && !t.contains("point") {
            TypeFamily::Integer
        } else if ["real", "floa", "doub", "numeric", "decimal"]
            .iter()
            .any(|p| t.contains(p))
        {
            TypeFamily::Real
        } else if ["char", "text", "clob", "uuid", "json", "enum"]
            .iter()
            .any(|p| t.contains(p))
        {
            TypeFamily::Text
        } else if ["blob", "bytea", "binary"].iter().any(|p| t.contains(p)) {
            TypeFamily::Blob
        } else {
            TypeFamily::Other
        }
    }

    /// Whether an insert must provide a value for this column.
    ///
    /// A primary key is always required unless the backend assigns it, which
    /// connectors report as a default.
    pub fn is_required(&self) -> bool {
        !self.has_default && (self.is_primary_key || !self.nullable)
    }

    /// Convert a value to the representation this column binds cleanly.
    ///
    /// Values that do not convert are passed through for the backend to judge.
    pub fn coerce(&self, value: Value) -> Value {
        match (self.family(), value) {
            (_, Value::Null) => Value::Null,
            (TypeFamily::Integer, Value::Text(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Integer(i),
                Err(_) => Value::Text(s),
            },
            (TypeFamily::Integer, Value::Bool(b)) => Value::Integer(i64::from(b)),
            (TypeFamily::Integer, Value::Real(r))
                if r.fract() == 0.0 && r >= i64::MIN as f64 && r <= i64::MAX as f64 =>
            {
                Value::Integer(r as i64)
            }
            (TypeFamily::Real, Value::Integer(i)) => Value::Real(i as f64),
            (TypeFamily::Real, Value::Text(s)) => match s.trim().parse::<f64>() {
                Ok(r) => Value::Real(r),
                Err(_) => Value::Text(s),
            },
            (TypeFamily::Boolean, Value::Integer(i)) => Value::Bool(i != 0),
            (TypeFamily::Boolean, Value::Text(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" | "yes" => Value::Bool(true),
                    "false" | "f" | "0" | "no" => Value::Bool(false),
                    _ => Value::Text(s),
                }
            }
            (TypeFamily::Text, v @ (Value::Integer(_) | Value::Real(_) | Value::Bool(_))) => {
                Value::Text(v.to_string())
            }
            (_, v) => v,
        }
    }
}

/// A table resolved against its discovered schema.
///
/// Every translation goes through a target, so unknown fields are rejected
/// before any statement is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct TableTarget {
    table: String,
    columns: Vec<ColumnInfo>,
    primary_key: Option<usize>,
}

impl TableTarget {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnInfo>) -> Result<Self> {
        let table = table.into();
        if columns.is_empty() {
            return Err(DataError::QuerySyntax(format!(
                "table `{table}` does not exist or has no columns"
            )));
        }

        let mut keys = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key)
            .map(|(i, _)| i);
        let primary_key = match (keys.next(), keys.next()) {
            (Some(i), None) => Some(i),
            _ => None,
        };

        Ok(Self {
            table,
            columns,
            primary_key,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Result<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                DataError::QuerySyntax(format!(
                    "unknown column `{name}` on table `{}`",
                    self.table
                ))
            })
    }

    /// Single-column primary key required by every write.
    pub fn primary_key(&self) -> Result<&ColumnInfo> {
        self.primary_key
            .map(|i| &self.columns[i])
            .ok_or_else(|| {
                DataError::QuerySyntax(format!(
                    "table `{}` needs a single-column primary key for writes",
                    self.table
                ))
            })
    }

    /// Typed primary key value for a row key string.
    pub fn key_value(&self, row_key: &str) -> Result<Value> {
        Ok(self.primary_key()?.coerce(Value::Text(row_key.to_string())))
    }

    pub fn check_insert(&self, spec: &InsertSpec) -> Result<()> {
        for name in spec.values().keys() {
            self.column(name)?;
        }
        if let Some(missing) = self
            .columns
            .iter()
            .find(|c| c.is_required() && !spec.values().contains_key(&c.name))
        {
            return Err(DataError::QuerySyntax(format!(
                "missing required column `{}`",
                missing.name
            )));
        }
        Ok(())
    }

    pub fn check_update(&self, spec: &UpdateSpec) -> Result<()> {
        let key = self.primary_key()?;
        for name in spec.values().keys() {
            self.column(name)?;
            if *name == key.name {
                return Err(DataError::QuerySyntax(format!(
                    "primary key column `{name}` cannot be edited"
                )));
            }
        }
        Ok(())
    }
}
