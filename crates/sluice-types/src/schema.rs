//! Versioned relational schema inferred from extracted data.
//!
//! Column order inside a [`Table`] is insertion order and never changes once
//! established. Two merge paths exist and they have different precedence:
//!
//! * [`Table::apply_hint`] applies an explicit [`ColumnHint`] and overrides
//!   whatever inference decided,
//! * [`Table::merge_inferred_column`] and [`Schema::merge_update`] only add
//!   columns or fill in unknown data types, never touching hints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;


// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Bigint,
    Double,
    Bool,
    Timestamp,
    Date,
    Decimal,
    Complex,
}

impl DataType {
    /// Wire-format string used in schema files and variant column names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Bigint => "bigint",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Decimal => "decimal",
            Self::Complex => "complex",
        }
    }

    /// Infer the data type of a JSON value. `null` has no type.
    #[must_use]
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Bigint),
            Value::Number(_) => Some(Self::Double),
            Value::String(s) if is_timestamp(s) => Some(Self::Timestamp),
            Value::String(_) => Some(Self::Text),
            Value::Array(_) | Value::Object(_) => Some(Self::Complex),
        }
    }

    /// Coerce `value` into this type, or `None` when it does not fit and
    /// must go to a variant column.
    #[must_use]
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (_, Value::Null)
            | (Self::Complex, _)
            | (Self::Text, Value::String(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::Double | Self::Decimal, Value::Number(_)) => Some(value.clone()),
            (Self::Bigint, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Some(value.clone())
                } else {
                    n.as_f64().and_then(integral_f64).map(Value::from)
                }
            }
            (Self::Decimal, Value::String(s)) if s.trim().parse::<f64>().is_ok() => {
                Some(value.clone())
            }
            (Self::Timestamp, Value::String(s)) if is_timestamp(s) => Some(value.clone()),
            (Self::Date, Value::String(s)) if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => {
                Some(value.clone())
            }
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_timestamp(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

#[allow(clippy::cast_possible_truncation)]
fn integral_f64(f: f64) -> Option<i64> {
    // 2^53: above this f64 can no longer represent every integer.
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    (f.fract() == 0.0 && f.abs() <= MAX_EXACT).then_some(f as i64)
}

// ---------------------------------------------------------------------------
// Write disposition
// ---------------------------------------------------------------------------

/// How rows of a table relate to rows already in the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    #[default]
    Append,
    Replace,
    Merge,
}

impl WriteDisposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Replace => "replace",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            other => Err(format!(
                "unknown write disposition '{other}', expected append, replace or merge"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

fn default_true() -> bool {
    true
}

/// A table column. `data_type` stays `None` until data or a hint provides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub merge_key: bool,
    /// Set on `<column>__v_<type>` columns.
    #[serde(default, skip_serializing_if = "is_false")]
    pub variant: bool,
}

impl Column {
    /// Nullable column with no known type and no hints.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
            nullable: true,
            primary_key: false,
            unique: false,
            merge_key: false,
            variant: false,
        }
    }

    #[must_use]
    pub fn with_type(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::new(name)
        }
    }
}

/// Explicitly supplied column properties. `None` fields leave the column as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_key: Option<bool>,
}

impl ColumnHint {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    #[must_use]
    pub fn primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = Some(primary_key);
        self
    }

    #[must_use]
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = Some(unique);
        self
    }

    #[must_use]
    pub fn merge_key(mut self, merge_key: bool) -> Self {
        self.merge_key = Some(merge_key);
        self
    }

    /// Overwrite the hinted properties of `column`. Returns `true` if anything
    /// changed. A primary key without an explicit nullability is not null.
    pub fn apply_to(&self, column: &mut Column) -> bool {
        let before = column.clone();
        if let Some(data_type) = self.data_type {
            column.data_type = Some(data_type);
        }
        if let Some(primary_key) = self.primary_key {
            column.primary_key = primary_key;
            if primary_key && self.nullable.is_none() {
                column.nullable = false;
            }
        }
        if let Some(nullable) = self.nullable {
            column.nullable = nullable;
        }
        if let Some(unique) = self.unique {
            column.unique = unique;
        }
        if let Some(merge_key) = self.merge_key {
            column.merge_key = merge_key;
        }
        *column != before
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// A table: ordered columns plus load metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub write_disposition: WriteDisposition,
    /// Parent table of a child table produced from a nested list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Name of the resource that owns a root table. Child tables have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Derive row identity from row content instead of a random id.
    #[serde(default, skip_serializing_if = "is_false")]
    pub row_hash: bool,
}

impl Table {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            write_disposition: WriteDisposition::default(),
            parent: None,
            resource: None,
            row_hash: false,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Names of the primary key columns, in column order.
    #[must_use]
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Whether rows of this table can be merged: a primary key or content hash.
    #[must_use]
    pub fn has_merge_key(&self) -> bool {
        self.row_hash || self.columns.iter().any(|c| c.primary_key || c.merge_key)
    }

    /// Apply an explicit hint, creating the column at the end if missing.
    pub fn apply_hint(&mut self, hint: &ColumnHint) -> bool {
        if let Some(column) = self.column_mut(&hint.name) {
            return hint.apply_to(column);
        }
        let mut column = Column::new(hint.name.clone());
        hint.apply_to(&mut column);
        self.columns.push(column);
        true
    }

    /// Merge an inferred column: add it if missing or fill in an unknown type.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ColumnTypeConflict`] when the column already
    /// has a different data type.
    pub fn merge_inferred_column(&mut self, incoming: &Column) -> Result<bool, SchemaError> {
        let table = self.name.clone();
        let Some(existing) = self.column_mut(&incoming.name) else {
            self.columns.push(incoming.clone());
            return Ok(true);
        };
        match (existing.data_type, incoming.data_type) {
            (None, Some(data_type)) => {
                existing.data_type = Some(data_type);
                Ok(true)
            }
            (Some(a), Some(b)) if a != b => Err(SchemaError::ColumnTypeConflict {
                table,
                column: incoming.name.clone(),
                existing: a,
                incoming: b,
            }),
            _ => Ok(false),
        }
    }

    /// Merge a partial table produced elsewhere. The write disposition of
    /// `other` replaces this one; parent and resource are only filled in when
    /// missing. Columns merge as in [`Table::merge_inferred_column`].
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ColumnTypeConflict`] on a column type clash.
    pub fn merge_table(&mut self, other: &Table) -> Result<bool, SchemaError> {
        let mut changed = false;
        if self.write_disposition != other.write_disposition {
            self.write_disposition = other.write_disposition;
            changed = true;
        }
        if self.parent.is_none() && other.parent.is_some() {
            self.parent.clone_from(&other.parent);
            changed = true;
        }
        if self.resource.is_none() && other.resource.is_some() {
            self.resource.clone_from(&other.resource);
            changed = true;
        }
        for column in &other.columns {
            changed |= self.merge_inferred_column(column)?;
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Tables and columns added by one normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaUpdate {
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
}

impl SchemaUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Errors raised while merging schema changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Two merges inferred different types for the same new column.
    #[error("column '{column}' of table '{table}' is {existing} but {incoming} was inferred")]
    ColumnTypeConflict {
        table: String,
        column: String,
        existing: DataType,
        incoming: DataType,
    },
}

/// Named, versioned set of tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub version_hash: String,
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
}

impl Schema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            version_hash: String::new(),
            tables: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Get a table, inserting an empty one if missing.
    pub fn get_or_insert_table(&mut self, name: &str) -> &mut Table {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Table::new(name))
    }

    /// Walk parent links up to the root table.
    #[must_use]
    pub fn root_table<'a>(&'a self, table: &'a Table) -> &'a Table {
        let mut current = table;
        while let Some(parent) = current.parent.as_deref().and_then(|p| self.tables.get(p)) {
            current = parent;
        }
        current
    }

    /// Content hash over all tables.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        crate::sha256_hex(&serde_json::to_vec(&self.tables).unwrap_or_default())
    }

    /// Increment the version if the content changed since the last bump.
    pub fn bump_version(&mut self) -> bool {
        let hash = self.compute_hash();
        if hash == self.version_hash {
            return false;
        }
        self.version += 1;
        self.version_hash = hash;
        true
    }

    /// Merge tables and columns from `update`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ColumnTypeConflict`] on a column type clash;
    /// `self` may be partially updated in that case.
    pub fn merge_update(&mut self, update: &SchemaUpdate) -> Result<bool, SchemaError> {
        let mut changed = false;
        for (name, table) in &update.tables {
            match self.tables.get_mut(name) {
                Some(existing) => changed |= existing.merge_table(table)?,
                None => {
                    self.tables.insert(name.clone(), table.clone());
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Tables and columns present in `self` but not in `base`, plus columns
    /// whose type became known. Tables whose write disposition or parent
    /// changed are included even without new columns. Unchanged tables are
    /// omitted.
    #[must_use]
    pub fn diff_from(&self, base: &Schema) -> SchemaUpdate {
        let mut update = SchemaUpdate::default();
        for (name, table) in &self.tables {
            let Some(base_table) = base.tables.get(name) else {
                update.tables.insert(name.clone(), table.clone());
                continue;
            };
            let columns: Vec<Column> = table
                .columns
                .iter()
                .filter(|c| {
                    base_table
                        .column(&c.name)
                        .map_or(true, |b| b.data_type.is_none() && c.data_type.is_some())
                })
                .cloned()
                .collect();
            let relinked = table.write_disposition != base_table.write_disposition
                || table.parent != base_table.parent;
            if relinked || !columns.is_empty() {
                update.tables.insert(
                    name.clone(),
                    Table {
                        columns,
                        ..table.clone()
                    },
                );
            }
        }
        update
    }
}
