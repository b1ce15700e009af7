//! Row flattening, child table unnesting and column inference.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sluice_types::ids::LoadId;
use sluice_types::naming::{
    self, LIST_IDX_COLUMN, LOAD_ID_COLUMN, PARENT_ID_COLUMN, ROOT_ID_COLUMN, ROW_ID_COLUMN,
    VALUE_COLUMN,
};
use sluice_types::schema::{Column, DataType, Schema, Table, WriteDisposition};

use crate::errors::NormalizeError;

/// A normalized row and the table it belongs to.
pub type NormalizedRow = (String, Map<String, Value>);

/// Lists found while flattening one object: column path and elements.
type PendingLists = Vec<(String, Vec<Value>)>;

/// Identity settings shared by a root row and all of its descendants.
struct Lineage {
    disposition: WriteDisposition,
    /// Child ids derived from the parent id and list position.
    stable_ids: bool,
    root_id: String,
}

/// Turns extracted rows into flat rows of root and child tables while
/// evolving the schema it owns.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    schema: Schema,
    load_id: LoadId,
}

impl RowNormalizer {
    #[must_use]
    pub fn new(schema: Schema, load_id: LoadId) -> Self {
        Self { schema, load_id }
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn into_schema(self) -> Schema {
        self.schema
    }

    /// Normalize one extracted row of `table`. The root row comes first,
    /// followed by child rows in depth-first order.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError::MergeKeyMissing`] for a merge table without
    /// primary key, merge key or row hash, and [`NormalizeError::Schema`] when
    /// a column type conflict can't be resolved.
    pub fn normalize_row(
        &mut self,
        table: &str,
        row: Map<String, Value>,
    ) -> Result<Vec<NormalizedRow>, NormalizeError> {
        let root = self.schema.get_or_insert_table(table);
        let disposition = root.write_disposition;
        let row_hash = root.row_hash;
        if disposition == WriteDisposition::Merge && !root.has_merge_key() {
            return Err(NormalizeError::MergeKeyMissing {
                table: table.to_string(),
            });
        }

        let row_id = if row_hash {
            hash_hex(&serde_json::to_vec(&row).unwrap_or_default())
        } else {
            random_id()
        };

        let mut flat = Map::new();
        let mut lists = Vec::new();
        self.flatten_object(table, "", row, &mut flat, &mut lists);
        flat.insert(LOAD_ID_COLUMN.to_string(), json!(self.load_id.as_str()));
        flat.insert(ROW_ID_COLUMN.to_string(), json!(row_id));

        let lineage = Lineage {
            disposition,
            stable_ids: row_hash || disposition == WriteDisposition::Merge,
            root_id: row_id.clone(),
        };
        let mut out = vec![(table.to_string(), self.finish_row(table, flat)?)];
        self.unnest_lists(table, &row_id, lists, &lineage, &mut out)?;
        Ok(out)
    }

    fn is_complex(&self, table: &str, column: &str) -> bool {
        self.schema
            .table(table)
            .and_then(|t| t.column(column))
            .is_some_and(|c| c.data_type == Some(DataType::Complex))
    }

    /// Flatten nested objects into `out` as `a__b` columns. Lists are set
    /// aside for unnesting unless the column is declared complex.
    fn flatten_object(
        &self,
        table: &str,
        prefix: &str,
        object: Map<String, Value>,
        out: &mut Map<String, Value>,
        lists: &mut PendingLists,
    ) {
        for (key, value) in object {
            let path = naming::make_path(prefix, &naming::normalize_identifier(&key));
            match value {
                Value::Object(inner) if !self.is_complex(table, &path) => {
                    self.flatten_object(table, &path, inner, out, lists);
                }
                Value::Array(items) if !self.is_complex(table, &path) => lists.push((path, items)),
                value => {
                    out.insert(path, value);
                }
            }
        }
    }

    fn unnest_lists(
        &mut self,
        parent_table: &str,
        parent_id: &str,
        lists: PendingLists,
        lineage: &Lineage,
        out: &mut Vec<NormalizedRow>,
    ) -> Result<(), NormalizeError> {
        for (path, items) in lists {
            let child_table = naming::make_path(parent_table, &path);
            self.ensure_child_table(parent_table, &child_table, lineage.disposition);

            for (idx, item) in items.into_iter().enumerate() {
                let object = match item {
                    Value::Object(object) => object,
                    other => {
                        let mut wrapped = Map::new();
                        wrapped.insert(VALUE_COLUMN.to_string(), other);
                        wrapped
                    }
                };
                let mut flat = Map::new();
                let mut nested = Vec::new();
                self.flatten_object(&child_table, "", object, &mut flat, &mut nested);

                let row_id = if lineage.stable_ids {
                    hash_hex(format!("{parent_id}{child_table}{idx}").as_bytes())
                } else {
                    random_id()
                };
                flat.insert(PARENT_ID_COLUMN.to_string(), json!(parent_id));
                flat.insert(LIST_IDX_COLUMN.to_string(), json!(idx));
                flat.insert(ROW_ID_COLUMN.to_string(), json!(row_id));
                if lineage.disposition == WriteDisposition::Merge {
                    flat.insert(ROOT_ID_COLUMN.to_string(), json!(lineage.root_id));
                    flat.insert(LOAD_ID_COLUMN.to_string(), json!(self.load_id.as_str()));
                }

                let row = self.finish_row(&child_table, flat)?;
                out.push((child_table.clone(), row));
                self.unnest_lists(&child_table, &row_id, nested, lineage, out)?;
            }
        }
        Ok(())
    }

    fn ensure_child_table(&mut self, parent: &str, child: &str, disposition: WriteDisposition) {
        if let Some(table) = self.schema.table_mut(child) {
            if table.write_disposition != disposition {
                table.write_disposition = disposition;
            }
            if table.parent.is_none() {
                table.parent = Some(parent.to_string());
            }
            return;
        }
        let mut table = Table::new(child);
        table.parent = Some(parent.to_string());
        table.write_disposition = disposition;
        self.schema.tables.insert(child.to_string(), table);
    }

    /// Coerce every non-null value into its column, inferring new columns.
    fn finish_row(
        &mut self,
        table: &str,
        flat: Map<String, Value>,
    ) -> Result<Map<String, Value>, NormalizeError> {
        let mut row = Map::with_capacity(flat.len());
        for (name, value) in flat {
            if value.is_null() {
                continue;
            }
            let (column, value) = self.coerce_column(table, name, value)?;
            row.insert(column, value);
        }
        Ok(row)
    }

    fn coerce_column(
        &mut self,
        table: &str,
        name: String,
        value: Value,
    ) -> Result<(String, Value), NormalizeError> {
        let Some(inferred) = DataType::infer(&value) else {
            return Ok((name, value));
        };
        let table = self.schema.get_or_insert_table(table);
        match table.column(&name).and_then(|c| c.data_type) {
            Some(existing) => match existing.coerce(&value) {
                Some(coerced) => Ok((name, coerced)),
                None => {
                    let variant = naming::variant_column(&name, inferred);
                    let mut column = Column::with_type(variant.clone(), inferred);
                    column.variant = true;
                    table.merge_inferred_column(&column)?;
                    Ok((variant, value))
                }
            },
            None => {
                table.merge_inferred_column(&Column::with_type(name.clone(), inferred))?;
                Ok((name, value))
            }
        }
    }
}

fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
