use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{NwbError, Result};
use crate::types::CellValue;

/// A named column of a dynamic table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorData {
    pub name: String,
    pub description: String,
    pub data: Vec<CellValue>,
    /// Value given to rows that do not supply this column
    pub fill: CellValue,
}

/// A row-indexed table whose columns can be appended at any time.
///
/// Rows are keyed by integer id. Every column always has one value per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicTable {
    pub name: String,
    pub description: String,
    pub id: Vec<i64>,
    pub columns: Vec<VectorData>,
}

impl DynamicTable {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            id: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub fn colnames(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&VectorData> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut VectorData> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn row_index(&self, id: i64) -> Option<usize> {
        self.id.iter().position(|&candidate| candidate == id)
    }

    /// Value of `column` in the row with `id`.
    pub fn get(&self, id: i64, column: &str) -> Option<&CellValue> {
        let row = self.row_index(id)?;
        self.column(column).and_then(|c| c.data.get(row))
    }

    /// Adds an empty column, padding existing rows with `fill`.
    pub fn add_empty_column(&mut self, name: &str, description: &str, fill: CellValue) -> Result<()> {
        let data = vec![fill.clone(); self.len()];
        self.push_column(name, description, data, fill)
    }

    /// Adds a column with one value per existing row.
    pub fn add_column(&mut self, name: &str, description: &str, data: Vec<CellValue>) -> Result<()> {
        let fill = data
            .iter()
            .find(|v| !v.is_missing())
            .map(CellValue::fill_for)
            .unwrap_or(CellValue::Float(f64::NAN));
        self.push_column(name, description, data, fill)
    }

    fn push_column(
        &mut self,
        name: &str,
        description: &str,
        data: Vec<CellValue>,
        fill: CellValue,
    ) -> Result<()> {
        if self.contains_column(name) {
            return Err(NwbError::DuplicateName {
                kind: "Column",
                name: name.to_string(),
            });
        }
        if data.len() != self.len() {
            return Err(NwbError::InvalidArgument(format!(
                "column '{}' has {} values but the table has {} rows",
                name,
                data.len(),
                self.len()
            )));
        }
        self.columns.push(VectorData {
            name: name.to_string(),
            description: description.to_string(),
            data,
            fill,
        });
        Ok(())
    }

    /// Appends a row. Columns missing from `values` receive their fill value.
    pub fn add_row(&mut self, id: i64, mut values: BTreeMap<String, CellValue>) -> Result<()> {
        if self.row_index(id).is_some() {
            return Err(NwbError::DuplicateName {
                kind: "Row id",
                name: id.to_string(),
            });
        }
        if let Some(unknown) = values.keys().find(|name| !self.contains_column(name)) {
            return Err(NwbError::InvalidArgument(format!(
                "row {} sets unknown column '{}'",
                id, unknown
            )));
        }
        for column in &mut self.columns {
            let value = values
                .remove(&column.name)
                .unwrap_or_else(|| column.fill.clone());
            column.data.push(value);
        }
        self.id.push(id);
        Ok(())
    }
}

/// Sets `property_name` for the rows in `row_ids`.
///
/// An existing column is updated in place. Otherwise a new column is created,
/// filled with `default_value` and then set at the given rows.
pub fn set_dynamic_table_property(
    table: &mut DynamicTable,
    row_ids: &[i64],
    property_name: &str,
    values: Vec<CellValue>,
    default_value: CellValue,
    description: &str,
) -> Result<()> {
    if let Some(&bad) = row_ids.iter().find(|&&id| table.row_index(id).is_none()) {
        return Err(NwbError::UnknownRowId(bad));
    }
    if row_ids.len() != values.len() {
        return Err(NwbError::InvalidArgument(
            "'ids' and 'values' should be lists of same size".to_string(),
        ));
    }

    let positions: Vec<usize> = row_ids
        .iter()
        .filter_map(|&id| table.row_index(id))
        .collect();

    if !table.contains_column(property_name) {
        table.add_empty_column(property_name, description, default_value)?;
    }
    if let Some(column) = table.column_mut(property_name) {
        for (row, value) in positions.into_iter().zip(values) {
            column.data[row] = value;
        }
    }
    Ok(())
}
