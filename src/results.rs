use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Broad SQL type family reported for a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Float,
    Decimal,
    Text,
    Boolean,
    Timestamp,
    Date,
    Time,
    Binary,
    Unknown,
}

/// Metadata for one result column.
///
/// Mirrors the DB-API seven-field description: drivers that cannot report a field leave
/// it as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: DataType,
    pub display_size: Option<usize>,
    pub internal_size: Option<usize>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
}

impl ColumnDescription {
    /// Describe a nullable column with only a name and type.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            display_size: None,
            internal_size: None,
            precision: None,
            scale: None,
            nullable: true,
        }
    }
}

/// Column names shared by every row fetched from one result set.
#[derive(Debug, Clone, Default)]
pub(crate) struct ColumnIndex {
    names: Arc<Vec<String>>,
    positions: Arc<HashMap<String, usize>>,
}

impl ColumnIndex {
    pub(crate) fn from_description(description: &[ColumnDescription]) -> Self {
        let names: Vec<String> = description.iter().map(|col| col.name.clone()).collect();
        let positions = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names: Arc::new(names),
            positions: Arc::new(positions),
        }
    }

    pub(crate) fn row(&self, values: Vec<Value>) -> Row {
        Row {
            column_names: Arc::clone(&self.names),
            values,
            column_index_cache: Arc::clone(&self.positions),
        }
    }
}

/// A row fetched through a [`Cursor`](crate::Cursor).
#[derive(Debug, Clone)]
pub struct Row {
    /// The column names for this row (shared across all rows in a result set)
    pub column_names: Arc<Vec<String>>,
    /// The values for this row
    pub values: Vec<Value>,
    column_index_cache: Arc<HashMap<String, usize>>,
}

impl Row {
    /// Build a standalone row; rows fetched from a cursor share their column index instead.
    #[must_use]
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let description: Vec<ColumnDescription> = column_names
            .into_iter()
            .map(|name| ColumnDescription::new(name, DataType::Unknown))
            .collect();
        ColumnIndex::from_description(&description).row(values)
    }

    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        if let Some(&idx) = self.column_index_cache.get(column_name) {
            return Some(idx);
        }
        // ODBC column names are frequently upper-cased by the driver
        self.column_names
            .iter()
            .position(|col| col.eq_ignore_ascii_case(column_name))
    }

    /// Get a value from the row by column name
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&Value> {
        self.get_column_index(column_name)
            .and_then(|idx| self.values.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consume the row, keeping only its values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.column_names == other.column_names && self.values == other.values
    }
}
