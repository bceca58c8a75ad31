//! Loosely-typed CSV tables exchanged between pipeline stages.
//!
//! Column presence, not column order, is the contract between stages, so a
//! [`Row`] carries its own column names and a [`Table`] keeps the union of
//! every column it has seen in first-seen order.

use crate::{atomic_write_bytes, CoreError, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed cell value, treating empty cells as absent.
    pub fn non_empty(&self, column: &str) -> Option<&str> {
        self.get(column)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.iter().any(|(name, _)| name == column)
    }

    /// Replaces the value of an existing column or appends a new one.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.set(k, v);
        }
        row
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row, widening the schema with any column not seen before.
    pub fn push(&mut self, row: Row) {
        for column in row.columns() {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.to_string());
            }
        }
        self.rows.push(row);
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn require_column(&self, table: &str, column: &str) -> Result<()> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(CoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn read_table(path: &Path) -> Result<Table> {
    if !path.is_file() {
        return Err(CoreError::MissingInput(path.to_path_buf()));
    }
    let wrap = |source: csv::Error| CoreError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(wrap)?;
    let columns: Vec<String> = reader
        .headers()
        .map_err(wrap)?
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut table = Table::with_columns(columns.clone());
    for record in reader.records() {
        let record = record.map_err(wrap)?;
        let row = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.clone(), record.get(idx).unwrap_or("").to_string()))
            .collect();
        table.rows.push(row);
    }
    Ok(table)
}

/// Writes the table with the union schema; cells a row lacks are left empty.
pub fn write_table(path: &Path, table: &Table) -> Result<()> {
    let wrap = |source: csv::Error| CoreError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(&table.columns).map_err(wrap)?;
    for row in &table.rows {
        let record: Vec<&str> = table
            .columns
            .iter()
            .map(|column| row.get(column).unwrap_or(""))
            .collect();
        writer.write_record(&record).map_err(wrap)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| CoreError::Io(err.into_error()))?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn push_widens_schema_in_first_seen_order() {
        let mut table = Table::with_columns(["filename", "replicate"]);
        table.push([("filename", "a_rep1.yaml"), ("ptm_model_0", "0.8")]
            .into_iter()
            .collect());
        table.push([("filename", "a_rep2.yaml"), ("iptm_model_0", "0.5")]
            .into_iter()
            .collect());
        assert_eq!(
            table.columns,
            vec!["filename", "replicate", "ptm_model_0", "iptm_model_0"]
        );
    }

    #[test]
    fn write_then_read_keeps_missing_cells_empty() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("summary.csv");
        let mut table = Table::default();
        table.push([("filename", "a.yaml"), ("ptm_model_0", "0.8")]
            .into_iter()
            .collect());
        table.push([("filename", "b,c.yaml")].into_iter().collect());
        write_table(&path, &table).expect("write");

        let back = read_table(&path).expect("read");
        assert_eq!(back.columns, vec!["filename", "ptm_model_0"]);
        assert_eq!(back.rows[1].get("filename"), Some("b,c.yaml"));
        assert_eq!(back.rows[1].get("ptm_model_0"), Some(""));
        assert_eq!(back.rows[1].non_empty("ptm_model_0"), None);
    }

    #[test]
    fn missing_file_is_a_typed_error() {
        let err = read_table(Path::new("/nonexistent/experiments.csv")).expect_err("missing");
        assert!(matches!(err, CoreError::MissingInput(_)));
    }

    #[test]
    fn require_column_names_table_and_column() {
        let table = Table::with_columns(["foldname"]);
        let err = table
            .require_column("experiment", "yaml_file")
            .expect_err("missing column");
        assert_eq!(
            err.to_string(),
            "experiment table is missing required column 'yaml_file'"
        );
    }

    #[test]
    fn row_set_replaces_existing_value() {
        let mut row = Row::new();
        row.set("replicate", "1");
        row.set("replicate", "2");
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("replicate"), Some("2"));
    }
}
