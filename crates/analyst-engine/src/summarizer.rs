//! Metadata summarizer
//!
//! Reduces a data file to the compact description embedded in prompts:
//! ordered columns with inferred types, a few sample rows and a row count.
//! CSV/TSV and JSON get a schema; anything else is summarized as text.

use crate::error::SummarizeError;
use analyst_core::{Column, ColumnType, DataFormat, DataHandle, DataMetadata};
use serde_json::{Map, Number, Value};
use std::path::Path;

/// Sample rows kept per source
pub const DEFAULT_SAMPLE_ROWS: usize = 5;

/// Characters of a text source kept as preview
const TEXT_PREVIEW_CHARS: usize = 500;

/// File-based summarizer
#[derive(Debug, Clone, Copy)]
pub struct FileSummarizer {
    sample_rows: usize,
}

impl Default for FileSummarizer {
    fn default() -> Self {
        Self {
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }
}

impl FileSummarizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    /// Summarize one handle; the format follows the file extension
    ///
    /// # Errors
    /// The file cannot be read, or does not parse as its extension claims.
    pub fn summarize(&self, handle: &DataHandle) -> Result<DataMetadata, SummarizeError> {
        let path = handle.path();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let meta = match extension.as_deref() {
            Some("csv") => self.summarize_csv(handle.name(), path, b',')?,
            Some("tsv") => self.summarize_csv(handle.name(), path, b'\t')?,
            Some("json") => self.summarize_json(handle.name(), path)?,
            _ => summarize_text(handle.name(), path)?,
        };
        tracing::debug!(
            source = %meta.source,
            rows = meta.row_count,
            columns = meta.schema.len(),
            "data source summarized"
        );
        Ok(meta)
    }

    fn summarize_csv(
        &self,
        name: &str,
        path: &Path,
        delimiter: u8,
    ) -> Result<DataMetadata, SummarizeError> {
        let csv_error = |source| SummarizeError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut types = vec![ColumnType::Empty; headers.len()];
        let mut samples = Vec::new();
        let mut row_count = 0;
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            row_count += 1;
            for (slot, cell) in types.iter_mut().zip(record.iter()) {
                *slot = widen(*slot, infer_cell(cell));
            }
            if samples.len() < self.sample_rows {
                let row: Map<String, Value> = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, cell)| (h.clone(), cell_value(cell)))
                    .collect();
                samples.push(Value::Object(row));
            }
        }

        Ok(DataMetadata {
            source: name.to_string(),
            format: DataFormat::Csv,
            schema: headers
                .into_iter()
                .zip(types)
                .map(|(h, t)| Column::new(h, t))
                .collect(),
            sample_rows: samples,
            row_count,
        })
    }

    fn summarize_json(&self, name: &str, path: &Path) -> Result<DataMetadata, SummarizeError> {
        let text = read(path)?;
        let value: Value = serde_json::from_str(&text).map_err(|source| SummarizeError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let rows = match value {
            Value::Array(rows) => rows,
            other => vec![other],
        };

        let mut schema: Vec<Column> = Vec::new();
        for row in &rows {
            match row {
                Value::Object(map) => {
                    for (key, value) in map {
                        let dtype = infer_json(value);
                        match schema.iter_mut().find(|c| &c.name == key) {
                            Some(column) => column.dtype = widen(column.dtype, dtype),
                            None => schema.push(Column::new(key.clone(), dtype)),
                        }
                    }
                }
                scalar => {
                    let dtype = infer_json(scalar);
                    match schema.iter_mut().find(|c| c.name == "value") {
                        Some(column) => column.dtype = widen(column.dtype, dtype),
                        None => schema.push(Column::new("value", dtype)),
                    }
                }
            }
        }

        Ok(DataMetadata {
            source: name.to_string(),
            format: DataFormat::Json,
            schema,
            sample_rows: rows.iter().take(self.sample_rows).cloned().collect(),
            row_count: rows.len(),
        })
    }
}

fn summarize_text(name: &str, path: &Path) -> Result<DataMetadata, SummarizeError> {
    let bytes = std::fs::read(path).map_err(|source| SummarizeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let preview: String = text.chars().take(TEXT_PREVIEW_CHARS).collect();
    Ok(DataMetadata::text(name, preview, text.lines().count()))
}

fn read(path: &Path) -> Result<String, SummarizeError> {
    std::fs::read_to_string(path).map_err(|source| SummarizeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn infer_cell(cell: &str) -> ColumnType {
    let cell = cell.trim();
    if cell.is_empty() {
        ColumnType::Empty
    } else if cell.parse::<i64>().is_ok() {
        ColumnType::Integer
    } else if cell.parse::<f64>().is_ok() {
        ColumnType::Float
    } else if cell.eq_ignore_ascii_case("true") || cell.eq_ignore_ascii_case("false") {
        ColumnType::Boolean
    } else {
        ColumnType::String
    }
}

fn cell_value(cell: &str) -> Value {
    let trimmed = cell.trim();
    match infer_cell(trimmed) {
        ColumnType::Empty => Value::Null,
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map_or_else(|_| Value::String(cell.to_string()), Value::from),
        ColumnType::Float => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or_else(|| Value::String(cell.to_string()), Value::Number),
        ColumnType::Boolean => Value::Bool(trimmed.eq_ignore_ascii_case("true")),
        ColumnType::String => Value::String(cell.to_string()),
    }
}

fn infer_json(value: &Value) -> ColumnType {
    match value {
        Value::Null => ColumnType::Empty,
        Value::Bool(_) => ColumnType::Boolean,
        Value::Number(n) if n.is_f64() => ColumnType::Float,
        Value::Number(_) => ColumnType::Integer,
        Value::String(_) | Value::Array(_) | Value::Object(_) => ColumnType::String,
    }
}

/// Narrowest type holding values of both `a` and `b`
fn widen(a: ColumnType, b: ColumnType) -> ColumnType {
    use ColumnType::{Empty, Float, Integer, String};
    match (a, b) {
        (Empty, t) | (t, Empty) => t,
        (x, y) if x == y => x,
        (Integer, Float) | (Float, Integer) => Float,
        _ => String,
    }
}
