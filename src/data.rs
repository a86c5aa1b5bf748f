//! Cell values, column signatures, and row batches.
//!
//! These are the only values that cross from a chunk reader to the writer.
//! A [`RowBatch`] is bounded by the configured chunk size and is dropped as soon
//! as the writer has appended it.

use std::{borrow::Cow, collections::HashSet, fmt, sync::Arc};

use anyhow::{Result, bail};

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Missing,
    Integer(i64),
    Single(f32),
    Double(f64),
    Text(String),
}

impl CellValue {
    /// Text cell, with the empty string treated as missing.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            CellValue::Missing
        } else {
            CellValue::Text(value)
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, CellValue::Missing)
    }

    /// The textual form written to the output file.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            CellValue::Missing => Cow::Borrowed(""),
            CellValue::Integer(i) => Cow::Owned(i.to_string()),
            CellValue::Single(f) if f.is_finite() => Cow::Owned(f.to_string()),
            CellValue::Double(f) if f.is_finite() => Cow::Owned(f.to_string()),
            CellValue::Single(_) | CellValue::Double(_) => Cow::Borrowed(""),
            CellValue::Text(s) => Cow::Borrowed(s.as_str()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Ordered column names identifying a file's row shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSignature {
    names: Vec<String>,
}

impl ColumnSignature {
    pub fn new(names: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                bail!("Duplicate column name '{name}' in header");
            }
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub type Row = Vec<CellValue>;

#[derive(Debug, Clone)]
pub struct RowBatch {
    signature: Arc<ColumnSignature>,
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(signature: Arc<ColumnSignature>, rows: Vec<Row>) -> Self {
        Self { signature, rows }
    }

    pub fn signature(&self) -> &ColumnSignature {
        &self.signature
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Header cell fallback for blank column names.
pub(crate) fn unnamed_column(index: usize) -> String {
    format!("Unnamed: {index}")
}
