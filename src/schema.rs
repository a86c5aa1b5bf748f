//! Reference-schema enforcement across input files.
//!
//! The first file that yields a batch fixes the reference [`ColumnSignature`];
//! every later file must match it exactly, position by position. There is no
//! reordering, renaming, or case folding.

use std::path::Path;

use log::debug;

use crate::{data::ColumnSignature, error::MergeError};

#[derive(Debug, Default)]
pub struct SchemaValidator {
    reference: Option<ColumnSignature>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference(&self) -> Option<&ColumnSignature> {
        self.reference.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.reference.is_some()
    }

    /// Records the reference signature. Later calls keep the first one.
    pub fn establish(&mut self, signature: &ColumnSignature) {
        if self.reference.is_none() {
            debug!("Reference schema: {:?}", signature.names());
            self.reference = Some(signature.clone());
        }
    }

    pub fn check(&self, path: &Path, signature: &ColumnSignature) -> Result<(), MergeError> {
        let Some(reference) = &self.reference else {
            return Ok(());
        };
        if reference == signature {
            return Ok(());
        }
        Err(MergeError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: reference.names().to_vec(),
            found: signature.names().to_vec(),
        })
    }
}

/// One-line explanation of how two signatures differ, for logs and reports.
pub fn describe_mismatch(expected: &[String], found: &[String]) -> String {
    if expected.len() != found.len() {
        return format!(
            "expected {} column(s) but found {}",
            expected.len(),
            found.len()
        );
    }
    expected
        .iter()
        .zip(found)
        .enumerate()
        .find(|(_, (left, right))| left != right)
        .map(|(idx, (left, right))| {
            format!(
                "column {} expected '{}' but found '{}'",
                idx + 1,
                left,
                right
            )
        })
        .unwrap_or_else(|| "signatures are identical".to_string())
}
