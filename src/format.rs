//! Extension-based format detection.
//!
//! Classification never looks at file contents: a `.csv` holding Stata bytes is
//! still handed to the delimited reader, which then fails for that file alone.

use std::{fmt, fs, path::Path, path::PathBuf};

use serde::Serialize;

use crate::error::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileFormat {
    Delimited,
    SpreadsheetLegacy,
    SpreadsheetModern,
    StatisticalPackage,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Delimited => "csv",
            FileFormat::SpreadsheetLegacy => "xls",
            FileFormat::SpreadsheetModern => "xlsx",
            FileFormat::StatisticalPackage => "dta",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        [
            FileFormat::Delimited,
            FileFormat::SpreadsheetLegacy,
            FileFormat::SpreadsheetModern,
            FileFormat::StatisticalPackage,
        ]
        .into_iter()
        .find(|format| ext.eq_ignore_ascii_case(format.extension()))
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileFormat::Delimited => "delimited-text",
            FileFormat::SpreadsheetLegacy => "spreadsheet-legacy",
            FileFormat::SpreadsheetModern => "spreadsheet-modern",
            FileFormat::StatisticalPackage => "statistical-package",
        };
        f.write_str(label)
    }
}

pub fn detect(path: &Path) -> Result<FileFormat, MergeError> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    FileFormat::from_extension(ext).ok_or_else(|| MergeError::UnsupportedFormat {
        path: path.to_path_buf(),
        extension: ext.to_string(),
    })
}

/// A discovered input and the reader variant chosen for it.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: PathBuf,
    pub format: FileFormat,
    pub size: u64,
}

impl InputFile {
    pub fn detect(path: &Path) -> Result<Self, MergeError> {
        let format = detect(path)?;
        let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            format,
            size,
        })
    }

    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
