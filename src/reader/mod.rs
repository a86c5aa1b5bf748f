//! Chunked row sources.
//!
//! [`ChunkReader`] is the closed set of per-format readers. The orchestrator
//! opens one per file with [`ChunkReader::open`], then drains
//! [`ChunkReader::batches`]: a lazy, non-restartable iterator whose first batch
//! carries the file's column signature. A file with a header and no rows yields
//! one empty batch; a file without a header yields nothing.

pub mod delimited;
pub mod spreadsheet;
pub mod stata;

use std::num::NonZeroUsize;

use encoding_rs::Encoding;
use serde::Serialize;

use crate::{
    data::RowBatch,
    encoding::EncodingResolver,
    error::MergeError,
    format::{FileFormat, InputFile},
};

pub use delimited::DelimitedReader;
pub use spreadsheet::{XlsReader, XlsxReader};
pub use stata::StataReader;

pub type RowBatches<'a> = Box<dyn Iterator<Item = Result<RowBatch, MergeError>> + 'a>;

/// Which code path served a file. `Buffered` holds the whole file in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    Chunked,
    Buffered,
}

impl std::fmt::Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadMode::Chunked => f.write_str("chunked"),
            ReadMode::Buffered => f.write_str("buffered"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub resolver: EncodingResolver,
}

pub enum ChunkReader {
    Delimited(DelimitedReader),
    Xls(XlsReader),
    Xlsx(XlsxReader),
    Stata(StataReader),
}

impl ChunkReader {
    pub fn open(input: &InputFile, options: &ReaderOptions) -> Result<Self, MergeError> {
        let path = input.path.as_path();
        Ok(match input.format {
            FileFormat::Delimited => {
                ChunkReader::Delimited(DelimitedReader::open(path, &options.resolver)?)
            }
            FileFormat::SpreadsheetLegacy => ChunkReader::Xls(XlsReader::open(path)?),
            FileFormat::SpreadsheetModern => ChunkReader::Xlsx(XlsxReader::open(path)?),
            FileFormat::StatisticalPackage => ChunkReader::Stata(StataReader::open(path)?),
        })
    }

    pub fn batches(&mut self, chunk_size: NonZeroUsize) -> Result<RowBatches<'_>, MergeError> {
        Ok(match self {
            ChunkReader::Delimited(reader) => Box::new(reader.batches(chunk_size)),
            ChunkReader::Xls(reader) => Box::new(reader.batches(chunk_size)?),
            ChunkReader::Xlsx(reader) => Box::new(reader.batches(chunk_size)?),
            ChunkReader::Stata(reader) => reader.batches(chunk_size)?,
        })
    }

    pub fn read_mode(&self) -> ReadMode {
        match self {
            ChunkReader::Stata(reader) => reader.read_mode(),
            _ => ReadMode::Chunked,
        }
    }

    /// Rows dropped as malformed so far.
    pub fn skipped_rows(&self) -> u64 {
        match self {
            ChunkReader::Delimited(reader) => reader.skipped_rows(),
            ChunkReader::Xls(reader) => reader.skipped_rows(),
            ChunkReader::Xlsx(reader) => reader.skipped_rows(),
            ChunkReader::Stata(_) => 0,
        }
    }

    pub fn encoding(&self) -> Option<&'static Encoding> {
        match self {
            ChunkReader::Delimited(reader) => Some(reader.encoding()),
            _ => None,
        }
    }
}
