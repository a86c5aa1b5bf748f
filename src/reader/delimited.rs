//! Comma-delimited text reader.

use std::{
    fs::File,
    io::BufReader,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use csv::ByteRecord;
use encoding_rs::Encoding;
use log::warn;

use crate::{
    data::{CellValue, ColumnSignature, Row, RowBatch, unnamed_column},
    encoding::{EncodingResolver, decode_field, strip_bom},
    error::MergeError,
};

pub const DELIMITER: u8 = b',';

pub struct DelimitedReader {
    path: PathBuf,
    encoding: &'static Encoding,
    reader: csv::Reader<BufReader<File>>,
    skipped_rows: u64,
}

impl DelimitedReader {
    pub fn open(path: &Path, resolver: &EncodingResolver) -> Result<Self, MergeError> {
        let encoding = resolver.resolve(path)?;
        let file = File::open(path)
            .with_context(|| format!("Opening input file {path:?}"))
            .map_err(|err| MergeError::reader(path, err))?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(DELIMITER)
            .double_quote(true)
            .flexible(true)
            .from_reader(BufReader::new(file));
        Ok(Self {
            path: path.to_path_buf(),
            encoding,
            reader,
            skipped_rows: 0,
        })
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    pub fn batches(&mut self, chunk_size: NonZeroUsize) -> DelimitedBatches<'_> {
        DelimitedBatches {
            source: self,
            chunk_size: chunk_size.get(),
            signature: None,
            record: ByteRecord::new(),
            emitted: false,
            exhausted: false,
        }
    }

    fn read_signature(&mut self) -> Result<Option<ColumnSignature>, MergeError> {
        let headers = self
            .reader
            .byte_headers()
            .context("Reading header row")
            .map_err(|err| MergeError::reader(&self.path, err))?
            .clone();
        if headers.is_empty() {
            return Ok(None);
        }
        let mut names = Vec::with_capacity(headers.len());
        for (idx, field) in headers.iter().enumerate() {
            let decoded = decode_field(field, self.encoding).ok_or_else(|| {
                MergeError::reader(
                    &self.path,
                    anyhow::anyhow!(
                        "Header column {} is not valid {}",
                        idx + 1,
                        self.encoding.name()
                    ),
                )
            })?;
            let name = if idx == 0 {
                strip_bom(&decoded).to_string()
            } else {
                decoded
            };
            names.push(if name.is_empty() {
                unnamed_column(idx)
            } else {
                name
            });
        }
        ColumnSignature::new(names)
            .map(Some)
            .map_err(|err| MergeError::reader(&self.path, err))
    }

    fn decode_row(&self, record: &ByteRecord, width: usize) -> Result<Row, MergeError> {
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        if record.len() != width {
            return Err(MergeError::MalformedRow {
                path: self.path.clone(),
                line,
                reason: format!("expected {width} field(s) but found {}", record.len()),
            });
        }
        record
            .iter()
            .enumerate()
            .map(|(idx, field)| {
                decode_field(field, self.encoding)
                    .map(CellValue::text)
                    .ok_or_else(|| MergeError::MalformedRow {
                        path: self.path.clone(),
                        line,
                        reason: format!(
                            "field {} is not valid {}",
                            idx + 1,
                            self.encoding.name()
                        ),
                    })
            })
            .collect()
    }
}

pub struct DelimitedBatches<'a> {
    source: &'a mut DelimitedReader,
    chunk_size: usize,
    signature: Option<Arc<ColumnSignature>>,
    record: ByteRecord,
    emitted: bool,
    exhausted: bool,
}

impl DelimitedBatches<'_> {
    fn fill_batch(&mut self) -> Result<Option<RowBatch>, MergeError> {
        let signature = match &self.signature {
            Some(signature) => Arc::clone(signature),
            None => match self.source.read_signature()? {
                Some(signature) => {
                    let signature = Arc::new(signature);
                    self.signature = Some(Arc::clone(&signature));
                    signature
                }
                None => return Ok(None),
            },
        };

        let mut rows = Vec::with_capacity(self.chunk_size.min(4096));
        while !self.exhausted && rows.len() < self.chunk_size {
            let more = self
                .source
                .reader
                .read_byte_record(&mut self.record)
                .context("Reading record")
                .map_err(|err| MergeError::reader(&self.source.path, err))?;
            if !more {
                self.exhausted = true;
                break;
            }
            match self.source.decode_row(&self.record, signature.len()) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!("Skipping malformed row: {err}");
                    self.source.skipped_rows += 1;
                }
            }
        }

        if rows.is_empty() && self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(RowBatch::new(signature, rows)))
    }
}

impl Iterator for DelimitedBatches<'_> {
    type Item = Result<RowBatch, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted && self.emitted {
            return None;
        }
        match self.fill_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.exhausted = true;
                self.emitted = true;
                None
            }
            Err(err) => {
                self.exhausted = true;
                self.emitted = true;
                Some(Err(err))
            }
        }
    }
}
