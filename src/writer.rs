//! Append-only CSV destination for a merge run.
//!
//! The writer owns the single output stream for the whole run. It writes an
//! optional UTF-8 byte order mark (so spreadsheet tools pick the right
//! encoding), the header exactly once, and then appends batches verbatim. It
//! never seeks or reads back, so output size is unbounded while memory stays
//! at one batch plus the csv buffer.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use csv::{QuoteStyle, StringRecord, Terminator};
use log::debug;

use crate::{
    data::{ColumnSignature, RowBatch},
    error::MergeError,
    reader::delimited::DELIMITER,
};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub struct MergeWriter {
    path: PathBuf,
    inner: csv::Writer<File>,
    record: StringRecord,
    columns: Option<usize>,
    rows_written: u64,
}

impl MergeWriter {
    /// Creates (or truncates) `path`.
    pub fn create(path: &Path, write_bom: bool) -> Result<Self, MergeError> {
        let mut file = File::create(path).map_err(|err| MergeError::writer(path, err))?;
        if write_bom {
            file.write_all(UTF8_BOM)
                .map_err(|err| MergeError::writer(path, err))?;
        }
        let inner = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .quote_style(QuoteStyle::Necessary)
            .double_quote(true)
            .terminator(Terminator::Any(b'\n'))
            .flexible(false)
            .from_writer(file);
        debug!("Opened output {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            inner,
            record: StringRecord::new(),
            columns: None,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn write_header(&mut self, signature: &ColumnSignature) -> Result<(), MergeError> {
        if self.columns.is_some() {
            return Err(self.failure(io::Error::other("header already written")));
        }
        self.inner
            .write_record(signature.names())
            .map_err(|err| MergeError::writer(&self.path, err))?;
        self.columns = Some(signature.len());
        Ok(())
    }

    /// Appends every row of `batch`, returning how many were written.
    pub fn append_rows(&mut self, batch: &RowBatch) -> Result<u64, MergeError> {
        let Some(columns) = self.columns else {
            return Err(self.failure(io::Error::other("rows appended before header")));
        };
        if batch.signature().len() != columns {
            return Err(self.failure(io::Error::other(format!(
                "batch has {} column(s) but output has {columns}",
                batch.signature().len()
            ))));
        }
        for row in batch.rows() {
            self.record.clear();
            for cell in row {
                self.record.push_field(&cell.render());
            }
            self.inner
                .write_record(&self.record)
                .map_err(|err| MergeError::writer(&self.path, err))?;
        }
        let appended = batch.len() as u64;
        self.rows_written += appended;
        Ok(appended)
    }

    /// Flushes and closes the destination.
    pub fn finish(mut self) -> Result<u64, MergeError> {
        self.inner
            .flush()
            .map_err(|err| MergeError::writer(&self.path, err))?;
        debug!(
            "Closed output {:?} after {} row(s)",
            self.path, self.rows_written
        );
        Ok(self.rows_written)
    }

    fn failure(&self, err: io::Error) -> MergeError {
        MergeError::writer(&self.path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellValue;
    use std::{fs, sync::Arc};
    use tempfile::tempdir;

    fn signature(names: &[&str]) -> Arc<ColumnSignature> {
        Arc::new(ColumnSignature::new(names.iter().map(|n| n.to_string()).collect()).unwrap())
    }

    #[test]
    fn writes_bom_header_and_minimally_quoted_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sig = signature(&["a", "b"]);
        let mut writer = MergeWriter::create(&path, true).unwrap();
        writer.write_header(&sig).unwrap();
        let batch = RowBatch::new(
            Arc::clone(&sig),
            vec![
                vec![CellValue::Integer(1), CellValue::text("x, y")],
                vec![CellValue::Missing, CellValue::Double(2.5)],
            ],
        );
        assert_eq!(writer.append_rows(&batch).unwrap(), 2);
        assert_eq!(writer.finish().unwrap(), 2);

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        assert_eq!(
            String::from_utf8(bytes[3..].to_vec()).unwrap(),
            "a,b\n1,\"x, y\"\n,2.5\n"
        );
    }

    #[test]
    fn header_is_written_once_and_rows_require_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sig = signature(&["a"]);
        let mut writer = MergeWriter::create(&path, false).unwrap();
        let early = RowBatch::new(Arc::clone(&sig), vec![vec![CellValue::Integer(1)]]);
        assert!(matches!(
            writer.append_rows(&early),
            Err(MergeError::WriterFailure { .. })
        ));
        writer.write_header(&sig).unwrap();
        assert!(writer.write_header(&sig).is_err());
        let wide = RowBatch::new(signature(&["a", "b"]), vec![]);
        assert!(writer.append_rows(&wide).is_err());
    }

    #[test]
    fn unwritable_destination_is_writer_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        assert!(matches!(
            MergeWriter::create(&path, true),
            Err(MergeError::WriterFailure { .. })
        ));
    }
}
