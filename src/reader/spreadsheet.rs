//! Excel readers for `.xlsx` and `.xls` workbooks.
//!
//! Workbooks have no batched-read primitive, so both variants feed sparse
//! sheet rows, in file order, into [`SheetBatches`], which buffers at most one
//! batch. Only the first worksheet is read. The modern format streams cells
//! straight out of the zipped sheet XML; the legacy format decodes the sheet's
//! cell range first (BIFF sheets are capped at 65,536 rows) and walks it.

use std::{
    fs::File,
    io::BufReader,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use calamine::{Data, DataType, Range, Reader, Xls, Xlsx, open_workbook};
use chrono::NaiveDateTime;
use log::warn;

use crate::{
    data::{CellValue, ColumnSignature, Row, RowBatch, unnamed_column},
    error::MergeError,
};

/// The occupied cells of one sheet row, keyed by zero-based column.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub index: u32,
    pub cells: Vec<(u32, CellValue)>,
}

impl SheetRow {
    fn new(index: u32) -> Self {
        Self {
            index,
            cells: Vec::new(),
        }
    }
}

pub struct XlsxReader {
    path: PathBuf,
    workbook: Xlsx<BufReader<File>>,
    sheet: String,
    skipped_rows: u64,
}

impl XlsxReader {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let workbook: Xlsx<_> =
            open_workbook(path).map_err(|err| MergeError::reader(path, err))?;
        let sheet = first_sheet(path, workbook.sheet_names())?;
        Ok(Self {
            path: path.to_path_buf(),
            workbook,
            sheet,
            skipped_rows: 0,
        })
    }

    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    pub fn batches(
        &mut self,
        chunk_size: NonZeroUsize,
    ) -> Result<SheetBatches<'_, impl Iterator<Item = Result<SheetRow, MergeError>>>, MergeError>
    {
        let Self {
            path,
            workbook,
            sheet,
            skipped_rows,
        } = self;
        let path: &Path = path;
        let mut cells = workbook
            .worksheet_cells_reader(sheet)
            .map_err(|err| MergeError::reader(path, err))?;

        let mut pending: Option<(u32, u32, CellValue)> = None;
        let mut done = false;
        let rows = std::iter::from_fn(move || {
            if done {
                return None;
            }
            let mut current = pending
                .take()
                .map(|(row, col, value)| SheetRow {
                    index: row,
                    cells: vec![(col, value)],
                });
            loop {
                match cells.next_cell() {
                    Ok(Some(cell)) => {
                        let (row, col) = cell.get_position();
                        let value = cell_value(cell.get_value());
                        if value.is_missing() {
                            continue;
                        }
                        if current.as_ref().is_some_and(|cur| cur.index != row) {
                            pending = Some((row, col, value));
                            return current.map(Ok);
                        }
                        current
                            .get_or_insert_with(|| SheetRow::new(row))
                            .cells
                            .push((col, value));
                    }
                    Ok(None) => {
                        done = true;
                        return current.map(Ok);
                    }
                    Err(err) => {
                        done = true;
                        return Some(Err(MergeError::reader(path, err)));
                    }
                }
            }
        });
        Ok(SheetBatches::new(path, rows, chunk_size, skipped_rows))
    }
}

pub struct XlsReader {
    path: PathBuf,
    workbook: Xls<BufReader<File>>,
    sheet: String,
    range: Option<Range<Data>>,
    skipped_rows: u64,
}

impl XlsReader {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let workbook: Xls<_> = open_workbook(path).map_err(|err| MergeError::reader(path, err))?;
        let sheet = first_sheet(path, workbook.sheet_names())?;
        Ok(Self {
            path: path.to_path_buf(),
            workbook,
            sheet,
            range: None,
            skipped_rows: 0,
        })
    }

    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    pub fn batches(
        &mut self,
        chunk_size: NonZeroUsize,
    ) -> Result<SheetBatches<'_, impl Iterator<Item = Result<SheetRow, MergeError>>>, MergeError>
    {
        let Self {
            path,
            workbook,
            sheet,
            range,
            skipped_rows,
        } = self;
        let path: &Path = path;
        let loaded = workbook
            .worksheet_range(sheet)
            .map_err(|err| MergeError::reader(path, err))?;
        let range: &Range<Data> = range.insert(loaded);
        let (first_row, first_col) = range.start().unwrap_or((0, 0));
        let rows = range.rows().enumerate().map(move |(offset, cells)| {
            let cells = cells
                .iter()
                .enumerate()
                .filter_map(|(col, data)| {
                    let value = cell_value(data);
                    (!value.is_missing()).then(|| (first_col + col as u32, value))
                })
                .collect();
            Ok(SheetRow {
                index: first_row + offset as u32,
                cells,
            })
        });
        Ok(SheetBatches::new(path, rows, chunk_size, skipped_rows))
    }
}

fn first_sheet(path: &Path, names: Vec<String>) -> Result<String, MergeError> {
    names
        .into_iter()
        .next()
        .ok_or_else(|| MergeError::reader(path, anyhow!("Workbook contains no worksheets")))
}

fn cell_value<T: DataType>(value: &T) -> CellValue {
    if value.is_empty() {
        CellValue::Missing
    } else if let Some(i) = value.get_int() {
        CellValue::Integer(i)
    } else if let Some(f) = value.get_float() {
        CellValue::Double(f)
    } else if let Some(b) = value.get_bool() {
        CellValue::Text(if b { "True" } else { "False" }.to_string())
    } else if let Some(s) = value.get_string() {
        CellValue::text(s)
    } else if value.is_datetime() || value.is_datetime_iso() {
        value
            .as_datetime()
            .map(|dt| CellValue::Text(format_datetime(dt)))
            .or_else(|| value.as_string().map(CellValue::text))
            .unwrap_or(CellValue::Missing)
    } else if let Some(err) = value.get_error() {
        CellValue::Text(err.to_string())
    } else {
        value
            .as_string()
            .map(CellValue::text)
            .unwrap_or(CellValue::Missing)
    }
}

fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
struct SheetLayout {
    base: u32,
    signature: Arc<ColumnSignature>,
}

impl SheetLayout {
    /// The header's first and last occupied columns fix the column span.
    fn from_header(path: &Path, header: &SheetRow) -> Result<Self, MergeError> {
        let base = header.cells.iter().map(|(col, _)| *col).min().unwrap_or(0);
        let last = header.cells.iter().map(|(col, _)| *col).max().unwrap_or(0);
        let width = (last - base + 1) as usize;
        let mut names = (0..width).map(unnamed_column).collect::<Vec<_>>();
        for (col, value) in &header.cells {
            let name = value.render().into_owned();
            if !name.is_empty() {
                names[(col - base) as usize] = name;
            }
        }
        let signature = ColumnSignature::new(names).map_err(|err| MergeError::reader(path, err))?;
        Ok(Self {
            base,
            signature: Arc::new(signature),
        })
    }

    fn place(&self, path: &Path, row: SheetRow) -> Result<Row, MergeError> {
        let width = self.signature.len();
        let mut dense = vec![CellValue::Missing; width];
        for (col, value) in row.cells {
            let slot = col
                .checked_sub(self.base)
                .map(|offset| offset as usize)
                .filter(|offset| *offset < width)
                .ok_or_else(|| MergeError::MalformedRow {
                    path: path.to_path_buf(),
                    line: u64::from(row.index) + 1,
                    reason: format!(
                        "value in column {} lies outside the {width} header column(s)",
                        col + 1
                    ),
                })?;
            dense[slot] = value;
        }
        Ok(dense)
    }
}

/// Turns a stream of sparse sheet rows into bounded [`RowBatch`]es.
pub struct SheetBatches<'a, I> {
    path: &'a Path,
    rows: I,
    chunk_size: usize,
    skipped_rows: &'a mut u64,
    layout: Option<SheetLayout>,
    emitted: bool,
    exhausted: bool,
}

impl<'a, I> SheetBatches<'a, I>
where
    I: Iterator<Item = Result<SheetRow, MergeError>>,
{
    pub fn new(
        path: &'a Path,
        rows: I,
        chunk_size: NonZeroUsize,
        skipped_rows: &'a mut u64,
    ) -> Self {
        Self {
            path,
            rows,
            chunk_size: chunk_size.get(),
            skipped_rows,
            layout: None,
            emitted: false,
            exhausted: false,
        }
    }

    fn read_header(&mut self) -> Result<bool, MergeError> {
        for row in self.rows.by_ref() {
            let row = row?;
            if row.cells.is_empty() {
                continue;
            }
            self.layout = Some(SheetLayout::from_header(self.path, &row)?);
            return Ok(true);
        }
        Ok(false)
    }

    fn fill_batch(&mut self) -> Result<Option<RowBatch>, MergeError> {
        if self.layout.is_none() && !self.read_header()? {
            return Ok(None);
        }
        let Some(layout) = self.layout.as_ref() else {
            return Ok(None);
        };

        let mut rows = Vec::with_capacity(self.chunk_size.min(4096));
        while rows.len() < self.chunk_size {
            let Some(row) = self.rows.next() else {
                self.exhausted = true;
                break;
            };
            let row = row?;
            if row.cells.is_empty() {
                continue;
            }
            match layout.place(self.path, row) {
                Ok(dense) => rows.push(dense),
                Err(err) => {
                    warn!("Skipping malformed row: {err}");
                    *self.skipped_rows += 1;
                }
            }
        }

        if rows.is_empty() && self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(RowBatch::new(Arc::clone(&layout.signature), rows)))
    }
}

impl<I> Iterator for SheetBatches<'_, I>
where
    I: Iterator<Item = Result<SheetRow, MergeError>>,
{
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

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn sheet(rows: Vec<SheetRow>) -> impl Iterator<Item = Result<SheetRow, MergeError>> {
        rows.into_iter().map(Ok)
    }

    fn row(index: u32, cells: Vec<(u32, CellValue)>) -> SheetRow {
        SheetRow { index, cells }
    }

    #[test]
    fn header_names_keep_surrounding_spaces() {
        let rows = vec![row(0, vec![(0, text(" id ")), (1, text("v"))])];
        let mut skipped = 0;
        let batches = SheetBatches::new(
            Path::new("book.xlsx"),
            sheet(rows),
            NonZeroUsize::new(10).unwrap(),
            &mut skipped,
        )
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
        assert_eq!(batches[0].signature().names(), [" id ", "v"]);
    }

    #[test]
    fn header_row_sets_base_and_width() {
        let rows = vec![
            row(0, vec![]),
            row(1, vec![(1, text("id")), (3, text("score"))]),
            row(2, vec![(1, CellValue::Integer(1)), (3, CellValue::Double(9.5))]),
            row(4, vec![(2, text("gap only"))]),
        ];
        let mut skipped = 0;
        let path = Path::new("book.xlsx");
        let batches = SheetBatches::new(path, sheet(rows), NonZeroUsize::new(10).unwrap(), &mut skipped)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].signature().names(),
            ["id", "Unnamed: 1", "score"]
        );
        assert_eq!(
            batches[0].rows()[0],
            vec![CellValue::Integer(1), CellValue::Missing, CellValue::Double(9.5)]
        );
        assert_eq!(batches[0].rows()[1][1], text("gap only"));
    }

    #[test]
    fn cells_outside_header_span_are_skipped_rows() {
        let rows = vec![
            row(0, vec![(0, text("a")), (1, text("b"))]),
            row(1, vec![(0, text("x")), (5, text("stray"))]),
            row(2, vec![(0, text("y"))]),
        ];
        let mut skipped = 0;
        let batches = SheetBatches::new(
            Path::new("book.xlsx"),
            sheet(rows),
            NonZeroUsize::new(1).unwrap(),
            &mut skipped,
        )
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rows()[0], vec![text("y"), CellValue::Missing]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn never_buffers_more_than_one_chunk() {
        let mut rows = vec![row(0, vec![(0, text("n"))])];
        rows.extend((1..=7).map(|i| row(i, vec![(0, CellValue::Integer(i64::from(i)))])));
        let mut skipped = 0;
        let sizes = SheetBatches::new(
            Path::new("book.xls"),
            sheet(rows),
            NonZeroUsize::new(3).unwrap(),
            &mut skipped,
        )
        .map(|batch| batch.unwrap().len())
        .collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn empty_sheet_yields_no_batches() {
        let mut skipped = 0;
        let mut batches = SheetBatches::new(
            Path::new("book.xlsx"),
            sheet(vec![row(0, vec![])]),
            NonZeroUsize::new(3).unwrap(),
            &mut skipped,
        );
        assert!(batches.next().is_none());
    }
}
