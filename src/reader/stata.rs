//! Stata `.dta` reader.
//!
//! Supports the fixed-header releases 113–115 and the tagged releases
//! 117–119, in either byte order. Records are fixed width, so the common path
//! seeks to the data section and decodes one batch of records at a time.
//!
//! Long strings (`strL`) are stored as `(v, o)` references into a section that
//! follows the data. Files that use them are served by the buffered path: every
//! record is loaded, the `strL` section is read, references are resolved, and
//! the rows are then re-sliced into batches. That path holds the whole file in
//! memory and is reported as [`ReadMode::Buffered`].

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail, ensure};
use encoding_rs::WINDOWS_1252;
use log::{debug, warn};

use crate::{
    data::{CellValue, ColumnSignature, Row, RowBatch},
    error::MergeError,
    reader::{ReadMode, RowBatches},
};

const NEW_FORMAT_MAGIC: &[u8] = b"<stata_dta>";
const MAX_INT8: i8 = 100;
const MAX_INT16: i16 = 32_740;
const MAX_INT32: i32 = 2_147_483_620;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

macro_rules! decode_number {
    ($name:ident, $ty:ty, $len:expr) => {
        fn $name(self, bytes: &[u8]) -> $ty {
            let mut buf = [0u8; $len];
            buf.copy_from_slice(&bytes[..$len]);
            match self {
                ByteOrder::Big => <$ty>::from_be_bytes(buf),
                ByteOrder::Little => <$ty>::from_le_bytes(buf),
            }
        }
    };
}

impl ByteOrder {
    decode_number!(u16, u16, 2);
    decode_number!(u32, u32, 4);
    decode_number!(u64, u64, 8);
    decode_number!(i16, i16, 2);
    decode_number!(i32, i32, 4);
    decode_number!(f32, f32, 4);
    decode_number!(f64, f64, 8);

    /// Unsigned integer of any width up to eight bytes.
    fn uint(self, bytes: &[u8]) -> u64 {
        let push = |acc: u64, byte: &u8| (acc << 8) | u64::from(*byte);
        match self {
            ByteOrder::Big => bytes.iter().fold(0, push),
            ByteOrder::Little => bytes.iter().rev().fold(0, push),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DtaType {
    Byte,
    Int,
    Long,
    Float,
    Double,
    Str(usize),
    StrL,
}

impl DtaType {
    fn from_tagged_code(code: u16) -> Result<Self> {
        Ok(match code {
            1..=2045 => DtaType::Str(code as usize),
            32768 => DtaType::StrL,
            65526 => DtaType::Double,
            65527 => DtaType::Float,
            65528 => DtaType::Long,
            65529 => DtaType::Int,
            65530 => DtaType::Byte,
            other => bail!("Unknown variable type code {other}"),
        })
    }

    fn from_legacy_code(code: u8) -> Result<Self> {
        Ok(match code {
            1..=244 => DtaType::Str(code as usize),
            251 => DtaType::Byte,
            252 => DtaType::Int,
            253 => DtaType::Long,
            254 => DtaType::Float,
            255 => DtaType::Double,
            other => bail!("Unknown variable type code {other}"),
        })
    }

    fn width(self) -> usize {
        match self {
            DtaType::Byte => 1,
            DtaType::Int => 2,
            DtaType::Long | DtaType::Float => 4,
            DtaType::Double | DtaType::StrL => 8,
            DtaType::Str(width) => width,
        }
    }
}

#[derive(Debug, Clone)]
struct DtaColumn {
    name: String,
    kind: DtaType,
    offset: usize,
}

#[derive(Debug, Clone)]
struct DtaLayout {
    release: u16,
    order: ByteOrder,
    observations: u64,
    columns: Vec<DtaColumn>,
    record_width: usize,
    data_offset: u64,
    strls: Option<Range<u64>>,
}

impl DtaLayout {
    fn has_strls(&self) -> bool {
        self.columns.iter().any(|c| c.kind == DtaType::StrL)
    }

    fn signature(&self) -> Result<ColumnSignature> {
        ColumnSignature::new(self.columns.iter().map(|c| c.name.clone()).collect())
    }

    fn decode_record(&self, record: &[u8]) -> Vec<RawCell> {
        let order = self.order;
        self.columns
            .iter()
            .map(|column| {
                let bytes = &record[column.offset..column.offset + column.kind.width()];
                let value = match column.kind {
                    DtaType::Byte => {
                        let v = bytes[0] as i8;
                        if v > MAX_INT8 {
                            CellValue::Missing
                        } else {
                            CellValue::Integer(i64::from(v))
                        }
                    }
                    DtaType::Int => {
                        let v = order.i16(bytes);
                        if v > MAX_INT16 {
                            CellValue::Missing
                        } else {
                            CellValue::Integer(i64::from(v))
                        }
                    }
                    DtaType::Long => {
                        let v = order.i32(bytes);
                        if v > MAX_INT32 {
                            CellValue::Missing
                        } else {
                            CellValue::Integer(i64::from(v))
                        }
                    }
                    DtaType::Float => {
                        let v = order.f32(bytes);
                        if v.is_nan() || v >= 2f32.powi(127) {
                            CellValue::Missing
                        } else {
                            CellValue::Single(v)
                        }
                    }
                    DtaType::Double => {
                        let v = order.f64(bytes);
                        if v.is_nan() || v >= 2f64.powi(1023) {
                            CellValue::Missing
                        } else {
                            CellValue::Double(v)
                        }
                    }
                    DtaType::Str(_) => CellValue::text(decode_text(self.release, bytes)),
                    DtaType::StrL => return RawCell::StrL(self.strl_key(bytes)),
                };
                RawCell::Value(value)
            })
            .collect()
    }

    /// `(v, o)` as stored in a data record. `v` occupies the leading bytes
    /// of the field and `o` the rest, each in file byte order.
    fn strl_key(&self, bytes: &[u8]) -> (u32, u64) {
        let v_len = match self.release {
            117 => 4,
            118 => 2,
            _ => 3,
        };
        (
            self.order.uint(&bytes[..v_len]) as u32,
            self.order.uint(&bytes[v_len..8]),
        )
    }
}

fn decode_text(release: u16, bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let bytes = &bytes[..end];
    if release >= 118 {
        match std::str::from_utf8(bytes) {
            Ok(text) => return text.to_string(),
            Err(_) => warn!("Invalid UTF-8 in Stata string; decoding as windows-1252"),
        }
    }
    WINDOWS_1252.decode_without_bom_handling(bytes).0.into_owned()
}

#[derive(Debug, Clone)]
enum RawCell {
    Value(CellValue),
    StrL((u32, u64)),
}

struct DtaInput<R> {
    inner: R,
    order: ByteOrder,
}

impl<R: Read + Seek> DtaInput<R> {
    fn bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        Ok(self.order.u16(&self.bytes(2)?))
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(self.order.u32(&self.bytes(4)?))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(self.order.u64(&self.bytes(8)?))
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Current(len as i64)).map(|_| ())
    }

    fn expect(&mut self, tag: &[u8]) -> Result<()> {
        let found = self.bytes(tag.len())?;
        ensure!(
            found == tag,
            "Expected '{}' but found '{}'",
            String::from_utf8_lossy(tag),
            String::from_utf8_lossy(&found)
        );
        Ok(())
    }

    fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }
}

fn parse_layout<R: Read + Seek>(inner: R) -> Result<DtaLayout> {
    let mut input = DtaInput {
        inner,
        order: ByteOrder::Little,
    };
    let magic = input.bytes(NEW_FORMAT_MAGIC.len()).context("Reading file header")?;
    if magic == NEW_FORMAT_MAGIC {
        parse_tagged(&mut input)
    } else {
        input.inner.seek(SeekFrom::Start(0))?;
        parse_legacy(&mut input)
    }
}

fn parse_tagged<R: Read + Seek>(input: &mut DtaInput<R>) -> Result<DtaLayout> {
    input.expect(b"<header><release>")?;
    let release_text = input.bytes(3)?;
    let release: u16 = std::str::from_utf8(&release_text)
        .ok()
        .and_then(|s| s.parse().ok())
        .context("Unreadable release number")?;
    ensure!(
        (117..=119).contains(&release),
        "Unsupported Stata release {release}"
    );
    input.expect(b"</release><byteorder>")?;
    input.order = match input.bytes(3)?.as_slice() {
        b"MSF" => ByteOrder::Big,
        b"LSF" => ByteOrder::Little,
        other => bail!("Unknown byte order '{}'", String::from_utf8_lossy(other)),
    };
    input.expect(b"</byteorder><K>")?;
    let variables = if release == 119 {
        input.u32()? as usize
    } else {
        input.u16()? as usize
    };
    input.expect(b"</K><N>")?;
    let observations = if release == 117 {
        u64::from(input.u32()?)
    } else {
        input.u64()?
    };
    input.expect(b"</N><label>")?;
    let label_len = if release == 117 {
        u64::from(input.u8()?)
    } else {
        u64::from(input.u16()?)
    };
    input.skip(label_len)?;
    input.expect(b"</label><timestamp>")?;
    let stamp_len = input.u8()?;
    input.skip(u64::from(stamp_len))?;
    input.expect(b"</timestamp></header><map>")?;
    let map = (0..14).map(|_| input.u64()).collect::<io::Result<Vec<_>>>()?;
    input.expect(b"</map><variable_types>")?;
    let kinds = (0..variables)
        .map(|_| DtaType::from_tagged_code(input.u16()?))
        .collect::<Result<Vec<_>>>()?;
    input.expect(b"</variable_types><varnames>")?;
    let name_width = if release == 117 { 33 } else { 129 };
    let raw_names = (0..variables)
        .map(|_| input.bytes(name_width))
        .collect::<io::Result<Vec<_>>>()?;

    input.inner.seek(SeekFrom::Start(map[9]))?;
    input.expect(b"<data>").context("Locating data section")?;
    let data_offset = input.position()?;

    let (columns, record_width) = build_columns(release, raw_names, kinds);
    Ok(DtaLayout {
        release,
        order: input.order,
        observations,
        columns,
        record_width,
        data_offset,
        strls: Some(map[10]..map[11]),
    })
}

fn parse_legacy<R: Read + Seek>(input: &mut DtaInput<R>) -> Result<DtaLayout> {
    let release = u16::from(input.u8()?);
    ensure!(
        (113..=115).contains(&release),
        "Unsupported Stata release {release}"
    );
    input.order = match input.u8()? {
        1 => ByteOrder::Big,
        2 => ByteOrder::Little,
        other => bail!("Unknown byte order flag {other}"),
    };
    input.skip(2)?;
    let variables = input.u16()? as usize;
    let observations = u64::from(input.u32()?);
    input.skip(81 + 18)?;
    let kinds = input
        .bytes(variables)?
        .into_iter()
        .map(DtaType::from_legacy_code)
        .collect::<Result<Vec<_>>>()?;
    let raw_names = (0..variables)
        .map(|_| input.bytes(33))
        .collect::<io::Result<Vec<_>>>()?;
    let format_width: u64 = if release == 113 { 12 } else { 49 };
    let vars = variables as u64;
    // sort list, formats, value label names, variable labels
    input.skip(2 * (vars + 1) + format_width * vars + 33 * vars + 81 * vars)?;
    loop {
        let kind = input.u8()?;
        let len = input.u32()?;
        if kind == 0 && len == 0 {
            break;
        }
        input.skip(u64::from(len))?;
    }
    let data_offset = input.position()?;

    let (columns, record_width) = build_columns(release, raw_names, kinds);
    Ok(DtaLayout {
        release,
        order: input.order,
        observations,
        columns,
        record_width,
        data_offset,
        strls: None,
    })
}

/// Lays columns out back to back; returns them with the record width.
fn build_columns(
    release: u16,
    raw_names: Vec<Vec<u8>>,
    kinds: Vec<DtaType>,
) -> (Vec<DtaColumn>, usize) {
    let mut offset = 0;
    let columns = raw_names
        .into_iter()
        .zip(kinds)
        .map(|(raw, kind)| {
            let column = DtaColumn {
                name: decode_text(release, &raw),
                kind,
                offset,
            };
            offset += kind.width();
            column
        })
        .collect();
    (columns, offset)
}

fn read_strls<R: Read + Seek>(
    input: &mut DtaInput<R>,
    release: u16,
    section: Range<u64>,
) -> Result<HashMap<(u32, u64), String>> {
    input.inner.seek(SeekFrom::Start(section.start))?;
    input.expect(b"<strls>").context("Locating strL section")?;
    let mut values = HashMap::new();
    loop {
        let marker = input.bytes(3)?;
        match marker.as_slice() {
            b"GSO" => {}
            b"</s" => break,
            other => bail!(
                "Unexpected bytes '{}' in strL section",
                String::from_utf8_lossy(other)
            ),
        }
        let v = input.u32()?;
        let o = if release == 117 {
            u64::from(input.u32()?)
        } else {
            input.u64()?
        };
        let kind = input.u8()?;
        let len = input.u32()?;
        let remaining = section.end.saturating_sub(input.position()?);
        ensure!(
            u64::from(len) <= remaining,
            "strL (v={v}, o={o}) claims {len} byte(s) but the section has {remaining} left"
        );
        let mut payload = input.bytes(len as usize)?;
        let text = if kind == 130 {
            if payload.last() == Some(&0) {
                payload.pop();
            }
            match String::from_utf8(payload) {
                Ok(text) => text,
                Err(err) => WINDOWS_1252
                    .decode_without_bom_handling(err.as_bytes())
                    .0
                    .into_owned(),
            }
        } else {
            String::from_utf8_lossy(&payload).into_owned()
        };
        values.insert((v, o), text);
    }
    Ok(values)
}

pub struct StataReader {
    path: PathBuf,
    layout: DtaLayout,
    input: DtaInput<BufReader<File>>,
}

impl StataReader {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        Self::open_inner(path).map_err(|err| MergeError::reader(path, err))
    }

    fn open_inner(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
        let mut reader = BufReader::new(file);
        let layout = parse_layout(&mut reader).context("Parsing Stata header")?;
        debug!(
            "{:?}: Stata release {}, {} variable(s), {} observation(s)",
            path,
            layout.release,
            layout.columns.len(),
            layout.observations
        );
        Ok(Self {
            path: path.to_path_buf(),
            input: DtaInput {
                inner: reader,
                order: layout.order,
            },
            layout,
        })
    }

    pub fn read_mode(&self) -> ReadMode {
        if self.layout.has_strls() {
            ReadMode::Buffered
        } else {
            ReadMode::Chunked
        }
    }

    pub fn batches(&mut self, chunk_size: NonZeroUsize) -> Result<RowBatches<'_>, MergeError> {
        let path = self.path.clone();
        let signature = Arc::new(
            self.layout
                .signature()
                .map_err(|err| MergeError::reader(&path, err))?,
        );
        self.input
            .inner
            .seek(SeekFrom::Start(self.layout.data_offset))
            .map_err(|err| MergeError::reader(&path, err))?;
        match self.read_mode() {
            ReadMode::Chunked => Ok(Box::new(ChunkedBatches {
                remaining: self.layout.observations,
                record: vec![0u8; self.layout.record_width],
                reader: self,
                signature,
                chunk_size: chunk_size.get(),
                emitted: false,
                failed: false,
            })),
            ReadMode::Buffered => {
                warn!(
                    "{path:?} stores long strings (strL); loading the whole file before batching"
                );
                let rows = self
                    .load_all()
                    .map_err(|err| MergeError::reader(&path, err))?;
                Ok(Box::new(BufferedBatches {
                    rows: rows.into_iter(),
                    signature,
                    chunk_size: chunk_size.get(),
                    emitted: false,
                }))
            }
        }
    }

    fn load_all(&mut self) -> Result<Vec<Row>> {
        let mut record = vec![0u8; self.layout.record_width];
        let mut raw = Vec::new();
        for idx in 0..self.layout.observations {
            self.input
                .inner
                .read_exact(&mut record)
                .with_context(|| format!("Reading observation {}", idx + 1))?;
            raw.push(self.layout.decode_record(&record));
        }
        let section = self
            .layout
            .strls
            .clone()
            .context("strL variables without a strL section")?;
        let strls = read_strls(&mut self.input, self.layout.release, section)?;
        raw.into_iter()
            .map(|cells| {
                cells
                    .into_iter()
                    .map(|cell| match cell {
                        RawCell::Value(value) => Ok(value),
                        RawCell::StrL((0, 0)) => Ok(CellValue::Missing),
                        RawCell::StrL(key) => match strls.get(&key) {
                            Some(text) => Ok(CellValue::text(text.clone())),
                            None => bail!("Dangling strL reference (v={}, o={})", key.0, key.1),
                        },
                    })
                    .collect::<Result<Row>>()
            })
            .collect()
    }
}

struct ChunkedBatches<'a> {
    reader: &'a mut StataReader,
    signature: Arc<ColumnSignature>,
    remaining: u64,
    record: Vec<u8>,
    chunk_size: usize,
    emitted: bool,
    failed: bool,
}

impl ChunkedBatches<'_> {
    fn read_batch(&mut self) -> Result<RowBatch> {
        let take = (self.chunk_size as u64).min(self.remaining) as usize;
        let mut rows = Vec::with_capacity(take);
        for _ in 0..take {
            let observation = self.reader.layout.observations - self.remaining + 1;
            self.reader
                .input
                .inner
                .read_exact(&mut self.record)
                .with_context(|| format!("Reading observation {observation}"))?;
            self.remaining -= 1;
            let row = self
                .reader
                .layout
                .decode_record(&self.record)
                .into_iter()
                .map(|cell| match cell {
                    RawCell::Value(value) => value,
                    RawCell::StrL(_) => CellValue::Missing,
                })
                .collect();
            rows.push(row);
        }
        Ok(RowBatch::new(Arc::clone(&self.signature), rows))
    }
}

impl Iterator for ChunkedBatches<'_> {
    type Item = Result<RowBatch, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || (self.remaining == 0 && self.emitted) {
            return None;
        }
        self.emitted = true;
        match self.read_batch() {
            Ok(batch) => Some(Ok(batch)),
            Err(err) => {
                self.failed = true;
                Some(Err(MergeError::reader(&self.reader.path, err)))
            }
        }
    }
}

struct BufferedBatches {
    rows: std::vec::IntoIter<Row>,
    signature: Arc<ColumnSignature>,
    chunk_size: usize,
    emitted: bool,
}

impl Iterator for BufferedBatches {
    type Item = Result<RowBatch, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rows = self.rows.by_ref().take(self.chunk_size).collect::<Vec<_>>();
        if rows.is_empty() && self.emitted {
            return None;
        }
        self.emitted = true;
        Some(Ok(RowBatch::new(Arc::clone(&self.signature), rows)))
    }
}
