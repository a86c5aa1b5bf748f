#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{ExcelDateTime, Format, Workbook};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory with an empty `input/` folder.
    pub fn new() -> Self {
        let temp_dir = tempdir().expect("temp dir");
        fs::create_dir(temp_dir.path().join("input")).expect("create input dir");
        Self { temp_dir }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn input_dir(&self) -> PathBuf {
        self.path().join("input")
    }

    pub fn output_path(&self) -> PathBuf {
        self.path().join("merged.csv")
    }

    /// Writes `contents` into `input/<name>` and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.input_dir().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    /// Output text with the leading byte order mark removed.
    pub fn read_output(&self) -> String {
        let bytes = fs::read(self.output_path()).expect("read output");
        let body = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(&bytes);
        String::from_utf8(body.to_vec()).expect("output is utf-8")
    }
}

/// One spreadsheet cell for [`write_xlsx`].
#[derive(Debug, Clone)]
pub enum Sheet {
    Text(&'static str),
    Number(f64),
    Bool(bool),
    Date(u16, u8, u8),
    Blank,
}

/// Writes a single-sheet workbook. Row and column offsets place the grid.
pub fn write_xlsx(path: &Path, first_row: u32, first_col: u16, rows: &[Vec<Sheet>]) {
    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format("yyyy-mm-dd");
    let sheet = workbook.add_worksheet();
    for (r, cells) in rows.iter().enumerate() {
        let row = first_row + r as u32;
        for (c, cell) in cells.iter().enumerate() {
            let col = first_col + c as u16;
            match cell {
                Sheet::Text(text) => {
                    sheet.write_string(row, col, *text).expect("write string");
                }
                Sheet::Number(value) => {
                    sheet.write_number(row, col, *value).expect("write number");
                }
                Sheet::Bool(value) => {
                    sheet.write_boolean(row, col, *value).expect("write bool");
                }
                Sheet::Date(y, m, d) => {
                    let date = ExcelDateTime::from_ymd(*y, *m, *d).expect("valid date");
                    sheet
                        .write_datetime_with_format(row, col, &date, &date_format)
                        .expect("write date");
                }
                Sheet::Blank => {}
            }
        }
    }
    workbook.save(path).expect("save workbook");
}

/// Stata variable storage types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DtaVar {
    Byte,
    Int,
    Long,
    Float,
    Double,
    Str(usize),
    StrL,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DtaValue {
    Int(i64),
    Real(f64),
    Text(String),
    Missing,
}

pub fn text(value: &str) -> DtaValue {
    DtaValue::Text(value.to_string())
}

/// Assembles `.dta` files byte by byte.
pub struct DtaBuilder {
    release: u16,
    big_endian: bool,
    vars: Vec<(String, DtaVar)>,
    rows: Vec<Vec<DtaValue>>,
    declared_observations: Option<u64>,
}

impl DtaBuilder {
    pub fn new(release: u16) -> Self {
        Self {
            release,
            big_endian: false,
            vars: Vec::new(),
            rows: Vec::new(),
            declared_observations: None,
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn var(mut self, name: &str, kind: DtaVar) -> Self {
        self.vars.push((name.to_string(), kind));
        self
    }

    pub fn row(mut self, values: Vec<DtaValue>) -> Self {
        assert_eq!(values.len(), self.vars.len(), "row width");
        self.rows.push(values);
        self
    }

    /// Claims more observations in the header than the data section holds.
    pub fn declare_observations(mut self, n: u64) -> Self {
        self.declared_observations = Some(n);
        self
    }

    pub fn write(&self, path: &Path) {
        fs::write(path, self.build()).expect("write dta");
    }

    pub fn build(&self) -> Vec<u8> {
        if self.release >= 117 {
            self.build_tagged()
        } else {
            self.build_legacy()
        }
    }

    fn observations(&self) -> u64 {
        self.declared_observations
            .unwrap_or(self.rows.len() as u64)
    }

    fn u16(&self, out: &mut Vec<u8>, v: u16) {
        out.extend(if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn u32(&self, out: &mut Vec<u8>, v: u32) {
        out.extend(if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn u64(&self, out: &mut Vec<u8>, v: u64) {
        out.extend(if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    /// Low `len` bytes of `v` in file byte order.
    fn uint(&self, out: &mut Vec<u8>, v: u64, len: usize) {
        if self.big_endian {
            out.extend_from_slice(&v.to_be_bytes()[8 - len..]);
        } else {
            out.extend_from_slice(&v.to_le_bytes()[..len]);
        }
    }

    fn padded(out: &mut Vec<u8>, text: &str, width: usize) {
        let bytes = text.as_bytes();
        assert!(bytes.len() <= width, "'{text}' wider than {width}");
        out.extend_from_slice(bytes);
        out.extend(std::iter::repeat_n(0u8, width - bytes.len()));
    }

    fn record(&self, out: &mut Vec<u8>, obs: usize, values: &[DtaValue]) {
        for (var, ((_, kind), value)) in self.vars.iter().zip(values).enumerate() {
            match (kind, value) {
                (DtaVar::Byte, DtaValue::Int(v)) => out.push(*v as i8 as u8),
                (DtaVar::Byte, DtaValue::Missing) => out.push(101),
                (DtaVar::Int, DtaValue::Int(v)) => self.u16(out, *v as i16 as u16),
                (DtaVar::Int, DtaValue::Missing) => self.u16(out, 32_741),
                (DtaVar::Long, DtaValue::Int(v)) => self.u32(out, *v as i32 as u32),
                (DtaVar::Long, DtaValue::Missing) => self.u32(out, 2_147_483_621),
                (DtaVar::Float, DtaValue::Real(v)) => self.u32(out, (*v as f32).to_bits()),
                (DtaVar::Float, DtaValue::Missing) => self.u32(out, 0x7f00_0000),
                (DtaVar::Double, DtaValue::Real(v)) => self.u64(out, v.to_bits()),
                (DtaVar::Double, DtaValue::Missing) => self.u64(out, 0x7fe0_0000_0000_0000),
                (DtaVar::Str(width), DtaValue::Text(s)) => Self::padded(out, s, *width),
                (DtaVar::Str(width), DtaValue::Missing) => Self::padded(out, "", *width),
                (DtaVar::StrL, DtaValue::Missing) => self.u64(out, 0),
                (DtaVar::StrL, DtaValue::Text(_)) => {
                    let (v, o) = ((var + 1) as u64, (obs + 1) as u64);
                    let v_len = match self.release {
                        117 => 4,
                        118 => 2,
                        _ => 3,
                    };
                    self.uint(out, v, v_len);
                    self.uint(out, o, 8 - v_len);
                }
                (kind, value) => panic!("cannot store {value:?} as {kind:?}"),
            }
        }
    }

    fn build_tagged(&self) -> Vec<u8> {
        let release = self.release;
        let k = self.vars.len();
        let name_width = if release == 117 { 33 } else { 129 };
        let mut map = [0u64; 14];
        let mut out = Vec::new();

        out.extend_from_slice(b"<stata_dta><header><release>");
        out.extend_from_slice(release.to_string().as_bytes());
        out.extend_from_slice(b"</release><byteorder>");
        out.extend_from_slice(if self.big_endian { b"MSF" } else { b"LSF" });
        out.extend_from_slice(b"</byteorder><K>");
        if release == 119 {
            self.u32(&mut out, k as u32);
        } else {
            self.u16(&mut out, k as u16);
        }
        out.extend_from_slice(b"</K><N>");
        if release == 117 {
            self.u32(&mut out, self.observations() as u32);
        } else {
            self.u64(&mut out, self.observations());
        }
        out.extend_from_slice(b"</N><label>");
        let label = b"test data";
        if release == 117 {
            out.push(label.len() as u8);
        } else {
            self.u16(&mut out, label.len() as u16);
        }
        out.extend_from_slice(label);
        out.extend_from_slice(b"</label><timestamp>");
        let stamp = b"01 Jan 2024 12:00";
        out.push(stamp.len() as u8);
        out.extend_from_slice(stamp);
        out.extend_from_slice(b"</timestamp></header>");

        map[1] = out.len() as u64;
        out.extend_from_slice(b"<map>");
        let map_at = out.len();
        out.extend(std::iter::repeat_n(0u8, 14 * 8));
        out.extend_from_slice(b"</map>");

        map[2] = out.len() as u64;
        out.extend_from_slice(b"<variable_types>");
        for (_, kind) in &self.vars {
            let code = match kind {
                DtaVar::Str(width) => *width as u16,
                DtaVar::StrL => 32768,
                DtaVar::Double => 65526,
                DtaVar::Float => 65527,
                DtaVar::Long => 65528,
                DtaVar::Int => 65529,
                DtaVar::Byte => 65530,
            };
            self.u16(&mut out, code);
        }
        out.extend_from_slice(b"</variable_types>");

        map[3] = out.len() as u64;
        out.extend_from_slice(b"<varnames>");
        for (name, _) in &self.vars {
            Self::padded(&mut out, name, name_width);
        }
        out.extend_from_slice(b"</varnames>");

        map[4] = out.len() as u64;
        out.extend_from_slice(b"<sortlist>");
        for _ in 0..=k {
            if release == 119 {
                self.u32(&mut out, 0);
            } else {
                self.u16(&mut out, 0);
            }
        }
        out.extend_from_slice(b"</sortlist>");

        map[5] = out.len() as u64;
        out.extend_from_slice(b"<formats>");
        let format_width = if release == 117 { 49 } else { 57 };
        for _ in 0..k {
            Self::padded(&mut out, "%9.0g", format_width);
        }
        out.extend_from_slice(b"</formats>");

        map[6] = out.len() as u64;
        out.extend_from_slice(b"<value_label_names>");
        out.extend(std::iter::repeat_n(0u8, k * name_width));
        out.extend_from_slice(b"</value_label_names>");

        map[7] = out.len() as u64;
        out.extend_from_slice(b"<variable_labels>");
        let label_width = if release == 117 { 81 } else { 321 };
        out.extend(std::iter::repeat_n(0u8, k * label_width));
        out.extend_from_slice(b"</variable_labels>");

        map[8] = out.len() as u64;
        out.extend_from_slice(b"<characteristics></characteristics>");

        map[9] = out.len() as u64;
        out.extend_from_slice(b"<data>");
        for (obs, values) in self.rows.iter().enumerate() {
            self.record(&mut out, obs, values);
        }
        out.extend_from_slice(b"</data>");

        map[10] = out.len() as u64;
        out.extend_from_slice(b"<strls>");
        for (obs, values) in self.rows.iter().enumerate() {
            for (var, ((_, kind), value)) in self.vars.iter().zip(values).enumerate() {
                if let (DtaVar::StrL, DtaValue::Text(s)) = (kind, value) {
                    out.extend_from_slice(b"GSO");
                    self.u32(&mut out, (var + 1) as u32);
                    if release == 117 {
                        self.u32(&mut out, (obs + 1) as u32);
                    } else {
                        self.u64(&mut out, (obs + 1) as u64);
                    }
                    out.push(130);
                    self.u32(&mut out, s.len() as u32 + 1);
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
            }
        }
        out.extend_from_slice(b"</strls>");

        map[11] = out.len() as u64;
        out.extend_from_slice(b"<value_labels></value_labels>");
        map[12] = out.len() as u64;
        out.extend_from_slice(b"</stata_dta>");
        map[13] = out.len() as u64;

        let mut encoded = Vec::with_capacity(14 * 8);
        for offset in map {
            self.u64(&mut encoded, offset);
        }
        out[map_at..map_at + 14 * 8].copy_from_slice(&encoded);
        out
    }

    fn build_legacy(&self) -> Vec<u8> {
        let k = self.vars.len();
        let mut out = vec![
            self.release as u8,
            if self.big_endian { 1 } else { 2 },
            1,
            0,
        ];
        self.u16(&mut out, k as u16);
        self.u32(&mut out, self.observations() as u32);
        Self::padded(&mut out, "test data", 81);
        Self::padded(&mut out, "01 Jan 2024 12:00", 18);
        for (_, kind) in &self.vars {
            out.push(match kind {
                DtaVar::Str(width) => *width as u8,
                DtaVar::Byte => 251,
                DtaVar::Int => 252,
                DtaVar::Long => 253,
                DtaVar::Float => 254,
                DtaVar::Double => 255,
                DtaVar::StrL => panic!("strL needs release 117 or later"),
            });
        }
        for (name, _) in &self.vars {
            Self::padded(&mut out, name, 33);
        }
        out.extend(std::iter::repeat_n(0u8, 2 * (k + 1)));
        let format_width = if self.release == 113 { 12 } else { 49 };
        for _ in 0..k {
            Self::padded(&mut out, "%9.0g", format_width);
        }
        out.extend(std::iter::repeat_n(0u8, 33 * k));
        out.extend(std::iter::repeat_n(0u8, 81 * k));
        // expansion fields terminator
        out.push(0);
        self.u32(&mut out, 0);
        for (obs, values) in self.rows.iter().enumerate() {
            self.record(&mut out, obs, values);
        }
        out
    }
}
