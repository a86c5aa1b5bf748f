//! Merge orchestration.
//!
//! A run moves `Idle → Discovering → ProcessingFile(i)… → Finalized`, or to
//! `Aborted` when the destination cannot be written or the input directory
//! cannot be listed. Every other failure rejects only the file at hand: it is
//! logged, recorded in [`MergeRunStats`], and the run moves on to the next file.
//!
//! Files are processed one at a time in file-name order and batches are handed
//! from reader to writer as they are produced, so at most one batch is alive.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use chrono::{DateTime, Local};
use encoding_rs::Encoding;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{MergeConfig, resolve_encoding},
    encoding::EncodingResolver,
    error::{FailureKind, MergeAbort, MergeError},
    format::{FileFormat, InputFile, display_name},
    reader::{ChunkReader, ReadMode, ReaderOptions},
    schema::{SchemaValidator, describe_mismatch},
    writer::MergeWriter,
};

const PROGRESS_EVERY_BATCHES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Idle,
    Discovering,
    ProcessingFile(usize),
    Finalized,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FileFailure {
    fn from_error(err: &MergeError) -> Self {
        let message = match err {
            MergeError::SchemaMismatch {
                expected, found, ..
            } => describe_mismatch(expected, found),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    /// 1-based position in the sorted directory listing.
    pub index: usize,
    pub path: PathBuf,
    pub format: Option<FileFormat>,
    pub size: u64,
    pub status: FileStatus,
    pub rows_written: u64,
    pub skipped_rows: u64,
    pub read_mode: Option<ReadMode>,
    pub encoding: Option<String>,
    pub failure: Option<FileFailure>,
}

impl FileOutcome {
    fn pending(index: usize, input: &InputFile) -> Self {
        Self {
            index,
            path: input.path.clone(),
            format: Some(input.format),
            size: input.size,
            status: FileStatus::Accepted,
            rows_written: 0,
            skipped_rows: 0,
            read_mode: None,
            encoding: None,
            failure: None,
        }
    }

    fn unsupported(index: usize, err: &MergeError) -> Self {
        let path = match err {
            MergeError::UnsupportedFormat { path, .. } => path.clone(),
            _ => PathBuf::new(),
        };
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or_default();
        Self {
            index,
            path,
            format: None,
            size,
            status: FileStatus::Rejected,
            rows_written: 0,
            skipped_rows: 0,
            read_mode: None,
            encoding: None,
            failure: Some(FileFailure::from_error(err)),
        }
    }

    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }

    pub fn is_degraded(&self) -> bool {
        self.read_mode == Some(ReadMode::Buffered)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunStats {
    pub state: MergeState,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub input_directory: PathBuf,
    pub output_path: PathBuf,
    pub chunk_size: usize,
    pub files_discovered: usize,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub rows_written: u64,
    pub reference_columns: Vec<String>,
    pub files: Vec<FileOutcome>,
}

impl MergeRunStats {
    fn new(config: &MergeConfig) -> Self {
        Self {
            state: MergeState::Idle,
            started_at: Local::now(),
            finished_at: None,
            input_directory: config.input_directory.clone(),
            output_path: config.output_path.clone(),
            chunk_size: config.chunk_size.get(),
            files_discovered: 0,
            files_succeeded: 0,
            files_failed: 0,
            rows_written: 0,
            reference_columns: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn rejected(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Rejected)
    }

    pub fn degraded(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| f.is_degraded())
    }

    fn record(&mut self, outcome: FileOutcome) {
        match outcome.status {
            FileStatus::Accepted => self.files_succeeded += 1,
            FileStatus::Rejected => self.files_failed += 1,
        }
        self.rows_written += outcome.rows_written;
        self.files.push(outcome);
    }
}

/// Directory listing split into readable inputs and rejected names.
#[derive(Debug, Default)]
pub struct Worklist {
    pub inputs: Vec<(usize, InputFile)>,
    pub unsupported: Vec<(usize, MergeError)>,
}

impl Worklist {
    pub fn discovered(&self) -> usize {
        self.inputs.len() + self.unsupported.len()
    }
}

/// Lists regular files directly under `dir`, sorted by name, skipping `exclude`.
pub fn discover(dir: &Path, exclude: Option<&Path>) -> Result<Worklist, MergeError> {
    let listing_error = |source: std::io::Error| MergeError::InputDirectory {
        path: dir.to_path_buf(),
        source,
    };
    let excluded = exclude.and_then(|path| fs::canonicalize(path).ok());
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(listing_error)? {
        let path = entry.map_err(listing_error)?.path();
        if !path.is_file() {
            continue;
        }
        if excluded.is_some() && fs::canonicalize(&path).ok() == excluded {
            debug!("Skipping output file {:?} found in input directory", path);
            continue;
        }
        paths.push(path);
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut worklist = Worklist::default();
    for (idx, path) in paths.iter().enumerate() {
        match InputFile::detect(path) {
            Ok(input) => worklist.inputs.push((idx + 1, input)),
            Err(err) => worklist.unsupported.push((idx + 1, err)),
        }
    }
    Ok(worklist)
}

/// Runs a merge to completion. Per-file problems are reported in the returned
/// stats; only run-level failures produce an `Err`.
pub fn run(config: &MergeConfig) -> Result<MergeRunStats, MergeAbort> {
    Merger::new(config).run()
}

struct Merger<'a> {
    config: &'a MergeConfig,
    state: MergeState,
    stats: MergeRunStats,
    validator: SchemaValidator,
}

impl<'a> Merger<'a> {
    fn new(config: &'a MergeConfig) -> Self {
        Self {
            config,
            state: MergeState::Idle,
            stats: MergeRunStats::new(config),
            validator: SchemaValidator::new(),
        }
    }

    fn transition(&mut self, next: MergeState) {
        debug!("Merge state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.stats.state = next;
    }

    fn abort(mut self, error: MergeError) -> MergeAbort {
        self.transition(MergeState::Aborted);
        self.stats.finished_at = Some(Local::now());
        self.stats.files.sort_by_key(|f| f.index);
        MergeAbort {
            stats: self.stats,
            error,
        }
    }

    fn reader_options(&self) -> ReaderOptions {
        let candidates: Vec<&'static Encoding> = self
            .config
            .encodings
            .iter()
            .filter_map(|label| match resolve_encoding(label) {
                Ok(encoding) => Some(encoding),
                Err(err) => {
                    warn!("Ignoring encoding candidate: {err}");
                    None
                }
            })
            .collect();
        ReaderOptions {
            resolver: EncodingResolver::new(candidates, self.config.encoding_sample_bytes),
        }
    }

    fn run(mut self) -> Result<MergeRunStats, MergeAbort> {
        let options = self.reader_options();
        let mut writer = match MergeWriter::create(&self.config.output_path, self.config.write_bom)
        {
            Ok(writer) => writer,
            Err(err) => return Err(self.abort(err)),
        };

        self.transition(MergeState::Discovering);
        let worklist = match discover(&self.config.input_directory, Some(writer.path())) {
            Ok(worklist) => worklist,
            Err(err) => return Err(self.abort(err)),
        };
        self.stats.files_discovered = worklist.discovered();
        info!(
            "Found {} file(s) in {:?}; merging {} with chunk size {}",
            worklist.discovered(),
            self.config.input_directory,
            worklist.inputs.len(),
            self.config.chunk_size
        );
        for (index, err) in &worklist.unsupported {
            warn!("Rejected: {err}");
            self.stats.record(FileOutcome::unsupported(*index, err));
        }

        let total = worklist.inputs.len();
        for (position, (index, input)) in worklist.inputs.iter().enumerate() {
            self.transition(MergeState::ProcessingFile(position + 1));
            info!("[{}/{}] {}", position + 1, total, input.file_name());
            if let Err(err) = self.process_file(*index, input, &mut writer, &options) {
                return Err(self.abort(err));
            }
        }

        if let Err(err) = writer.finish() {
            return Err(self.abort(err));
        }
        self.transition(MergeState::Finalized);
        self.stats.finished_at = Some(Local::now());
        self.stats.files.sort_by_key(|f| f.index);
        self.stats.reference_columns = self
            .validator
            .reference()
            .map(|sig| sig.names().to_vec())
            .unwrap_or_default();
        info!(
            "Merged {} row(s) from {} of {} file(s) into {:?} ({} rejected)",
            self.stats.rows_written,
            self.stats.files_succeeded,
            self.stats.files_discovered,
            self.config.output_path,
            self.stats.files_failed
        );
        Ok(self.stats)
    }

    /// Processes one input. `Err` is returned only for fatal errors; the
    /// file's outcome has been recorded either way.
    fn process_file(
        &mut self,
        index: usize,
        input: &InputFile,
        writer: &mut MergeWriter,
        options: &ReaderOptions,
    ) -> Result<(), MergeError> {
        let mut outcome = FileOutcome::pending(index, input);
        let result = match ChunkReader::open(input, options) {
            Ok(mut reader) => {
                outcome.read_mode = Some(reader.read_mode());
                outcome.encoding = reader.encoding().map(|e| e.name().to_string());
                let streamed = self.stream_file(&mut reader, input, writer, &mut outcome.rows_written);
                outcome.skipped_rows = reader.skipped_rows();
                streamed
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                info!(
                    "  ✓ {} row(s) from {}{}",
                    outcome.rows_written,
                    input.file_name(),
                    if outcome.skipped_rows > 0 {
                        format!(" ({} malformed row(s) skipped)", outcome.skipped_rows)
                    } else {
                        String::new()
                    }
                );
                if outcome.is_degraded() {
                    warn!(
                        "  {} was read through the buffered fallback; memory use scaled with file size",
                        input.file_name()
                    );
                }
                self.stats.record(outcome);
                Ok(())
            }
            Err(err) => {
                warn!("  ✗ Rejected {}: {err}", input.file_name());
                if outcome.rows_written > 0 {
                    warn!(
                        "  {} row(s) from {} were already written before the failure",
                        outcome.rows_written,
                        input.file_name()
                    );
                }
                outcome.status = FileStatus::Rejected;
                outcome.failure = Some(FileFailure::from_error(&err));
                self.stats.record(outcome);
                if err.is_fatal() { Err(err) } else { Ok(()) }
            }
        }
    }

    fn stream_file(
        &mut self,
        reader: &mut ChunkReader,
        input: &InputFile,
        writer: &mut MergeWriter,
        rows_written: &mut u64,
    ) -> Result<(), MergeError> {
        let mut batches = reader.batches(self.config.chunk_size)?;
        let first = batches
            .next()
            .transpose()?
            .ok_or_else(|| MergeError::reader(&input.path, anyhow!("File has no header row")))?;

        if self.validator.is_established() {
            self.validator.check(&input.path, first.signature())?;
        } else {
            self.validator.establish(first.signature());
            writer.write_header(first.signature())?;
        }
        *rows_written += writer.append_rows(&first)?;
        drop(first);

        for (batch_no, batch) in batches.enumerate() {
            let batch = batch?;
            *rows_written += writer.append_rows(&batch)?;
            if (batch_no + 2) % PROGRESS_EVERY_BATCHES == 0 {
                info!(
                    "    {} row(s) so far from {}",
                    rows_written,
                    input.file_name()
                );
            }
        }
        Ok(())
    }
}
