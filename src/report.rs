//! Run summaries: the stdout table and the optional JSON report.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use itertools::Itertools;

use crate::{
    error::MergeError,
    format::display_name,
    merge::{FileStatus, MergeRunStats, Worklist},
    table,
};

const SUMMARY_HEADERS: [&str; 8] = [
    "#", "file", "format", "status", "rows", "skipped", "mode", "detail",
];

pub fn summary_rows(stats: &MergeRunStats) -> Vec<Vec<String>> {
    stats
        .files
        .iter()
        .map(|outcome| {
            let detail = match (&outcome.failure, &outcome.encoding) {
                (Some(failure), _) => format!("{}: {}", failure.kind, failure.message),
                (None, Some(encoding)) => encoding.clone(),
                (None, None) => String::new(),
            };
            vec![
                outcome.index.to_string(),
                outcome.file_name(),
                outcome
                    .format
                    .map(|format| format.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                status_label(outcome.status).to_string(),
                outcome.rows_written.to_string(),
                outcome.skipped_rows.to_string(),
                outcome
                    .read_mode
                    .map(|mode| mode.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                detail,
            ]
        })
        .collect()
}

pub fn render_summary(stats: &MergeRunStats) -> String {
    let headers = SUMMARY_HEADERS.map(String::from);
    let mut rendered = table::render_table(&headers, &summary_rows(stats));
    rendered.push_str(&format!(
        "\n{} row(s) written to {} from {}/{} file(s)\n",
        stats.rows_written,
        stats.output_path.display(),
        stats.files_succeeded,
        stats.files_discovered
    ));
    let rejected = stats.rejected().map(|outcome| outcome.file_name()).join(", ");
    if !rejected.is_empty() {
        rendered.push_str(&format!("Rejected: {rejected}\n"));
    }
    let degraded = stats.degraded().map(|outcome| outcome.file_name()).join(", ");
    if !degraded.is_empty() {
        rendered.push_str(&format!("Buffered (unbounded memory): {degraded}\n"));
    }
    rendered
}

pub fn print_summary(stats: &MergeRunStats) {
    print!("{}", render_summary(stats));
}

pub fn write_json(stats: &MergeRunStats, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Creating report file {path:?}"))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, stats)
        .with_context(|| format!("Writing report to {path:?}"))?;
    writer
        .flush()
        .with_context(|| format!("Flushing report to {path:?}"))
}

/// Table of what a merge over this worklist would read, without reading it.
pub fn render_worklist(worklist: &Worklist) -> String {
    let headers = ["#", "file", "format", "bytes", "status"].map(String::from);
    let supported = worklist.inputs.iter().map(|(index, input)| {
        (
            *index,
            vec![
                index.to_string(),
                input.file_name(),
                input.format.to_string(),
                input.size.to_string(),
                status_label(FileStatus::Accepted).to_string(),
            ],
        )
    });
    let unsupported = worklist.unsupported.iter().map(|(index, err)| {
        (
            *index,
            vec![
                index.to_string(),
                err_file_name(err),
                "-".to_string(),
                "-".to_string(),
                format!("rejected ({})", err.kind()),
            ],
        )
    });
    let rows = supported
        .chain(unsupported)
        .sorted_by_key(|(index, _)| *index)
        .map(|(_, row)| row)
        .collect::<Vec<_>>();
    table::render_table(&headers, &rows)
}

fn err_file_name(err: &MergeError) -> String {
    match err {
        MergeError::UnsupportedFormat { path, .. } => display_name(path),
        other => other.to_string(),
    }
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Accepted => "accepted",
        FileStatus::Rejected => "rejected",
    }
}
