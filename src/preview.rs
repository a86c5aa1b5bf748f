use std::num::NonZeroUsize;

use anyhow::{Context, Result, anyhow};
use log::info;

use crate::{
    cli::PreviewArgs,
    config::{DEFAULT_ENCODING_SAMPLE_BYTES, DEFAULT_ENCODINGS, resolve_encoding},
    encoding::EncodingResolver,
    format::InputFile,
    reader::{ChunkReader, ReaderOptions},
    table,
};

pub fn execute(args: &PreviewArgs) -> Result<()> {
    let input = InputFile::detect(&args.input)?;
    let labels: Vec<&str> = if args.encodings.is_empty() {
        DEFAULT_ENCODINGS.to_vec()
    } else {
        args.encodings.iter().map(String::as_str).collect()
    };
    let candidates = labels
        .into_iter()
        .map(resolve_encoding)
        .collect::<Result<Vec<_>>>()?;
    let options = ReaderOptions {
        resolver: EncodingResolver::new(candidates, DEFAULT_ENCODING_SAMPLE_BYTES),
    };

    let mut reader = ChunkReader::open(&input, &options)?;
    let chunk = NonZeroUsize::new(args.rows).unwrap_or(NonZeroUsize::MIN);
    let batch = reader
        .batches(chunk)?
        .next()
        .transpose()
        .with_context(|| format!("Reading rows from {:?}", args.input))?
        .ok_or_else(|| anyhow!("{:?} has no header row", args.input))?;

    let headers = batch.signature().names().to_vec();
    let rows = batch
        .rows()
        .iter()
        .take(args.rows)
        .map(|row| row.iter().map(|cell| cell.render().into_owned()).collect())
        .collect::<Vec<Vec<String>>>();

    table::print_table(&headers, &rows);
    info!(
        "Displayed {} row(s) from {:?} ({}, {})",
        rows.len(),
        args.input,
        input.format,
        reader.read_mode()
    );
    Ok(())
}
