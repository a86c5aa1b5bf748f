//! Encoding inference for delimited-text inputs.
//!
//! A leading sample of the file is decoded against each candidate in order and
//! the first clean decode wins for the whole file. Single-byte fallbacks such as
//! windows-1252 accept every byte, so they terminate the search but may
//! mis-decode text written in an encoding that is not in the list.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use encoding_rs::{DecoderResult, Encoding, UTF_8};
use itertools::Itertools;
use log::debug;

use crate::error::MergeError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone)]
pub struct EncodingResolver {
    candidates: Vec<&'static Encoding>,
    sample_bytes: usize,
}

impl EncodingResolver {
    pub fn new(candidates: Vec<&'static Encoding>, sample_bytes: usize) -> Self {
        Self {
            candidates,
            sample_bytes: sample_bytes.max(1),
        }
    }

    pub fn resolve(&self, path: &Path) -> Result<&'static Encoding, MergeError> {
        let (sample, complete) = read_sample(path, self.sample_bytes)
            .map_err(|err| MergeError::reader(path, err))?;
        let encoding = self.resolve_sample(&sample, complete).ok_or_else(|| {
            MergeError::EncodingUnresolvable {
                path: path.to_path_buf(),
                candidates: self.candidates.iter().map(|e| e.name()).join(", "),
            }
        })?;
        debug!("Resolved encoding {} for {:?}", encoding.name(), path);
        Ok(encoding)
    }

    /// `complete` is true when the sample holds the whole file, in which case
    /// a trailing partial sequence is an error rather than a cut-off.
    pub fn resolve_sample(&self, sample: &[u8], complete: bool) -> Option<&'static Encoding> {
        if sample.starts_with(UTF8_BOM) {
            return Some(UTF_8);
        }
        self.candidates
            .iter()
            .copied()
            .find(|encoding| decodes_cleanly(encoding, sample, complete))
    }
}

fn read_sample(path: &Path, limit: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let file = File::open(path)?;
    let mut sample = Vec::with_capacity(limit.min(1 << 20));
    BufReader::new(file)
        .take(limit as u64 + 1)
        .read_to_end(&mut sample)?;
    let complete = sample.len() <= limit;
    sample.truncate(limit);
    Ok((sample, complete))
}

fn decodes_cleanly(encoding: &'static Encoding, sample: &[u8], last: bool) -> bool {
    let mut decoder = encoding.new_decoder_without_bom_handling();
    let mut output = String::with_capacity(
        decoder
            .max_utf8_buffer_length_without_replacement(sample.len())
            .unwrap_or(sample.len() * 3),
    );
    let mut input = sample;
    loop {
        let (result, read) = decoder.decode_to_string_without_replacement(input, &mut output, last);
        input = &input[read..];
        match result {
            DecoderResult::InputEmpty => return true,
            DecoderResult::Malformed(_, _) => return false,
            DecoderResult::OutputFull => {
                output.clear();
                output.reserve(input.len() * 3 + 16);
            }
        }
    }
}

/// Decodes one field without replacement characters.
pub fn decode_field(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{GB18030, WINDOWS_1252};

    fn default_resolver() -> EncodingResolver {
        EncodingResolver::new(vec![UTF_8, GB18030, WINDOWS_1252], 1024)
    }

    #[test]
    fn utf8_sample_selects_utf8() {
        let resolver = default_resolver();
        assert_eq!(
            resolver.resolve_sample("id,名前\n1,東京\n".as_bytes(), true),
            Some(UTF_8)
        );
    }

    #[test]
    fn gb18030_sample_falls_through_utf8() {
        let (bytes, _, _) = GB18030.encode("县,人口\n定西,280万\n");
        assert_eq!(default_resolver().resolve_sample(&bytes, true), Some(GB18030));
    }

    #[test]
    fn latin_sample_lands_on_single_byte_fallback() {
        let (bytes, _, _) = WINDOWS_1252.encode("name\nCaf\u{e9}\n");
        assert_eq!(
            default_resolver().resolve_sample(&bytes, true),
            Some(WINDOWS_1252)
        );
    }

    #[test]
    fn truncated_multibyte_sequence_is_not_an_error_mid_file() {
        let text = "a,b\n1,é".as_bytes();
        let cut = &text[..text.len() - 1];
        let resolver = EncodingResolver::new(vec![UTF_8], 1024);
        assert_eq!(resolver.resolve_sample(cut, false), Some(UTF_8));
        assert_eq!(resolver.resolve_sample(cut, true), None);
    }

    #[test]
    fn bom_short_circuits_to_utf8() {
        let resolver = EncodingResolver::new(vec![WINDOWS_1252], 1024);
        assert_eq!(resolver.resolve_sample(b"\xEF\xBB\xBFa,b\n", true), Some(UTF_8));
        assert_eq!(strip_bom("\u{feff}a"), "a");
    }

    #[test]
    fn decode_field_refuses_invalid_bytes() {
        assert_eq!(decode_field(b"ok", UTF_8).as_deref(), Some("ok"));
        assert!(decode_field(b"\xff\xfe", UTF_8).is_none());
    }
}
