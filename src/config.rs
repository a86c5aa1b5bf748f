//! Run configuration.
//!
//! A [`MergeConfig`] is built once (from CLI flags, optionally layered over a
//! YAML file) and then passed by shared reference into the orchestrator, so no
//! component can change chunking or encoding policy mid-run.

use std::{fs, num::NonZeroUsize, path::Path, path::PathBuf};

use anyhow::{Context, Result, anyhow, ensure};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_ENCODING_SAMPLE_BYTES: usize = 64 * 1024;
pub const DEFAULT_ENCODINGS: &[&str] = &["utf-8", "gb18030", "windows-1252"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    pub input_directory: PathBuf,
    pub output_path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: NonZeroUsize,
    /// Candidate labels for delimited-text inputs, tried in order.
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
    #[serde(default = "default_sample_bytes")]
    pub encoding_sample_bytes: usize,
    #[serde(default = "default_true")]
    pub write_bom: bool,
}

fn default_chunk_size() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN)
}

fn default_encodings() -> Vec<String> {
    DEFAULT_ENCODINGS.iter().map(|s| s.to_string()).collect()
}

fn default_sample_bytes() -> usize {
    DEFAULT_ENCODING_SAMPLE_BYTES
}

fn default_true() -> bool {
    true
}

impl MergeConfig {
    pub fn new(input_directory: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_directory: input_directory.into(),
            output_path: output_path.into(),
            chunk_size: default_chunk_size(),
            encodings: default_encodings(),
            encoding_sample_bytes: DEFAULT_ENCODING_SAMPLE_BYTES,
            write_bom: true,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: NonZeroUsize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_encodings<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.encodings = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bom(mut self, write_bom: bool) -> Self {
        self.write_bom = write_bom;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("Opening config file {path:?}"))?;
        let config: MergeConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("Parsing config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.encodings.is_empty(),
            "At least one candidate encoding must be configured"
        );
        ensure!(
            self.encoding_sample_bytes > 0,
            "encoding_sample_bytes must be positive"
        );
        self.encoding_candidates()?;
        Ok(())
    }

    /// Resolves the configured labels, preserving order.
    pub fn encoding_candidates(&self) -> Result<Vec<&'static Encoding>> {
        self.encodings
            .iter()
            .map(|label| resolve_encoding(label))
            .collect()
    }
}

pub fn resolve_encoding(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| anyhow!("Unknown encoding '{label}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_utf8_gb18030_then_single_byte_fallback() {
        let config = MergeConfig::new("in", "out.csv");
        let names = config
            .encoding_candidates()
            .unwrap()
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["UTF-8", "gb18030", "windows-1252"]);
        assert_eq!(config.chunk_size.get(), DEFAULT_CHUNK_SIZE);
        assert!(config.write_bom);
    }

    #[test]
    fn validate_rejects_unknown_labels() {
        let config = MergeConfig::new("in", "out.csv").with_encodings(["utf-8", "klingon"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown encoding 'klingon'"));
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config: MergeConfig =
            serde_yaml::from_str("input_directory: data\noutput_path: merged.csv\nchunk_size: 50\n")
                .unwrap();
        assert_eq!(config.chunk_size.get(), 50);
        assert_eq!(config.encodings, default_encodings());
        assert_eq!(config.encoding_sample_bytes, DEFAULT_ENCODING_SAMPLE_BYTES);
    }

    #[test]
    fn yaml_rejects_zero_chunk_size() {
        let parsed = serde_yaml::from_str::<MergeConfig>(
            "input_directory: data\noutput_path: merged.csv\nchunk_size: 0\n",
        );
        assert!(parsed.is_err());
    }
}
