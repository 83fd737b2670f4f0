//! Domain blacklist files.
//!
//! One domain per line. Blank lines and lines starting with `#` are
//! skipped, trailing `# comments` are stripped, and `*.`/leading-dot
//! wildcard forms collapse to the bare domain (the engine always matches
//! subdomains).

use std::path::{Path, PathBuf};
use thiserror::Error;

use super::engine::normalize_domain;

/// Files larger than this are refused outright.
const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("failed to read blocklist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blocklist {path} is too large ({size} bytes)")]
    TooLarge { path: PathBuf, size: u64 },
}

/// Domains parsed from a blacklist file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    domains: Vec<String>,
}

impl Blocklist {
    /// Read and parse a blacklist file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlocklistError> {
        let path = path.as_ref();
        let io_err = |source| BlocklistError::Io {
            path: path.to_path_buf(),
            source,
        };

        let size = std::fs::metadata(path).map_err(io_err)?.len();
        if size > MAX_FILE_SIZE {
            return Err(BlocklistError::TooLarge {
                path: path.to_path_buf(),
                size,
            });
        }

        let contents = std::fs::read_to_string(path).map_err(io_err)?;
        let blocklist = Self::parse(&contents);

        tracing::info!(
            path = %path.display(),
            domains = blocklist.len(),
            "Loaded domain blocklist"
        );

        Ok(blocklist)
    }

    /// Parse blacklist text.
    pub fn parse(contents: &str) -> Self {
        let domains = contents.lines().filter_map(parse_line).collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn into_domains(self) -> Vec<String> {
        self.domains
    }
}

/// Shorthand for [`Blocklist::load`] returning the bare domain list.
pub fn load_domains(path: impl AsRef<Path>) -> Result<Vec<String>, BlocklistError> {
    Blocklist::load(path).map(Blocklist::into_domains)
}

fn parse_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let entry = match line.split_once('#') {
        Some((before, _)) => before,
        None => line,
    };
    let entry = entry.split_whitespace().next()?;
    normalize_domain(entry)
}
