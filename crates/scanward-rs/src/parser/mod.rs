mod fscan;
mod nmap;
mod scalar;
mod summary;
mod xml;

use std::path::PathBuf;

pub use fscan::{parse_fscan_log, FscanEvent};
#[cfg(test)]
pub use fscan::parse_fscan_str;
pub use nmap::{NmapParser, NmapReport};
pub use summary::NmapSummary;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The content was readable but did not decode. `content` is the text the
    /// decoder actually saw, kept for diagnostics.
    #[error("malformed tool output: {reason}")]
    ParseFailure { reason: String, content: String },

    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

impl ParseError {
    pub fn content(&self) -> Option<&str> {
        match self {
            ParseError::ParseFailure { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// A parsed value together with the failure that forced it to be empty, if any.
#[derive(Debug)]
pub struct ParseOutcome<T> {
    pub value: T,
    pub failure: Option<ParseError>,
}

impl<T> ParseOutcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            failure: None,
        }
    }

    pub fn failed(value: T, failure: ParseError) -> Self {
        Self {
            value,
            failure: Some(failure),
        }
    }
}
