//! Crate-wide error type.
//!
//! Variants follow how a failure should be handled rather than where it came
//! from: transient network trouble is retried by the page resolver, structural
//! failures are surfaced as a terminal `Failed` state with the display string
//! as the human-readable reason.

use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The intermediate document or gallery page could not be understood.
    #[error("unparseable document: {0}")]
    Parse(String),

    #[error("gallery no longer exists: {0}")]
    GalleryGone(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A failure fanned out to several waiters.
    #[error(transparent)]
    Shared(Arc<PipelineError>),

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn storage(msg: impl Into<String>) -> Self {
        PipelineError::Storage(msg.into())
    }

    pub fn with_context(self, context: &'static str) -> Self {
        PipelineError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// Failures after which retrying the same page or task is pointless.
    pub fn is_structural(&self) -> bool {
        match self {
            PipelineError::GalleryGone(_) | PipelineError::Cancelled => true,
            PipelineError::Context { source, .. } => source.is_structural(),
            PipelineError::Shared(inner) => inner.is_structural(),
            _ => false,
        }
    }

    /// Whether a bounded local retry can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Timeout(_)
            | PipelineError::Unreachable(_)
            | PipelineError::Protocol(_)
            | PipelineError::Parse(_) => true,
            PipelineError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            PipelineError::Context { source, .. } => source.is_transient(),
            PipelineError::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(PipelineError::Timeout("x".into()).is_transient());
        assert!(
            PipelineError::HttpStatus {
                status: 503,
                url: "u".into()
            }
            .is_transient()
        );
        assert!(
            !PipelineError::HttpStatus {
                status: 404,
                url: "u".into()
            }
            .is_transient()
        );
        assert!(!PipelineError::GalleryGone("1".into()).is_transient());
        assert!(!PipelineError::storage("disk full").is_transient());
    }

    #[test]
    fn context_keeps_classification_and_message() {
        let err = PipelineError::Unreachable("e-hentai.org".into()).with_context("fetching page 3");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "fetching page 3: host unreachable: e-hentai.org");
    }
}
