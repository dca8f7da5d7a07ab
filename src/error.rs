//! Error kinds surfaced by the orchestrators.
//!
//! Collaborator implementations report failures with `anyhow`; the
//! orchestrators classify them into one of these kinds at their boundary.

use thiserror::Error;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Filename extension outside the supported spreadsheet set.
    #[error("unsupported file type: '{0}' (supported: .xlsx, .xls)")]
    UnsupportedFileType(String),

    /// The document could not be read or parsed.
    #[error("could not extract '{filename}': {message}")]
    Extraction { filename: String, message: String },

    /// Embedding or index construction failed.
    #[error("failed to build index: {0}")]
    IndexBuild(String),

    /// The answer stream failed to start or broke mid-turn.
    #[error("generation failed: {0}")]
    Generation(String),

    /// `insert_pipeline` called for a key that is already cached.
    #[error("pipeline already cached for '{0}'")]
    DuplicateKey(String),

    #[error("no document loaded; upload a spreadsheet first")]
    NoActiveDocument,

    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn extraction(filename: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Extraction {
            filename: filename.into(),
            message: message.to_string(),
        }
    }

    pub fn index_build(message: impl std::fmt::Display) -> Self {
        Self::IndexBuild(message.to_string())
    }

    pub fn generation(message: impl std::fmt::Display) -> Self {
        Self::Generation(message.to_string())
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnsupportedFileType(_) => "unsupported_file_type",
            Error::Extraction { .. } => "extraction_error",
            Error::IndexBuild(_) => "index_build_error",
            Error::Generation(_) => "generation_error",
            Error::DuplicateKey(_) => "duplicate_key",
            Error::NoActiveDocument => "no_active_document",
            Error::EmptyQuestion => "bad_request",
            Error::Io(_) => "internal",
        }
    }
}
