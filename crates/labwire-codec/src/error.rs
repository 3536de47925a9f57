//! Codec errors.

/// Errors produced while encoding, decoding or extracting values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The text is not a well-formed payload.
    #[error("malformed payload at offset {offset}: {reason}")]
    MalformedPayload {
        /// Byte offset where parsing stopped
        offset: usize,
        /// What went wrong
        reason: String,
    },
    /// A constructor, dtype or conversion outside the supported set.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    /// Reading or writing a value file failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl CodecError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            offset,
            reason: reason.into(),
        }
    }

    /// Type mismatch during typed extraction.
    #[must_use]
    pub fn expected(expected: &str, found: &str) -> Self {
        Self::UnsupportedType(format!("expected {expected}, found {found}"))
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
