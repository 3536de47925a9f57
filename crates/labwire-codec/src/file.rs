//! Value files.

use crate::decode::decode;
use crate::encode::encode;
use crate::error::CodecError;
use crate::value::Value;
use std::io::Write;
use std::path::Path;

/// Store `value` in `path`, replacing it atomically.
///
/// The encoded text is written to a temporary file in the same directory,
/// flushed to disk and renamed over `path`, so readers see either the old or
/// the new content.
///
/// # Errors
///
/// Returns [`CodecError::Io`] if the file cannot be written.
pub fn store_file(path: impl AsRef<Path>, value: &Value) -> Result<(), CodecError> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(encode(value).as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CodecError::from(e.error))?;
    tracing::debug!(path = %path.display(), "Stored value file");
    Ok(())
}

/// Load a value stored with [`store_file`].
///
/// # Errors
///
/// Returns [`CodecError::Io`] if the file cannot be read and a decode error
/// if its content is not a valid payload.
pub fn load_file(path: impl AsRef<Path>) -> Result<Value, CodecError> {
    let text = std::fs::read_to_string(path)?;
    decode(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.pyon");
        let value = Value::map([("counts", Value::from(vec![1, 2, 3])), ("name", "x".into())]);

        store_file(&path, &value).unwrap();
        assert_eq!(load_file(&path).unwrap(), value);

        store_file(&path, &Value::None).unwrap();
        assert_eq!(load_file(&path).unwrap(), Value::None);

        // Only the target file remains; the temporary was renamed over it.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_file(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }
}
