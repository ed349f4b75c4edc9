//! Seekable byte endpoints for parsing and serialization.
//!
//! Archives are read from and written to anything that is `Read + Seek` or
//! `Write + Seek`: real files in the CLI, `Cursor` buffers in tests. The
//! parse-side endpoint is shared behind a mutex because every file loaded
//! lazily out of an archive keeps reading from the same stream long after
//! parsing finished.

use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, SyncError};

/// A seekable input endpoint.
pub trait ReadStream: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadStream for T {}

/// A seekable output endpoint.
pub trait WriteStream: Write + Seek {}
impl<T: Write + Seek> WriteStream for T {}

/// Parse-side endpoint, shared between a handle and the lazy file sources
/// it hands out. The sources keep the stream alive, so an archive may
/// outlive the handle that populated it.
pub type SharedInput = Arc<Mutex<dyn ReadStream>>;

pub fn shared_input(stream: impl ReadStream + 'static) -> SharedInput {
    Arc::new(Mutex::new(stream))
}

/// Locks a shared input, turning a poisoned lock into a sync error instead
/// of a panic.
pub(crate) fn lock_input(
    input: &SharedInput,
) -> Result<MutexGuard<'_, dyn ReadStream + 'static>> {
    input
        .lock()
        .map_err(|_| SyncError::Misc("parse endpoint lock poisoned".to_string()))
}

/// Creates (or truncates) a file for writing, creating missing parent
/// directories first.
pub fn create_output_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, SeekFrom};

    #[test]
    fn cursor_is_an_endpoint() {
        let mut cursor = Cursor::new(vec![0u8; 8]);
        let writer: &mut dyn WriteStream = &mut cursor;
        writer.write_all(&[1, 2, 3]).unwrap();
        writer.seek(SeekFrom::Start(0)).unwrap();

        let shared = shared_input(Cursor::new(vec![9u8, 8, 7]));
        let mut buf = [0u8; 3];
        lock_input(&shared).unwrap().read_exact(&mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);
    }

    #[test]
    fn output_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c.psarc");
        let mut file = create_output_file(&nested).unwrap();
        file.write_all(b"PSAR").unwrap();
        assert_eq!(fs::read(&nested).unwrap(), b"PSAR");
    }
}
