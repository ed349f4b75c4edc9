//! Reading and writing PSARC archives.
//!
//! PSARC is a block-compressed container format: a fixed header, a table of
//! contents whose first entry is a path manifest, a packed table of
//! per-block compressed sizes, and the payload. This crate parses archives
//! into an in-memory file tree ("upsync") and serializes such a tree back
//! into a conformant archive ("downsync"), with LZMA and zlib block
//! compression and lazy loading of file bodies.
//!
//! ```no_run
//! use std::io::Cursor;
//! use psarc::{Archive, File, PsarcHandle, Settings};
//!
//! let mut archive = Archive::new();
//! archive.add_file(File::from_bytes("data/hello.txt", b"hello".to_vec()));
//!
//! let mut out = Cursor::new(Vec::new());
//! let mut handle = PsarcHandle::new();
//! handle.set_serialization_endpoint(Some(&mut out));
//! handle.set_archive(Some(&mut archive));
//! handle.downsync(&Settings::default()).unwrap();
//! ```

pub mod archive;
pub mod codec;
pub mod error;
pub mod scalar;
pub mod stream;
pub mod sync;

pub use archive::{Archive, DEFAULT_BLOCK_SIZE, Directory, File, FileData, FileSource, MANIFEST_PATH};
pub use codec::CompressionKind;
pub use error::{Result, SyncError};
pub use scalar::Endianness;
pub use stream::{SharedInput, shared_input};
pub use sync::{PathKind, PsarcHandle, Settings};
