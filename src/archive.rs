//! The logical archive: a tree of directories and files plus the manifest
//! slot, and the lazy per-file content state machine.
//!
//! A [`File`] holds up to two in-memory representations of its body, one
//! uncompressed and one compressed, and optionally a [`FileSource`] that can
//! produce the body on demand (typically a region of a parsed archive).
//! Either representation is materialized lazily from the other or from the
//! source, so an archive can be re-serialized without ever decompressing
//! files that arrived compressed.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::{self, CompressionKind};
use crate::error::{Result, SyncError};

/// Reserved path of the manifest, the archive's first serialized entry.
pub const MANIFEST_PATH: &str = "/PSArcManifest.bin";

/// Block size used when a file is created from plain bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 65536;

/// One representation of a file body together with its block layout.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    pub bytes: Vec<u8>,
    /// On-disk byte count of each block.
    pub block_sizes: Vec<u32>,
    /// Whether each block is actually compressed or stored raw.
    pub block_is_compressed: Vec<bool>,
    pub compression: CompressionKind,
    pub max_uncompressed_block: u32,
    pub max_compressed_block: u32,
    pub uncompressed_total: u64,
}

impl FileData {
    /// Wraps raw, uncompressed bytes.
    pub fn from_uncompressed(bytes: Vec<u8>) -> Self {
        FileData {
            uncompressed_total: bytes.len() as u64,
            bytes,
            block_sizes: Vec::new(),
            block_is_compressed: Vec::new(),
            compression: CompressionKind::None,
            max_uncompressed_block: DEFAULT_BLOCK_SIZE,
            max_compressed_block: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Provider of a file body that lives outside the archive, e.g. a region of
/// a parsed archive stream or a file on disk. Answers are stable across
/// calls.
pub trait FileSource: Send + Sync {
    fn data(&self) -> Result<FileData>;
    fn compression(&self) -> CompressionKind;
    fn has_uncompressed_size(&self) -> bool;
    fn uncompressed_size(&self) -> u64;
}

/// A file in the archive. See the module docs for the content model.
pub struct File {
    path: String,
    uncompressed: Option<FileData>,
    compressed: Option<FileData>,
    source: Option<Arc<dyn FileSource>>,
    compressed_source: bool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("uncompressed", &self.uncompressed)
            .field("compressed", &self.compressed)
            .field("source", &self.source.as_ref().map(|_| "<FileSource>"))
            .field("compressed_source", &self.compressed_source)
            .finish()
    }
}

impl File {
    pub fn from_bytes(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        File {
            path: path.into(),
            uncompressed: Some(FileData::from_uncompressed(bytes)),
            compressed: None,
            source: None,
            compressed_source: false,
        }
    }

    pub fn from_source(path: impl Into<String>, source: Arc<dyn FileSource>) -> Self {
        let compressed_source = source.compression() != CompressionKind::None;
        File {
            path: path.into(),
            uncompressed: None,
            compressed: None,
            source: Some(source),
            compressed_source,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Makes the uncompressed representation present: keeps an existing one,
    /// otherwise adopts or decompresses the source or the compressed
    /// representation. A file with no content anywhere becomes empty.
    pub fn load_uncompressed(&mut self) -> Result<()> {
        if self.uncompressed.is_some() {
            return Ok(());
        }

        if self.source.is_some() {
            if self.compressed_source {
                self.load_compressed(CompressionKind::Lzma)?;
                return self.decompress();
            }
            if let Some(source) = &self.source {
                self.uncompressed = Some(source.data()?);
                return Ok(());
            }
        }

        if self.compressed.is_some() {
            return self.decompress();
        }

        self.uncompressed = Some(FileData::from_uncompressed(Vec::new()));
        Ok(())
    }

    /// Makes the compressed representation present. An already-compressed
    /// source is adopted as-is; otherwise the uncompressed view is
    /// compressed with `preferred` (unless `preferred` is `None`, in which
    /// case the representation becomes empty).
    pub fn load_compressed(&mut self, preferred: CompressionKind) -> Result<()> {
        if self.compressed.is_some() {
            return Ok(());
        }

        if let Some(source) = &self.source {
            if self.compressed_source {
                self.compressed = Some(source.data()?);
                return Ok(());
            }
            if preferred != CompressionKind::None {
                self.load_uncompressed()?;
            }
        }

        if preferred != CompressionKind::None {
            if let Some(uncompressed) = &self.uncompressed {
                let block_size = uncompressed.max_uncompressed_block;
                return self.compress(preferred, block_size);
            }
        }

        self.compressed = Some(FileData::default());
        Ok(())
    }

    /// Like [`Self::load_compressed`] but with an explicit block size for
    /// the case where compression has to run; serialization uses this so
    /// freshly compressed files honor the archive settings rather than the
    /// source's defaults.
    pub fn materialize_compressed(&mut self, kind: CompressionKind, block_size: u32) -> Result<()> {
        if self.compressed.is_some() {
            return Ok(());
        }
        if self.source.is_some() && self.compressed_source {
            return self.load_compressed(kind);
        }
        self.load_uncompressed()?;
        self.compress(kind, block_size)
    }

    /// Compresses the uncompressed representation into a new compressed one,
    /// replacing any previous compressed representation. No-op if there is
    /// no uncompressed representation to work from.
    pub fn compress(&mut self, kind: CompressionKind, block_size: u32) -> Result<()> {
        let Some(uncompressed) = &self.uncompressed else {
            return Ok(());
        };

        let (bytes, block_sizes, block_is_compressed) = codec::compress_blocks(
            kind,
            &uncompressed.bytes,
            block_size as usize,
            block_size as usize,
        )?;

        self.compressed = Some(FileData {
            uncompressed_total: uncompressed.bytes.len() as u64,
            bytes,
            block_sizes,
            block_is_compressed,
            compression: kind,
            max_uncompressed_block: block_size,
            max_compressed_block: block_size,
        });
        Ok(())
    }

    /// Decompresses the compressed representation into a new uncompressed
    /// one. No-op if there is no compressed representation.
    pub fn decompress(&mut self) -> Result<()> {
        let Some(compressed) = &self.compressed else {
            return Ok(());
        };

        let bytes = codec::decompress_blocks(
            compressed.compression,
            &compressed.bytes,
            &compressed.block_sizes,
            &compressed.block_is_compressed,
        )?;

        let block_size = if compressed.max_uncompressed_block > 0 {
            compressed.max_uncompressed_block
        } else {
            DEFAULT_BLOCK_SIZE
        };

        self.uncompressed = Some(FileData {
            uncompressed_total: bytes.len() as u64,
            bytes,
            block_sizes: Vec::new(),
            block_is_compressed: Vec::new(),
            compression: CompressionKind::None,
            max_uncompressed_block: block_size,
            max_compressed_block: block_size,
        });
        Ok(())
    }

    /// Drops the compressed representation. The source, if any, still makes
    /// the content recoverable.
    pub fn clear_compressed(&mut self) {
        self.compressed = None;
    }

    /// Drops the uncompressed representation.
    pub fn clear_uncompressed(&mut self) {
        self.uncompressed = None;
    }

    /// Size of the uncompressed body, answered without decompressing:
    /// first from the uncompressed view, then from the compressed view's
    /// total, then from the source if it advertises one.
    pub fn uncompressed_size(&self) -> u64 {
        if let Some(uncompressed) = &self.uncompressed {
            return uncompressed.uncompressed_total;
        }
        if let Some(compressed) = &self.compressed {
            return compressed.uncompressed_total;
        }
        match &self.source {
            Some(source) if source.has_uncompressed_size() => source.uncompressed_size(),
            _ => 0,
        }
    }

    pub fn is_uncompressed_size_available(&self) -> bool {
        self.uncompressed.is_some()
            || self.compressed.is_some()
            || self
                .source
                .as_ref()
                .is_some_and(|source| source.has_uncompressed_size())
    }

    pub fn is_compressed_size_available(&self) -> bool {
        self.compressed.is_some()
    }

    /// Byte length of the compressed body, materializing it if needed.
    pub fn compressed_size(&mut self) -> Result<u64> {
        Ok(self.compressed_data()?.bytes.len() as u64)
    }

    pub fn uncompressed_bytes(&mut self) -> Result<&[u8]> {
        self.load_uncompressed()?;
        self.uncompressed
            .as_ref()
            .map(|data| data.bytes.as_slice())
            .ok_or_else(|| SyncError::Misc("uncompressed bytes unavailable".to_string()))
    }

    pub fn compressed_bytes(&mut self) -> Result<&[u8]> {
        Ok(&self.compressed_data()?.bytes)
    }

    pub fn compressed_block_sizes(&mut self) -> Result<&[u32]> {
        Ok(&self.compressed_data()?.block_sizes)
    }

    fn compressed_data(&mut self) -> Result<&FileData> {
        self.load_compressed(CompressionKind::Lzma)?;
        self.compressed
            .as_ref()
            .ok_or_else(|| SyncError::Misc("compressed bytes unavailable".to_string()))
    }
}

/// A directory node; children keep insertion order.
#[derive(Debug)]
pub struct Directory {
    name: String,
    subdirectories: Vec<Directory>,
    files: Vec<File>,
}

impl Directory {
    fn new(name: impl Into<String>) -> Self {
        Directory {
            name: name.into(),
            subdirectories: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The archive: a root directory tree plus the dedicated manifest slot.
/// The manifest is not part of the tree so iteration yields it exactly
/// once, and first.
#[derive(Debug)]
pub struct Archive {
    root: Directory,
    manifest: Option<File>,
    file_count: usize,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

impl Archive {
    pub fn new() -> Self {
        Archive {
            root: Directory::new("root"),
            manifest: None,
            file_count: 0,
        }
    }

    /// Inserts a file, creating intermediate directories as needed. A file
    /// at the reserved manifest path goes into the manifest slot instead of
    /// the tree. Returns false when the path has no usable components.
    pub fn add_file(&mut self, file: File) -> bool {
        let components: Vec<&str> = normalized(file.path())
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();

        if components.is_empty() {
            return false;
        }

        if normalized(file.path()) == normalized(MANIFEST_PATH) {
            self.manifest = Some(file);
            return true;
        }

        let mut current = &mut self.root;
        for component in &components[..components.len() - 1] {
            let found = current
                .subdirectories
                .iter()
                .position(|dir| dir.name == *component);
            current = match found {
                Some(index) => &mut current.subdirectories[index],
                None => {
                    current.subdirectories.push(Directory::new(*component));
                    let last = current.subdirectories.len() - 1;
                    &mut current.subdirectories[last]
                }
            };
        }

        current.files.push(file);
        self.file_count += 1;
        true
    }

    pub fn find_file(&self, path: &str) -> Option<&File> {
        if normalized(path) == normalized(MANIFEST_PATH) {
            return self.manifest.as_ref();
        }

        let dir = self.walk(path)?;
        dir.files
            .iter()
            .find(|file| normalized(file.path()) == normalized(path))
    }

    pub fn find_file_mut(&mut self, path: &str) -> Option<&mut File> {
        if normalized(path) == normalized(MANIFEST_PATH) {
            return self.manifest.as_mut();
        }

        let components: Vec<&str> = normalized(path)
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        let (_, dirs) = components.split_last()?;

        let mut current = &mut self.root;
        for component in dirs {
            let index = current
                .subdirectories
                .iter()
                .position(|dir| dir.name == *component)?;
            current = &mut current.subdirectories[index];
        }

        current
            .files
            .iter_mut()
            .find(|file| normalized(file.path()) == normalized(path))
    }

    fn walk(&self, path: &str) -> Option<&Directory> {
        let components: Vec<&str> = normalized(path)
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        let (_, dirs) = components.split_last()?;

        let mut current = &self.root;
        for component in dirs {
            current = current
                .subdirectories
                .iter()
                .find(|dir| dir.name == *component)?;
        }
        Some(current)
    }

    /// Number of serialized entries, the manifest included when present.
    pub fn file_count(&self) -> usize {
        self.file_count + usize::from(self.manifest.is_some())
    }

    pub fn has_manifest(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn manifest_mut(&mut self) -> Option<&mut File> {
        self.manifest.as_mut()
    }

    pub fn set_manifest(&mut self, file: File) {
        self.manifest = Some(file);
    }

    pub fn remove_manifest(&mut self) {
        self.manifest = None;
    }

    /// Iterates all files: the manifest first, then breadth-first over the
    /// tree with a directory's files yielded before any subdirectory is
    /// descended into, everything in insertion order.
    pub fn files(&self) -> Files<'_> {
        let mut files = VecDeque::new();
        if let Some(manifest) = &self.manifest {
            files.push_back(manifest);
        }
        files.extend(&self.root.files);

        let mut directories = VecDeque::new();
        directories.extend(&self.root.subdirectories);

        Files { directories, files }
    }

    /// Mutable view of every file, in the same order as [`Self::files`].
    pub(crate) fn collect_files_mut(&mut self) -> Vec<&mut File> {
        let mut out = Vec::with_capacity(self.file_count());
        if let Some(manifest) = self.manifest.as_mut() {
            out.push(manifest);
        }

        let mut directories = VecDeque::new();
        directories.push_back(&mut self.root);
        while let Some(dir) = directories.pop_front() {
            out.extend(dir.files.iter_mut());
            directories.extend(dir.subdirectories.iter_mut());
        }
        out
    }
}

/// Single-pass file iterator, see [`Archive::files`].
pub struct Files<'a> {
    directories: VecDeque<&'a Directory>,
    files: VecDeque<&'a File>,
}

impl<'a> Iterator for Files<'a> {
    type Item = &'a File;

    fn next(&mut self) -> Option<Self::Item> {
        while self.files.is_empty() {
            let dir = self.directories.pop_front()?;
            self.directories.extend(&dir.subdirectories);
            self.files.extend(&dir.files);
        }
        self.files.pop_front()
    }
}

pub(crate) fn normalized(path: &str) -> &str {
    path.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource {
        data: FileData,
        kind: CompressionKind,
    }

    impl FileSource for StaticSource {
        fn data(&self) -> Result<FileData> {
            Ok(self.data.clone())
        }
        fn compression(&self) -> CompressionKind {
            self.kind
        }
        fn has_uncompressed_size(&self) -> bool {
            true
        }
        fn uncompressed_size(&self) -> u64 {
            self.data.uncompressed_total
        }
    }

    fn sample_archive() -> Archive {
        let mut archive = Archive::new();
        assert!(archive.add_file(File::from_bytes("top.txt", b"t".to_vec())));
        assert!(archive.add_file(File::from_bytes("a/one.txt", b"1".to_vec())));
        assert!(archive.add_file(File::from_bytes("b/two.txt", b"2".to_vec())));
        assert!(archive.add_file(File::from_bytes("a/sub/deep.txt", b"d".to_vec())));
        assert!(archive.add_file(File::from_bytes("late.txt", b"l".to_vec())));
        archive
    }

    #[test]
    fn add_and_find_nested_paths() {
        let archive = sample_archive();
        assert!(archive.find_file("a/sub/deep.txt").is_some());
        // A leading slash addresses the same file.
        assert!(archive.find_file("/a/sub/deep.txt").is_some());
        assert!(archive.find_file("a/sub/missing.txt").is_none());
        assert!(archive.find_file("nosuch/dir.txt").is_none());
    }

    #[test]
    fn iteration_is_breadth_first_in_insertion_order() {
        let archive = sample_archive();
        let order: Vec<&str> = archive.files().map(File::path).collect();
        assert_eq!(
            order,
            ["top.txt", "late.txt", "a/one.txt", "b/two.txt", "a/sub/deep.txt"]
        );
    }

    #[test]
    fn manifest_lives_in_its_slot_and_iterates_first() {
        let mut archive = sample_archive();
        assert_eq!(archive.file_count(), 5);

        assert!(archive.add_file(File::from_bytes(MANIFEST_PATH, b"m".to_vec())));
        // The manifest is counted but not part of the tree.
        assert_eq!(archive.file_count(), 6);
        assert!(archive.find_file("PSArcManifest.bin").is_some());

        let first = archive.files().next().map(|f| f.path().to_string());
        assert_eq!(first.as_deref(), Some(MANIFEST_PATH));

        archive.remove_manifest();
        assert_eq!(archive.file_count(), 5);
    }

    #[test]
    fn empty_path_is_rejected() {
        let mut archive = Archive::new();
        assert!(!archive.add_file(File::from_bytes("", Vec::new())));
        assert!(!archive.add_file(File::from_bytes("/", Vec::new())));
    }

    #[test]
    fn compress_then_decompress_restores_bytes() {
        let body = b"compressible compressible compressible".repeat(100);
        let mut file = File::from_bytes("f.bin", body.clone());

        file.compress(CompressionKind::Zlib, 256).unwrap();
        assert!(file.is_compressed_size_available());
        file.clear_uncompressed();

        assert_eq!(file.uncompressed_size(), body.len() as u64);
        assert_eq!(file.uncompressed_bytes().unwrap(), &body[..]);
    }

    #[test]
    fn uncompressed_source_is_adopted_lazily() {
        let body = b"from the outside".to_vec();
        let source = Arc::new(StaticSource {
            data: FileData::from_uncompressed(body.clone()),
            kind: CompressionKind::None,
        });
        let mut file = File::from_source("s.bin", source);

        // Size is known without touching the data.
        assert!(file.is_uncompressed_size_available());
        assert_eq!(file.uncompressed_size(), body.len() as u64);

        assert_eq!(file.uncompressed_bytes().unwrap(), &body[..]);
        file.clear_uncompressed();
        // Clearing never loses content that the source can restore.
        assert_eq!(file.uncompressed_bytes().unwrap(), &body[..]);
    }

    #[test]
    fn compressed_source_decompresses_on_demand() {
        let body = b"zlib zlib zlib zlib zlib".repeat(64);
        let (bytes, block_sizes, block_is_compressed) =
            codec::compress_blocks(CompressionKind::Zlib, &body, 128, 128).unwrap();
        let source = Arc::new(StaticSource {
            data: FileData {
                uncompressed_total: body.len() as u64,
                bytes,
                block_sizes,
                block_is_compressed,
                compression: CompressionKind::Zlib,
                max_uncompressed_block: 128,
                max_compressed_block: 128,
            },
            kind: CompressionKind::Zlib,
        });

        let mut file = File::from_source("z.bin", source);
        assert_eq!(file.uncompressed_bytes().unwrap(), &body[..]);

        // Re-serialization adopts the source's compressed form untouched.
        file.clear_uncompressed();
        file.clear_compressed();
        file.materialize_compressed(CompressionKind::Zlib, 128).unwrap();
        assert!(file.is_compressed_size_available());
    }

    #[test]
    fn file_with_no_content_loads_empty() {
        let mut file = File::from_bytes("x", Vec::new());
        file.clear_uncompressed();
        assert_eq!(file.uncompressed_bytes().unwrap(), b"");
        assert_eq!(file.compressed_size().unwrap(), 0);
    }
}
