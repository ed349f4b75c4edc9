//! Serialization and parsing of the PSARC container format.
//!
//! An archive on disk is a 32-byte header, a table of contents with one
//! 30-byte entry per file (the first entry always being the manifest), a
//! packed table of per-block compressed sizes, and the block payload.
//! [`PsarcHandle`] connects an [`Archive`] to a parse endpoint (upsync: bytes
//! to archive) and/or a serialization endpoint (downsync: archive to bytes).
//!
//! Header scalars are stored in whatever byte order the writing host used; a
//! version-major field above 255 tells the reader the order is the opposite
//! of its own.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use log::debug;
use md5::{Digest, Md5};
use rayon::prelude::*;

use crate::archive::{Archive, File, FileData, FileSource, MANIFEST_PATH, normalized};
use crate::codec::{self, CompressionKind};
use crate::error::{Result, SyncError};
use crate::scalar::{self, Endianness};
use crate::stream::{SharedInput, WriteStream, lock_input};

const MAGIC: &[u8; 4] = b"PSAR";
const DSAR_MAGIC: &[u8; 4] = b"DSAR";
const HEADER_SIZE: usize = 0x20;

/// Byte length of the fixed TOC entry layout (MD5, block index, sizes).
const TOC_ENTRY_LAYOUT: usize = 30;

/// How file paths inside the archive are meant to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathKind {
    #[default]
    Relative,
    IgnoreCase,
    Absolute,
}

impl PathKind {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => PathKind::IgnoreCase,
            2 => PathKind::Absolute,
            _ => PathKind::Relative,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            PathKind::Relative => 0,
            PathKind::IgnoreCase => 1,
            PathKind::Absolute => 2,
        }
    }
}

/// Serialization configuration. `toc_entry_size` is configurable but 30 is
/// the only value known to round-trip with real-world archives.
#[derive(Debug, Clone)]
pub struct Settings {
    pub version_major: u16,
    pub version_minor: u16,
    pub compression: CompressionKind,
    pub block_size: u32,
    pub toc_entry_size: u32,
    pub path_kind: PathKind,
    pub endianness: Endianness,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            version_major: 1,
            version_minor: 4,
            compression: CompressionKind::Lzma,
            block_size: 65536,
            toc_entry_size: TOC_ENTRY_LAYOUT as u32,
            path_kind: PathKind::Relative,
            endianness: Endianness::native(),
        }
    }
}

/// One table-of-contents record.
#[derive(Debug, Clone)]
pub(crate) struct TocEntry {
    pub md5: [u8; 16],
    /// Index of the file's first block in the block-size table.
    pub block_offset: u32,
    pub uncompressed_size: u64,
    pub file_offset: u64,
}

impl TocEntry {
    fn parse(buf: &[u8], offset: usize, swap: bool) -> Self {
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&buf[offset..offset + 0x10]);
        TocEntry {
            md5,
            block_offset: scalar::read_u32(buf, offset + 0x10, swap),
            uncompressed_size: scalar::read_u40(buf, offset + 0x14, swap),
            file_offset: scalar::read_u40(buf, offset + 0x19, swap),
        }
    }

    fn write(&self, buf: &mut [u8], swap: bool) {
        buf[0x00..0x10].copy_from_slice(&self.md5);
        scalar::write_u32(buf, 0x10, self.block_offset, swap);
        scalar::write_u40(buf, 0x14, self.uncompressed_size, swap);
        scalar::write_u40(buf, 0x19, self.file_offset, swap);
    }
}

/// Geometry of a parsed archive, shared by every lazy file source it
/// produced.
struct ParsedLayout {
    /// Wire values of the block-size table; 0 still means "one full block".
    blocks: Vec<u32>,
    block_size: u32,
    compression: CompressionKind,
}

/// Width in bytes of a block-size table entry for a given block size.
fn block_byte_width(block_size: u32) -> usize {
    let mut width = 2;
    if block_size > 0x10000 {
        width += 1;
    }
    if block_size > 0x100_0000 {
        width += 1;
    }
    width
}

fn read_block_size(buf: &[u8], offset: usize, width: usize, swap: bool) -> u32 {
    match width {
        2 => u32::from(scalar::read_u16(buf, offset, swap)),
        3 => scalar::read_u24(buf, offset, swap),
        _ => scalar::read_u32(buf, offset, swap),
    }
}

fn write_block_size(buf: &mut [u8], offset: usize, value: u32, width: usize, swap: bool) {
    match width {
        // Truncation folds a full-sized block to 0, the wire's "one whole
        // block" marker.
        2 => scalar::write_u16(buf, offset, value as u16, swap),
        3 => scalar::write_u24(buf, offset, value, swap),
        _ => scalar::write_u32(buf, offset, value, swap),
    }
}

fn compression_from_tag(tag: &[u8]) -> CompressionKind {
    match tag.first() {
        Some(b'z') => CompressionKind::Zlib,
        Some(b'l') => CompressionKind::Lzma,
        _ => CompressionKind::None,
    }
}

// There is no "none" tag in the wire format; uncompressed archives are
// written as stored blocks under the lzma tag.
fn header_tag(kind: CompressionKind) -> [u8; 4] {
    match kind {
        CompressionKind::Zlib => *b"zlib",
        CompressionKind::Lzma | CompressionKind::None => *b"lzma",
    }
}

/// Lazy provider for one file of a parsed archive. Reads the file's blocks
/// from the shared parse stream on demand and classifies each block as
/// compressed or stored.
struct PsarcFileSource {
    input: SharedInput,
    layout: Arc<ParsedLayout>,
    entry: TocEntry,
}

impl FileSource for PsarcFileSource {
    fn data(&self) -> Result<FileData> {
        let block_size = self.layout.block_size;
        let mut stream = lock_input(&self.input)?;
        stream.seek(SeekFrom::Start(self.entry.file_offset))?;

        let mut bytes = Vec::new();
        let mut block_sizes = Vec::new();
        let mut block_is_compressed = Vec::new();

        let mut block = self.entry.block_offset as usize;
        let mut uncompressed_read = 0u64;

        while uncompressed_read < self.entry.uncompressed_size {
            let wire = *self
                .layout
                .blocks
                .get(block)
                .ok_or_else(|| SyncError::Decompression("block index out of range".to_string()))?;
            let on_disk = if wire > 0 { wire } else { block_size };

            let start = bytes.len();
            bytes.resize(start + on_disk as usize, 0);
            stream.read_exact(&mut bytes[start..])?;

            let max_possible =
                u64::from(block_size).min(self.entry.uncompressed_size - uncompressed_read);
            let compressed = match self.layout.compression {
                // LZMA has no real magic; 0x5D is the near-universal first
                // properties byte, and a block as large as its uncompressed
                // bound can only be stored.
                CompressionKind::Lzma => {
                    bytes[start] == 0x5D && u64::from(on_disk) < max_possible
                }
                CompressionKind::Zlib => {
                    on_disk >= 2 && codec::is_zlib_magic(bytes[start], bytes[start + 1])
                }
                CompressionKind::None => false,
            };

            block_sizes.push(on_disk);
            block_is_compressed.push(compressed);

            // A whole block's worth per iteration, short final block
            // included; this is what terminates the walk.
            uncompressed_read += u64::from(block_size);
            block += 1;
        }

        Ok(FileData {
            bytes,
            block_sizes,
            block_is_compressed,
            compression: self.layout.compression,
            max_uncompressed_block: block_size,
            max_compressed_block: block_size,
            uncompressed_total: self.entry.uncompressed_size,
        })
    }

    fn compression(&self) -> CompressionKind {
        self.layout.compression
    }

    fn has_uncompressed_size(&self) -> bool {
        true
    }

    fn uncompressed_size(&self) -> u64 {
        self.entry.uncompressed_size
    }
}

/// Connects an archive to its endpoints and runs sync operations between
/// them. A handle is reusable; endpoints and archive can be swapped between
/// operations.
#[derive(Default)]
pub struct PsarcHandle<'a> {
    parsing_endpoint: Option<SharedInput>,
    serialization_endpoint: Option<&'a mut dyn WriteStream>,
    archive: Option<&'a mut Archive>,
    layout: Option<Arc<ParsedLayout>>,
}

impl<'a> PsarcHandle<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parsing_endpoint(&mut self, endpoint: Option<SharedInput>) {
        self.parsing_endpoint = endpoint;
    }

    pub fn set_serialization_endpoint(&mut self, endpoint: Option<&'a mut dyn WriteStream>) {
        self.serialization_endpoint = endpoint;
    }

    pub fn set_archive(&mut self, archive: Option<&'a mut Archive>) {
        self.archive = archive;
    }

    /// Parses the archive from the parsing endpoint into the attached
    /// archive: header, TOC, block-size table, then the manifest, whose
    /// path list names every other entry. File bodies stay on the stream
    /// and are loaded lazily.
    pub fn upsync(&mut self) -> Result<()> {
        let input = self.parsing_endpoint.clone().ok_or(SyncError::Endpoint)?;
        let archive = self.archive.as_deref_mut().ok_or(SyncError::Endpoint)?;

        let mut header = [0u8; HEADER_SIZE];
        {
            let mut stream = lock_input(&input)?;
            stream.read_exact(&mut header)?;
        }

        if &header[0x00..0x04] == DSAR_MAGIC {
            return Err(SyncError::DsarUnsupported);
        }
        if &header[0x00..0x04] != MAGIC {
            return Err(SyncError::BadHeader);
        }

        // A major version above 255 can only mean the bytes are the other
        // way around.
        let swap = scalar::read_u16(&header, 0x04, false) > 255;

        let compression = compression_from_tag(&header[0x08..0x0C]);
        let toc_length = scalar::read_u32(&header, 0x0C, swap) as usize;
        let toc_entry_size = scalar::read_u32(&header, 0x10, swap) as usize;
        let toc_entries_count = scalar::read_u32(&header, 0x14, swap) as usize;
        let block_size = scalar::read_u32(&header, 0x18, swap);
        let path_kind = PathKind::from_u32(scalar::read_u32(&header, 0x1C, swap));

        if block_size == 0 || toc_entry_size < TOC_ENTRY_LAYOUT {
            return Err(SyncError::BadHeader);
        }
        let entries_bytes = toc_entries_count
            .checked_mul(toc_entry_size)
            .filter(|total| *total <= toc_length)
            .ok_or(SyncError::BadHeader)?;

        let mut toc = vec![0u8; toc_length];
        {
            let mut stream = lock_input(&input)?;
            stream.read_exact(&mut toc)?;
        }

        let entries: Vec<TocEntry> = (0..toc_entries_count)
            .map(|i| TocEntry::parse(&toc, i * toc_entry_size, swap))
            .collect();

        let width = block_byte_width(block_size);
        let table = &toc[entries_bytes..];
        let blocks: Vec<u32> = (0..table.len() / width)
            .map(|i| read_block_size(table, i * width, width, swap))
            .collect();

        debug!(
            "upsync: {} entries, {} blocks, block size {}, path kind {:?}",
            entries.len(),
            blocks.len(),
            block_size,
            path_kind
        );

        let Some(manifest_entry) = entries.first().cloned() else {
            return Err(SyncError::Manifest);
        };
        if manifest_entry.uncompressed_size == 0 {
            return Err(SyncError::Manifest);
        }

        let layout = Arc::new(ParsedLayout {
            blocks,
            block_size,
            compression,
        });
        self.layout = Some(Arc::clone(&layout));

        let manifest_source = Arc::new(PsarcFileSource {
            input: Arc::clone(&input),
            layout: Arc::clone(&layout),
            entry: manifest_entry,
        });
        if !archive.add_file(File::from_source(MANIFEST_PATH, manifest_source)) {
            return Err(SyncError::Insert);
        }

        let paths = {
            let manifest = archive.manifest_mut().ok_or(SyncError::Manifest)?;
            parse_manifest_paths(manifest.uncompressed_bytes()?)
        };
        if paths.len() != entries.len() - 1 {
            return Err(SyncError::Manifest);
        }

        for (entry, path) in entries.into_iter().skip(1).zip(paths) {
            let source = Arc::new(PsarcFileSource {
                input: Arc::clone(&input),
                layout: Arc::clone(&layout),
                entry,
            });
            if !archive.add_file(File::from_source(path, source)) {
                return Err(SyncError::Insert);
            }
        }

        Ok(())
    }

    /// Serializes the attached archive to the serialization endpoint with
    /// default settings.
    pub fn downsync(&mut self, settings: &Settings) -> Result<()> {
        self.downsync_with_progress(settings, |_, _| {})
    }

    /// Serializes the attached archive. The progress callback receives the
    /// index and path of each file as its payload is written; it is
    /// informational only.
    pub fn downsync_with_progress(
        &mut self,
        settings: &Settings,
        mut progress: impl FnMut(usize, &str),
    ) -> Result<()> {
        let output = match self.serialization_endpoint.as_deref_mut() {
            Some(output) => output,
            None => return Err(SyncError::Endpoint),
        };
        let archive = match self.archive.as_deref_mut() {
            Some(archive) => archive,
            None => return Err(SyncError::Endpoint),
        };

        if settings.block_size == 0 {
            return Err(SyncError::Misc("block size must not be zero".to_string()));
        }
        if (settings.toc_entry_size as usize) < TOC_ENTRY_LAYOUT {
            return Err(SyncError::Misc(format!(
                "toc entry size {} is below the fixed {} byte layout",
                settings.toc_entry_size, TOC_ENTRY_LAYOUT
            )));
        }

        let swap = settings.endianness.is_swapped();

        // A pre-existing manifest pins the order of the files it names;
        // consumers of round-tripped archives rely on that order.
        let listing = match archive.manifest_mut() {
            Some(manifest) => Some(parse_manifest_paths(manifest.uncompressed_bytes()?)),
            None => None,
        };
        archive.remove_manifest();

        let natural: Vec<String> = archive.files().map(|f| f.path().to_string()).collect();
        let ordered_paths = match &listing {
            Some(listing) => reorder_paths(natural, listing),
            None => natural,
        };

        let manifest_bytes = synthesize_manifest(&ordered_paths, settings.path_kind);
        archive.set_manifest(File::from_bytes(MANIFEST_PATH, manifest_bytes));

        let toc_entries_count = archive.file_count();

        let mut files = archive.collect_files_mut();
        if listing.is_some() {
            let tail = files.split_off(1);
            files.extend(reorder_files(tail, &ordered_paths));
        }

        // Per-file compression is the only parallel region; file sizes vary
        // wildly, so let the pool schedule dynamically.
        files
            .par_iter_mut()
            .try_for_each(|file| {
                file.materialize_compressed(settings.compression, settings.block_size)
            })?;

        let width = block_byte_width(settings.block_size);
        let mut total_blocks = 0usize;
        for file in files.iter_mut() {
            total_blocks += file.compressed_block_sizes()?.len();
        }

        let toc_length = toc_entries_count * settings.toc_entry_size as usize + total_blocks * width;

        let mut header = [0u8; HEADER_SIZE];
        header[0x00..0x04].copy_from_slice(MAGIC);
        scalar::write_u16(&mut header, 0x04, settings.version_major, swap);
        scalar::write_u16(&mut header, 0x06, settings.version_minor, swap);
        header[0x08..0x0C].copy_from_slice(&header_tag(settings.compression));
        scalar::write_u32(&mut header, 0x0C, toc_length as u32, swap);
        scalar::write_u32(&mut header, 0x10, settings.toc_entry_size, swap);
        scalar::write_u32(&mut header, 0x14, toc_entries_count as u32, swap);
        scalar::write_u32(&mut header, 0x18, settings.block_size, swap);
        scalar::write_u32(&mut header, 0x1C, settings.path_kind.as_u32(), swap);

        output.seek(SeekFrom::Start(0))?;
        output.write_all(&header)?;

        // Payload first; TOC entries need every file's offset and digest.
        let payload_start = (HEADER_SIZE + toc_length) as u64;
        output.seek(SeekFrom::Start(payload_start))?;

        let mut toc_entries: Vec<TocEntry> = Vec::with_capacity(files.len());
        let mut block_table: Vec<u32> = Vec::with_capacity(total_blocks);
        let mut file_offset = payload_start;

        for (index, file) in files.iter_mut().enumerate() {
            progress(index, file.path());

            let uncompressed_size = file.uncompressed_size();
            let block_offset = block_table.len() as u32;

            let bytes = file.compressed_bytes()?;
            // The manifest is the one entry serialized without a digest.
            let md5: [u8; 16] = if index == 0 {
                [0u8; 16]
            } else {
                Md5::digest(bytes).into()
            };
            output.write_all(bytes)?;
            let written = bytes.len() as u64;

            toc_entries.push(TocEntry {
                md5,
                block_offset,
                uncompressed_size,
                file_offset,
            });
            file_offset += written;
            block_table.extend_from_slice(file.compressed_block_sizes()?);

            // Anything a source can restore does not need to stay resident.
            if file.has_source() {
                file.clear_compressed();
                file.clear_uncompressed();
            }
        }

        output.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut entry_buf = vec![0u8; settings.toc_entry_size as usize];
        for entry in &toc_entries {
            entry_buf.fill(0);
            entry.write(&mut entry_buf, swap);
            output.write_all(&entry_buf)?;
        }

        let mut table = vec![0u8; block_table.len() * width];
        for (i, size) in block_table.iter().enumerate() {
            write_block_size(&mut table, i * width, *size, width, swap);
        }
        output.write_all(&table)?;
        output.flush()?;

        debug!(
            "downsync: {} entries, {} blocks, {} payload bytes",
            toc_entries.len(),
            block_table.len(),
            file_offset - payload_start
        );

        Ok(())
    }
}

/// Splits manifest content into its path list. Stray NUL terminators from
/// C producers are tolerated.
fn parse_manifest_paths(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split(['\n', '\0'])
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Newline-joined path list, no trailing terminator.
fn synthesize_manifest(paths: &[String], kind: PathKind) -> Vec<u8> {
    let formatted: Vec<String> = paths.iter().map(|path| format_path(path, kind)).collect();
    formatted.join("\n").into_bytes()
}

fn format_path(path: &str, kind: PathKind) -> String {
    let relative = normalized(path);
    match kind {
        PathKind::Absolute => format!("/{relative}"),
        PathKind::Relative | PathKind::IgnoreCase => relative.to_string(),
    }
}

/// Files named by `listing` first, in listing order; everything else after,
/// in natural order.
fn reorder_paths(natural: Vec<String>, listing: &[String]) -> Vec<String> {
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, path) in natural.iter().enumerate() {
        index.entry(normalized(path).to_string()).or_insert(i);
    }

    let mut used = vec![false; natural.len()];
    let mut out = Vec::with_capacity(natural.len());
    for wanted in listing {
        if let Some(i) = index.remove(normalized(wanted)) {
            used[i] = true;
            out.push(natural[i].clone());
        }
    }
    for (i, path) in natural.iter().enumerate() {
        if !used[i] {
            out.push(path.clone());
        }
    }
    out
}

fn reorder_files<'a>(files: Vec<&'a mut File>, ordered_paths: &[String]) -> Vec<&'a mut File> {
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, file) in files.iter().enumerate() {
        index.entry(normalized(file.path()).to_string()).or_insert(i);
    }

    let mut slots: Vec<Option<&'a mut File>> = files.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(slots.len());
    for path in ordered_paths {
        if let Some(i) = index.remove(normalized(path)) {
            if let Some(file) = slots[i].take() {
                out.push(file);
            }
        }
    }
    for slot in &mut slots {
        if let Some(file) = slot.take() {
            out.push(file);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_byte_width_thresholds() {
        assert_eq!(block_byte_width(1024), 2);
        assert_eq!(block_byte_width(65536), 2);
        assert_eq!(block_byte_width(65537), 3);
        assert_eq!(block_byte_width(16_777_216), 3);
        assert_eq!(block_byte_width(16_777_217), 4);
    }

    #[test]
    fn toc_entry_round_trips_both_orders() {
        let entry = TocEntry {
            md5: *b"0123456789abcdef",
            block_offset: 0xCAFE_F00D,
            uncompressed_size: 0xAB_1234_5678,
            file_offset: 0x01_0000_0020,
        };
        for swap in [false, true] {
            let mut buf = [0u8; TOC_ENTRY_LAYOUT];
            entry.write(&mut buf, swap);
            let parsed = TocEntry::parse(&buf, 0, swap);
            assert_eq!(parsed.md5, entry.md5);
            assert_eq!(parsed.block_offset, entry.block_offset);
            assert_eq!(parsed.uncompressed_size, entry.uncompressed_size);
            assert_eq!(parsed.file_offset, entry.file_offset);
        }
    }

    #[test]
    fn full_block_folds_to_zero_on_the_wire() {
        let mut buf = [0u8; 2];
        write_block_size(&mut buf, 0, 65536, 2, false);
        assert_eq!(read_block_size(&buf, 0, 2, false), 0);

        let mut buf = [0u8; 3];
        write_block_size(&mut buf, 0, 0x100_0000, 3, false);
        assert_eq!(read_block_size(&buf, 0, 3, false), 0);
    }

    #[test]
    fn manifest_synthesis_applies_path_kind() {
        let paths = vec!["/a/b.bin".to_string(), "c.bin".to_string()];
        assert_eq!(
            synthesize_manifest(&paths, PathKind::Relative),
            b"a/b.bin\nc.bin".to_vec()
        );
        assert_eq!(
            synthesize_manifest(&paths, PathKind::Absolute),
            b"/a/b.bin\n/c.bin".to_vec()
        );
        assert!(synthesize_manifest(&[], PathKind::Relative).is_empty());
    }

    #[test]
    fn manifest_parse_tolerates_nul_and_blank_lines() {
        let paths = parse_manifest_paths(b"a.bin\nb/c.bin\0");
        assert_eq!(paths, ["a.bin", "b/c.bin"]);
    }

    #[test]
    fn listing_reorders_listed_paths_first() {
        let natural = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let listing = vec!["z".to_string(), "x".to_string()];
        assert_eq!(reorder_paths(natural, &listing), ["z", "x", "y"]);
    }

    #[test]
    fn missing_endpoints_are_reported() {
        let mut handle = PsarcHandle::new();
        assert!(matches!(handle.upsync(), Err(SyncError::Endpoint)));
        assert!(matches!(
            handle.downsync(&Settings::default()),
            Err(SyncError::Endpoint)
        ));

        let mut archive = Archive::new();
        handle.set_archive(Some(&mut archive));
        assert!(matches!(handle.upsync(), Err(SyncError::Endpoint)));
    }
}
