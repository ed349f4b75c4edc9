use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use log::info;
use memmap2::Mmap;
use walkdir::WalkDir;

use psarc::{
    Archive, CompressionKind, File, FileData, FileSource, PsarcHandle, Settings, shared_input,
    stream,
};

#[derive(Parser)]
#[command(name = "psarc", version, about = "Pack and unpack PSARC archives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a directory into an archive.
    Pack {
        input_dir: PathBuf,
        output: PathBuf,
    },
    /// Unpack an archive into a directory.
    Unpack {
        archive: PathBuf,
        output_dir: PathBuf,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Pack { input_dir, output } => pack(&input_dir, &output),
        Command::Unpack {
            archive,
            output_dir,
        } => unpack(&archive, &output_dir),
    };

    if let Err(err) = result {
        eprintln!("psarc: {err:#}");
        std::process::exit(-1);
    }
}

/// Lazily provides a file's bytes from disk; packing never holds the whole
/// input tree uncompressed in memory at once.
struct DiskFileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource for DiskFileSource {
    fn data(&self) -> psarc::Result<FileData> {
        let file = fs::File::open(&self.path)?;
        if self.len == 0 {
            return Ok(FileData::from_uncompressed(Vec::new()));
        }

        // SAFETY: we assume the input tree is not modified while packing.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(FileData::from_uncompressed(mmap.to_vec()))
    }

    fn compression(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn has_uncompressed_size(&self) -> bool {
        true
    }

    fn uncompressed_size(&self) -> u64 {
        self.len
    }
}

fn pack(input_dir: &Path, output: &Path) -> anyhow::Result<()> {
    if !input_dir.is_dir() {
        bail!("input path is not a directory: {}", input_dir.display());
    }
    let started = Instant::now();

    let mut archive = Archive::new();
    for entry in WalkDir::new(input_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        // Don't pack the archive into itself.
        if path == output {
            continue;
        }

        let relative = path
            .strip_prefix(input_dir)
            .with_context(|| format!("cannot relativize {}", path.display()))?
            .to_string_lossy()
            .replace('\\', "/"); // archive paths always use forward slashes
        let len = entry.metadata()?.len();

        let source = Arc::new(DiskFileSource {
            path: path.to_path_buf(),
            len,
        });
        if !archive.add_file(File::from_source(relative.clone(), source)) {
            bail!("could not insert {relative} into the archive");
        }
    }

    // The manifest joins during serialization.
    let total = archive.file_count() + 1;

    let out_file = stream::create_output_file(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = std::io::BufWriter::new(out_file);

    println!("Packing {} files into {}", total, output.display());
    let mut handle = PsarcHandle::new();
    handle.set_serialization_endpoint(Some(&mut writer));
    handle.set_archive(Some(&mut archive));
    handle.downsync_with_progress(&Settings::default(), |index, path| {
        println!("[{}/{}] {}", index + 1, total, path);
    })?;

    info!(
        "packed {} files in {} ms",
        total,
        started.elapsed().as_millis()
    );
    Ok(())
}

fn unpack(archive_path: &Path, output_dir: &Path) -> anyhow::Result<()> {
    let started = Instant::now();

    let input = fs::File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let input = shared_input(std::io::BufReader::new(input));

    let mut archive = Archive::new();
    let mut handle = PsarcHandle::new();
    handle.set_parsing_endpoint(Some(input));
    handle.set_archive(Some(&mut archive));
    handle
        .upsync()
        .with_context(|| format!("failed to parse {}", archive_path.display()))?;

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let paths: Vec<String> = archive.files().map(|f| f.path().to_string()).collect();
    let total = paths.len();

    for (index, path) in paths.iter().enumerate() {
        println!("[{}/{}] {}", index + 1, total, path);

        let Some(file) = archive.find_file_mut(path) else {
            continue;
        };
        let out_path = output_dir.join(path.trim_start_matches('/'));
        let mut out = stream::create_output_file(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        out.write_all(file.uncompressed_bytes()?)?;

        // Keep memory flat; the parse stream can always restore the body.
        file.clear_uncompressed();
        file.clear_compressed();
    }

    info!(
        "unpacked {} files in {} ms",
        total,
        started.elapsed().as_millis()
    );
    Ok(())
}
