use crate::frontmatter::Format;
use eyre::{Context, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::{Connection, OpenFlags, backup::Backup};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Configuration required to run the export process.
/// This decouples the logic from how the arguments were parsed (CLI/Config file).
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Export JSON files (`.json` or `.json.zst`).
    pub inputs: Vec<PathBuf>,
    /// Open WebUI database to read instead of / in addition to `inputs`.
    pub db_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Where the hand-edited annotation files live.
    pub metadir: PathBuf,
    /// Seeded into posts that have no annotation file yet.
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub format: Format,
    pub jobs: usize,
    pub force: bool,
    pub dry_run: bool,
    pub normalize: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            db_path: None,
            output_dir: PathBuf::from("content/posts"),
            metadir: PathBuf::from("."),
            tags: Vec::new(),
            categories: Vec::new(),
            format: Format::Yaml,
            jobs: 1,
            force: false,
            dry_run: false,
            normalize: false,
            verbose: false,
            quiet: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    Created,
    Updated,
    /// Output already matches; nothing written.
    Unchanged,
    /// Malformed input; nothing rendered.
    Skipped,
}

/// Create a read-only backup of the database to a temporary file.
pub fn backup_database(db_path: &Path, quiet: bool) -> Result<NamedTempFile> {
    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        let s = ProgressBar::new_spinner();
        s.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        s.set_message("Snapshotting database...");
        s.enable_steady_tick(Duration::from_millis(80));
        s
    };

    let src = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err_with(|| format!("Failed to open source database: {}", db_path.display()))?;

    let tmp = NamedTempFile::new().wrap_err("Failed to create temporary file")?;
    let mut dst =
        Connection::open(tmp.path()).wrap_err("Failed to open snapshot database connection")?;

    {
        let backup = Backup::new(&src, &mut dst).wrap_err("Failed to initialize backup")?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .wrap_err("Backup did not complete successfully")?;
    }

    drop(src);
    spinner.finish_and_clear();
    Ok(tmp)
}

/// Decompress data bytes based on the data type.
pub fn decompress(data_type: &str, raw_data: &[u8]) -> Result<Vec<u8>> {
    match data_type {
        "zstd" => zstd::decode_all(raw_data).wrap_err("zstd decompression failed"),
        "json" => Ok(raw_data.to_vec()),
        other => Err(eyre!("Unknown data_type: {:?}", other)),
    }
}

/// Replace `path` with `contents` in one rename, so readers never observe a
/// half-written file. Parent directories are created as needed.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create directory: {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .wrap_err_with(|| format!("Failed to create temporary file in: {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())
        .wrap_err("Failed to write temporary file")?;
    tmp.flush().wrap_err("Failed to flush temporary file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .wrap_err_with(|| format!("Failed to replace: {}", path.display()))?;
    Ok(())
}

/// Write `contents` to `path` only if nothing is there yet.
/// Returns whether the file was created.
pub fn create_if_absent(path: &Path, contents: &str) -> Result<bool> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())
                .wrap_err_with(|| format!("Failed to write: {}", path.display()))?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).wrap_err_with(|| format!("Failed to create: {}", path.display())),
    }
}
