use clap::Parser;
use eyre::{Context, Result, eyre};
use owui_hugo::frontmatter::Format;
use owui_hugo::{pipeline, utils};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Convert Open WebUI chat exports into Hugo posts.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Chat export files (JSON, optionally .zst compressed).
    #[arg(value_name = "INPUT")]
    inputs: Vec<PathBuf>,

    /// Directory to write posts into.
    /// Defaults to ./content/posts if not set in config.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Directory holding annotation files.
    /// Defaults to the current directory if not set in config.
    #[arg(long, value_name = "DIR")]
    metadir: Option<PathBuf>,

    /// Path to an Open WebUI SQLite DB (webui.db) to read chats from.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/owui-hugo/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Comma-separated tags for new annotation files (e.g. "llm,chat").
    #[arg(long, value_name = "TAGS", value_delimiter = ',')]
    tags: Option<Vec<String>>,

    /// Comma-separated categories for new annotation files.
    #[arg(long, value_name = "CATEGORIES", value_delimiter = ',')]
    categories: Option<Vec<String>>,

    /// Front matter format of written files.
    #[arg(long, value_enum)]
    format: Option<Format>,

    /// Render conversations on this many threads.
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Rewrite annotation files in canonical form (explicit seek directives).
    #[arg(long)]
    normalize: bool,

    /// Render and report, but write nothing.
    #[arg(long)]
    dry_run: bool,

    /// Rewrite posts even if their content is unchanged.
    #[arg(short, long)]
    force: bool,

    /// Print each file written and debug diagnostics.
    #[arg(short, long)]
    verbose: bool,

    /// Only print warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    output_dir: Option<PathBuf>,
    metadir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    tags: Option<Vec<String>>,
    categories: Option<Vec<String>>,
    format: Option<Format>,
    jobs: Option<usize>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("owui-hugo/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve each setting (CLI > Config > Default)
    let defaults = utils::ExportConfig::default();
    let config = utils::ExportConfig {
        inputs: cli.inputs,
        db_path: cli.db.or(file_cfg.db_path),
        output_dir: cli
            .output
            .or(file_cfg.output_dir)
            .unwrap_or(defaults.output_dir),
        metadir: cli.metadir.or(file_cfg.metadir).unwrap_or(defaults.metadir),
        tags: cli.tags.or(file_cfg.tags).unwrap_or_default(),
        categories: cli.categories.or(file_cfg.categories).unwrap_or_default(),
        format: cli.format.or(file_cfg.format).unwrap_or(defaults.format),
        jobs: cli.jobs.or(file_cfg.jobs).unwrap_or(defaults.jobs).max(1),
        force: cli.force,
        dry_run: cli.dry_run,
        normalize: cli.normalize,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    // 3. Run the Business Logic
    pipeline::execute(&config)?;
    Ok(())
}
