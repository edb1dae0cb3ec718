use crate::directive::parse_annotations;
use crate::frontmatter;
use crate::graph::select_path;
use crate::importer::{self, ChatRecord};
use crate::parallel;
use crate::renderer::{ConversationFields, assemble, split_reserved};
use crate::utils::{ExportConfig, ProcessResult, create_if_absent, write_atomic};
use eyre::{Context, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Two conversations would be written to the same file.
    #[error("two conversations render to {}", path.display())]
    DuplicateOutput { path: PathBuf },
}

/// Output paths claimed so far in this run.
#[derive(Debug, Default)]
pub struct PathRegistry {
    seen: Mutex<HashSet<PathBuf>>,
}

impl PathRegistry {
    pub fn claim(&self, path: &Path) -> Result<(), PipelineError> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.insert(path.to_path_buf()) {
            Ok(())
        } else {
            Err(PipelineError::DuplicateOutput {
                path: path.to_path_buf(),
            })
        }
    }
}

/// A conversation fully rendered in memory, ready to be written.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub id: String,
    pub output: PathBuf,
    pub annotation: PathBuf,
    pub text: String,
    /// Skeleton for a missing annotation file.
    pub skeleton: Option<String>,
    /// Canonical rewrite of an existing annotation file (`--normalize`).
    pub normalized: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl Summary {
    fn record(&mut self, result: ProcessResult) {
        match result {
            ProcessResult::Created => self.created += 1,
            ProcessResult::Updated => self.updated += 1,
            ProcessResult::Unchanged => self.unchanged += 1,
            ProcessResult::Skipped => self.skipped += 1,
        }
    }
}

pub struct ConversationPipeline<'a> {
    config: &'a ExportConfig,
    registry: PathRegistry,
    seed: Mapping,
}

impl<'a> ConversationPipeline<'a> {
    pub fn new(config: &'a ExportConfig) -> Self {
        let list = |items: &[String]| {
            Value::Sequence(items.iter().cloned().map(Value::String).collect())
        };
        let mut seed = Mapping::new();
        seed.insert("categories".into(), list(&config.categories));
        if !config.tags.is_empty() {
            seed.insert("tags".into(), list(&config.tags));
        }
        Self {
            config,
            registry: PathRegistry::default(),
            seed,
        }
    }

    /// Render one conversation without touching the output tree.
    ///
    /// `Ok(None)` means the record was malformed and skipped. Errors are
    /// fatal for the whole run.
    pub fn render(&self, record: ChatRecord) -> Result<Option<Rendered>> {
        let Some(conv) = record.into_conversation() else {
            return Ok(None);
        };
        let fields = ConversationFields::new(&conv.id, &conv.title, &conv.models, conv.date());
        let rel = Path::new(&fields.month_dir()).join(fields.file_name());
        let output = self.config.output_dir.join(&rel);
        let annotation = self.config.metadir.join(&rel);

        let prior = if annotation.exists() {
            let text = fs::read_to_string(&annotation)
                .wrap_err_with(|| format!("Failed to read: {}", annotation.display()))?;
            Some(
                frontmatter::parse(&text)
                    .wrap_err_with(|| format!("Failed to parse: {}", annotation.display()))?,
            )
        } else {
            None
        };
        let (prior_meta, body) = match prior {
            Some(doc) => (Some(doc.metadata), doc.body),
            None => (None, Vec::new()),
        };
        let original_meta = prior_meta.clone();
        let (retained, reserved) = match prior_meta {
            Some(meta) => {
                let (kept, reserved) = split_reserved(meta);
                (Some(kept), reserved)
            }
            None => (None, Default::default()),
        };

        let graph = match conv.graph(&reserved.history) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(id = %conv.id, error = %e, "malformed history, conversation skipped");
                return Ok(None);
            }
        };
        // claimed only once the conversation is known to render
        self.registry
            .claim(&output)
            .wrap_err_with(|| format!("Conversation {} collides with an earlier one", conv.id))?;

        let path = select_path(&graph, &reserved.history).wrap_err_with(|| {
            format!("Cannot pick a history branch for {}", annotation.display())
        })?;
        debug!(id = %conv.id, messages = path.messages.len(), "history path selected");

        let parsed = parse_annotations(&body, &path.messages);
        let normalized = match (&original_meta, self.config.normalize) {
            (Some(meta), true) => Some(frontmatter::render(
                meta,
                &parsed.inserts.to_annotation_lines(),
                self.config.format,
            )?),
            _ => None,
        };
        let skeleton = match original_meta {
            None => Some(frontmatter::serialize(&self.seed, self.config.format)?),
            Some(_) => None,
        };

        let doc = assemble(
            &fields,
            &path.messages,
            parsed.inserts,
            &reserved,
            retained,
            &self.seed,
        );
        let text = doc.to_text(self.config.format)?;

        Ok(Some(Rendered {
            id: conv.id,
            output,
            annotation,
            text,
            skeleton,
            normalized,
        }))
    }

    /// Write one rendered conversation (unless `--dry-run`).
    pub fn write(&self, rendered: &Rendered) -> Result<ProcessResult> {
        let existing = fs::read_to_string(&rendered.output).ok();
        let result = match existing {
            None => ProcessResult::Created,
            Some(ref old) if *old == rendered.text && !self.config.force => {
                ProcessResult::Unchanged
            }
            Some(_) => ProcessResult::Updated,
        };
        if self.config.dry_run {
            info!(path = %rendered.output.display(), ?result, "dry run, not written");
            return Ok(result);
        }

        if result != ProcessResult::Unchanged {
            write_atomic(&rendered.output, &rendered.text)?;
        }
        if let Some(skeleton) = &rendered.skeleton
            && create_if_absent(&rendered.annotation, skeleton)?
        {
            info!(path = %rendered.annotation.display(), "created annotation file");
        }
        if let Some(normalized) = &rendered.normalized {
            let current = fs::read_to_string(&rendered.annotation).unwrap_or_default();
            if current != *normalized {
                write_atomic(&rendered.annotation, normalized)?;
                info!(path = %rendered.annotation.display(), "normalized annotation file");
            }
        }
        Ok(result)
    }
}

fn load_inputs(config: &ExportConfig) -> Result<Vec<ChatRecord>> {
    if config.inputs.is_empty() && config.db_path.is_none() {
        return Err(eyre!(
            "No input given.\nPass export JSON files, or --db for an Open WebUI database."
        ));
    }
    let mut records = Vec::new();
    for path in &config.inputs {
        records.extend(importer::load_file(path)?);
    }
    if let Some(db) = &config.db_path {
        records.extend(importer::load_db(db, config.quiet)?);
    }
    Ok(records)
}

/// Run the whole conversion.
///
/// Every conversation is rendered before anything is written, so a fatal
/// error (ambiguous branch, colliding output path) leaves the output tree
/// untouched.
pub fn execute(config: &ExportConfig) -> Result<Summary> {
    let records = load_inputs(config)?;
    let total = records.len();
    let pipeline = ConversationPipeline::new(config);

    let rendered: Vec<Option<Rendered>> = if config.jobs > 1 {
        parallel::render_all(&pipeline, records, config.jobs)?
    } else {
        records
            .into_iter()
            .map(|r| pipeline.render(r))
            .collect::<Result<_>>()?
    };

    let pb = if config.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        bar.println(format!("Found {} conversations.", total));
        bar
    };

    let mut summary = Summary::default();
    for item in &rendered {
        let result = match item {
            None => ProcessResult::Skipped,
            Some(r) => pipeline
                .write(r)
                .wrap_err_with(|| format!("Failed to write conversation {}", r.id))?,
        };
        if config.verbose
            && let Some(r) = item
        {
            let name = r.output.display();
            match result {
                ProcessResult::Created => pb.println(format!("Created:   {}", name)),
                ProcessResult::Updated => pb.println(format!("Updated:   {}", name)),
                ProcessResult::Unchanged => pb.println(format!("Unchanged: {}", name)),
                ProcessResult::Skipped => {}
            }
        }
        summary.record(result);
        pb.inc(1);
    }
    pb.finish_and_clear();

    if !config.quiet {
        let mut line = format!(
            "Done. {} created, {} updated, {} unchanged.",
            summary.created, summary.updated, summary.unchanged
        );
        if summary.skipped > 0 {
            line.push_str(&format!(" Skipped {} malformed conversation(s).", summary.skipped));
        }
        if config.dry_run {
            line.push_str(" (dry run)");
        }
        eprintln!("{}", line);
    }
    Ok(summary)
}
