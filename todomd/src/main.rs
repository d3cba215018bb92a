use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flexi_logger::{Logger, LoggerHandle};
use log::{debug, info};
use todomd::core::TodoError;
use todomd::date_math;
use todomd::document::{ParsedDocument, parse_document};
use todomd::projectors::agenda::{self, AgendaOptions};
use todomd::projectors::tree_view::{self, GroupBy, TreeItem};
use todomd::storage::{DocumentSource, FsDocumentSource};
use todomd::{Settings, TextEdit, apply_edits, evaluate, reset_for_new_visit};

#[derive(Debug, Parser)]
#[command(
    name = "todomd",
    about = "Plain-text todo list tooling built on the todomd crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// TOML settings file (indent unit, completion symbol, ...).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse todo files and print their task trees.
    Parse(ParseArgs),

    /// Evaluate a due expression against a date.
    Due(DueArgs),

    /// List tasks that are due or overdue on a date.
    Agenda(AgendaArgs),

    /// Print the task hierarchy or tag / project / context groups.
    Tree(TreeArgs),

    /// Mark missed recurring tasks overdue and reopen them for a new day.
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Todo files or directories containing todo files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DueArgs {
    /// Expression as written inside `{due:...}`.
    expression: String,
    /// Date to evaluate against (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Agenda day (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    json: bool,
    /// Keep completed tasks.
    #[arg(long)]
    include_done: bool,
    /// Keep tasks marked `{h}`.
    #[arg(long)]
    include_hidden: bool,
}

#[derive(Debug, Args)]
struct TreeArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    #[arg(long, value_enum, default_value_t = TreeGroup::Tasks)]
    group: TreeGroup,
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TreeGroup {
    Tasks,
    Tags,
    Projects,
    Contexts,
}

impl From<TreeGroup> for GroupBy {
    fn from(group: TreeGroup) -> Self {
        match group {
            TreeGroup::Tasks => GroupBy::Tasks,
            TreeGroup::Tags => GroupBy::Tags,
            TreeGroup::Projects => GroupBy::Projects,
            TreeGroup::Contexts => GroupBy::Contexts,
        }
    }
}

#[derive(Debug, Args)]
struct ResetArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Day the files were last visited (YYYY-MM-DD).
    #[arg(long)]
    last_visit: NaiveDate,
    /// Day of this visit (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    now: Option<NaiveDate>,
    /// Apply the edits to the files instead of printing them.
    #[arg(long)]
    in_place: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;
    let settings = load_settings(cli.config.as_deref())?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &settings),
        Commands::Due(args) => handle_due(args),
        Commands::Agenda(args) => handle_agenda(args, &settings),
        Commands::Tree(args) => handle_tree(args, &settings),
        Commands::Reset(args) => handle_reset(args, &settings),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose { "debug" } else { "warn" };
    Logger::try_with_env_or_str(level)
        .with_context(|| format!("invalid log level `{level}`"))?
        .log_to_stderr()
        .start()
        .context("starting logger")
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let settings =
        Settings::load(path).with_context(|| format!("loading settings from {:?}", path))?;
    info!("event=settings_loaded path={}", path.display());
    Ok(settings)
}

fn handle_parse(args: ParseArgs, settings: &Settings) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let source = FsDocumentSource::new(settings.clone(), date_math::today());
    let parsed = load_all(&source, &inputs, settings)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a ParsedDocument,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_due(args: DueArgs) -> Result<()> {
    let DueArgs {
        expression,
        date,
        json,
    } = args;
    let date = date.unwrap_or_else(date_math::today);
    let info = evaluate(&expression, date);

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        let mut kind = Vec::new();
        if info.is_recurring {
            kind.push("recurring");
        }
        if info.is_range {
            kind.push("range");
        }
        println!("{:?} on {date} [{}]", info.is_due, kind.join(","));
        if let Some(days) = info.overdue_in_days {
            println!("overdue by {days} day(s)");
        }
        if let (Some(next), Some(days)) = (info.closest_due_date, info.days_until_due) {
            println!("next due {next} (in {days} day(s))");
        }
    }
    Ok(())
}

fn handle_agenda(args: AgendaArgs, settings: &Settings) -> Result<()> {
    let AgendaArgs {
        inputs,
        date,
        json,
        include_done,
        include_hidden,
    } = args;
    let date = date.unwrap_or_else(date_math::today);
    let source = FsDocumentSource::new(settings.clone(), date);
    let parsed = load_all(&source, &inputs, settings)?;

    let opts = AgendaOptions {
        include_done,
        include_hidden,
    };
    let items: Vec<(&PathBuf, agenda::AgendaItem)> = parsed
        .iter()
        .flat_map(|(path, doc)| {
            agenda::project_agenda(doc, date, opts)
                .into_iter()
                .map(move |item| (path, item))
        })
        .collect();

    if items.is_empty() {
        eprintln!("Nothing due on {date}.");
        return Ok(());
    }

    if json {
        let payload: Vec<&agenda::AgendaItem> = items.iter().map(|(_, item)| item).collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, item) in items {
            let marker = if item.done { "x" } else { " " };
            let priority = item
                .priority
                .map(|p| format!("({})", p.0))
                .unwrap_or_default();
            let state = format!("{:?}", item.due.is_due).to_uppercase();
            let breadcrumb = if item.context_path.is_empty() {
                String::new()
            } else {
                format!(" <{}>", item.context_path.join(" / "))
            };
            println!(
                "{}:{} [{marker}] {:<8} {:<3} {}{}",
                path.display(),
                item.line_number + 1,
                state,
                priority,
                item.title,
                breadcrumb
            );
        }
    }
    Ok(())
}

fn handle_tree(args: TreeArgs, settings: &Settings) -> Result<()> {
    let TreeArgs {
        inputs,
        group,
        json,
    } = args;
    let source = FsDocumentSource::new(settings.clone(), date_math::today());
    let parsed = load_all(&source, &inputs, settings)?;

    for (path, doc) in &parsed {
        let items = tree_view::project_tree(doc, group.into());
        if json {
            println!("{}", serde_json::to_string_pretty(&items)?);
            continue;
        }
        if parsed.len() > 1 {
            println!("== {} ==", path.display());
        }
        let mut out = String::new();
        render_tree(&items, 0, &mut out);
        print!("{out}");
    }
    Ok(())
}

fn render_tree(items: &[TreeItem], depth: usize, out: &mut String) {
    for item in items {
        let prefix = "  ".repeat(depth);
        let line = match item {
            TreeItem::TagGroup { name, .. } => format!("#{name}"),
            TreeItem::ProjectGroup { name, .. } => format!("+{name}"),
            TreeItem::ContextGroup { name, .. } => format!("@{name}"),
            TreeItem::TaskNode {
                line_number,
                title,
                done,
                ..
            } => format!(
                "[{}] {title} (line {})",
                if *done { "x" } else { " " },
                line_number + 1
            ),
        };
        out.push_str(&prefix);
        out.push_str(&line);
        out.push('\n');
        render_tree(item.children(), depth + 1, out);
    }
}

fn handle_reset(args: ResetArgs, settings: &Settings) -> Result<()> {
    let ResetArgs {
        inputs,
        last_visit,
        now,
        in_place,
        json,
    } = args;
    let now = match now {
        Some(day) => day.and_time(NaiveTime::default()),
        None => date_math::now(),
    };
    let last_visit = last_visit.and_time(NaiveTime::default());
    let source = FsDocumentSource::new(settings.clone(), now.date());

    let expanded = expand_inputs(&inputs, settings)?;
    if expanded.is_empty() {
        return Err(TodoError::NoActiveDocument)
            .context("no todo files found in the provided inputs");
    }

    let mut report: Vec<(PathBuf, Vec<TextEdit>)> = Vec::new();
    for path in expanded {
        let text = source.read_text(&path)?;
        let edits = reset_text(&text, settings, last_visit, now);
        debug!(
            "event=reset_file path={} edits={}",
            path.display(),
            edits.len()
        );
        if in_place && !edits.is_empty() {
            let updated = apply_edits(&text, &edits)
                .with_context(|| format!("applying edits to {:?}", path))?;
            fs::write(&path, updated.as_bytes()).with_context(|| format!("writing {:?}", path))?;
            println!("Updated {} ({} edit(s))", path.display(), edits.len());
        }
        report.push((path, edits));
    }

    if in_place {
        return Ok(());
    }
    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            edits: &'a [TextEdit],
        }
        let payload: Vec<JsonOutput<'_>> = report
            .iter()
            .map(|(path, edits)| JsonOutput {
                path: path.display().to_string(),
                edits,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, edits) in &report {
            for edit in edits {
                println!(
                    "{}:{} {:?} {}..{} {:?}",
                    path.display(),
                    edit.line_number + 1,
                    edit.kind,
                    edit.range.start,
                    edit.range.end,
                    edit.new_text
                );
            }
        }
    }
    Ok(())
}

/// Run the reset pass over one document's text. A visit on the same day (or before
/// the last one) is skipped so tasks completed today are not reopened.
fn reset_text(
    text: &str,
    settings: &Settings,
    last_visit: NaiveDateTime,
    now: NaiveDateTime,
) -> Vec<TextEdit> {
    if !date_math::is_same_calendar_day(last_visit, now) && now > last_visit {
        let doc = parse_document(text, settings, now.date());
        return reset_for_new_visit(doc.iter(), last_visit, now);
    }
    debug!("event=reset_skipped last_visit={last_visit} now={now}");
    Vec::new()
}

fn load_all(
    source: &impl DocumentSource,
    inputs: &[PathBuf],
    settings: &Settings,
) -> Result<Vec<(PathBuf, ParsedDocument)>> {
    let expanded = expand_inputs(inputs, settings)?;
    if expanded.is_empty() {
        return Err(TodoError::NoActiveDocument)
            .context("no todo files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        debug!("event=load path={}", path.display());
        let doc = source.load_document(&path)?;
        parsed.push((path, doc));
    }
    Ok(parsed)
}

fn has_todo_extension(path: &Path, settings: &Settings) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| settings.accepts_extension(ext))
}

fn expand_inputs(paths: &[PathBuf], settings: &Settings) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("event=scan_dir path={}", canonical.display());
            for file in collect_todo_files(&canonical, settings)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            // Files named explicitly are taken whatever their extension.
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn collect_todo_files(dir: &Path, settings: &Settings) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited, settings)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(
    path: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
    settings: &Settings,
) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited, settings)?;
        }
    } else if metadata.is_file() && has_todo_extension(&canonical, settings) {
        debug!("event=found_file path={}", canonical.display());
        out.push(canonical);
    }
    Ok(())
}
