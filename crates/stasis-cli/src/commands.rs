use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use stasis_engine::{SaveIndex, SaveSlots, SCOPE_CONTEXT_KEY};
use stasis_store::{PayloadError, RecordStore, StoreConfig, StoreMetadata};
use stasis_types::ScopeContext;
use tracing::debug;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = store_config(&cli)?;
    debug!(
        backend = %config.backend,
        compression = %config.compression,
        obfuscate = config.obfuscate,
        "store configuration"
    );
    let format = cli.format;
    match cli.command {
        Command::Init(args) => cmd_init(config, args).await,
        Command::Inspect(args) => cmd_inspect(config, args, format).await,
        Command::Keys(args) => cmd_keys(config, args, format).await,
        Command::Show(args) => cmd_show(config, args, format).await,
        Command::Copy(args) => cmd_copy(config, args).await,
        Command::Slots(args) => cmd_slots(args, format),
    }
}

/// Settings from `--config`, overridden by flags.
pub fn store_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => StoreConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(compression) = cli.compression {
        config.compression = compression;
    }
    if cli.obfuscate {
        config.obfuscate = true;
    }
    if let Some(tag) = &cli.build_tag {
        config.build_tag = tag.clone();
    }
    Ok(config)
}

async fn open(config: StoreConfig, path: &Path) -> anyhow::Result<RecordStore> {
    if !path.is_file() {
        bail!("no save file at {}", path.display());
    }
    let store = RecordStore::new(config)?;
    store
        .load(path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------
// Commands
// ---------------------------------------------------------------

async fn cmd_init(config: StoreConfig, args: InitArgs) -> anyhow::Result<()> {
    if args.path.exists() {
        if !args.force {
            bail!("{} already exists (use --force to replace it)", args.path.display());
        }
        fs::remove_file(&args.path)
            .with_context(|| format!("removing {}", args.path.display()))?;
    }
    let backend = config.backend;
    let store = RecordStore::new(config)?;
    store.load(&args.path).await?;
    store.commit().await?;
    println!(
        "{} Initialized save file {} ({} backend)",
        "✓".green().bold(),
        args.path.display().to_string().bold(),
        backend.to_string().cyan()
    );
    Ok(())
}

#[derive(Serialize)]
struct Inspection {
    path: PathBuf,
    metadata: Option<StoreMetadata>,
    records: usize,
    objects: usize,
    parts: usize,
    assets: usize,
    kinds: BTreeMap<String, usize>,
    scopes: Option<ScopeContext>,
}

async fn cmd_inspect(config: StoreConfig, args: InspectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let store = open(config, &args.path).await?;
    let index = SaveIndex::read(&store)?;

    let mut kinds = BTreeMap::new();
    for key in store.keys()? {
        let payload = store.get_payload(&key)?;
        *kinds.entry(payload.kind().to_string()).or_insert(0) += 1;
    }

    let inspection = Inspection {
        path: args.path,
        metadata: store.metadata(),
        records: store.len(),
        objects: index.objects.len(),
        parts: index.parts.len(),
        assets: index.assets.len(),
        kinds,
        scopes: store.try_get::<ScopeContext>(SCOPE_CONTEXT_KEY)?,
    };

    if format == OutputFormat::Json {
        return print_json(&inspection);
    }

    println!("Save file {}", inspection.path.display().to_string().bold());
    match &inspection.metadata {
        Some(meta) => {
            println!("  Format: {}", meta.format.cyan());
            println!("  Build: {}", meta.build_tag.yellow());
            println!("  Modified: {}", meta.modified_at.to_rfc3339());
        }
        None => println!("  {}", "not yet written".dimmed()),
    }
    println!("  Records: {}", inspection.records.to_string().bold());
    println!(
        "  Indexed: {} objects, {} parts, {} assets",
        inspection.objects, inspection.parts, inspection.assets
    );
    for (kind, count) in &inspection.kinds {
        println!("    {kind}: {count}");
    }
    if let Some(scopes) = &inspection.scopes {
        let loaded: Vec<_> = scopes.loaded.iter().map(ToString::to_string).collect();
        println!("  Scopes: {}", loaded.join(", "));
        if let Some(active) = &scopes.active {
            println!("  Active scope: {}", active.to_string().green());
        }
    }
    Ok(())
}

async fn cmd_keys(config: StoreConfig, args: KeysArgs, format: OutputFormat) -> anyhow::Result<()> {
    let store = open(config, &args.path).await?;
    let keys: Vec<String> = store
        .keys()?
        .into_iter()
        .filter(|key| args.prefix.as_deref().map_or(true, |p| key.starts_with(p)))
        .collect();

    if format == OutputFormat::Json {
        return print_json(&keys);
    }
    for key in &keys {
        let payload = store.get_payload(key)?;
        println!("{}  {}", key, payload.token().to_string().dimmed());
    }
    if keys.is_empty() {
        println!("No records.");
    }
    Ok(())
}

async fn cmd_show(config: StoreConfig, args: ShowArgs, format: OutputFormat) -> anyhow::Result<()> {
    let store = open(config, &args.path).await?;
    let payload = store.get_payload(&args.key)?;

    let value = match payload.to_json() {
        Ok(value) => value,
        Err(PayloadError::Opaque { token }) => {
            bail!("record {} is a binary {token} payload and has no JSON view", args.key)
        }
        Err(e) => return Err(e.into()),
    };

    if format == OutputFormat::Json {
        return print_json(&value);
    }
    println!(
        "{} {} ({})",
        args.key.yellow().bold(),
        payload.token().to_string().cyan(),
        payload.kind()
    );
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn cmd_copy(config: StoreConfig, args: CopyArgs) -> anyhow::Result<()> {
    let store = open(config, &args.source).await?;
    let written = store.copy_to(&args.destination).await?;
    println!(
        "{} Copied {} into {} ({} records)",
        "✓".green().bold(),
        args.source.display(),
        args.destination.display().to_string().bold(),
        written
    );
    Ok(())
}

#[derive(Serialize)]
struct SlotRow {
    name: String,
    path: PathBuf,
    modified: DateTime<Utc>,
    size: u64,
}

fn cmd_slots(args: SlotsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let slots = SaveSlots::new(&args.dir).with_extension(args.extension);
    let rows: Vec<SlotRow> = slots
        .list()?
        .into_iter()
        .map(|entry| SlotRow {
            name: entry.name,
            path: entry.path,
            modified: entry.modified.into(),
            size: entry.size,
        })
        .collect();

    if format == OutputFormat::Json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No saves in {}.", args.dir.display());
    }
    for row in &rows {
        println!(
            "{}  {}  {} bytes",
            row.name.yellow(),
            row.modified.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            row.size
        );
    }
    Ok(())
}
