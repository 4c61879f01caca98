use clap::Parser;
use docrag::{
    ConfigDb, DataDir, Error, RagConfig, RagPipeline, Result,
    chunking::{self, ChunkOptions, ChunkStrategy},
    citation::CitationFormat,
    embedding_cache::EmbeddingCache,
    ingestion::{self, SourceDocument},
    query_expansion::QueryExpander,
    walker,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use kdam::{BarExt, tqdm};
use serde_json::{Value, json};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{
    CacheAction, ChunkArgs, Cli, Command, ConfigAction, EmbedArgs,
    ExpandArgs, SearchArgs,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    let config = load_config(&cli, &data_dir, &config_db)?;

    match &cli.command {
        Command::Chunk(args) => cmd_chunk(&config, args)?,
        Command::Search(args) => {
            cmd_search(config, &data_dir, args, cli.quiet)?;
        }
        Command::Expand(args) => cmd_expand(args)?,
        Command::Embed(args) => cmd_embed(config, &data_dir, args)?,
        Command::Cache { action } => match action {
            CacheAction::Status { json } => {
                cache_status(&config, &data_dir, *json)?;
            }
            CacheAction::Clear => cache_clear(&config, &data_dir)?,
        },
        Command::Config { action } => {
            let user = cli.user.as_deref();
            match action {
                ConfigAction::Show { json } => config_show(&config, *json)?,
                ConfigAction::Set { key, value } => {
                    config_set(&config_db, config, user, key, value)?;
                }
                ConfigAction::Get { key, stored } => {
                    if *stored {
                        config_get_stored(&config_db, user, key)?;
                    } else {
                        config_get(&config, key)?;
                    }
                }
                ConfigAction::Clear { key } => {
                    config_clear(&config_db, user, key.as_deref())?;
                }
            }
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Layered configuration with the global CLI flags applied last.
fn load_config(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
) -> Result<RagConfig> {
    let mut config = RagConfig::load(
        cli.config_file.as_deref(),
        data_dir,
        Some(config_db),
        cli.user.as_deref(),
    )?;
    if let Some(model) = &cli.model {
        config.embedding.model = Some(model.clone());
    }
    Ok(config)
}

fn cmd_chunk(config: &RagConfig, args: &ChunkArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.path)?;
    let doc = SourceDocument::new(
        args.path.to_string_lossy(),
        args.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase),
        text,
    );

    let options = ChunkOptions {
        chunk_size: args.size.unwrap_or(config.chunking.chunk_size),
        chunk_overlap: args.overlap.unwrap_or(config.chunking.chunk_overlap),
        strategy: args
            .strategy
            .as_deref()
            .map(ChunkStrategy::parse_lossy)
            .unwrap_or(config.chunking.strategy),
        file_type: doc.file_type.clone(),
    };
    let chunks = chunking::chunk_text(&doc.text, &options, &doc.metadata());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
    } else if chunks.is_empty() {
        println!("No chunks.");
    } else {
        for chunk in &chunks {
            println!(
                "--- chunk {} [{}..{}] ({} chars) ---",
                chunk.chunk_id,
                chunk.start_char,
                chunk.end_char,
                chunk.end_char - chunk.start_char
            );
            println!("{}", chunk.content);
        }
    }
    Ok(())
}

fn cmd_search(
    mut config: RagConfig,
    data_dir: &DataDir,
    args: &SearchArgs,
    quiet: bool,
) -> Result<()> {
    if let Some(count) = args.count {
        config.retrieval.top_k = count;
    }
    if let Some(method) = &args.method {
        config.retrieval.method = method.parse()?;
    }
    if let Some(method) = &args.rerank {
        config.rerank.method = method.parse()?;
    }
    if let Some(format) = &args.format {
        config.citation.format = CitationFormat::parse(format)?;
    }
    if let Some(min_score) = args.min_score {
        config.retrieval.min_score = min_score;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.context.max_tokens = max_tokens;
    }
    if args.compress {
        config.context.use_compression = true;
    }
    if args.no_references {
        config.citation.include_references = false;
    }

    let filter = build_filter(&args.globs)?;
    let files = walker::discover_all(&args.paths, filter.as_ref())?;
    let documents = ingestion::load_documents(&files);
    if documents.is_empty() {
        println!("No documents found.");
        return Ok(());
    }

    let mut pipeline = RagPipeline::from_config(config, Some(data_dir))?;
    let mut pb = tqdm!(desc = "Embedding", unit = " chunks", disable = quiet);
    let summary = pipeline.index_documents_with_progress(&documents, |n| {
        if let Err(e) = pb.update(n) {
            debug!(error = %e, "progress bar update failed");
        }
    });
    pb.refresh()?;
    if !quiet {
        eprintln!();
    }
    info!(
        documents = summary.documents,
        chunks = summary.chunks,
        "corpus ready"
    );

    let response = pipeline.answer_context(&args.query);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if response.results.is_empty() {
        println!("No results.");
    } else {
        println!("{}", response.context);
    }
    Ok(())
}

fn build_filter(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| {
            Error::Config(format!("invalid glob pattern: {e}"))
        })?);
    }
    let set = builder
        .build()
        .map_err(|e| Error::Config(format!("invalid glob pattern: {e}")))?;
    Ok(Some(set))
}

fn cmd_expand(args: &ExpandArgs) -> Result<()> {
    let variants = QueryExpander.expand(&args.query, args.count);
    let hyde = args.hyde.then(|| QueryExpander.hyde(&args.query));

    if args.json {
        let mut out = json!({ "query": args.query, "variants": variants });
        if let Some(hyde) = hyde {
            out["hyde"] = Value::String(hyde);
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for variant in &variants {
            println!("{variant}");
        }
        if let Some(hyde) = hyde {
            println!();
            println!("{hyde}");
        }
    }
    Ok(())
}

fn cmd_embed(
    config: RagConfig,
    data_dir: &DataDir,
    args: &EmbedArgs,
) -> Result<()> {
    let use_cache = config.embedding.use_cache && !args.no_cache;
    let pipeline = RagPipeline::from_config(config, Some(data_dir))?;
    let embedder = pipeline.embedder();
    let vector = embedder.embed(&args.text, use_cache).ok_or_else(|| {
        Error::Embedding {
            provider: embedder.model_name().to_string(),
            message: "no embedding returned".to_string(),
        }
    })?;

    if args.json {
        let out = json!({
            "model": embedder.model_name(),
            "dimensions": vector.len(),
            "embedding": vector,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("model: {}", embedder.model_name());
        println!("dimensions: {}", vector.len());
        let head: Vec<String> =
            vector.iter().take(8).map(|v| format!("{v:.4}")).collect();
        let more = if vector.len() > head.len() { ", ..." } else { "" };
        println!("vector: [{}{more}]", head.join(", "));
    }
    Ok(())
}

fn cache_status(
    config: &RagConfig,
    data_dir: &DataDir,
    json: bool,
) -> Result<()> {
    let kind = config.embedding.cache_backend;
    let cache = EmbeddingCache::open(kind, data_dir)?;
    let stats = cache.stats()?;
    let location = cache.backend().location();

    if json {
        let out = json!({
            "backend": kind.as_str(),
            "location": location,
            "entries": stats.entries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("backend: {}", kind.as_str());
        println!("location: {location}");
        println!("entries: {}", stats.entries);
    }
    Ok(())
}

fn cache_clear(config: &RagConfig, data_dir: &DataDir) -> Result<()> {
    let cache = EmbeddingCache::open(config.embedding.cache_backend, data_dir)?;
    let removed = cache.clear()?;
    println!("Removed {removed} cached embeddings");
    Ok(())
}

fn config_show(config: &RagConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        for key in config.keys()? {
            let value = config.get_setting(&key)?;
            println!("{key} = {}", display_value(&value));
        }
    }
    Ok(())
}

/// Validate `key = value` against the effective configuration, then store
/// it globally or for `user`.
fn config_set(
    config_db: &ConfigDb,
    mut config: RagConfig,
    user: Option<&str>,
    key: &str,
    value: &str,
) -> Result<()> {
    config.apply_setting(key, value)?;
    match user {
        Some(user) => config_db.set_user_setting(user, key, value)?,
        None => config_db.set_setting(key, value)?,
    }
    println!("Set {key} = {}", display_value(&config.get_setting(key)?));
    Ok(())
}

fn config_get(config: &RagConfig, key: &str) -> Result<()> {
    println!("{}", display_value(&config.get_setting(key)?));
    Ok(())
}

/// Print the raw override stored for `key`, without layering.
fn config_get_stored(
    config_db: &ConfigDb,
    user: Option<&str>,
    key: &str,
) -> Result<()> {
    let value = match user {
        Some(user) => config_db.get_user_setting(user, key)?,
        None => config_db.get_setting(key)?,
    };
    let value = value.ok_or_else(|| Error::NotFound {
        kind: "stored setting",
        name: key.to_string(),
    })?;
    println!("{value}");
    Ok(())
}

fn config_clear(
    config_db: &ConfigDb,
    user: Option<&str>,
    key: Option<&str>,
) -> Result<()> {
    if let Some(key) = key {
        let removed = match user {
            Some(user) => config_db.remove_user_setting(user, key)?,
            None => config_db.remove_setting(key)?,
        };
        if !removed {
            return Err(Error::NotFound {
                kind: "stored setting",
                name: key.to_string(),
            });
        }
        println!("Removed {key}");
        return Ok(());
    }

    let removed = match user {
        Some(user) => config_db.clear_user_settings(user)?,
        None => {
            let settings = config_db.list_settings()?;
            for (key, _) in &settings {
                config_db.remove_setting(key)?;
            }
            settings.len()
        }
    };
    println!("Removed {removed} stored settings");
    Ok(())
}

/// Strings print bare, everything else as JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "(unset)".to_string(),
        other => other.to_string(),
    }
}
