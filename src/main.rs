mod config;
mod embedder;
mod generator;
mod ingest;
mod offer;
mod refresh;
mod retriever;
mod source;
mod store;

use std::io::Write;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use embedder::{EmbeddingCodec, HashingEmbedder, HttpEmbedder};
use generator::{AnswerGenerator, GeneratorConfig, HttpGenerator};
use refresh::RefreshTracker;
use retriever::MetadataFilter;
use source::HttpOfferSource;
use store::EmbeddingStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    config
        .ensure_data_dir()
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let command = std::env::args().nth(1).unwrap_or_else(|| "chat".to_string());
    match command.as_str() {
        "ingest" => run_ingest(&config),
        "chat" => run_chat(&config),
        other => bail!("unknown command '{other}', expected 'ingest' or 'chat'"),
    }
}

/// Remote codec when an embeddings endpoint is configured, otherwise the
/// local hashing codec. `dimension` comes from the store once established.
fn build_codec(config: &AppConfig, dimension: usize) -> Result<Box<dyn EmbeddingCodec>> {
    match &config.embeddings_url {
        Some(url) => Ok(Box::new(HttpEmbedder::new(
            url.clone(),
            config.embeddings_model.clone(),
            config.api_key.clone(),
            dimension,
            config.request_timeout,
        )?)),
        None => Ok(Box::new(HashingEmbedder::new(dimension))),
    }
}

fn run_ingest(config: &AppConfig) -> Result<()> {
    let source_url = config
        .source_url
        .clone()
        .context("VIE_SCOUT_SOURCE_URL is required for ingestion")?;
    let source = HttpOfferSource::new(source_url, config.request_timeout, config.page_size)
        .context("failed to build offer source client")?;
    let tracker = RefreshTracker::new(config.tracker_path());

    let mut store = EmbeddingStore::load(&config.store_path());
    if store.is_empty() {
        store = EmbeddingStore::with_dimension(config.embedding_dimension);
    }
    let dimension = store.dimension().unwrap_or(config.embedding_dimension);
    let codec = build_codec(config, dimension)?;
    let cancel = AtomicBool::new(false);

    let stats = ingest::run_cycle(
        &source,
        codec.as_ref(),
        &mut store,
        &tracker,
        &config.store_path(),
        config.batch_size,
        &cancel,
    )?;

    println!(
        "Ingested {} offers ({} fetched, {} skipped, {} failed). Store holds {} entries.",
        stats.embedded,
        stats.fetched,
        stats.skipped,
        stats.failed,
        store.len()
    );
    if stats.interrupted {
        println!("Cycle interrupted; the next run resumes from the previous marker.");
    } else if !stats.committed {
        println!("Cycle did not commit; the next run retries from the previous marker.");
    }
    Ok(())
}

fn run_chat(config: &AppConfig) -> Result<()> {
    let store = EmbeddingStore::load(&config.store_path());
    if store.is_empty() {
        println!("The store is empty. Run `vie-scout ingest` first.");
        return Ok(());
    }
    let dimension = store.dimension().unwrap_or(config.embedding_dimension);
    let codec = build_codec(config, dimension)?;
    let generator = match &config.generator_url {
        Some(url) => Some(
            HttpGenerator::new(
                GeneratorConfig {
                    base_url: url.clone(),
                    model: config.generator_model.clone(),
                    api_key: config.api_key.clone(),
                    ..GeneratorConfig::default()
                },
                config.request_timeout,
            )
            .context("failed to build generator client")?,
        ),
        None => None,
    };

    println!(
        "Loaded {} offers. Enter your questions (Ctrl+D to exit).",
        store.len()
    );
    println!("Leading key=value tokens filter on metadata, e.g. `country=Germany data engineer`.");

    loop {
        let mut line = String::new();
        print!("> ");
        std::io::stdout().flush()?;

        if std::io::stdin().read_line(&mut line)? == 0 {
            break; // EOF (Ctrl+D)
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (filter, question) = split_filters(line);
        if question.is_empty() {
            println!("Ask a question after the filters.\n");
            continue;
        }

        let query_vector = match codec.embed(&question) {
            Ok(vector) => vector,
            Err(e) => {
                eprintln!("Error: {e}");
                continue;
            }
        };
        let result = if filter.is_empty() {
            retriever::query(&store, &query_vector, config.top_k)
        } else {
            retriever::query_filtered(&store, &query_vector, config.top_k, &filter)
        };
        let hits = match result {
            Ok(hits) => hits,
            Err(e) => {
                eprintln!("Error: {e}");
                continue;
            }
        };
        if hits.is_empty() {
            println!("No matching offers.\n");
            continue;
        }

        match &generator {
            Some(generator) => {
                print!("\nThinking...");
                std::io::stdout().flush()?;
                match generator.generate(&question, &hits) {
                    Ok(answer) => println!("\r{answer}\n"),
                    Err(e) => eprintln!("\rError: {e}\n"),
                }
            }
            None => {
                println!();
                for hit in &hits {
                    let title = hit
                        .metadata
                        .get("title")
                        .map(String::as_str)
                        .unwrap_or(hit.id.as_str());
                    println!("  {:.3}  {}", hit.score, title);
                }
                println!();
            }
        }
    }

    Ok(())
}

/// Splits leading `key=value` tokens off the question into a metadata
/// filter; the remainder is the question itself.
fn split_filters(input: &str) -> (MetadataFilter, String) {
    let mut filter = MetadataFilter::new();
    let mut rest: Vec<&str> = Vec::new();
    for token in input.split_whitespace() {
        if rest.is_empty() {
            if let Some((key, value)) = token.split_once('=') {
                if !key.is_empty() && !value.is_empty() {
                    filter = filter.require(key, value);
                    continue;
                }
            }
        }
        rest.push(token);
    }
    (filter, rest.join(" "))
}
