//! The `vecdex` CLI (§10.4): `partition` / `index` / `query` / `drop plan` /
//! `drop apply` subcommands over the partitioning engine and indexing core,
//! dispatched from a small static table of subcommand handlers.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vecdex_core::registry::JsonRegistry;
use vecdex_core::token::WhitespaceTokenCounter;
use vecdex_core::vector_store::QueryRequest;
use vecdex_core::{Registry, TokenCounter, VectorStoreClient};
use vecdex_index::{
    apply_drop, build_query_config, plan_drop, ApplyOptions, BatchIndexer, DropRequest, E2eRecorder, E2eSink,
    HttpVectorStoreClient, IndexSourceSpec, IndexingPolicy, QueryClient, ResumeStateStore, SampleSink, TruncationStrategy,
};
use vecdex_partition::manifest::Manifest;
use vecdex_partition::partition_writer::{PartitionWriter, PartitionWriterConfig, SourceSpec};
use vecdex_partition::csv_reader::CsvSourceConfig;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "vecdex")]
#[command(about = "Incremental CSV-to-vector-index partitioning, indexing and fan-out query engine")]
struct Args {
    /// Layered run configuration file (YAML or JSON), §10.3.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Optional `host:port` to expose a Prometheus `/metrics` + `/healthz`
    /// endpoint on for the duration of the command (§10 ambient stack).
    #[arg(long, global = true)]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the partitioning engine: ingest configured sources, carry over
    /// unaffected data, and append new partitions to the manifest (§4.4).
    Partition,
    /// Run the batch indexer over every non-stale partition's record-type
    /// CSVs (§4.5).
    Index {
        /// Reservoir-sample up to this many indexed documents for offline
        /// audit (§4.11). Zero disables sampling.
        #[arg(long, default_value_t = 0)]
        e2e_sample_size: usize,
        /// Where to write the e2e sample JSON array; required if
        /// `--e2e-sample-size` is non-zero.
        #[arg(long)]
        e2e_output: Option<PathBuf>,
    },
    /// Fan out a semantic query across the collections relevant to the
    /// requested record types (§4.9).
    Query {
        /// Query text, embedded by the vector-store's configured embedding
        /// function.
        text: String,
        #[arg(long, default_value_t = 10)]
        n_results: usize,
        /// Record types to restrict the fan-out to; omit for every known
        /// collection.
        #[arg(long = "model")]
        models: Vec<String>,
    },
    /// Build or apply a drop plan against the manifest (§4.12).
    Drop {
        #[command(subcommand)]
        action: DropAction,
    },
}

#[derive(Subcommand, Debug)]
enum DropAction {
    /// Compute what a drop request would remove, without mutating anything.
    Plan {
        #[arg(long = "model")]
        record_types: Vec<String>,
        #[arg(long)]
        before: Option<String>,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        /// Where to write the computed plan as JSON.
        #[arg(long)]
        output: PathBuf,
    },
    /// Apply a previously computed plan.
    Apply {
        /// Plan file produced by `drop plan`.
        plan: PathBuf,
        #[arg(long)]
        remove_local: bool,
        #[arg(long)]
        performed_by: Option<String>,
        /// Dry run: report what would happen without mutating the manifest.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Some(addr) = args.metrics_addr {
        spawn_metrics_endpoint(addr);
    }

    let app_config = AppConfig::load(args.config.as_deref()).context("loading run configuration")?;

    let result = match args.command {
        Command::Partition => run_partition(&app_config).await,
        Command::Index { e2e_sample_size, e2e_output } => run_index(&app_config, e2e_sample_size, e2e_output).await,
        Command::Query { text, n_results, models } => run_query(&app_config, text, n_results, models).await,
        Command::Drop { action } => run_drop(&app_config, action).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "vecdex: command failed");
    }
    result
}

fn spawn_metrics_endpoint(addr: std::net::SocketAddr) {
    use axum::{routing::get, Router};

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let handle = match builder.install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "vecdex: failed to install the metrics recorder, continuing without one");
            return;
        }
    };

    tokio::spawn(async move {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/metrics", get(move || { let handle = handle.clone(); async move { handle.render() } }));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "vecdex: metrics endpoint listening");
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(error = %e, "vecdex: metrics endpoint stopped");
                }
            }
            Err(e) => warn!(error = %e, %addr, "vecdex: failed to bind metrics endpoint"),
        }
    });
}

fn load_registry(path: &std::path::Path) -> Result<JsonRegistry> {
    let data = std::fs::read_to_string(path).with_context(|| format!("reading registry file {}", path.display()))?;
    let registry = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        JsonRegistry::from_json(&data)?
    } else {
        JsonRegistry::from_yaml(&data)?
    };
    Ok(registry)
}

fn csv_config(header_row: &str, malformed_column: Option<usize>) -> CsvSourceConfig {
    let policy = vecdex_partition::csv_reader::HeaderRowPolicy::parse(header_row)
        .unwrap_or(vecdex_partition::csv_reader::HeaderRowPolicy::All);
    CsvSourceConfig {
        delimiter: b',',
        header_row: policy,
        malformed_column,
    }
}

async fn run_partition(config: &AppConfig) -> Result<()> {
    let registry = load_registry(&config.registry_path)?;
    let manifest = Manifest::load(&config.manifest_path)?;

    let sources: Vec<SourceSpec> = config
        .sources
        .iter()
        .map(|s| SourceSpec {
            record_type: s.record_type.clone(),
            template: s.template.clone(),
            target_to_source: s.target_to_source.clone(),
            drop_na_columns: s.drop_na_columns.clone(),
            csv_config: csv_config(&config.header_row, s.malformed_column),
        })
        .collect();

    let run_id = uuid::Uuid::new_v4().to_string();
    let writer_config = PartitionWriterConfig {
        partition_root: config.partition_root.clone(),
        directory_size: config.directory_size,
        run_id: run_id.clone(),
    };

    info!(run_id = %run_id, sources = sources.len(), "vecdex: starting partition run");
    let writer = PartitionWriter::open(writer_config, manifest)?;
    let (manifest, outcome) = writer.run(&sources, &registry)?;
    manifest.save(&config.manifest_path)?;

    info!(
        partitions_created = outcome.partitions_created.len(),
        partitions_marked_stale = outcome.partitions_marked_stale.len(),
        rows_carried_over = outcome.rows_carried_over,
        rows_ingested = outcome.rows_ingested,
        "vecdex: partition run complete"
    );
    Ok(())
}

async fn run_index(config: &AppConfig, e2e_sample_size: usize, e2e_output: Option<PathBuf>) -> Result<()> {
    if e2e_sample_size > 0 && e2e_output.is_none() {
        anyhow::bail!("--e2e-output is required when --e2e-sample-size is non-zero");
    }

    let registry = load_registry(&config.registry_path)?;
    let manifest = Manifest::load(&config.manifest_path)?;
    let strategy: vecdex_core::CollectionStrategy = config.collection_strategy.clone().into();

    let address = config.store.clone().into_address(std::env::var("VECDEX_STORE_API_KEY").ok())?;
    let store = Arc::new(HttpVectorStoreClient::new(address)?);

    let token_counter: Box<dyn TokenCounter> = Box::new(WhitespaceTokenCounter);
    let truncation_strategy = TruncationStrategy::parse(&config.indexing.truncation_strategy).unwrap_or(TruncationStrategy::Auto);
    let policy = IndexingPolicy {
        max_docs_per_request: config.indexing.max_docs_per_request,
        max_tokens_per_request: config.indexing.max_tokens_per_request,
        token_safety_limit: config.indexing.token_safety_limit,
        document_size_limit: config.indexing.document_size_limit,
        embedding_token_limit: config.indexing.embedding_token_limit,
        configured_batch_size: config.indexing.configured_batch_size,
        truncation_strategy,
    };
    if !policy.is_valid() {
        anyhow::bail!("indexing policy is misconfigured (token_safety_limit/max_docs_per_request out of range)");
    }

    let mut recorder = E2eRecorder::new(e2e_sample_size, 0);

    // Mirrors the cancellation-token idiom used elsewhere in this codebase's
    // ancestry: one token, cancelled from a dedicated signal-watching task,
    // checked between flushes rather than threaded through every await point.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    'partitions: for partition in manifest.non_stale_partitions() {
        // `partition.dir` is already the full path the partition writer
        // created it under (`partition_root` joined in), not relative.
        let partition_dir = PathBuf::from(&partition.dir);
        let collection_name = strategy.collection_name(Some(&partition.name))?;
        let collection = store.get_or_create_collection(&collection_name).await?;

        for (record_type_name, entry) in &partition.models {
            if entry.deleted {
                continue;
            }
            let Some(record_type) = registry.record_type(record_type_name) else {
                warn!(record_type = %record_type_name, "vecdex index: record type missing from registry, skipping");
                continue;
            };

            let indexer = BatchIndexer {
                policy: policy.clone(),
                token_counter: token_counter.as_ref(),
                compactor: None,
                resume_store: ResumeStateStore::new(partition_dir.clone(), collection_name.clone()),
                errors_dir: partition_dir.join("errors"),
            };
            let source = IndexSourceSpec {
                record_type: record_type_name.clone(),
                csv_path: config.partition_root.join(&entry.path),
                partition_name: Some(partition.name.clone()),
                schema_version: Some(entry.schema_version),
                truncation_override: None,
            };

            let mut unit_sink = ();
            let mut e2e_sink = if e2e_sample_size > 0 {
                Some(E2eSink {
                    recorder: &mut recorder,
                    record_type: record_type_name.clone(),
                    source_path: source.csv_path.display().to_string(),
                })
            } else {
                None
            };
            let sink: &mut dyn SampleSink = match &mut e2e_sink {
                Some(s) => s,
                None => &mut unit_sink,
            };

            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("vecdex index: shutdown signal received, stopping between record types");
                    break 'partitions;
                }
                result = indexer.index_record_type(&source, record_type, collection.clone(), sink) => result?,
            };

            info!(
                partition = %partition.name,
                record_type = %record_type_name,
                documents_indexed = report.documents_indexed,
                documents_dropped_oversize = report.documents_dropped_oversize,
                skipped_complete = report.skipped_complete,
                "vecdex index: record type complete"
            );
        }
    }

    if e2e_sample_size > 0 {
        if let Some(output) = e2e_output {
            recorder.finish(&output);
            info!(samples = recorder.len(), path = %output.display(), "vecdex index: e2e samples written");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_query(config: &AppConfig, text: String, n_results: usize, models: Vec<String>) -> Result<()> {
    let query_config = build_query_config(&config.partition_root).context("building query config from resume state")?;
    let address = config.store.clone().into_address(std::env::var("VECDEX_STORE_API_KEY").ok())?;
    let store: Arc<dyn vecdex_core::VectorStoreClient> = Arc::new(HttpVectorStoreClient::new(address.clone())?);

    let mut client = QueryClient::new(store, query_config, address);
    client.connect()?;

    let models = if models.is_empty() { None } else { Some(models) };
    let request = QueryRequest {
        query_texts: Some(vec![text]),
        n_results,
        ..Default::default()
    };
    let result = client.query(models.as_deref(), request, n_results).await?;

    if !result.failed_collections.is_empty() {
        warn!(failed = ?result.failed_collections, "vecdex query: some collections failed and were skipped");
    }
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "matches": result.matches.iter().map(|m| serde_json::json!({
            "id": m.id,
            "distance": m.distance,
            "collection": m.collection,
            "document": m.document,
            "metadata": m.metadata,
        })).collect::<Vec<_>>(),
        "failed_collections": result.failed_collections,
    }))?);
    Ok(())
}

async fn run_drop(config: &AppConfig, action: DropAction) -> Result<()> {
    match action {
        DropAction::Plan {
            record_types,
            before,
            after,
            reason,
            output,
        } => {
            let manifest = Manifest::load(&config.manifest_path)?;
            let request = DropRequest {
                record_types,
                before,
                after,
                reason,
            };
            let drop_plan = plan_drop(&manifest, &request);
            let data = serde_json::to_vec_pretty(&serde_json::json!({
                "request": request,
                "plan": drop_plan,
            }))?;
            std::fs::write(&output, data).with_context(|| format!("writing drop plan to {}", output.display()))?;
            info!(
                partitions = drop_plan.total_partitions(),
                empty = drop_plan.is_empty(),
                path = %output.display(),
                "vecdex drop plan: written"
            );
            Ok(())
        }
        DropAction::Apply {
            plan,
            remove_local,
            performed_by,
            dry_run,
        } => {
            let data = std::fs::read_to_string(&plan).with_context(|| format!("reading drop plan {}", plan.display()))?;
            let parsed: serde_json::Value = serde_json::from_str(&data)?;
            let request: DropRequest = serde_json::from_value(parsed["request"].clone())?;
            let drop_plan: vecdex_index::DropPlan = serde_json::from_value(parsed["plan"].clone())?;

            let mut manifest = Manifest::load(&config.manifest_path)?;
            let options = ApplyOptions {
                apply_changes: !dry_run,
                remove_local,
                performed_by,
                partition_root: config.partition_root.clone(),
            };
            // `apply_drop` appends the manifest's `drops` log entry itself,
            // exactly once, only when changes were actually applied (§4.12)
            // — it is not repeated here.
            let results = apply_drop(&mut manifest, &drop_plan, &request, &options)?;

            if !dry_run {
                manifest.save(&config.manifest_path)?;
            }

            info!(dry_run, dropped = results.len(), "vecdex drop apply: complete");
            Ok(())
        }
    }
}
