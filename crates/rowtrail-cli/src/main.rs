mod logging;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use rowtrail_engine::{Config, Handler, Sink, Supervisor};
use rowtrail_reader::{PostgresReader, PostgresReaderConfig, TableFilter};
use rowtrail_store::{AuditStore, MongoStore};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "rowtrail",
    version,
    about = "Captures committed row changes from a replication log into an audit store"
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Optional key-value file; real environment variables win.
    let _ = dotenvy::dotenv();

    logging::init(&cli.log_level);

    let config = Config::from_env().context("load configuration")?;
    let source_id = config.source_id();
    tracing::info!(source = %source_id, "starting rowtrail");

    let store = MongoStore::connect(
        &config.store.uri,
        &config.store.database,
        &config.store.events_collection,
        &config.store.offsets_collection,
    )
    .await
    .context("connect to the audit store")?;
    let store: Arc<dyn AuditStore> = Arc::new(store);

    let sink = Arc::new(Sink::new(store.clone(), source_id));

    let filter = TableFilter::new(
        config.source.include.as_deref(),
        config.source.exclude.as_deref(),
    )
    .context("compile table filter")?;

    let mut reader_config = PostgresReaderConfig::new(
        config.source.host.clone(),
        config.source.port,
        config.source.user.clone(),
        config.source.password.clone(),
        config.source.database.clone(),
    );
    reader_config.application_name = format!("rowtrail-{}", config.source.client_id);
    reader_config.slot = config.source.slot.clone();
    reader_config.publication = config.source.publication.clone();
    let reader = PostgresReader::new(reader_config, filter).with_commit_feed(sink.commit_feed());

    let handler = Arc::new(tokio::sync::Mutex::new(Handler::new(
        sink.clone(),
        config.pipeline.timezone,
        config.pipeline.batch_size,
        CancellationToken::new(),
    )));

    Supervisor::new(store, sink, handler, Box::new(reader))
        .with_flush_timeout(config.pipeline.flush_timeout)
        .run()
        .await
}
