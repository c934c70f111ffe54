use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use bizhub_app::{LoggingEmailSender, build_dispatcher};
use bizhub_infra::store::{InMemoryStore, PostgresStore};
use bizhub_infra::{OutboxRelay, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bizhub_observability::init();

    let config = StoreConfig::from_env().context("invalid store configuration")?;
    let dispatcher = build_dispatcher(Arc::new(LoggingEmailSender));

    let ctx = CancellationToken::new();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        shutdown.cancel();
    });

    if config.use_persistent_stores {
        let store = PostgresStore::connect(&config)
            .await
            .context("failed to connect to Postgres")?;
        store.ensure_schema().await.context("failed to apply schema")?;

        OutboxRelay::from_config(store, dispatcher, &config)
            .run(&ctx, config.outbox_poll_interval)
            .await;
    } else {
        tracing::warn!("USE_PERSISTENT_STORES is not set; relaying a process-local in-memory outbox");
        OutboxRelay::from_config(InMemoryStore::new(), dispatcher, &config)
            .run(&ctx, config.outbox_poll_interval)
            .await;
    }

    Ok(())
}
