//! Store and collaborator wiring.
//!
//! `USE_PERSISTENT_STORES=true` selects the Postgres stores (schema applied at
//! startup); otherwise everything lives in process memory. Outbound
//! collaborators fall back to their in-process stand-ins when unconfigured.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use artforge_auth::WebhookVerifier;
use artforge_events::NotificationHub;
use artforge_infra::config::AppConfig;
use artforge_infra::external::{
    HTTP_TIMEOUT, HttpJobProvider, HttpObjectStorage, InMemoryObjectStorage, JobProvider,
    NoopTitleGenerator, ObjectStorage, OpenAiTitleGenerator, StubJobProvider, TitleGenerator,
};
use artforge_infra::ledger::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use artforge_infra::lifecycle::{LifecycleParts, PredictionLifecycle, TransitionHandler};
use artforge_infra::predictions::{
    InMemoryPredictionStore, PostgresPredictionStore, PredictionStore,
};
use artforge_infra::tasks::{
    InMemoryTaskQueue, PostgresTaskQueue, TaskQueue, TaskWorker, TaskWorkerConfig,
};
use artforge_infra::works::{InMemoryWorkArchive, PostgresWorkArchive, WorkArchive};
use artforge_infra::{db, schema};

const MAX_DB_CONNECTIONS: u32 = 10;

/// Shared state behind every handler.
pub struct AppServices {
    pub lifecycle: Arc<PredictionLifecycle>,
    pub hub: NotificationHub,
    /// Direct ledger access for seeding codes; requests go through the lifecycle.
    pub ledger: Arc<dyn LedgerStore>,
    pub tasks: Arc<dyn TaskQueue>,
}

struct Stores {
    ledger: Arc<dyn LedgerStore>,
    predictions: Arc<dyn PredictionStore>,
    works: Arc<dyn WorkArchive>,
    tasks: Arc<dyn TaskQueue>,
}

/// Wire stores, collaborators and the lifecycle; returns the services plus
/// the (not yet spawned) transition worker.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<(AppServices, TaskWorker)> {
    let stores = if config.use_persistent_stores {
        build_persistent_stores(config).await?
    } else {
        info!("using in-memory stores");
        build_in_memory_stores()
    };

    let provider: Arc<dyn JobProvider> = match &config.provider {
        Some(p) => Arc::new(
            HttpJobProvider::new(&p.base_url, p.api_token.clone(), HTTP_TIMEOUT)
                .context("failed to build provider client")?,
        ),
        None => Arc::new(StubJobProvider::new()),
    };
    let storage: Arc<dyn ObjectStorage> = match &config.storage {
        Some(s) => Arc::new(
            HttpObjectStorage::new(&s.base_url, s.api_token.clone(), HTTP_TIMEOUT)
                .context("failed to build storage client")?,
        ),
        None => Arc::new(InMemoryObjectStorage::new()),
    };
    let titles: Arc<dyn TitleGenerator> = match &config.titles {
        Some(t) => Arc::new(
            OpenAiTitleGenerator::new(&t.api_url, t.api_key.clone(), t.model.clone(), HTTP_TIMEOUT)
                .context("failed to build title client")?,
        ),
        None => Arc::new(NoopTitleGenerator),
    };

    let hub = NotificationHub::new();
    let lifecycle = Arc::new(
        PredictionLifecycle::new(LifecycleParts {
            ledger: stores.ledger.clone(),
            predictions: stores.predictions,
            works: stores.works,
            tasks: stores.tasks.clone(),
            provider,
            storage,
            titles,
            events: Arc::new(hub.clone()),
            verifier: WebhookVerifier::new(config.webhook_secret.clone()),
            catalog: config.catalog.clone(),
            public_base_url: config.public_base_url.clone(),
        })
        .with_retry_policy(config.retry_policy()),
    );

    let worker = TaskWorker::new(
        stores.tasks.clone(),
        Arc::new(TransitionHandler::new(lifecycle.clone())),
        TaskWorkerConfig::default().with_poll_interval(config.worker_poll_interval),
    )
    .with_waker(lifecycle.waker());

    Ok((
        AppServices {
            lifecycle,
            hub,
            ledger: stores.ledger,
            tasks: stores.tasks,
        },
        worker,
    ))
}

fn build_in_memory_stores() -> Stores {
    Stores {
        ledger: InMemoryLedgerStore::arc(),
        predictions: InMemoryPredictionStore::arc(),
        works: InMemoryWorkArchive::arc(),
        tasks: InMemoryTaskQueue::arc(),
    }
}

async fn build_persistent_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = db::connect(database_url, MAX_DB_CONNECTIONS)
        .await
        .context("failed to connect to Postgres")?;
    schema::apply(&pool).await.context("failed to apply schema")?;
    info!("using Postgres stores");

    Ok(Stores {
        ledger: Arc::new(PostgresLedgerStore::new(pool.clone())),
        predictions: Arc::new(PostgresPredictionStore::new(pool.clone())),
        works: Arc::new(PostgresWorkArchive::new(pool.clone())),
        tasks: Arc::new(PostgresTaskQueue::new(pool)),
    })
}
