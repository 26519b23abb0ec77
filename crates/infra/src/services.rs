//! Service wiring: picks the store backends and builds the engines.
//!
//! `USE_PERSISTENT_STORES=true` selects the Postgres idempotency store and
//! stock ledger; everything else stays in memory.

use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::PgPool;

use invflow_auth::Authorizer;
use invflow_events::{EventBus, EventEnvelope};

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::db;
use crate::directory::UserDirectory;
use crate::error::EngineError;
use crate::fulfillment::FulfillmentHooks;
use crate::idempotency::{
    IdempotencyGate, IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
use crate::posting_engine::PostingEngine;
use crate::stock_ledger::{InMemoryStockLedger, PostgresStockLedger, StockLedger};
use crate::template_registry::TemplateRegistry;
use crate::workflow_engine::{WorkflowDeps, WorkflowEngine};
use crate::workflow_store::{InMemoryWorkflowStore, WorkflowStore};

/// Collaborators owned by the embedding application.
pub struct Collaborators {
    pub registry: Arc<dyn TemplateRegistry>,
    pub directory: Arc<dyn UserDirectory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub audit: Arc<dyn AuditSink>,
    pub hooks: Arc<dyn FulfillmentHooks>,
}

pub struct Services<B> {
    pub gate: Arc<IdempotencyGate>,
    pub postings: Arc<PostingEngine<B>>,
    pub workflow: Arc<WorkflowEngine<B>>,
    pool: Option<PgPool>,
}

struct Stores {
    idempotency: Arc<dyn IdempotencyStore>,
    ledger: Arc<dyn StockLedger>,
    workflow: Arc<dyn WorkflowStore>,
    pool: Option<PgPool>,
}

impl<B> Services<B>
where
    B: EventBus<EventEnvelope<JsonValue>> + Clone,
{
    pub async fn build(
        config: &EngineConfig,
        collaborators: Collaborators,
        bus: B,
    ) -> anyhow::Result<Self> {
        let stores = if config.use_persistent_stores {
            build_persistent_stores(config).await?
        } else {
            build_in_memory_stores()
        };

        let gate = Arc::new(IdempotencyGate::new(stores.idempotency, config.idempotency_ttl));
        let postings = Arc::new(PostingEngine::new(
            stores.ledger,
            gate.clone(),
            collaborators.authorizer.clone(),
            collaborators.audit.clone(),
            bus.clone(),
            config,
        ));
        let workflow = Arc::new(WorkflowEngine::new(
            WorkflowDeps {
                store: stores.workflow,
                registry: collaborators.registry,
                directory: collaborators.directory,
                authorizer: collaborators.authorizer,
                audit: collaborators.audit,
                hooks: collaborators.hooks,
                postings: postings.clone(),
                gate: gate.clone(),
                bus,
            },
            config,
        ));

        tracing::info!(
            persistent = config.use_persistent_stores,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            commit_retries = config.commit_retries,
            "engine services ready"
        );

        Ok(Self {
            gate,
            postings,
            workflow,
            pool: stores.pool,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.pool.is_some()
    }

    /// Drop expired idempotency records. Returns how many were removed.
    pub async fn purge_expired_idempotency(&self) -> Result<u64, EngineError> {
        let purged = self.gate.store().purge_expired(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "expired idempotency records purged");
        }
        Ok(purged)
    }
}

fn build_in_memory_stores() -> Stores {
    Stores {
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        ledger: Arc::new(InMemoryStockLedger::new()),
        workflow: Arc::new(InMemoryWorkflowStore::new()),
        pool: None,
    }
}

async fn build_persistent_stores(config: &EngineConfig) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
    };

    let pool = db::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    db::ensure_schema(&pool)
        .await
        .context("failed to create idempotency and ledger tables")?;

    let shared = Arc::new(pool.clone());
    Ok(Stores {
        idempotency: Arc::new(PostgresIdempotencyStore::from_shared(shared.clone())),
        ledger: Arc::new(PostgresStockLedger::from_shared(shared, config.lock_timeout)),
        // Instances are kept in process; only ledger and idempotency state is durable.
        workflow: Arc::new(InMemoryWorkflowStore::new()),
        pool: Some(pool),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::directory::InMemoryUserDirectory;
    use crate::fulfillment::NoFulfillment;
    use crate::template_registry::InMemoryTemplateRegistry;
    use invflow_auth::StaticAuthorizer;
    use invflow_events::InMemoryEventBus;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn collaborators() -> Collaborators {
        Collaborators {
            registry: Arc::new(InMemoryTemplateRegistry::new()),
            directory: Arc::new(InMemoryUserDirectory::new()),
            authorizer: Arc::new(StaticAuthorizer::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            hooks: Arc::new(NoFulfillment),
        }
    }

    #[tokio::test]
    async fn in_memory_services_build_by_default() {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let services = Services::build(&EngineConfig::default(), collaborators(), bus)
            .await
            .unwrap();
        assert!(!services.is_persistent());
        assert_eq!(services.purge_expired_idempotency().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persistent_services_require_a_database_url() {
        let config = EngineConfig {
            use_persistent_stores: true,
            database_url: None,
            ..EngineConfig::default()
        };
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let err = Services::build(&config, collaborators(), bus)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
