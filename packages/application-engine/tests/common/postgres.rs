//! Postgres harness with testcontainers.
//!
//! One container is started for the whole test binary and migrated once;
//! each test gets a fresh pool over it. Tests using it are `#[ignore]`d so
//! the default run does not need a Docker daemon:
//!
//! ```ignore
//! cargo test -p application-engine -- --ignored
//! ```

use anyhow::{Context, Result};
use application_engine::kernel::PostgresStore;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use super::init_tracing;

/// Shared database container, kept alive for the entire test run.
struct SharedPostgres {
    db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Result<Self> {
        init_tracing();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        // Runs the migrations once for every test that follows
        PostgresStore::connect(&db_url, 2).await?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_POSTGRES
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared Postgres container")
            })
            .await
    }
}

pub struct PostgresHarness {
    pub store: PostgresStore,
}

impl AsyncTestContext for PostgresHarness {
    async fn setup() -> Self {
        let infra = SharedPostgres::get().await;
        let pool = PgPool::connect(&infra.db_url)
            .await
            .expect("Failed to connect to test database");
        Self {
            store: PostgresStore::new(pool),
        }
    }
}
