use anyhow::Result;
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use storefront::{
    platform::{
        app_state::AppState,
        bootstrap::{self, bootstrap},
        config, db,
    },
    routes, workers,
};

/// Migrations embedded into the binary which helps with streamlining image building process
const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    bootstrap::init_env();

    let config = config::load()?;

    tracing::info!("Running migrations...");
    let migrations_count = db::run_migrations_blocking(MIGRATIONS, &config.database.url).await?;
    tracing::info!("Run {} new migrations successfully", migrations_count);

    let addr = config.server.addr;
    let db_pool = db::create_pool(&config.database.url);
    let state = AppState::new(config, db_pool);

    let relay = workers::outbox_relay::spawn(state.clone());

    tracing::info!("Bootstrapping...");
    let served = bootstrap("Storefront", routes::app(state), addr).await;
    relay.abort();
    served
}
