mod api;
mod config;
mod favorites;
mod http;
mod intake;
mod llm;
mod metrics;
mod models;
mod operation;
mod registry;
mod store;
mod supabase;
mod vehicle;

use config::{ServerConfig, StoreBackend};
use eyre::{WrapErr, eyre};
use favorites::FavoriteToggle;
use intake::codec::DataUriCodec;
use intake::session::SessionDeps;
use llm::{LlmClient, LlmConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use registry::DraftRegistry;
use std::{net::SocketAddr, sync::Arc};
use store::{ListingStore, MemoryStore, SavedCarStore};
use supabase::SupabaseClient;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use vehicle::LlmVehicleExtractor;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "intake.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let config = ServerConfig::from_env();

    let (listings, saved): (Arc<dyn ListingStore>, Arc<dyn SavedCarStore>) = match config.store
    {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        }
        StoreBackend::Supabase => {
            let client = Arc::new(SupabaseClient::from_env().ok_or_else(|| {
                eyre!("INTAKE_STORE=supabase needs SUPABASE_URL and a service key")
            })?);
            (client.clone(), client)
        }
    };
    let extractor = Arc::new(LlmVehicleExtractor::new(LlmClient::new(LlmConfig::from_env())));

    let deps = SessionDeps {
        codec: Arc::new(DataUriCodec),
        extractor,
        listings,
    };
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    let state = api::AppState {
        registry: DraftRegistry::new(deps, config.max_drafts, config.draft_idle),
        favorites: FavoriteToggle::new(saved),
        prometheus,
        metrics_key: config.metrics_key.clone(),
    };
    let app = api::build_router(state, config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(
        target = "intake.api",
        store = ?config.store,
        max_drafts = config.max_drafts,
        draft_idle_secs = config.draft_idle.as_secs(),
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
