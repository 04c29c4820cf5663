use anyhow::{Context, Result};
use facematch_core::{
    DirectoryPersistence, EmbeddingStore, MemoryPersistence, OnnxEmbedder, PersistenceAdapter,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod crypto;
mod dbus_interface;
mod engine;
mod service;
mod store;

use config::{Backend, Bus, Config};
use dbus_interface::{FaceMatchInterface, BUS_NAME, OBJECT_PATH};

fn open_persistence(config: &Config) -> Result<Arc<dyn PersistenceAdapter>> {
    let persistence: Arc<dyn PersistenceAdapter> = match config.backend {
        Backend::Sqlite => {
            let cipher = crypto::EmbeddingCipher::load_or_create(&config.key_path)
                .context("loading embedding key")?;
            Arc::new(store::SqlitePersistence::open(&config.db_path, cipher)?)
        }
        Backend::Directory => Arc::new(DirectoryPersistence::open(&config.store_dir)?),
        Backend::Memory => {
            tracing::warn!("memory backend: enrollments will not survive a restart");
            Arc::new(MemoryPersistence::new())
        }
    };
    tracing::info!(backend = %persistence.describe(), "persistence ready");
    Ok(persistence)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = Config::from_env();
    tracing::info!(
        backend = ?config.backend,
        metric = %config.metric,
        threshold = config.threshold,
        model = %config.model_path.display(),
        "configuration loaded"
    );

    // Load everything up front so a bad model or database fails startup.
    let persistence = open_persistence(&config)?;
    let records = persistence.load().context("loading enrolled embeddings")?;
    let store = Arc::new(EmbeddingStore::from_records(config.store_config(), records)?);

    let model_path = config.model_path.to_string_lossy().into_owned();
    let embedder = OnnxEmbedder::load(&model_path, config.embedder_options())
        .with_context(|| format!("loading embedding model {model_path}"))?;
    let engine = engine::spawn_engine(Box::new(embedder))?;

    let service = Arc::new(service::FaceService::new(
        engine,
        store,
        persistence,
        config.metric,
        config.threshold,
    ));

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceMatchInterface::new(service))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facematchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facematchd shutting down");

    Ok(())
}
