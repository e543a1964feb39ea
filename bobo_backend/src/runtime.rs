use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PetConfig;
use crate::llm_client::{LlmClient, Oracle};
use crate::pet::{Pet, PetEvent};
use crate::store::{open_store, Store};

pub struct BackendRuntime {
    pub config: PetConfig,
    pub pet: Arc<Pet>,
}

pub struct BackendRuntimeBuilder {
    config: PetConfig,
    event_tx: Sender<PetEvent>,
    store: Option<Arc<dyn Store>>,
    oracle: Option<Arc<dyn Oracle>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: PetConfig, event_tx: Sender<PetEvent>) -> Self {
        Self {
            config,
            event_tx,
            store: None,
            oracle: None,
        }
    }

    /// Use this store instead of the one named in config.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this oracle instead of the configured LLM endpoint.
    pub fn with_oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config).with_context(|| {
                format!(
                    "Failed to open {:?} conversation store at {}",
                    config.store_backend, config.store_path
                )
            })?,
        };

        let oracle = match self.oracle {
            Some(oracle) => oracle,
            None => {
                let client = LlmClient::from_config(&config);
                if config.llm_api_key.is_none() {
                    tracing::warn!("No LLM API key configured; requests go out unauthenticated");
                }
                tracing::info!("Oracle: {} at {}", client.model(), config.llm_api_url);
                Arc::new(client) as Arc<dyn Oracle>
            }
        };

        let pet = Arc::new(Pet::new(config.clone(), store, oracle, self.event_tx));
        Ok(BackendRuntime { config, pet })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: PetConfig, event_tx: Sender<PetEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Prepares the log and starts idle chatter. Returns the shutdown switch
    /// for the idle loop along with its handle, if one was started.
    pub async fn start(&self) -> Result<(watch::Sender<bool>, Option<JoinHandle<()>>)> {
        self.pet
            .startup()
            .await
            .context("Failed to prepare conversation log")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let idle = self.pet.spawn_idle_loop(shutdown_rx);
        Ok((shutdown_tx, idle))
    }
}
