pub mod account;
pub mod contact;
pub mod group;
pub mod message;

use crate::config::Config;
use crate::spool::{ContactDirectory, SpoolTransport};
use anyhow::Result;
use herald_core::{
    AccountRegistry, ChainKdfEngine, FileStorageAdapter, InboundEvent, MessagePipeline,
    PipelineConfig, StorageAdapter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything a command handler needs, built once per invocation.
pub struct App {
    pub registry: AccountRegistry,
    pub config: Config,
    pub data_dir: PathBuf,
    pub transport: Arc<SpoolTransport>,
    pub directory: Arc<ContactDirectory>,
}

impl App {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let storage: Arc<dyn StorageAdapter> =
            Arc::new(FileStorageAdapter::new(data_dir.join("store"))?);
        let registry = AccountRegistry::new(storage)?;
        let config = Config::load(data_dir)?;
        let transport = Arc::new(SpoolTransport::new(data_dir)?);
        let directory = Arc::new(ContactDirectory::new(data_dir)?);
        Ok(Self {
            registry,
            config,
            data_dir: data_dir.to_path_buf(),
            transport,
            directory,
        })
    }

    pub fn pipeline(
        &self,
        account_flag: Option<&str>,
    ) -> Result<(MessagePipeline, crossbeam_channel::Receiver<InboundEvent>)> {
        let handle = self.config.resolve_account(account_flag)?;
        let account = self.registry.get(&handle)?;
        let config = PipelineConfig {
            max_attempts: self.config.max_send_attempts,
            base_backoff: Duration::from_millis(50),
            sealed_sender: self.config.sealed_sender,
        };
        let (pipeline, events) = MessagePipeline::new(
            account,
            Arc::new(ChainKdfEngine::new()),
            self.transport.clone(),
            self.directory.clone(),
            config,
        );
        Ok((pipeline, events))
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }
}
