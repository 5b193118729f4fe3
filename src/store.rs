//! Persisted connection descriptors.
//!
//! The store is a single JSON document, `{"connections": [...]}`. It is read
//! once per invocation and rewritten whole on every change. There is no file
//! locking, so concurrent invocations can lose writes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionConfig, ConnectionFactory, ConnectionLookup};
use crate::error::{MalloyError, MalloyResult};

const TEST_QUERY: &str = "SELECT 1";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    connections: Vec<ConnectionConfig>,
}

/// Result of `connections test`. A failure is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionStore {
    path: PathBuf,
    connections: Vec<ConnectionConfig>,
}

impl ConnectionStore {
    /// Load the store at `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> MalloyResult<Self> {
        let path = path.into();
        if !path.exists() {
            debug!("Connection store {} does not exist yet", path.display());
            return Ok(Self {
                path,
                connections: Vec::new(),
            });
        }

        let text = std::fs::read_to_string(&path)?;
        let file: StoreFile = serde_json::from_str(&text)?;
        debug!("Loaded {} connection(s) from {}", file.connections.len(), path.display());
        Ok(Self {
            path,
            connections: file.connections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[ConnectionConfig] {
        &self.connections
    }

    pub fn get(&self, name: &str) -> MalloyResult<&ConnectionConfig> {
        self.connections
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| MalloyError::ConnectionNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.iter().any(|c| c.name() == name)
    }

    pub fn create(&mut self, config: ConnectionConfig) -> MalloyResult<()> {
        if self.contains(config.name()) {
            return Err(MalloyError::DuplicateConnectionName(config.name().to_string()));
        }
        info!("Creating {} connection '{}'", config.kind(), config.name());
        self.connections.push(config);
        self.save()
    }

    pub fn delete(&mut self, name: &str) -> MalloyResult<ConnectionConfig> {
        let index = self
            .connections
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| MalloyError::ConnectionNotFound(name.to_string()))?;
        let removed = self.connections.remove(index);
        info!("Deleted connection '{}'", name);
        self.save()?;
        Ok(removed)
    }

    /// Connect to `name` and run a trivial query. Never modifies the store.
    pub async fn test(&self, name: &str, factory: &dyn ConnectionFactory) -> MalloyResult<TestOutcome> {
        let config = self.get(name)?;

        let connection = match factory.connect(config).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Connection '{}' could not be opened: {}", name, e);
                return Ok(TestOutcome::Failed(e.to_string()));
            }
        };

        match connection.run_sql(TEST_QUERY).await {
            Ok(_) => Ok(TestOutcome::Succeeded),
            Err(e) => {
                warn!("Test query on '{}' failed: {}", name, e);
                Ok(TestOutcome::Failed(e.to_string()))
            }
        }
    }

    pub fn connection_lookup(&self, factory: Arc<dyn ConnectionFactory>) -> ConnectionLookup {
        ConnectionLookup::new(self.connections.clone(), factory)
    }

    pub fn all_connection_configs(&self) -> &[ConnectionConfig] {
        &self.connections
    }

    fn save(&self) -> MalloyResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = StoreFile {
            connections: self.connections.clone(),
        };
        let text = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Saved connection store to {}", self.path.display());
        Ok(())
    }
}
