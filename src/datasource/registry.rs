//! Static registry of connector implementations.
//!
//! Each connector is registered under exactly one backend kind. Resolution is
//! a direct lookup on the config's kind tag followed by that connector's own
//! validation.

use std::sync::Arc;

use super::config::{BackendKind, TableConfig};
use super::{Connector, MySqlConnector, PoolSettings, PostgresConnector, SqliteConnector};
use crate::error::{DataError, Result};

/// Ordered set of connectors, at most one per backend kind.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ConnectorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with the SQLite, PostgreSQL and MySQL connectors.
    pub fn with_defaults(settings: PoolSettings) -> Self {
        Self {
            connectors: vec![
                Arc::new(SqliteConnector::new(settings)),
                Arc::new(PostgresConnector::new(settings)),
                Arc::new(MySqlConnector::new(settings)),
            ],
        }
    }

    /// Connector for `config`, after validating the config against it.
    pub fn resolve(&self, config: &TableConfig) -> Result<Arc<dyn Connector>> {
        let connector = self
            .get(config.kind())
            .ok_or_else(|| DataError::UnknownDatasource(config.kind().to_string()))?;
        connector.validate(config)?;
        Ok(connector)
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Connector>> {
        self.connectors.iter().find(|c| c.kind() == kind).cloned()
    }

    /// Registered kinds in registration order.
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.connectors.iter().map(|c| c.kind()).collect()
    }

    /// Release every pool held by every connector.
    pub async fn shutdown(&self) {
        for connector in &self.connectors {
            connector.shutdown().await;
        }
    }
}

/// Builder rejecting a second connector for an already-claimed kind.
#[derive(Default)]
pub struct RegistryBuilder {
    connectors: Vec<Arc<dyn Connector>>,
}

impl RegistryBuilder {
    pub fn register(mut self, connector: Arc<dyn Connector>) -> Result<Self> {
        let kind = connector.kind();
        if self.connectors.iter().any(|c| c.kind() == kind) {
            return Err(DataError::AmbiguousDatasource(kind.to_string()));
        }
        self.connectors.push(connector);
        Ok(self)
    }

    pub fn build(self) -> ConnectorRegistry {
        ConnectorRegistry {
            connectors: self.connectors,
        }
    }
}
