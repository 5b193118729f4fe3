use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::drivers::{BigQueryConnection, DuckDbConnection, PostgresConnection};
use crate::error::{MalloyError, MalloyResult};

/// One result row, column name to value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

pub const REDACTED: &str = "********";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigQueryConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key_path: Option<PathBuf>,
    /// Passed through to the query request untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_bytes_billed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckDbConfig {
    pub name: String,
    /// Database file; in-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

/// A named, persisted description of how to reach a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    BigQuery(BigQueryConfig),
    Postgres(PostgresConfig),
    DuckDb(DuckDbConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    BigQuery,
    Postgres,
    DuckDb,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::BigQuery => write!(f, "bigquery"),
            ConnectionKind::Postgres => write!(f, "postgres"),
            ConnectionKind::DuckDb => write!(f, "duckdb"),
        }
    }
}

impl ConnectionConfig {
    pub fn name(&self) -> &str {
        match self {
            ConnectionConfig::BigQuery(c) => &c.name,
            ConnectionConfig::Postgres(c) => &c.name,
            ConnectionConfig::DuckDb(c) => &c.name,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionConfig::BigQuery(_) => ConnectionKind::BigQuery,
            ConnectionConfig::Postgres(_) => ConnectionKind::Postgres,
            ConnectionConfig::DuckDb(_) => ConnectionKind::DuckDb,
        }
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        match self {
            ConnectionConfig::Postgres(c) => ConnectionConfig::Postgres(PostgresConfig {
                password: c.password.as_ref().map(|_| REDACTED.to_string()),
                ..c.clone()
            }),
            other => other.clone(),
        }
    }
}

/// A live database connection.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    fn name(&self) -> &str;

    async fn run_sql(&self, sql: &str) -> MalloyResult<Vec<Row>>;
}

/// Builds live connections from descriptors.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> MalloyResult<Box<dyn DatabaseConnection>>;
}

/// Factory backed by the real database drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverFactory;

#[async_trait]
impl ConnectionFactory for DriverFactory {
    async fn connect(&self, config: &ConnectionConfig) -> MalloyResult<Box<dyn DatabaseConnection>> {
        create_connection(config).await
    }
}

/// Select a driver by connection kind and connect.
pub async fn create_connection(config: &ConnectionConfig) -> MalloyResult<Box<dyn DatabaseConnection>> {
    info!("Creating {} connection '{}'", config.kind(), config.name());
    let connection: Box<dyn DatabaseConnection> = match config {
        ConnectionConfig::BigQuery(c) => Box::new(BigQueryConnection::connect(c.clone()).await?),
        ConnectionConfig::Postgres(c) => Box::new(PostgresConnection::connect(c).await?),
        ConnectionConfig::DuckDb(c) => Box::new(DuckDbConnection::open(c).await?),
    };
    Ok(connection)
}

/// Resolves connection names to live connections for the runtime.
#[derive(Clone)]
pub struct ConnectionLookup {
    configs: Vec<ConnectionConfig>,
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionLookup {
    pub fn new(configs: Vec<ConnectionConfig>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { configs, factory }
    }

    pub async fn lookup_connection(&self, name: &str) -> MalloyResult<Box<dyn DatabaseConnection>> {
        let config = self
            .configs
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| MalloyError::ConnectionNotFound(name.to_string()))?;
        self.factory.connect(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_tagged_by_type() {
        let config = ConnectionConfig::Postgres(PostgresConfig {
            name: "warehouse".into(),
            host: Some("db.internal".into()),
            port: Some(5433),
            ..Default::default()
        });

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "postgres");
        assert_eq!(json["name"], "warehouse");
        assert_eq!(json["port"], 5433);
        assert!(json.get("password").is_none());

        let back: ConnectionConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn bigquery_fields_are_camel_case() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"type": "bigquery", "name": "bq", "projectId": "p1", "maximumBytesBilled": "1000"}"#,
        )
        .unwrap();
        match config {
            ConnectionConfig::BigQuery(c) => {
                assert_eq!(c.project_id.as_deref(), Some("p1"));
                assert_eq!(c.maximum_bytes_billed.as_deref(), Some("1000"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn redaction_masks_postgres_password_only() {
        let config = ConnectionConfig::Postgres(PostgresConfig {
            name: "pg".into(),
            username: Some("me".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        });
        match config.redacted() {
            ConnectionConfig::Postgres(c) => {
                assert_eq!(c.password.as_deref(), Some(REDACTED));
                assert_eq!(c.username.as_deref(), Some("me"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let duck = ConnectionConfig::DuckDb(DuckDbConfig {
            name: "duck".into(),
            ..Default::default()
        });
        assert_eq!(duck.redacted(), duck);
    }
}
