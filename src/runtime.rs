//! Boundary to the Malloy compiler.
//!
//! Parsing and translating Malloy happens outside this crate. [`Runtime`] and
//! [`Model`] are the calls the CLI makes into it; [`CompilerBridge`] is the
//! implementation that talks to an external compiler process over JSON.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::config::CompilerSettings;
use crate::connection::{ConnectionLookup, Row};
use crate::error::{MalloyError, MalloyResult};

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn load_model(&self, url: &Url) -> MalloyResult<Box<dyn Model>>;
}

/// A loaded model that queries can be resolved against.
#[async_trait]
pub trait Model: Send + Sync {
    /// Add the declarations of another file to this model.
    async fn extend_model(&mut self, url: &Url) -> MalloyResult<()>;

    /// `index` is 1-based.
    async fn query_by_index(&self, index: usize) -> MalloyResult<QueryMaterializer>;

    async fn query_by_name(&self, name: &str) -> MalloyResult<QueryMaterializer>;

    /// Compile a literal Malloy query against the model.
    async fn query(&self, source: &str) -> MalloyResult<QueryMaterializer>;

    /// The last runnable query in the file.
    async fn final_query(&self) -> MalloyResult<QueryMaterializer>;
}

/// A resolved, compiled query that has not run yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMaterializer {
    sql: String,
    connection_name: String,
}

impl QueryMaterializer {
    pub fn new(sql: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            connection_name: connection_name.into(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Run `sql` on this query's own connection.
    pub async fn run(&self, sql: &str, lookup: &ConnectionLookup) -> MalloyResult<Vec<Row>> {
        let connection = lookup.lookup_connection(&self.connection_name).await?;
        info!("Running query on connection '{}'", connection.name());
        connection.run_sql(sql).await
    }
}

pub fn file_url(path: &Path) -> MalloyResult<Url> {
    let absolute = std::fs::canonicalize(path)?;
    Url::from_file_path(&absolute).map_err(|_| {
        MalloyError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot turn {} into a file URL", absolute.display()),
        ))
    })
}

/// Load source text for a URL. Only `file:` URLs are supported.
pub async fn read_url(url: &Url) -> MalloyResult<String> {
    let path = url.to_file_path().map_err(|_| {
        MalloyError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unsupported URL: {}", url),
        ))
    })?;
    debug!("Reading {}", path.display());
    Ok(tokio::fs::read_to_string(&path).await?)
}

/// Runtime backed by an external compiler executable.
///
/// Each query is one process invocation: a JSON request on stdin, a JSON reply
/// on stdout.
#[derive(Debug, Clone)]
pub struct CompilerBridge {
    settings: CompilerSettings,
}

impl CompilerBridge {
    pub fn new(settings: CompilerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Runtime for CompilerBridge {
    async fn load_model(&self, url: &Url) -> MalloyResult<Box<dyn Model>> {
        let source = read_url(url).await?;
        Ok(Box::new(BridgeModel {
            settings: self.settings.clone(),
            url: url.clone(),
            source,
        }))
    }
}

struct BridgeModel {
    settings: CompilerSettings,
    url: Url,
    source: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeReply {
    sql: Option<String>,
    connection_name: Option<String>,
    error: Option<BridgeError>,
}

#[derive(Debug, Deserialize)]
struct BridgeError {
    kind: String,
    message: String,
}

impl BridgeModel {
    async fn compile(&self, query: JsonValue) -> MalloyResult<QueryMaterializer> {
        let request = json!({
            "url": self.url.as_str(),
            "source": self.source,
            "query": query,
        });
        debug!("Compiler request: {}", request["query"]);

        let mut child = tokio::process::Command::new(&self.settings.command)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                MalloyError::Compile(format!(
                    "failed to start compiler '{}': {}",
                    self.settings.command, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.to_string().as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        let reply: Option<BridgeReply> = serde_json::from_slice(&output.stdout).ok();
        match reply {
            Some(BridgeReply { error: Some(err), .. }) => Err(match err.kind.as_str() {
                "selection" => MalloyError::QuerySelection(err.message),
                _ => MalloyError::Compile(err.message),
            }),
            Some(BridgeReply {
                sql: Some(sql),
                connection_name,
                ..
            }) if output.status.success() => Ok(QueryMaterializer::new(
                sql,
                connection_name.unwrap_or_default(),
            )),
            _ => Err(MalloyError::Compile(format!(
                "compiler exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

#[async_trait]
impl Model for BridgeModel {
    async fn extend_model(&mut self, url: &Url) -> MalloyResult<()> {
        let extra = read_url(url).await?;
        self.source.push('\n');
        self.source.push_str(&extra);
        Ok(())
    }

    async fn query_by_index(&self, index: usize) -> MalloyResult<QueryMaterializer> {
        self.compile(json!({ "kind": "index", "value": index })).await
    }

    async fn query_by_name(&self, name: &str) -> MalloyResult<QueryMaterializer> {
        self.compile(json!({ "kind": "name", "value": name })).await
    }

    async fn query(&self, source: &str) -> MalloyResult<QueryMaterializer> {
        self.compile(json!({ "kind": "literal", "value": source })).await
    }

    async fn final_query(&self) -> MalloyResult<QueryMaterializer> {
        self.compile(json!({ "kind": "final" })).await
    }
}
