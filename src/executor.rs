use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::connection::{ConnectionConfig, ConnectionFactory, Row};
use crate::error::{MalloyError, MalloyResult};
use crate::runtime::{file_url, Runtime};
use crate::store::ConnectionStore;

/// Stored connection that, when present, receives every `run` directly.
pub const DIRECT_EXECUTION_CONNECTION: &str = "bokksu";

/// Which query in a file to run or compile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QuerySelection {
    #[default]
    Final,
    /// 1-based position among the file's queries.
    Index(usize),
    Name(String),
    /// A Malloy query written on the command line.
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub selection: QuerySelection,
    /// Files loaded into the model after the main file, in order.
    pub extend: Vec<PathBuf>,
    pub compile_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultPayload {
    pub sql: String,
    /// JSON array of row objects; absent for compile-only runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
}

pub struct QueryExecutor<'a> {
    runtime: &'a dyn Runtime,
    store: &'a ConnectionStore,
    factory: Arc<dyn ConnectionFactory>,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(runtime: &'a dyn Runtime, store: &'a ConnectionStore, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            runtime,
            store,
            factory,
        }
    }

    /// Compile the selected query in `file_path` and, unless compile-only, run it.
    pub async fn run_malloy(&self, file_path: &Path, options: &RunOptions) -> MalloyResult<ResultPayload> {
        let url = file_url(file_path)?;
        info!("Loading model from {}", url);
        let mut model = self.runtime.load_model(&url).await?;
        for extra in &options.extend {
            let extra_url = file_url(extra)?;
            info!("Extending model with {}", extra_url);
            model.extend_model(&extra_url).await?;
        }

        let query = match &options.selection {
            QuerySelection::Final => model.final_query().await?,
            QuerySelection::Index(0) => {
                return Err(MalloyError::QuerySelection("query index starts at 1".to_string()));
            }
            QuerySelection::Index(index) => model.query_by_index(*index).await?,
            QuerySelection::Name(name) => model.query_by_name(name).await?,
            QuerySelection::Literal(source) => model.query(source).await?,
        };

        let sql = fix_interval_literals(query.sql());
        debug!("Compiled SQL:\n{}", sql);

        if options.compile_only {
            return Ok(ResultPayload { sql, results: None });
        }

        let rows = match direct_execution_target(self.store.all_connection_configs()) {
            Some(config) => {
                info!("Running directly on connection '{}'", config.name());
                let connection = self.factory.connect(config).await.map_err(as_execution)?;
                connection.run_sql(&sql).await.map_err(as_execution)?
            }
            None => {
                let lookup = self.store.connection_lookup(Arc::clone(&self.factory));
                query.run(&sql, &lookup).await.map_err(as_execution)?
            }
        };

        Ok(ResultPayload {
            sql,
            results: Some(rows_to_json(&rows)?),
        })
    }
}

fn direct_execution_target(configs: &[ConnectionConfig]) -> Option<&ConnectionConfig> {
    configs.iter().find(|c| c.name() == DIRECT_EXECUTION_CONNECTION)
}

// Driver failures surface as execution errors; lookup misses keep their own kind.
fn as_execution(err: MalloyError) -> MalloyError {
    match err {
        MalloyError::Execution(_) | MalloyError::ConnectionNotFound(_) => err,
        other => MalloyError::Execution(other.to_string()),
    }
}

fn rows_to_json(rows: &[Row]) -> MalloyResult<String> {
    Ok(serde_json::to_string(rows)?)
}

/// Rewrite `'(3) DAY'` style interval literals to `'3 DAY'`.
pub fn fix_interval_literals(sql: &str) -> String {
    static INTERVAL: OnceLock<Regex> = OnceLock::new();
    let re = INTERVAL.get_or_init(|| Regex::new(r"'\((\d+)\) (\w+)'").expect("static regex"));
    re.replace_all(sql, "'$1 $2'").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DatabaseConnection, DuckDbConfig};
    use crate::runtime::{Model, QueryMaterializer};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use url::Url;

    struct FakeModel {
        queries: Vec<(String, QueryMaterializer)>,
    }

    #[async_trait]
    impl Model for FakeModel {
        // Each `name=sql` line of the extra file adds a query.
        async fn extend_model(&mut self, url: &Url) -> MalloyResult<()> {
            let source = crate::runtime::read_url(url).await?;
            for line in source.lines() {
                if let Some((name, sql)) = line.split_once('=') {
                    self.queries.push((name.into(), QueryMaterializer::new(sql, "duck")));
                }
            }
            Ok(())
        }

        async fn query_by_index(&self, index: usize) -> MalloyResult<QueryMaterializer> {
            self.queries
                .get(index - 1)
                .map(|(_, q)| q.clone())
                .ok_or_else(|| MalloyError::QuerySelection(format!("no query at index {index}")))
        }

        async fn query_by_name(&self, name: &str) -> MalloyResult<QueryMaterializer> {
            self.queries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, q)| q.clone())
                .ok_or_else(|| MalloyError::QuerySelection(format!("no query named {name}")))
        }

        async fn query(&self, source: &str) -> MalloyResult<QueryMaterializer> {
            Ok(QueryMaterializer::new(format!("-- {source}\nSELECT 1"), "duck"))
        }

        async fn final_query(&self) -> MalloyResult<QueryMaterializer> {
            self.queries
                .last()
                .map(|(_, q)| q.clone())
                .ok_or_else(|| MalloyError::QuerySelection("no final query".into()))
        }
    }

    struct FakeRuntime {
        queries: Vec<(String, QueryMaterializer)>,
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn load_model(&self, _url: &Url) -> MalloyResult<Box<dyn Model>> {
            Ok(Box::new(FakeModel {
                queries: self.queries.clone(),
            }))
        }
    }

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl DatabaseConnection for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run_sql(&self, sql: &str) -> MalloyResult<Vec<Row>> {
            self.log.lock().unwrap().push((self.name.clone(), sql.to_string()));
            let mut row = Row::new();
            row.insert("connection".into(), json!(self.name));
            Ok(vec![row])
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        log: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl ConnectionFactory for RecordingFactory {
        async fn connect(&self, config: &ConnectionConfig) -> MalloyResult<Box<dyn DatabaseConnection>> {
            Ok(Box::new(Recorder {
                name: config.name().to_string(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn duck(name: &str) -> ConnectionConfig {
        ConnectionConfig::DuckDb(DuckDbConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    fn fixture(configs: &[&str]) -> (TempDir, std::path::PathBuf, ConnectionStore) {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("q.malloy");
        std::fs::write(&file, "run: flights -> by_carrier").unwrap();
        let mut store = ConnectionStore::load(dir.path().join("connections.json")).unwrap();
        for name in configs {
            store.create(duck(name)).unwrap();
        }
        (dir, file, store)
    }

    fn runtime() -> FakeRuntime {
        FakeRuntime {
            queries: vec![
                ("first".into(), QueryMaterializer::new("SELECT 'first'", "duck")),
                (
                    "by_carrier".into(),
                    QueryMaterializer::new("SELECT now() - INTERVAL '(3) DAY'", "duck"),
                ),
            ],
        }
    }

    #[test]
    fn interval_literal_fix() {
        assert_eq!(fix_interval_literals("INTERVAL '(3) DAY'"), "INTERVAL '3 DAY'");
        assert_eq!(
            fix_interval_literals("a '(12) hour' b '(1) MONTH'"),
            "a '12 hour' b '1 MONTH'"
        );
        assert_eq!(fix_interval_literals("'(x) DAY' '3 DAY'"), "'(x) DAY' '3 DAY'");
    }

    #[tokio::test]
    async fn compile_only_returns_sql_without_results() {
        let (_dir, file, store) = fixture(&[]);
        let factory = Arc::new(RecordingFactory::default());
        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, factory.clone());

        let payload = executor
            .run_malloy(&file, &RunOptions { compile_only: true, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(payload.sql, "SELECT now() - INTERVAL '3 DAY'");
        assert_eq!(payload.results, None);
        assert!(factory.log.lock().unwrap().is_empty());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, json!({"sql": "SELECT now() - INTERVAL '3 DAY'"}));
    }

    #[tokio::test]
    async fn run_uses_the_query_connection() {
        let (_dir, file, store) = fixture(&["duck"]);
        let factory = Arc::new(RecordingFactory::default());
        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, factory.clone());

        let options = RunOptions {
            selection: QuerySelection::Index(1),
            ..Default::default()
        };
        let payload = executor.run_malloy(&file, &options).await.unwrap();

        assert_eq!(payload.sql, "SELECT 'first'");
        let results: serde_json::Value = serde_json::from_str(payload.results.as_deref().unwrap()).unwrap();
        assert_eq!(results, json!([{"connection": "duck"}]));
        assert_eq!(
            *factory.log.lock().unwrap(),
            vec![("duck".to_string(), "SELECT 'first'".to_string())]
        );
    }

    #[tokio::test]
    async fn direct_execution_connection_overrides_query_connection() {
        let (_dir, file, store) = fixture(&["duck", DIRECT_EXECUTION_CONNECTION]);
        let factory = Arc::new(RecordingFactory::default());
        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, factory.clone());

        let options = RunOptions {
            selection: QuerySelection::Name("by_carrier".into()),
            ..Default::default()
        };
        executor.run_malloy(&file, &options).await.unwrap();

        let log = factory.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, DIRECT_EXECUTION_CONNECTION);
        assert_eq!(log[0].1, "SELECT now() - INTERVAL '3 DAY'");
    }

    #[tokio::test]
    async fn selection_failures_do_not_execute() {
        let (_dir, file, store) = fixture(&["duck"]);
        let factory = Arc::new(RecordingFactory::default());
        let empty = FakeRuntime { queries: vec![] };
        let executor = QueryExecutor::new(&empty, &store, factory.clone());

        let err = executor.run_malloy(&file, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, MalloyError::QuerySelection(_)));

        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, factory.clone());
        for selection in [
            QuerySelection::Index(0),
            QuerySelection::Index(9),
            QuerySelection::Name("missing".into()),
        ] {
            let options = RunOptions {
                selection,
                ..Default::default()
            };
            let err = executor.run_malloy(&file, &options).await.unwrap_err();
            assert!(matches!(err, MalloyError::QuerySelection(_)), "got {err:?}");
        }
        assert!(factory.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn literal_query_is_compiled_against_model() {
        let (_dir, file, store) = fixture(&["duck"]);
        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, Arc::new(RecordingFactory::default()));

        let options = RunOptions {
            selection: QuerySelection::Literal("flights -> { aggregate: c is count() }".into()),
            compile_only: true,
            ..Default::default()
        };
        let payload = executor.run_malloy(&file, &options).await.unwrap();
        assert!(payload.sql.starts_with("-- flights ->"));
    }

    #[tokio::test]
    async fn extension_files_add_queries_in_order() {
        let (dir, file, store) = fixture(&[]);
        let first = dir.path().join("first.malloy");
        let second = dir.path().join("second.malloy");
        std::fs::write(&first, "late=SELECT 'late'").unwrap();
        std::fs::write(&second, "latest=SELECT 'latest'").unwrap();
        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, Arc::new(RecordingFactory::default()));

        let options = RunOptions {
            selection: QuerySelection::Name("late".into()),
            extend: vec![first.clone(), second.clone()],
            compile_only: true,
        };
        assert_eq!(executor.run_malloy(&file, &options).await.unwrap().sql, "SELECT 'late'");

        let options = RunOptions {
            extend: vec![first, second],
            compile_only: true,
            ..Default::default()
        };
        assert_eq!(executor.run_malloy(&file, &options).await.unwrap().sql, "SELECT 'latest'");

        let options = RunOptions {
            extend: vec![dir.path().join("missing.malloy")],
            compile_only: true,
            ..Default::default()
        };
        let err = executor.run_malloy(&file, &options).await.unwrap_err();
        assert!(matches!(err, MalloyError::Io(_)));
    }

    #[tokio::test]
    async fn unknown_query_connection_is_reported() {
        let (_dir, file, store) = fixture(&[]);
        let rt = runtime();
        let executor = QueryExecutor::new(&rt, &store, Arc::new(RecordingFactory::default()));

        let err = executor.run_malloy(&file, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, MalloyError::ConnectionNotFound(ref n) if n == "duck"));
    }

    #[tokio::test]
    async fn runs_against_real_duckdb() {
        let (_dir, file, store) = fixture(&["duck"]);
        let rt = FakeRuntime {
            queries: vec![(
                "q".into(),
                QueryMaterializer::new("SELECT 42 AS answer", "duck"),
            )],
        };
        let executor = QueryExecutor::new(&rt, &store, Arc::new(crate::connection::DriverFactory));

        let payload = executor.run_malloy(&file, &RunOptions::default()).await.unwrap();
        let results: serde_json::Value = serde_json::from_str(payload.results.as_deref().unwrap()).unwrap();
        assert_eq!(results, json!([{"answer": 42}]));
    }
}
