use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::commands;
use crate::config::{load_config, Configuration, LogLevel, CONFIG_ENV_VAR};
use crate::connection::{ConnectionFactory, DriverFactory};
use crate::error::{MalloyError, MalloyResult};
use crate::executor::{QuerySelection, ResultPayload};
use crate::formatter::OutputFormat;
use crate::output::Logger;
use crate::runtime::{CompilerBridge, Runtime};
use crate::store::ConnectionStore;

#[derive(Parser, Debug)]
#[command(name = "malloy")]
#[command(version)]
#[command(about = "Run and compile Malloy queries from the command line", long_about = None)]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, env = CONFIG_ENV_VAR)]
    pub config: Option<PathBuf>,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile and execute a query from a Malloy file
    Run {
        #[command(flatten)]
        target: QueryArgs,

        /// Print the result payload as JSON
        #[arg(long)]
        json: bool,

        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Compile a query to SQL without running it
    Compile {
        #[command(flatten)]
        target: QueryArgs,

        #[arg(long)]
        json: bool,
    },
    /// Manage database connections
    Connections {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
    /// Show the effective configuration
    Config,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Malloy source file
    pub file: PathBuf,

    /// 1-based index of the query in the file
    #[arg(short, long, conflicts_with_all = ["query_name", "query"])]
    pub index: Option<usize>,

    /// Name of the query to run
    #[arg(short = 'n', long, conflicts_with = "query")]
    pub query_name: Option<String>,

    /// Malloy query to run against the file's model
    #[arg(long)]
    pub query: Option<String>,

    /// Another Malloy file whose declarations are added to the model
    #[arg(short, long = "extend", value_name = "FILE")]
    pub extend: Vec<PathBuf>,
}

impl QueryArgs {
    pub fn selection(&self) -> QuerySelection {
        if let Some(index) = self.index {
            QuerySelection::Index(index)
        } else if let Some(name) = &self.query_name {
            QuerySelection::Name(name.clone())
        } else if let Some(query) = &self.query {
            QuerySelection::Literal(query.clone())
        } else {
            QuerySelection::Final
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConnectionCommands {
    /// List all connections
    List {
        #[arg(long)]
        show_secrets: bool,
    },
    /// Show one connection
    Show {
        name: String,

        #[arg(long)]
        show_secrets: bool,
    },
    /// Check that a connection can run a query
    Test { name: String },
    /// Delete a connection
    Delete { name: String },
    /// Add a BigQuery connection
    CreateBigquery(BigQueryArgs),
    /// Add a Postgres connection
    CreatePostgres(PostgresArgs),
    /// Add a DuckDB connection
    CreateDuckdb(DuckDbArgs),
}

#[derive(Args, Debug)]
pub struct BigQueryArgs {
    pub name: String,

    #[arg(long)]
    pub project_id: Option<String>,

    #[arg(long)]
    pub location: Option<String>,

    #[arg(long)]
    pub service_account_key_path: Option<PathBuf>,

    #[arg(long)]
    pub timeout_ms: Option<String>,

    #[arg(long)]
    pub maximum_bytes_billed: Option<String>,
}

#[derive(Args, Debug)]
pub struct PostgresArgs {
    pub name: String,

    #[arg(short = 'H', long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(short, long)]
    pub username: Option<String>,

    #[arg(short = 'D', long)]
    pub database_name: Option<String>,

    #[arg(long, conflicts_with = "password_prompt")]
    pub password: Option<String>,

    /// Read the password from the terminal
    #[arg(short = 'P', long)]
    pub password_prompt: bool,
}

#[derive(Args, Debug)]
pub struct DuckDbArgs {
    pub name: String,

    /// Database file; in-memory when omitted
    #[arg(long)]
    pub database_path: Option<PathBuf>,

    #[arg(long)]
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliMode {
    /// Print usage and errors, exit on parse failure.
    Interactive,
    /// Return every error to the caller and print nothing.
    Test,
}

/// Process-wide state, built once before a command body runs.
pub struct AppContext {
    pub config: Configuration,
    pub logger: Logger,
    pub store: ConnectionStore,
    pub runtime: Arc<dyn Runtime>,
    pub factory: Arc<dyn ConnectionFactory>,
}

/// Effective log level and whether user output is silenced.
pub fn effective_level(cli: &Cli, config: &Configuration) -> (LogLevel, bool) {
    if cli.quiet || config.quiet {
        return (LogLevel::Error, true);
    }
    if cli.debug || cfg!(debug_assertions) {
        return (LogLevel::Debug, false);
    }
    (cli.log_level.unwrap_or(config.log_level), false)
}

fn init_tracing(level: LogLevel) {
    let installed = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter())),
        )
        .try_init();
    if let Err(e) = installed {
        debug!("Keeping the existing tracing subscriber: {}", e);
    }
}

pub struct Dispatcher {
    mode: CliMode,
    runtime: Option<Arc<dyn Runtime>>,
    factory: Arc<dyn ConnectionFactory>,
    logger: Option<Logger>,
}

impl Dispatcher {
    pub fn new(mode: CliMode) -> Self {
        Self {
            mode,
            runtime: None,
            factory: Arc::new(DriverFactory),
            logger: None,
        }
    }

    pub fn test() -> Self {
        Self::new(CliMode::Test)
    }

    /// Use `runtime` instead of the external compiler from the config.
    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Parse `args` (including the program name) and run the selected command.
    pub async fn dispatch<I, T>(&self, args: I) -> MalloyResult<Option<ResultPayload>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(e) => match self.mode {
                CliMode::Interactive => e.exit(),
                CliMode::Test => match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => return Ok(None),
                    _ => return Err(MalloyError::Usage(e.to_string())),
                },
            },
        };

        let mut ctx = match self.init(&cli) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.fallback_logger().error(&e.to_string());
                return Err(e);
            }
        };

        commands::execute(&cli.command, &mut ctx).await
    }

    /// Pre-action hook: logging, configuration, then connections.
    pub fn init(&self, cli: &Cli) -> MalloyResult<AppContext> {
        let config = load_config(cli.config.as_deref())?;
        let (level, silent) = effective_level(cli, &config);

        let logger = match (&self.logger, self.mode) {
            (Some(logger), _) => logger.clone().with_level(level).silenced(silent),
            (None, CliMode::Test) => Logger::capture(level).silenced(silent),
            (None, CliMode::Interactive) => {
                init_tracing(level);
                Logger::new(level, silent)
            }
        };
        debug!("Effective log level {:?}, silent: {}", level, silent);

        let store = ConnectionStore::load(config.connections_path())?;
        let runtime = match &self.runtime {
            Some(runtime) => Arc::clone(runtime),
            None => Arc::new(CompilerBridge::new(config.compiler.clone())) as Arc<dyn Runtime>,
        };

        Ok(AppContext {
            config,
            logger,
            store,
            runtime,
            factory: Arc::clone(&self.factory),
        })
    }

    fn fallback_logger(&self) -> Logger {
        match (&self.logger, self.mode) {
            (Some(logger), _) => logger.clone(),
            (None, CliMode::Test) => Logger::capture(LogLevel::Error),
            (None, CliMode::Interactive) => Logger::new(LogLevel::Error, false),
        }
    }
}
