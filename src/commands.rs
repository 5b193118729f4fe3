use std::io::Write;
use std::sync::Arc;
use tracing::error;

use crate::cli::{AppContext, BigQueryArgs, Commands, ConnectionCommands, DuckDbArgs, PostgresArgs, QueryArgs};
use crate::connection::{BigQueryConfig, ConnectionConfig, DuckDbConfig, PostgresConfig};
use crate::error::MalloyResult;
use crate::executor::{QueryExecutor, ResultPayload, RunOptions};
use crate::formatter::{format_rows, parse_rows, OutputFormat};
use crate::output::ResultFilter;
use crate::store::TestOutcome;

/// Run one parsed command. Errors are reported here, once, and then returned.
pub async fn execute(command: &Commands, ctx: &mut AppContext) -> MalloyResult<Option<ResultPayload>> {
    let result = match command {
        Commands::Run { target, json, format } => run_malloy(ctx, target, *json, *format, false).await.map(Some),
        Commands::Compile { target, json } => {
            run_malloy(ctx, target, *json, OutputFormat::Table, true).await.map(Some)
        }
        Commands::Connections { command } => connections(ctx, command).await.map(|_| None),
        Commands::Config => show_config(ctx).map(|_| None),
    };

    if let Err(e) = &result {
        error!("Command failed: {:?}", e);
        ctx.logger.error(&e.to_string());
    }
    result
}

async fn run_malloy(
    ctx: &AppContext,
    target: &QueryArgs,
    json: bool,
    format: OutputFormat,
    compile_only: bool,
) -> MalloyResult<ResultPayload> {
    let logger = if json {
        ctx.logger.filtered(ResultFilter::JsonOnly)
    } else {
        ctx.logger.clone()
    };

    let verb = if compile_only { "Compiling" } else { "Running" };
    logger.task(&format!("{} {}", verb, target.file.display()));

    let options = RunOptions {
        selection: target.selection(),
        extend: target.extend.clone(),
        compile_only,
    };
    let executor = QueryExecutor::new(ctx.runtime.as_ref(), &ctx.store, Arc::clone(&ctx.factory));
    let payload = executor.run_malloy(&target.file, &options).await?;

    if json {
        logger.result(&serde_json::to_string_pretty(&payload)?);
    } else {
        logger.sql(&payload.sql);
        if let Some(results) = &payload.results {
            let rows = parse_rows(results)?;
            logger.result(&format_rows(&rows, format)?);
        }
    }

    Ok(payload)
}

async fn connections(ctx: &mut AppContext, command: &ConnectionCommands) -> MalloyResult<()> {
    match command {
        ConnectionCommands::List { show_secrets } => {
            if ctx.store.list().is_empty() {
                ctx.logger.info("No connections configured");
                return Ok(());
            }
            let shown: Vec<ConnectionConfig> = ctx
                .store
                .list()
                .iter()
                .map(|c| if *show_secrets { c.clone() } else { c.redacted() })
                .collect();
            ctx.logger.result(&serde_json::to_string_pretty(&shown)?);
        }
        ConnectionCommands::Show { name, show_secrets } => {
            let config = ctx.store.get(name)?;
            let shown = if *show_secrets { config.clone() } else { config.redacted() };
            ctx.logger.result(&serde_json::to_string_pretty(&shown)?);
        }
        ConnectionCommands::Test { name } => {
            ctx.logger.task(&format!("Testing connection '{}'", name));
            match ctx.store.test(name, ctx.factory.as_ref()).await? {
                TestOutcome::Succeeded => ctx.logger.success(&format!("Connection '{}' succeeded", name)),
                TestOutcome::Failed(reason) => {
                    ctx.logger.error(&format!("Connection '{}' failed: {}", name, reason))
                }
            }
        }
        ConnectionCommands::Delete { name } => {
            ctx.store.delete(name)?;
            ctx.logger.success(&format!("Deleted connection '{}'", name));
        }
        ConnectionCommands::CreateBigquery(args) => create(ctx, bigquery_config(args))?,
        ConnectionCommands::CreatePostgres(args) => {
            let config = postgres_config(args)?;
            create(ctx, config)?
        }
        ConnectionCommands::CreateDuckdb(args) => create(ctx, duckdb_config(args))?,
    }
    Ok(())
}

fn create(ctx: &mut AppContext, config: ConnectionConfig) -> MalloyResult<()> {
    let message = format!("Created {} connection '{}'", config.kind(), config.name());
    ctx.store.create(config)?;
    ctx.logger.success(&message);
    Ok(())
}

fn bigquery_config(args: &BigQueryArgs) -> ConnectionConfig {
    ConnectionConfig::BigQuery(BigQueryConfig {
        name: args.name.clone(),
        project_id: args.project_id.clone(),
        location: args.location.clone(),
        service_account_key_path: args.service_account_key_path.clone(),
        timeout_ms: args.timeout_ms.clone(),
        maximum_bytes_billed: args.maximum_bytes_billed.clone(),
    })
}

fn postgres_config(args: &PostgresArgs) -> MalloyResult<ConnectionConfig> {
    let password = if args.password_prompt {
        print!("Password: ");
        std::io::stdout().flush()?;
        Some(rpassword::read_password()?)
    } else {
        args.password.clone()
    };

    Ok(ConnectionConfig::Postgres(PostgresConfig {
        name: args.name.clone(),
        host: args.host.clone(),
        port: args.port,
        username: args.username.clone(),
        password,
        database_name: args.database_name.clone(),
    }))
}

fn duckdb_config(args: &DuckDbArgs) -> ConnectionConfig {
    ConnectionConfig::DuckDb(DuckDbConfig {
        name: args.name.clone(),
        database_path: args.database_path.clone(),
        working_directory: args.working_directory.clone(),
    })
}

fn show_config(ctx: &AppContext) -> MalloyResult<()> {
    ctx.logger.result(&serde_json::to_string_pretty(&ctx.config)?);
    Ok(())
}
