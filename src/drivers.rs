use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use duckdb::types::{TimeUnit, Value as DuckValue};
use pg_bigdecimal::PgNumeric;
use serde_json::{json, Value as JsonValue};
use std::error::Error;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info};

use crate::connection::{BigQueryConfig, DatabaseConnection, DuckDbConfig, PostgresConfig, Row};
use crate::error::{MalloyError, MalloyResult};

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";
const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PostgresConnection {
    name: String,
    client: Client,
}

impl PostgresConnection {
    pub async fn connect(config: &PostgresConfig) -> MalloyResult<Self> {
        let host = config.host.as_deref().unwrap_or("localhost");
        let port = config.port.unwrap_or(5432);
        info!("Connecting to Postgres at {}:{}", host, port);

        let mut pg = tokio_postgres::Config::new();
        pg.host(host).port(port);
        if let Some(user) = &config.username {
            pg.user(user);
        }
        if let Some(password) = &config.password {
            pg.password(password);
        }
        if let Some(db) = &config.database_name {
            pg.dbname(db);
        }

        let (client, connection) = pg.connect(NoTls).await.map_err(|e| {
            MalloyError::Execution(format!(
                "Failed to connect to Postgres at {}:{}\n\nOriginal error: {}",
                host, port, e
            ))
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection closed with error: {}", e);
            }
        });

        Ok(Self {
            name: config.name.clone(),
            client,
        })
    }

    /// Run through the simple query protocol, which returns every value as text.
    async fn run_as_text(&self, sql: &str) -> MalloyResult<Vec<Row>> {
        let messages = self.client.simple_query(sql).await?;
        Ok(messages
            .iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(text_row(
                    row.columns()
                        .iter()
                        .enumerate()
                        .map(|(i, column)| (column.name(), row.get(i))),
                )),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_sql(&self, sql: &str) -> MalloyResult<Vec<Row>> {
        debug!("postgres: {}", sql);
        let statement = self.client.prepare(sql).await?;
        if let Some(column) = statement.columns().iter().find(|c| !decodes_natively(c.type_())) {
            debug!(
                "column '{}' has type {}, reading the result as text",
                column.name(),
                column.type_()
            );
            return self.run_as_text(sql).await;
        }

        let rows = self.client.query(&statement, &[]).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut json_row = Row::new();
            for (i, column) in row.columns().iter().enumerate() {
                json_row.insert(column.name().to_string(), pg_value_to_json(row, i, column.type_())?);
            }
            out.push(json_row);
        }
        Ok(out)
    }
}

fn text_row<'a>(cells: impl Iterator<Item = (&'a str, Option<&'a str>)>) -> Row {
    cells
        .map(|(name, value)| (name.to_string(), value.map_or(JsonValue::Null, |v| json!(v))))
        .collect()
}

fn is_native_scalar(ty: &Type) -> bool {
    matches!(
        ty,
        &Type::BOOL
            | &Type::INT2
            | &Type::INT4
            | &Type::INT8
            | &Type::FLOAT4
            | &Type::FLOAT8
            | &Type::NUMERIC
            | &Type::TEXT
            | &Type::VARCHAR
            | &Type::BPCHAR
            | &Type::NAME
            | &Type::JSON
            | &Type::JSONB
            | &Type::TIMESTAMP
            | &Type::TIMESTAMPTZ
            | &Type::DATE
            | &Type::TIME
            | &Type::OID
            | &Type::CHAR
            | &Type::INET
    )
}

fn is_native_array_element(ty: &Type) -> bool {
    matches!(
        ty,
        &Type::BOOL
            | &Type::INT2
            | &Type::INT4
            | &Type::INT8
            | &Type::FLOAT4
            | &Type::FLOAT8
            | &Type::TEXT
            | &Type::VARCHAR
            | &Type::BPCHAR
            | &Type::NAME
    )
}

fn decodes_natively(ty: &Type) -> bool {
    match ty.kind() {
        Kind::Array(inner) => is_native_array_element(inner),
        _ => is_native_scalar(ty),
    }
}

fn pg_value_to_json(row: &tokio_postgres::Row, i: usize, ty: &Type) -> MalloyResult<JsonValue> {
    if let Kind::Array(inner) = ty.kind() {
        return pg_array_to_json(row, i, inner);
    }
    let value = match ty {
        &Type::BOOL => json!(row.try_get::<_, Option<bool>>(i)?),
        &Type::INT2 => json!(row.try_get::<_, Option<i16>>(i)?),
        &Type::INT4 => json!(row.try_get::<_, Option<i32>>(i)?),
        &Type::INT8 => json!(row.try_get::<_, Option<i64>>(i)?),
        &Type::FLOAT4 => json!(row.try_get::<_, Option<f32>>(i)?),
        &Type::FLOAT8 => json!(row.try_get::<_, Option<f64>>(i)?),
        &Type::NUMERIC => row
            .try_get::<_, Option<PgDecimal>>(i)?
            .map_or(JsonValue::Null, numeric_to_json),
        &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME => {
            json!(row.try_get::<_, Option<String>>(i)?)
        }
        &Type::JSON | &Type::JSONB => row.try_get::<_, Option<JsonValue>>(i)?.unwrap_or(JsonValue::Null),
        &Type::TIMESTAMP => json!(row
            .try_get::<_, Option<NaiveDateTime>>(i)?
            .map(|t| t.to_string())),
        &Type::TIMESTAMPTZ => json!(row
            .try_get::<_, Option<DateTime<Utc>>>(i)?
            .map(|t| t.to_rfc3339())),
        &Type::DATE => json!(row.try_get::<_, Option<NaiveDate>>(i)?.map(|d| d.to_string())),
        &Type::TIME => json!(row.try_get::<_, Option<NaiveTime>>(i)?.map(|t| t.to_string())),
        &Type::OID => json!(row.try_get::<_, Option<u32>>(i)?),
        &Type::CHAR => json!(row
            .try_get::<_, Option<i8>>(i)?
            .map(|c| char::from(c as u8).to_string())),
        &Type::INET => json!(row.try_get::<_, Option<IpAddr>>(i)?.map(|a| a.to_string())),
        other => {
            return Err(MalloyError::Execution(format!("unsupported postgres type {}", other)));
        }
    };
    Ok(value)
}

fn pg_array_to_json(row: &tokio_postgres::Row, i: usize, element: &Type) -> MalloyResult<JsonValue> {
    let value = match element {
        &Type::BOOL => json!(row.try_get::<_, Option<Vec<Option<bool>>>>(i)?),
        &Type::INT2 => json!(row.try_get::<_, Option<Vec<Option<i16>>>>(i)?),
        &Type::INT4 => json!(row.try_get::<_, Option<Vec<Option<i32>>>>(i)?),
        &Type::INT8 => json!(row.try_get::<_, Option<Vec<Option<i64>>>>(i)?),
        &Type::FLOAT4 => json!(row.try_get::<_, Option<Vec<Option<f32>>>>(i)?),
        &Type::FLOAT8 => json!(row.try_get::<_, Option<Vec<Option<f64>>>>(i)?),
        &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME => {
            json!(row.try_get::<_, Option<Vec<Option<String>>>>(i)?)
        }
        other => {
            return Err(MalloyError::Execution(format!("unsupported postgres array of {}", other)));
        }
    };
    Ok(value)
}

/// A NUMERIC cell. `pg_bigdecimal` decodes finite values and NaN; the
/// infinities Postgres 14 added are recognised by their sign word first.
enum PgDecimal {
    Value(PgNumeric),
    Infinity,
    NegativeInfinity,
}

impl<'a> FromSql<'a> for PgDecimal {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        match raw.get(4..6) {
            Some([0xD0, 0x00]) => Ok(PgDecimal::Infinity),
            Some([0xF0, 0x00]) => Ok(PgDecimal::NegativeInfinity),
            _ => Ok(PgDecimal::Value(PgNumeric::from_sql(ty, raw)?)),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <PgNumeric as FromSql>::accepts(ty)
    }
}

fn numeric_to_json(value: PgDecimal) -> JsonValue {
    let text = match value {
        PgDecimal::Value(numeric) => match numeric.n {
            Some(n) => n.normalized().to_string(),
            None => "NaN".to_string(),
        },
        PgDecimal::Infinity => "Infinity".to_string(),
        PgDecimal::NegativeInfinity => "-Infinity".to_string(),
    };
    serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
}

// ---------------------------------------------------------------------------
// DuckDB
// ---------------------------------------------------------------------------

pub struct DuckDbConnection {
    name: String,
    conn: Arc<Mutex<duckdb::Connection>>,
}

impl DuckDbConnection {
    pub async fn open(config: &DuckDbConfig) -> MalloyResult<Self> {
        let path = config.database_path.as_ref().map(|p| match &config.working_directory {
            Some(dir) if p.is_relative() => dir.join(p),
            _ => p.clone(),
        });

        let conn = tokio::task::spawn_blocking(move || open_duckdb(path))
            .await
            .map_err(|e| MalloyError::Execution(format!("DuckDB open task failed: {}", e)))??;

        Ok(Self {
            name: config.name.clone(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn open_duckdb(path: Option<PathBuf>) -> MalloyResult<duckdb::Connection> {
    match path {
        Some(path) => {
            info!("Opening DuckDB database {}", path.display());
            Ok(duckdb::Connection::open(path)?)
        }
        None => {
            info!("Opening in-memory DuckDB database");
            Ok(duckdb::Connection::open_in_memory()?)
        }
    }
}

#[async_trait]
impl DatabaseConnection for DuckDbConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_sql(&self, sql: &str) -> MalloyResult<Vec<Row>> {
        debug!("duckdb: {}", sql);
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| MalloyError::Execution("DuckDB connection poisoned".to_string()))?;
            query_duckdb(&conn, &sql)
        })
        .await
        .map_err(|e| MalloyError::Execution(format!("DuckDB query task failed: {}", e)))?
    }
}

fn query_duckdb(conn: &duckdb::Connection, sql: &str) -> MalloyResult<Vec<Row>> {
    let mut statement = conn.prepare(sql)?;
    let mut rows = statement.query([])?;
    let names: Vec<String> = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut json_row = Row::new();
        for (i, name) in names.iter().enumerate() {
            json_row.insert(name.clone(), duck_value_to_json(&row.get::<_, DuckValue>(i)?));
        }
        out.push(json_row);
    }
    Ok(out)
}

fn duck_value_to_json(value: &DuckValue) -> JsonValue {
    match value {
        DuckValue::Null => JsonValue::Null,
        DuckValue::Boolean(v) => json!(v),
        DuckValue::TinyInt(v) => json!(v),
        DuckValue::SmallInt(v) => json!(v),
        DuckValue::Int(v) => json!(v),
        DuckValue::BigInt(v) => json!(v),
        DuckValue::HugeInt(v) => json!(v.to_string()),
        DuckValue::UTinyInt(v) => json!(v),
        DuckValue::USmallInt(v) => json!(v),
        DuckValue::UInt(v) => json!(v),
        DuckValue::UBigInt(v) => json!(v),
        DuckValue::Float(v) => json!(v),
        DuckValue::Double(v) => json!(v),
        DuckValue::Decimal(v) => {
            let text = v.to_string();
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
        DuckValue::Text(v) | DuckValue::Enum(v) => json!(v),
        DuckValue::Blob(_) => JsonValue::String("BLOB".to_string()),
        DuckValue::Date32(days) => json!(DateTime::from_timestamp(*days as i64 * 86_400, 0)
            .map(|dt| dt.date_naive().to_string())),
        DuckValue::Timestamp(unit, v) => json!(DateTime::from_timestamp_micros(to_micros(*unit, *v))
            .map(|dt| dt.naive_utc().to_string())),
        DuckValue::Time64(unit, v) => json!(time_of_day(to_micros(*unit, *v)).map(|t| t.to_string())),
        DuckValue::Interval { months, days, nanos } => json!(iso_duration(*months, *days, *nanos)),
        DuckValue::List(items) | DuckValue::Array(items) => {
            JsonValue::Array(items.iter().map(duck_value_to_json).collect())
        }
        DuckValue::Struct(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), duck_value_to_json(v)))
                .collect(),
        ),
        DuckValue::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k), duck_value_to_json(v)))
                .collect(),
        ),
        DuckValue::Union(inner) => duck_value_to_json(inner),
    }
}

fn to_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

fn time_of_day(micros: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

/// ISO-8601 duration, e.g. `P1M2DT3.5S`.
fn iso_duration(months: i32, days: i32, nanos: i64) -> String {
    let sign = if nanos < 0 { "-" } else { "" };
    let whole = (nanos / 1_000_000_000).abs();
    let frac = (nanos % 1_000_000_000).abs();
    let seconds = if frac == 0 {
        whole.to_string()
    } else {
        let digits = format!("{:09}", frac);
        format!("{}.{}", whole, digits.trim_end_matches('0'))
    };
    format!("P{}M{}DT{}{}S", months, days, sign, seconds)
}

// JSON object keys must be strings; other key types use their JSON text.
fn map_key(key: &DuckValue) -> String {
    match duck_value_to_json(key) {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// BigQuery
// ---------------------------------------------------------------------------

pub struct BigQueryConnection {
    config: BigQueryConfig,
    http: reqwest::Client,
    token: String,
}

impl BigQueryConnection {
    pub async fn connect(config: BigQueryConfig) -> MalloyResult<Self> {
        let token = access_token(&config).await?;
        Ok(Self {
            config,
            http: reqwest::Client::new(),
            token,
        })
    }

    fn request_body(&self, sql: &str) -> JsonValue {
        let mut body = json!({ "query": sql, "useLegacySql": false });
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }
        if let Some(timeout) = &self.config.timeout_ms {
            body["timeoutMs"] = passthrough_number(timeout);
        }
        if let Some(max) = &self.config.maximum_bytes_billed {
            body["maximumBytesBilled"] = json!(max);
        }
        body
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> MalloyResult<JsonValue> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let body: JsonValue = response.json().await?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(MalloyError::Execution(format!("BigQuery returned {}: {}", status, message)));
        }
        Ok(body)
    }

    /// `jobs.getQueryResults`: waits on a running job or fetches a later page.
    async fn query_results(
        &self,
        project: &str,
        job: &JsonValue,
        page_token: Option<String>,
    ) -> MalloyResult<JsonValue> {
        let job_id = job["jobId"].as_str().ok_or_else(|| {
            MalloyError::Execution("BigQuery response has no job reference".to_string())
        })?;

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(location) = job["location"].as_str() {
            params.push(("location", location.to_string()));
        }
        if let Some(timeout) = &self.config.timeout_ms {
            params.push(("timeoutMs", timeout.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let url = format!("{}/projects/{}/queries/{}", BIGQUERY_API, project, job_id);
        self.send(self.http.get(url).query(&params)).await
    }
}

fn passthrough_number(value: &str) -> JsonValue {
    value.parse::<u64>().map(|n| json!(n)).unwrap_or_else(|_| json!(value))
}

async fn access_token(config: &BigQueryConfig) -> MalloyResult<String> {
    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        return Ok(token);
    }

    let mut cmd = tokio::process::Command::new("gcloud");
    cmd.args(["auth", "application-default", "print-access-token"]);
    if let Some(key) = &config.service_account_key_path {
        cmd.env("GOOGLE_APPLICATION_CREDENTIALS", key);
    }
    let output = cmd.output().await.map_err(|e| {
        MalloyError::Execution(format!(
            "Failed to obtain a BigQuery access token (set {} or install gcloud): {}",
            ACCESS_TOKEN_ENV, e
        ))
    })?;
    if !output.status.success() {
        return Err(MalloyError::Execution(format!(
            "gcloud could not print an access token: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl DatabaseConnection for BigQueryConnection {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run_sql(&self, sql: &str) -> MalloyResult<Vec<Row>> {
        let project = self.config.project_id.as_deref().ok_or_else(|| {
            MalloyError::Execution(format!("BigQuery connection '{}' has no project id", self.config.name))
        })?;
        debug!("bigquery ({}): {}", project, sql);

        let request = self
            .http
            .post(format!("{}/projects/{}/queries", BIGQUERY_API, project))
            .json(&self.request_body(sql));
        let first = self.send(request).await?;
        let job = first["jobReference"].clone();

        drain_pages(first, |page_token| self.query_results(project, &job, page_token)).await
    }
}

/// Collect every row of a query response. `fetch(None)` polls a job that has
/// not completed; `fetch(Some(token))` reads the next page.
async fn drain_pages<F, Fut>(first: JsonValue, mut fetch: F) -> MalloyResult<Vec<Row>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = MalloyResult<JsonValue>>,
{
    let mut body = first;
    let mut fields: Vec<JsonValue> = Vec::new();
    let mut rows = Vec::new();

    loop {
        if body["jobComplete"] == json!(false) {
            debug!("BigQuery job not complete yet, polling");
            body = fetch(None).await?;
            continue;
        }
        if let Some(schema) = body["schema"]["fields"].as_array() {
            fields = schema.clone();
        }
        rows.extend(bigquery_rows(&fields, &body["rows"]));

        let next = body["pageToken"].as_str().map(str::to_string);
        match next {
            Some(token) => {
                debug!("Fetching next BigQuery page ({} rows so far)", rows.len());
                body = fetch(Some(token)).await?;
            }
            None => break,
        }
    }
    Ok(rows)
}

fn bigquery_rows(fields: &[JsonValue], rows: &JsonValue) -> Vec<Row> {
    rows.as_array()
        .map(|rows| rows.iter().map(|row| bigquery_record(fields, row)).collect())
        .unwrap_or_default()
}

// Rows and RECORD values share the `{"f": [{"v": ...}]}` shape.
fn bigquery_record(fields: &[JsonValue], record: &JsonValue) -> Row {
    let empty = Vec::new();
    let cells = record["f"].as_array().unwrap_or(&empty);
    fields
        .iter()
        .zip(cells)
        .map(|(field, cell)| {
            let name = field["name"].as_str().unwrap_or_default().to_string();
            (name, bigquery_cell(field, &cell["v"]))
        })
        .collect()
}

fn bigquery_cell(field: &JsonValue, value: &JsonValue) -> JsonValue {
    if field["mode"] == "REPEATED" {
        let items = value.as_array().map(Vec::as_slice).unwrap_or(&[]);
        return JsonValue::Array(items.iter().map(|item| bigquery_single(field, &item["v"])).collect());
    }
    bigquery_single(field, value)
}

fn bigquery_single(field: &JsonValue, value: &JsonValue) -> JsonValue {
    match field["type"].as_str().unwrap_or("STRING") {
        "RECORD" | "STRUCT" if !value.is_null() => {
            let nested = field["fields"].as_array().map(Vec::as_slice).unwrap_or(&[]);
            JsonValue::Object(bigquery_record(nested, value))
        }
        ty => bigquery_value_to_json(ty, value),
    }
}

fn bigquery_value_to_json(ty: &str, value: &JsonValue) -> JsonValue {
    let Some(text) = value.as_str() else {
        return value.clone();
    };
    match ty {
        "INTEGER" | "INT64" => text.parse::<i64>().map(|v| json!(v)).unwrap_or_else(|_| json!(text)),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => {
            text.parse::<f64>().map(|v| json!(v)).unwrap_or_else(|_| json!(text))
        }
        "BOOLEAN" | "BOOL" => json!(text == "true"),
        _ => json!(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn numeric_bytes(ndigits: i16, weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    fn numeric(raw: &[u8]) -> JsonValue {
        numeric_to_json(PgDecimal::from_sql(&Type::NUMERIC, raw).unwrap())
    }

    #[test]
    fn postgres_numeric_to_json() {
        // 12345.678 = [1, 2345, 6780] with weight 1
        assert_eq!(numeric(&numeric_bytes(3, 1, 0, 3, &[1, 2345, 6780])), json!(12345.678));
        assert_eq!(numeric(&numeric_bytes(1, 0, 0, 0, &[42])), json!(42));
        assert_eq!(numeric(&numeric_bytes(0, 0, 0xC000, 0, &[])), json!("NaN"));
        assert_eq!(numeric(&numeric_bytes(0, 0, 0xD000, 0, &[])), json!("Infinity"));
        assert_eq!(numeric(&numeric_bytes(0, 0, 0xF000, 0, &[])), json!("-Infinity"));
    }

    #[test]
    fn unknown_postgres_types_fall_back_to_text() {
        assert!(decodes_natively(&Type::INT4));
        assert!(decodes_natively(&Type::TEXT_ARRAY));
        assert!(decodes_natively(&Type::INET));
        assert!(!decodes_natively(&Type::UUID));
        assert!(!decodes_natively(&Type::INTERVAL));
        assert!(!decodes_natively(&Type::JSONB_ARRAY));

        let row = text_row(
            [
                ("id", Some("1b4e28ba-2fa1-11d2-883f-0016d3cca427")),
                ("wait", Some("00:05:00")),
                ("gone", None),
            ]
            .into_iter(),
        );
        assert_eq!(
            JsonValue::Object(row),
            json!({"id": "1b4e28ba-2fa1-11d2-883f-0016d3cca427", "wait": "00:05:00", "gone": null})
        );
    }

    fn carrier_schema() -> JsonValue {
        json!([
            {"name": "state", "type": "STRING"},
            {"name": "n", "type": "INTEGER"},
            {"name": "ok", "type": "BOOLEAN"}
        ])
    }

    #[test]
    fn converts_bigquery_rows_by_field_type() {
        let fields = carrier_schema();
        let rows = bigquery_rows(
            fields.as_array().unwrap(),
            &json!([{"f": [{"v": "CA"}, {"v": "12"}, {"v": "true"}]}]),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["state"], json!("CA"));
        assert_eq!(rows[0]["n"], json!(12));
        assert_eq!(rows[0]["ok"], json!(true));
    }

    #[test]
    fn converts_nested_bigquery_records() {
        let fields = json!([
            {"name": "carrier", "type": "STRING"},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "by_origin", "type": "RECORD", "mode": "REPEATED", "fields": [
                {"name": "origin", "type": "STRING"},
                {"name": "flights", "type": "INTEGER"}
            ]},
            {"name": "top", "type": "RECORD", "mode": "NULLABLE", "fields": [
                {"name": "origin", "type": "STRING"}
            ]}
        ]);
        let rows = json!([{"f": [
            {"v": "AA"},
            {"v": [{"v": "a"}, {"v": "b"}]},
            {"v": [
                {"v": {"f": [{"v": "SFO"}, {"v": "3"}]}},
                {"v": {"f": [{"v": "JFK"}, {"v": "5"}]}}
            ]},
            {"v": null}
        ]}]);

        let rows = bigquery_rows(fields.as_array().unwrap(), &rows);
        assert_eq!(
            JsonValue::Object(rows[0].clone()),
            json!({
                "carrier": "AA",
                "tags": ["a", "b"],
                "by_origin": [{"origin": "SFO", "flights": 3}, {"origin": "JFK", "flights": 5}],
                "top": null
            })
        );
    }

    #[tokio::test]
    async fn bigquery_polls_and_reads_every_page() {
        let first = json!({"jobComplete": false, "jobReference": {"jobId": "job_1"}});
        let mut pages = VecDeque::from(vec![
            json!({
                "jobComplete": true,
                "schema": {"fields": carrier_schema()},
                "rows": [{"f": [{"v": "CA"}, {"v": "1"}, {"v": "true"}]}],
                "pageToken": "page_2"
            }),
            json!({
                "jobComplete": true,
                "rows": [{"f": [{"v": "NY"}, {"v": "2"}, {"v": "false"}]}]
            }),
        ]);
        let mut requested = Vec::new();

        let rows = drain_pages(first, |token| {
            requested.push(token);
            let page = pages.pop_front().expect("no more pages");
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(requested, vec![None, Some("page_2".to_string())]);
        let states: Vec<&JsonValue> = rows.iter().map(|r| &r["state"]).collect();
        assert_eq!(states, vec![&json!("CA"), &json!("NY")]);
        assert_eq!(rows[1]["ok"], json!(false));
    }

    #[test]
    fn interval_as_iso_duration() {
        assert_eq!(iso_duration(1, 2, 3_500_000_000), "P1M2DT3.5S");
        assert_eq!(iso_duration(0, 0, 0), "P0M0DT0S");
        assert_eq!(iso_duration(0, 1, -60_000_000_000), "P0M1DT-60S");
    }

    async fn duck() -> DuckDbConnection {
        DuckDbConnection::open(&DuckDbConfig {
            name: "duck".into(),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn duckdb_in_memory_round_trip() {
        let conn = duck().await;
        let rows = conn
            .run_sql("SELECT 1 AS one, 'a' AS letter, NULL AS nothing")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["one"], json!(1));
        assert_eq!(rows[0]["letter"], json!("a"));
        assert_eq!(rows[0]["nothing"], JsonValue::Null);
        let columns: Vec<&String> = rows[0].keys().collect();
        assert_eq!(columns, vec!["one", "letter", "nothing"]);
    }

    #[tokio::test]
    async fn duckdb_nested_values_are_json() {
        let conn = duck().await;
        let rows = conn
            .run_sql(
                "SELECT [1, 2] AS l, {'carrier': 'AA', 'n': 3} AS s, TIME '10:00:00' AS t, \
                 [{'origin': 'SFO'}] AS nested",
            )
            .await
            .unwrap();

        assert_eq!(rows[0]["l"], json!([1, 2]));
        assert_eq!(rows[0]["s"], json!({"carrier": "AA", "n": 3}));
        assert_eq!(rows[0]["t"], json!("10:00:00"));
        assert_eq!(rows[0]["nested"], json!([{"origin": "SFO"}]));
    }
}
