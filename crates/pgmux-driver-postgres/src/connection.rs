//! PostgreSQL connection implementation

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::TryStreamExt;
use pgmux_core::{Connection, PgmuxError, QueryResult, Result, Row, Value, encode_array};
use postgres_types::{Format, IsNull, ToSql, Type};
use tokio::sync::Mutex;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Row as PgRow, Statement};

use crate::error::map_error;

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// PostgreSQL connection wrapper
pub struct PostgresConnection {
    /// `None` once closed
    client: Mutex<Option<Client>>,
    /// Reuse named statements instead of preparing on every call
    prepare: bool,
    statements: parking_lot::Mutex<HashMap<String, Statement>>,
}

impl PostgresConnection {
    pub fn new(client: Client, prepare: bool) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            prepare,
            statements: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    async fn statement(&self, client: &Client, sql: &str) -> Result<Statement> {
        if !self.prepare {
            return client.prepare(sql).await.map_err(map_error);
        }

        let cached = self.statements.lock().get(sql).cloned();
        if let Some(statement) = cached {
            return Ok(statement);
        }
        let statement = client.prepare(sql).await.map_err(map_error)?;
        self.statements
            .lock()
            .insert(sql.to_string(), statement.clone());
        Ok(statement)
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn driver_name(&self) -> &str {
        "postgres"
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start_time = std::time::Instant::now();

        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(PgmuxError::ConnectionClosed)?;

        // Prepare first so we know the target type of each parameter
        let statement = self.statement(client, sql).await?;
        let param_types = statement.params();
        let pg_params: Vec<PgValue> = params
            .iter()
            .enumerate()
            .map(|(i, value)| match param_types.get(i) {
                Some(target_type) => PgValue::bind(value, target_type),
                None => PgValue::bind(value, &Type::UNKNOWN),
            })
            .collect();

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();

        let stream = client
            .query_raw(&statement, pg_params.iter().map(|p| p as &dyn ToSql))
            .await
            .map_err(map_error)?;
        let mut stream = std::pin::pin!(stream);

        let mut rows = Vec::new();
        while let Some(pg_row) = stream.try_next().await.map_err(map_error)? {
            let values = (0..columns.len())
                .map(|idx| postgres_to_value(&pg_row, idx))
                .collect();
            rows.push(Row::new(columns.clone(), values));
        }
        let count = stream.rows_affected().unwrap_or(rows.len() as u64);

        tracing::debug!(
            row_count = rows.len(),
            count,
            execution_time_ms = start_time.elapsed().as_millis() as u64,
            "statement executed"
        );

        Ok(QueryResult {
            columns,
            rows,
            count,
        })
    }

    async fn close(&self) -> Result<()> {
        // Dropping the client ends the connection task
        if self.client.lock().await.take().is_some() {
            self.statements.lock().clear();
            tracing::debug!("PostgreSQL connection closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        match self.client.try_lock() {
            Ok(guard) => guard.as_ref().is_none_or(Client::is_closed),
            // Busy with a statement, so not closed by us
            Err(_) => false,
        }
    }
}

/// A bind parameter in the representation tokio-postgres should send.
///
/// Binary variants are used when the value matches the declared parameter
/// type. Everything else travels as text and is parsed by the server,
/// which is also how encoded array literals reach array parameters.
#[derive(Debug, Clone, PartialEq)]
enum PgValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    DateTimeUtc(chrono::DateTime<chrono::Utc>),
    Literal(String),
}

impl PgValue {
    /// Convert a value for a parameter declared as `target_type`
    fn bind(value: &Value, target_type: &Type) -> Self {
        match (value, target_type) {
            (Value::Null, _) => PgValue::Null,
            (Value::Bool(v), &Type::BOOL) => PgValue::Bool(*v),
            (Value::Int16(v), _) => Self::coerce_int(*v as i64, target_type),
            (Value::Int32(v), _) => Self::coerce_int(*v as i64, target_type),
            (Value::Int64(v), _) => Self::coerce_int(*v, target_type),
            (Value::Float32(v), &Type::FLOAT4) => PgValue::Float32(*v),
            (Value::Float32(v), &Type::FLOAT8) => PgValue::Literal(float_literal(*v)),
            (Value::Float64(v), &Type::FLOAT8) => PgValue::Float64(*v),
            (Value::Float64(v), &Type::FLOAT4) => PgValue::Float32(*v as f32),
            (Value::Bytes(v), &Type::BYTEA) => PgValue::Bytes(v.clone()),
            (Value::Uuid(v), &Type::UUID) => PgValue::Uuid(*v),
            (Value::Json(v), &Type::JSON | &Type::JSONB) => PgValue::Json(v.clone()),
            (Value::DateTimeUtc(v), &Type::TIMESTAMPTZ) => PgValue::DateTimeUtc(*v),
            (other, _) => PgValue::Literal(literal(other)),
        }
    }

    /// Pick the integer width the parameter declares
    fn coerce_int(value: i64, target_type: &Type) -> Self {
        match *target_type {
            Type::INT2 => i16::try_from(value)
                .map(PgValue::Int16)
                .unwrap_or_else(|_| PgValue::Literal(value.to_string())),
            Type::INT4 => i32::try_from(value)
                .map(PgValue::Int32)
                .unwrap_or_else(|_| PgValue::Literal(value.to_string())),
            Type::INT8 => PgValue::Int64(value),
            Type::FLOAT8 => PgValue::Float64(value as f64),
            _ => PgValue::Literal(value.to_string()),
        }
    }
}

/// Text form the server parses for any parameter type
fn literal(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(v) => v.to_string(),
        Value::Float32(v) => float_literal(*v),
        Value::Float64(v) => float_literal(*v),
        Value::Bytes(v) => {
            let hex: String = v.iter().map(|b| format!("{:02x}", b)).collect();
            format!("\\x{}", hex)
        }
        Value::DateTimeUtc(v) => v.to_rfc3339(),
        Value::Json(v) => v.to_string(),
        Value::Array(items) => encode_array(items),
        other => other.to_string(),
    }
}

fn float_literal<T: Into<f64> + ToString + Copy>(v: T) -> String {
    let wide: f64 = v.into();
    if wide.is_nan() {
        "NaN".to_string()
    } else if wide.is_infinite() {
        if wide > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

impl ToSql for PgValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::Int16(v) => v.to_sql(ty, out),
            PgValue::Int32(v) => v.to_sql(ty, out),
            PgValue::Int64(v) => v.to_sql(ty, out),
            PgValue::Float32(v) => v.to_sql(ty, out),
            PgValue::Float64(v) => v.to_sql(ty, out),
            PgValue::Bytes(v) => v.to_sql(ty, out),
            PgValue::Uuid(v) => v.to_sql(ty, out),
            PgValue::Json(v) => v.to_sql(ty, out),
            PgValue::DateTimeUtc(v) => v.to_sql(ty, out),
            PgValue::Literal(v) => {
                out.extend_from_slice(v.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        match self {
            PgValue::Literal(_) => Format::Text,
            _ => Format::Binary,
        }
    }

    postgres_types::to_sql_checked!();
}

#[derive(Debug)]
struct PgNumericString(String);

#[derive(Debug)]
struct PgFallbackString(String);

impl PgNumericString {
    /// Render the binary NUMERIC payload as decimal text
    fn parse(raw: &[u8]) -> std::result::Result<String, BoxError> {
        if raw.len() < 8 {
            return Err("invalid NUMERIC payload: too short".into());
        }

        let ndigits = i16::from_be_bytes([raw[0], raw[1]]) as usize;
        let weight = i16::from_be_bytes([raw[2], raw[3]]);
        let sign = u16::from_be_bytes([raw[4], raw[5]]);
        let dscale = i16::from_be_bytes([raw[6], raw[7]]) as usize;

        if raw.len() < 8 + ndigits * 2 {
            return Err("invalid NUMERIC payload: truncated digits".into());
        }
        match sign {
            0xC000 => return Ok("NaN".to_string()),
            0xD000 => return Ok("Infinity".to_string()),
            0xF000 => return Ok("-Infinity".to_string()),
            _ => {}
        }

        let digits: Vec<u16> = (0..ndigits)
            .map(|i| u16::from_be_bytes([raw[8 + i * 2], raw[9 + i * 2]]))
            .collect();
        if digits.iter().any(|group| *group > 9999) {
            return Err("invalid NUMERIC payload: group out of range".into());
        }
        if digits.is_empty() {
            return Ok(if dscale > 0 {
                format!("0.{}", "0".repeat(dscale))
            } else {
                "0".to_string()
            });
        }

        let integer_groups = if weight >= 0 { weight as usize + 1 } else { 0 };

        let mut integer_text = String::new();
        for index in 0..integer_groups {
            let group = digits.get(index).copied().unwrap_or(0);
            if index == 0 {
                integer_text.push_str(&group.to_string());
            } else {
                integer_text.push_str(&format!("{group:04}"));
            }
        }
        if integer_text.is_empty() {
            integer_text.push('0');
        }

        let mut fraction_text = String::new();
        if dscale > 0 {
            // Groups between the decimal point and the first stored digit
            let leading_zero_groups = if weight < -1 { (-weight - 1) as usize } else { 0 };
            fraction_text.push_str(&"0000".repeat(leading_zero_groups));
            for group in digits.iter().skip(integer_groups.min(digits.len())) {
                fraction_text.push_str(&format!("{group:04}"));
            }
            if fraction_text.len() < dscale {
                fraction_text.push_str(&"0".repeat(dscale - fraction_text.len()));
            } else {
                fraction_text.truncate(dscale);
            }
        }

        let mut output = String::new();
        if sign == 0x4000 {
            output.push('-');
        }
        output.push_str(&integer_text);
        if !fraction_text.is_empty() {
            output.push('.');
            output.push_str(&fraction_text);
        }
        Ok(output)
    }
}

impl<'a> FromSql<'a> for PgNumericString {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

impl<'a> FromSql<'a> for PgFallbackString {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a PgRow, idx: usize, wrap: impl FnOnce(T) -> Value) -> Value {
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(Value::Null)
}

fn get_array<'a, T: FromSql<'a>>(
    row: &'a PgRow,
    idx: usize,
    wrap: impl Fn(T) -> Value,
) -> Value {
    get::<Vec<Option<T>>>(row, idx, |items| {
        Value::Array(
            items
                .into_iter()
                .map(|item| item.map(&wrap).unwrap_or(Value::Null))
                .collect(),
        )
    })
}

/// Convert a PostgreSQL column value to a [`Value`]
fn postgres_to_value(row: &PgRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    match type_name {
        "bool" => get(row, idx, Value::Bool),
        "int2" => get(row, idx, Value::Int16),
        "int4" => get(row, idx, Value::Int32),
        "int8" => get(row, idx, Value::Int64),
        "oid" => get(row, idx, |v: u32| Value::Int64(v as i64)),
        "float4" => get(row, idx, Value::Float32),
        "float8" => get(row, idx, Value::Float64),
        "text" | "varchar" | "bpchar" | "name" | "citext" => get(row, idx, Value::String),
        "bytea" => get(row, idx, Value::Bytes),
        "uuid" => get(row, idx, Value::Uuid),
        "json" | "jsonb" => get(row, idx, Value::Json),
        "timestamptz" => get(row, idx, Value::DateTimeUtc),
        "timestamp" => get(row, idx, |v: chrono::NaiveDateTime| {
            Value::DateTimeUtc(v.and_utc())
        }),
        "date" => get(row, idx, |v: chrono::NaiveDate| Value::String(v.to_string())),
        "time" => get(row, idx, |v: chrono::NaiveTime| Value::String(v.to_string())),
        "numeric" => get(row, idx, |v: PgNumericString| Value::Decimal(v.0)),
        // Array type names carry a leading underscore
        "_bool" => get_array(row, idx, Value::Bool),
        "_int2" => get_array(row, idx, Value::Int16),
        "_int4" => get_array(row, idx, Value::Int32),
        "_int8" => get_array(row, idx, Value::Int64),
        "_float8" => get_array(row, idx, Value::Float64),
        "_text" | "_varchar" | "_bpchar" | "_name" => get_array(row, idx, Value::String),
        "_uuid" => get_array(row, idx, Value::Uuid),
        "_jsonb" | "_json" => get_array(row, idx, Value::Json),
        // Enums and other custom types: raw payload as text
        _ => get(row, idx, |v: PgFallbackString| Value::String(v.0)),
    }
}
