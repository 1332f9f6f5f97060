//! Query execution bridge.
//!
//! Translates a validated request (compiled endpoint + supplied query
//! parameters) into a backend query restricted to the endpoint's bound
//! columns and operators. The backend itself sits behind [`QueryBackend`],
//! a narrow execute-and-return-rows contract: ClickHouse over HTTP in
//! production, an in-memory table map for tests and debug runs.
//!
//! SQL text only ever contains identifiers taken from the manifest and
//! typed `{name:Type}` placeholders; caller-supplied values travel as
//! bound parameters, never spliced into the text.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use cerro_core::endpoint::{EndpointSpec, Operator};

use crate::config::ClickHouseConfig;
use crate::error::ApiError;

/// One result row: column name → value, in backend order.
pub type Row = serde_json::Map<String, Value>;

/// Pagination bounds, matching the public API contract.
const DEFAULT_LIMIT: u64 = 100;
const MAX_LIMIT: u64 = 5000;

/// Failure from the query backend, classified for HTTP mapping.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct QueryBackendError {
    message: String,
    transient: bool,
}

impl QueryBackendError {
    /// A failure worth retrying (network, timeout, backend overload).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure retries won't fix (bad relation, rejected query).
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether a client retry could plausibly succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.transient
    }
}

/// The narrow contract the route dispatcher executes queries through.
///
/// Implementations must be cancellation-safe: dropping the returned future
/// (client disconnect, timeout) must abort the underlying query call.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Executes `sql` with named parameters, returning ordered rows.
    async fn execute(
        &self,
        sql: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Row>, QueryBackendError>;
}

// ============================================================================
// Compiled endpoints
// ============================================================================

/// An endpoint with its query skeleton resolved at table-build time.
///
/// Binding a request against it validates the supplied parameters and
/// produces the final SQL + parameter list.
#[derive(Debug)]
pub struct CompiledEndpoint {
    /// The derived endpoint specification.
    pub spec: EndpointSpec,
    select: String,
}

/// A fully bound query, ready for the backend.
#[derive(Debug, PartialEq, Eq)]
pub struct BoundQuery {
    /// SQL text with typed placeholders.
    pub sql: String,
    /// Named parameter values, placeholder name → value.
    pub params: Vec<(String, String)>,
}

impl CompiledEndpoint {
    /// Compiles an endpoint specification into its query skeleton.
    #[must_use]
    pub fn compile(spec: EndpointSpec) -> Self {
        let select = format!("SELECT * FROM {}", spec.relation);
        Self { spec, select }
    }

    /// Validates supplied query parameters and binds them into a query.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::invalid_parameter`] for unrecognized parameters,
    /// missing required parameters, or out-of-range pagination values.
    pub fn bind(&self, supplied: &HashMap<String, String>) -> Result<BoundQuery, ApiError> {
        // Reject unknown names first, deterministically.
        let mut unknown: Vec<&str> = supplied
            .keys()
            .map(String::as_str)
            .filter(|name| {
                *name != "limit" && *name != "offset" && !self.spec.params.iter().any(|p| p.name == *name)
            })
            .collect();
        unknown.sort_unstable();
        if let Some(name) = unknown.first() {
            return Err(ApiError::invalid_parameter(format!(
                "Unknown query parameter: {name}"
            )));
        }

        let limit = parse_bounded(supplied.get("limit"), "limit", DEFAULT_LIMIT, 1, MAX_LIMIT)?;
        let offset = parse_bounded(supplied.get("offset"), "offset", 0, 0, u64::MAX)?;

        let mut sql = self.select.clone();
        let mut params: Vec<(String, String)> = Vec::new();
        let mut where_parts: Vec<String> = Vec::new();

        for param in &self.spec.params {
            let Some(value) = supplied.get(&param.name) else {
                if param.required {
                    return Err(ApiError::invalid_parameter(format!(
                        "Missing required parameter: {}",
                        param.name
                    )));
                }
                continue;
            };

            let key = format!("p_{}", param.name);
            where_parts.push(format!(
                "{} {} {{{key}:{}}}",
                param.column,
                param.operator.as_sql(),
                param.value_type.placeholder_type(),
            ));
            let value = if param.operator == Operator::ILike && !value.contains('%') {
                format!("%{value}%")
            } else {
                value.clone()
            };
            params.push((key, value));
        }

        if !where_parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_parts.join(" AND "));
        }
        if let Some(order_by) = &self.spec.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        sql.push_str(" LIMIT {p_limit:UInt64} OFFSET {p_offset:UInt64}");
        params.push(("p_limit".to_string(), limit.to_string()));
        params.push(("p_offset".to_string(), offset.to_string()));

        Ok(BoundQuery { sql, params })
    }
}

fn parse_bounded(
    value: Option<&String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ApiError> {
    let Some(value) = value else {
        return Ok(default);
    };
    let parsed: u64 = value.parse().map_err(|_| {
        ApiError::invalid_parameter(format!("{name} must be a non-negative integer"))
    })?;
    if parsed < min || parsed > max {
        return Err(ApiError::invalid_parameter(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(parsed)
}

// ============================================================================
// ClickHouse backend
// ============================================================================

/// ClickHouse query backend over the HTTP interface.
///
/// Queries are POSTed with `FORMAT JSON`; parameters travel as
/// `param_<name>` request parameters matching the `{name:Type}`
/// placeholders in the SQL text.
pub struct ClickHouseBackend {
    base_url: String,
    user: String,
    password: String,
    database: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for ClickHouseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseBackend")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .finish()
    }
}

impl ClickHouseBackend {
    /// Creates a backend from connection settings.
    #[must_use]
    pub fn new(config: &ClickHouseConfig, timeout: Duration) -> Self {
        let http = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "Failed to configure reqwest client; using defaults"
                );
                reqwest::Client::new()
            }
        };

        Self {
            base_url: config.base_url(),
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            http,
        }
    }
}

#[async_trait]
impl QueryBackend for ClickHouseBackend {
    async fn execute(
        &self,
        sql: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Row>, QueryBackendError> {
        let mut query: Vec<(String, String)> =
            vec![("database".to_string(), self.database.clone())];
        query.extend(
            params
                .iter()
                .map(|(name, value)| (format!("param_{name}"), value.clone())),
        );

        let response = self
            .http
            .post(&self.base_url)
            .query(&query)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(format!("{sql} FORMAT JSON"))
            .send()
            .await
            .map_err(|err| {
                // No response at all: network path or timeout, retryable.
                QueryBackendError::transient(format!("request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("backend returned {status}: {}", body.trim());
            return if status.is_server_error() {
                Err(QueryBackendError::transient(message))
            } else {
                Err(QueryBackendError::permanent(message))
            };
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| QueryBackendError::permanent(format!("unreadable response: {err}")))?;

        let rows = payload
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| QueryBackendError::permanent("response has no data array"))?;

        rows.iter()
            .map(|row| {
                row.as_object().cloned().ok_or_else(|| {
                    QueryBackendError::permanent("response row is not an object")
                })
            })
            .collect()
    }
}

// ============================================================================
// In-memory backend (tests / debug)
// ============================================================================

/// In-memory query backend for tests and debug runs.
///
/// Holds rows per relation and answers queries by relation name, honoring
/// the bound `p_limit`/`p_offset` parameters. Executed queries are recorded
/// for assertions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: HashMap<String, Vec<Row>>,
    executed: Mutex<Vec<BoundQuery>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds rows for a relation.
    #[must_use]
    pub fn with_rows(mut self, relation: &str, rows: Vec<Row>) -> Self {
        self.tables.insert(relation.to_string(), rows);
        self
    }

    /// Returns the queries executed so far.
    pub fn executed(&self) -> Vec<BoundQuery> {
        self.executed
            .lock()
            .map(|log| {
                log.iter()
                    .map(|q| BoundQuery {
                        sql: q.sql.clone(),
                        params: q.params.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn relation_of(sql: &str) -> Option<&str> {
        let from = sql.find(" FROM ")?;
        sql[from + " FROM ".len()..].split_whitespace().next()
    }
}

#[async_trait]
impl QueryBackend for MemoryBackend {
    async fn execute(
        &self,
        sql: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Row>, QueryBackendError> {
        if let Ok(mut log) = self.executed.lock() {
            log.push(BoundQuery {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
        }

        let relation = Self::relation_of(sql)
            .ok_or_else(|| QueryBackendError::permanent("query has no FROM clause"))?;
        let rows = self
            .tables
            .get(relation)
            .ok_or_else(|| QueryBackendError::permanent(format!("unknown relation {relation}")))?;

        let lookup = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .and_then(|(_, value)| value.parse::<usize>().ok())
        };
        let offset = lookup("p_offset").unwrap_or(0);
        let limit = lookup("p_limit").unwrap_or(rows.len());

        Ok(rows.iter().skip(offset).take(limit).cloned().collect())
    }
}
