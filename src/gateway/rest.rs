//! PostgREST gateway for a Supabase-hosted storefront database.
//!
//! Every table lives under `/rest/v1/<table>`. Rows are addressed with
//! `?id=eq.<id>` filters, and writes ask for the stored row back with
//! `Prefer: return=representation`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;

use super::{GatewayError, GatewayResult, ListFilter, PersistenceGateway};
use crate::model::{Entity, EntityType, Fields};

/// Connection settings for the REST endpoint
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project URL (`https://<project>.supabase.co`)
    pub base_url: String,
    /// Anon API key, sent as `apikey` and as the bearer token
    pub api_key: String,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Read `SUPABASE_URL` and `SUPABASE_ANON_KEY`; `None` unless both are set
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok().filter(|v| !v.trim().is_empty())?;
        let api_key = std::env::var("SUPABASE_ANON_KEY").ok().filter(|v| !v.trim().is_empty())?;
        Some(Self::new(base_url, api_key))
    }
}

/// Gateway speaking the PostgREST dialect
pub struct RestGateway {
    client: Client,
    base_url: String,
}

impl RestGateway {
    pub fn new(config: RestConfig) -> GatewayResult<Self> {
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| GatewayError::InvalidResponse(format!("invalid api key header: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| GatewayError::InvalidResponse(format!("invalid api key header: {}", e)))?;
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, entity_type: EntityType) -> String {
        format!("{}/rest/v1/{}", self.base_url, entity_type.table())
    }

    /// Send a request and decode the returned rows
    async fn send(&self, request: RequestBuilder) -> GatewayResult<Vec<Entity>> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(status_error(status, body));
        }
        decode_rows(&body)
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Transient(format!("request timed out: {}", e))
    } else {
        GatewayError::Transient(e.to_string())
    }
}

/// Map a non-success status; server-side and throttling errors are retryable
fn status_error(status: StatusCode, body: String) -> GatewayError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        GatewayError::Transient(format!("{}: {}", status, body))
    } else {
        GatewayError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// An empty body (e.g. `204 No Content`) decodes to no rows
fn decode_rows(body: &str) -> GatewayResult<Vec<Entity>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

/// Query parameters for a list call
fn list_query(filter: Option<&ListFilter>) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    let Some(filter) = filter else {
        return query;
    };

    for (column, value) in &filter.equals {
        query.push((column.clone(), format!("eq.{}", value)));
    }
    if let Some(column) = &filter.order_by {
        let direction = if filter.descending { "desc" } else { "asc" };
        query.push(("order".to_string(), format!("{}.{}", column, direction)));
    }
    if let Some(limit) = filter.limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    query
}

fn id_query(id: &str) -> [(&'static str, String); 1] {
    [("id", format!("eq.{}", id))]
}

fn first_row(rows: Vec<Entity>, entity_type: EntityType, id: &str) -> GatewayResult<Entity> {
    rows.into_iter().next().ok_or_else(|| GatewayError::NotFound {
        entity_type,
        id: id.to_string(),
    })
}

#[async_trait]
impl PersistenceGateway for RestGateway {
    async fn create(&self, entity_type: EntityType, payload: &Fields) -> GatewayResult<Entity> {
        debug!("POST {}", entity_type);
        let request = self
            .client
            .post(self.table_url(entity_type))
            .header("Prefer", "return=representation")
            .json(payload);

        self.send(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::InvalidResponse("insert returned no row".to_string()))
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Fields,
    ) -> GatewayResult<Entity> {
        debug!("PATCH {} {}", entity_type, id);
        let request = self
            .client
            .patch(self.table_url(entity_type))
            .query(&id_query(id))
            .header("Prefer", "return=representation")
            .json(payload);

        first_row(self.send(request).await?, entity_type, id)
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> GatewayResult<()> {
        debug!("DELETE {} {}", entity_type, id);
        let request = self
            .client
            .delete(self.table_url(entity_type))
            .query(&id_query(id))
            .header("Prefer", "return=representation");

        first_row(self.send(request).await?, entity_type, id).map(|_| ())
    }

    async fn list(
        &self,
        entity_type: EntityType,
        filter: Option<&ListFilter>,
    ) -> GatewayResult<Vec<Entity>> {
        let request = self
            .client
            .get(self.table_url(entity_type))
            .query(&list_query(filter));

        self.send(request).await
    }
}
