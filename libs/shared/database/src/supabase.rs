use anyhow::{Result, anyhow};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Thin PostgREST client. Only equality filters are supported, which is all
/// the queue engine assumes of its remote store.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_base_url(&config.supabase_url, &config.supabase_anon_key)
    }

    pub fn with_base_url(base_url: &str, anon_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        }
    }

    fn get_headers(&self, return_representation: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.anon_key))?,
        );
        if return_representation {
            headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let wants_body = method != Method::GET;
        let mut req = self.client.request(method, &url)
            .headers(self.get_headers(wants_body)?);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// `GET /rest/v1/<table>?<field>=eq.<value>&...`
    pub async fn select(&self, table: &str, filters: &[(String, String)]) -> Result<Vec<Value>> {
        let path = format!("/rest/v1/{}{}", table, query_string(filters));
        self.request(Method::GET, &path, None).await
    }

    /// Inserts one row and returns the stored representation.
    pub async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let path = format!("/rest/v1/{}", table);
        let mut rows: Vec<Value> = self.request(Method::POST, &path, Some(row)).await?;
        if rows.is_empty() {
            return Err(anyhow!("Insert into {} returned no representation", table));
        }
        Ok(rows.swap_remove(0))
    }

    /// Patches the rows of `table` whose `id` equals `id`.
    pub async fn patch_by_id(&self, table: &str, id: &str, patch: Value) -> Result<Vec<Value>> {
        let path = format!("/rest/v1/{}?id=eq.{}", table, urlencoding::encode(id));
        self.request(Method::PATCH, &path, Some(patch)).await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}

fn query_string(filters: &[(String, String)]) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = filters
        .iter()
        .map(|(field, value)| format!("{}=eq.{}", urlencoding::encode(field), urlencoding::encode(value)))
        .collect();
    format!("?{}", parts.join("&"))
}
