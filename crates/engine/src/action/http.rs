//! HTTP handlers: `http.get` and `http.request`.
//!
//! - `http.get`: `args = [url, { headers?, query? }?]`
//! - `http.request`: `args = [{ url, method?, headers?, query?, body? }]`
//!
//! Response bodies are parsed as JSON when possible, otherwise returned as text.
//! Non-2xx statuses are errors.

use anyhow::{Context as _, Result, anyhow, bail};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tracing::debug;

use super::{ActionHandler, parse_output};
use crate::context::PublicContext;
use crate::resolve::format_json_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMode {
    Get,
    Request,
}

/// reqwest-backed handler.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: Client,
    mode: HttpMode,
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHandler {
    /// `http.get` handler with a fresh client.
    pub fn new() -> Self {
        Self::get(Client::new())
    }

    pub fn get(client: Client) -> Self {
        Self {
            client,
            mode: HttpMode::Get,
        }
    }

    pub fn request(client: Client) -> Self {
        Self {
            client,
            mode: HttpMode::Request,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Normalized request description.
#[derive(Debug, Clone, PartialEq)]
struct RequestSpec {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RequestSpec {
    fn from_args(mode: HttpMode, args: Vec<Value>) -> Result<Self> {
        let mut args = args.into_iter();
        match mode {
            HttpMode::Get => {
                let url = match args.next() {
                    Some(Value::String(url)) => url,
                    Some(other) => bail!("http.get expects a URL string, got {other}"),
                    None => bail!("http.get expects a URL argument"),
                };
                let options = match args.next() {
                    Some(Value::Object(map)) => map,
                    Some(Value::Null) | None => Map::new(),
                    Some(other) => bail!("http.get options must be an object, got {other}"),
                };
                Ok(Self {
                    method: Method::GET,
                    url,
                    headers: string_pairs(options.get("headers")),
                    query: string_pairs(options.get("query")),
                    body: None,
                })
            }
            HttpMode::Request => {
                let mut options = match args.next() {
                    Some(Value::Object(map)) => map,
                    Some(Value::String(url)) => {
                        let mut map = Map::new();
                        map.insert("url".into(), Value::String(url));
                        map
                    }
                    _ => bail!("http.request expects an object with at least a 'url'"),
                };
                let url = options
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("http.request is missing 'url'"))?
                    .to_string();
                let method_name = options.get("method").and_then(Value::as_str).unwrap_or("GET").to_ascii_uppercase();
                let method = Method::from_bytes(method_name.as_bytes()).with_context(|| format!("invalid HTTP method '{method_name}'"))?;
                Ok(Self {
                    method,
                    url,
                    headers: string_pairs(options.get("headers")),
                    query: string_pairs(options.get("query")),
                    body: options.remove("body").filter(|body| !body.is_null()),
                })
            }
        }
    }
}

fn string_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), format_json_value(value)))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait::async_trait]
impl ActionHandler for HttpHandler {
    async fn invoke(&self, args: Vec<Value>, _ctx: &mut PublicContext) -> Result<Value> {
        let spec = RequestSpec::from_args(self.mode, args)?;
        debug!(method = %spec.method, url = %spec.url, "sending HTTP request");

        let mut builder = self.client.request(spec.method.clone(), &spec.url);
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        if let Some(body) = &spec.body {
            builder = match body {
                Value::String(text) => builder.body(text.clone()),
                other => builder.json(other),
            };
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", spec.method, spec.url))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("HTTP {} from {} {}: {}", status.as_u16(), spec.method, spec.url, text.trim());
        }
        Ok(parse_output(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_arguments_are_normalized() {
        let spec = RequestSpec::from_args(
            HttpMode::Get,
            vec![
                json!("https://example.com/feed"),
                json!({ "headers": { "Accept": "application/json" }, "query": { "page": 2, "skip": null } }),
            ],
        )
        .unwrap();
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.headers, vec![("Accept".to_string(), "application/json".to_string())]);
        assert_eq!(spec.query, vec![("page".to_string(), "2".to_string())]);
        assert!(RequestSpec::from_args(HttpMode::Get, vec![]).is_err());
    }

    #[test]
    fn request_arguments_accept_method_and_body() {
        let spec = RequestSpec::from_args(
            HttpMode::Request,
            vec![json!({ "url": "https://example.com/hook", "method": "post", "body": { "ok": true } })],
        )
        .unwrap();
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.body, Some(json!({ "ok": true })));
        assert!(RequestSpec::from_args(HttpMode::Request, vec![json!({ "method": "GET" })]).is_err());
    }
}
