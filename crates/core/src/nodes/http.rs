use super::{Node, NodeContext, NodeInit, NodeOutput, HTTP_REQUEST};
use crate::config::secs;
use crate::error::NodeError;
use crate::template::{render, render_value};
use crate::types::Payload;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// HTTP methods the network-call node can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    fn sends_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }

    fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("Unsupported HTTP method: {}", other)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_timeout")]
    timeout: f64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> f64 {
    30.0
}

/// Issues an HTTP request and returns the response envelope.
/// The input is not merged into the output.
pub struct HttpNode {
    id: String,
    client: reqwest::Client,
    url: String,
    method: HttpMethod,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    timeout: Duration,
}

impl HttpNode {
    pub fn construct(init: NodeInit<'_>) -> Result<Box<dyn Node>, NodeError> {
        let config: HttpConfig = init.parse_config()?;

        if config.url.trim().is_empty() {
            return Err(init.invalid("URL is required for HTTP node"));
        }
        let method = config.method.parse::<HttpMethod>().map_err(|e| init.invalid(e))?;
        if !(config.timeout.is_finite() && config.timeout > 0.0) {
            return Err(init.invalid("'timeout' must be a positive number of seconds"));
        }

        Ok(Box::new(Self {
            id: init.id.to_string(),
            client: init.services.http.clone(),
            url: config.url,
            method,
            headers: config.headers,
            body: config.body,
            timeout: secs(config.timeout),
        }))
    }
}

#[async_trait::async_trait]
impl Node for HttpNode {
    fn node_type(&self) -> &str {
        HTTP_REQUEST
    }

    async fn execute(&self, input: &Payload, ctx: &mut NodeContext) -> Result<NodeOutput, NodeError> {
        let url = render(&self.url, input);
        let method = self.method;

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            node_id = %self.id,
            "Making {} request to {}",
            method.as_str(),
            url
        );

        let mut request = self
            .client
            .request(method.as_reqwest(), &url)
            .timeout(self.timeout);

        for (name, value) in &self.headers {
            request = request.header(name.as_str(), render(value, input));
        }

        if method.sends_body() {
            if let Some(body) = &self.body {
                request = request.json(&render_value(body, input));
            }
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(node_id = %self.id, "HTTP request failed: {}", e);
            NodeError::Http(e)
        })?;

        let status = response.status().as_u16();
        let headers: Payload = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));

        let text = response.text().await?;
        let body = if is_json {
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(text),
            }
        } else {
            Value::String(text)
        };

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            node_id = %self.id,
            "Response status: {}",
            status
        );

        let envelope = json!({
            "status_code": status,
            "headers": headers,
            "body": body,
            "url": url,
            "method": method.as_str(),
        });

        match envelope {
            Value::Object(data) => Ok(NodeOutput::new(data)),
            _ => Err(NodeError::Execution("response envelope was not an object".to_string())),
        }
    }
}
