//! Mock matching: decides, per exchange, whether to answer locally or pass through.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::filter::Filter;
use crate::proxy::body::{full, ProxyBody};
use crate::proxy::layers::http::Exchange;
use crate::{Error, Result};

/// A locally synthesized response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body<S: Into<String>>(mut self, body: S) -> Self {
        self.body = body.into();
        self
    }

    pub fn body_bytes(&self) -> Bytes {
        Bytes::from(self.body.clone())
    }

    pub fn into_response(self) -> Result<Response<ProxyBody>> {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.body(full(self.body))?)
    }
}

/// What to do with a matched exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    Respond(MockResponse),
    PassThrough,
    /// Close the inbound connection without a response.
    Close,
    /// Reset the stream (HTTP/2) or abort the connection (HTTP/1.1).
    Reset,
}

/// The collaborator that picks an action for every non-CONNECT exchange.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn match_exchange(&self, exchange: &Exchange) -> Option<RuleAction>;
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub filter: Filter,
    pub action: RuleAction,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    filter: String,
    #[serde(flatten)]
    action: RuleAction,
}

/// Ordered rule list, first match wins. Rules may be added while the proxy runs.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: RwLock<Vec<Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON array of `{"filter": "...", "action": "...", ...}` objects.
    pub fn from_json(json: &str) -> Result<Self> {
        let specs: Vec<RuleSpec> = serde_json::from_str(json)?;
        let set = Self::new();
        for spec in specs {
            set.push(&spec.filter, spec.action)?;
        }
        Ok(set)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn push(&self, filter: &str, action: RuleAction) -> Result<()> {
        let rule = Rule {
            filter: Filter::new(filter)?,
            action,
        };
        self.rules
            .write()
            .map_err(|_| Error::internal("rule set lock poisoned"))?
            .push(rule);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut rules) = self.rules.write() {
            rules.clear();
        }
    }

    fn find(&self, exchange: &Exchange) -> Option<RuleAction> {
        let rules = self.rules.read().ok()?;
        rules
            .iter()
            .find(|rule| rule.filter.matches(exchange))
            .map(|rule| {
                debug!("{} {} matched rule {:?}", exchange.method, exchange.url(), rule.filter.expression);
                rule.action.clone()
            })
    }
}

#[async_trait]
impl RuleSource for RuleSet {
    async fn match_exchange(&self, exchange: &Exchange) -> Option<RuleAction> {
        self.find(exchange)
    }
}
