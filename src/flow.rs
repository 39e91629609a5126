use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::ConnectionInfo;
use crate::filter::{Filter, Matchable};
use crate::proxy::layers::http::{DispatchOutcome, Exchange};
use crate::Result;

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn content_hash(content: &[u8]) -> Option<String> {
    if content.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(content);
    Some(format!("{:x}", hasher.finalize()))
}

/// Where the exchange arrived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConn {
    pub id: String,
    pub peername: Option<String>,
    pub tls: bool,
    pub sni: Option<String>,
    pub alpn: String,
    pub depth: usize,
    pub tunnel_authority: Option<String>,
}

impl From<&ConnectionInfo> for ClientConn {
    fn from(conn: &ConnectionInfo) -> Self {
        Self {
            id: conn.id.clone(),
            peername: conn.peername.map(|addr| addr.to_string()),
            tls: conn.is_tls(),
            sni: conn.sni.clone(),
            alpn: conn.protocol.to_string(),
            depth: conn.depth,
            tunnel_authority: conn.tunnel_authority.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HTTPRequest {
    pub method: String,
    pub scheme: String,
    pub authority: Option<String>,
    pub target: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
    pub timestamp_start: f64,
}

impl HTTPRequest {
    pub fn url(&self) -> String {
        match &self.authority {
            Some(authority) => format!("{}://{}{}", self.scheme, authority, self.target),
            None => self.target.clone(),
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<&Exchange> for HTTPRequest {
    fn from(exchange: &Exchange) -> Self {
        Self {
            method: exchange.method.to_string(),
            scheme: exchange.scheme.clone(),
            authority: exchange.authority.clone(),
            target: exchange.target.clone(),
            http_version: exchange.http_version().to_string(),
            headers: exchange.headers.clone(),
            timestamp_start: now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HTTPResponse {
    pub status_code: u16,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
    /// Only known for mocked responses; forwarded bodies stream through.
    pub content: Option<Vec<u8>>,
    pub content_hash: Option<String>,
    pub timestamp_start: f64,
}

impl HTTPResponse {
    pub fn new(status_code: u16, http_version: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            status_code,
            http_version: http_version.to_string(),
            headers,
            content: None,
            content_hash: None,
            timestamp_start: now(),
        }
    }

    pub fn set_content(&mut self, content: Vec<u8>) {
        self.content_hash = content_hash(&content);
        self.content = Some(content);
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowError {
    pub msg: String,
    pub timestamp: f64,
}

/// Record of one dispatched exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HTTPFlow {
    pub id: String,
    pub timestamp_created: f64,
    pub client_conn: ClientConn,
    pub request: HTTPRequest,
    /// Header list exactly as sent to the upstream, pseudo-headers included for HTTP/2.
    pub upstream_request_headers: Option<Vec<(String, String)>>,
    pub upstream_http_version: Option<String>,
    pub response: Option<HTTPResponse>,
    pub outcome: DispatchOutcome,
    pub error: Option<FlowError>,
}

impl HTTPFlow {
    pub fn new(conn: &ConnectionInfo, exchange: &Exchange) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp_created: now(),
            client_conn: ClientConn::from(conn),
            request: HTTPRequest::from(exchange),
            upstream_request_headers: None,
            upstream_http_version: None,
            response: None,
            outcome: DispatchOutcome::Error,
            error: None,
        }
    }

    pub fn set_error(&mut self, msg: String) {
        self.error = Some(FlowError {
            msg,
            timestamp: now(),
        });
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Matchable for HTTPFlow {
    fn method(&self) -> &str {
        &self.request.method
    }

    fn host(&self) -> &str {
        self.request
            .authority
            .as_deref()
            .map(crate::proxy::layers::http::authority_host)
            .unwrap_or("")
    }

    fn url(&self) -> String {
        self.request.url()
    }

    fn headers(&self) -> &[(String, String)] {
        &self.request.headers
    }

    fn is_http2(&self) -> bool {
        self.request.http_version == "HTTP/2.0"
    }

    fn is_tls(&self) -> bool {
        self.client_conn.tls
    }
}

/// Bounded in-memory history of flows with a live subscription channel.
#[derive(Debug, Clone)]
pub struct FlowStore {
    flows: Arc<RwLock<VecDeque<HTTPFlow>>>,
    max_flows: usize,
    tx: broadcast::Sender<HTTPFlow>,
}

impl FlowStore {
    pub fn new(max_flows: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            flows: Arc::new(RwLock::new(VecDeque::new())),
            max_flows: max_flows.max(1),
            tx,
        }
    }

    /// Stores a flow, evicting the oldest once the store is full.
    pub fn record(&self, flow: HTTPFlow) {
        if let Ok(mut flows) = self.flows.write() {
            while flows.len() >= self.max_flows {
                flows.pop_front();
            }
            flows.push_back(flow.clone());
        }
        // Nobody listening is fine.
        let _ = self.tx.send(flow);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HTTPFlow> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<HTTPFlow> {
        let flows = self.flows.read().ok()?;
        flows.iter().find(|f| f.id == id).cloned()
    }

    pub fn list(&self) -> Vec<HTTPFlow> {
        self.flows
            .read()
            .map(|flows| flows.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flows matching a filter expression, oldest first.
    pub fn filter(&self, expression: &str) -> Result<Vec<HTTPFlow>> {
        let filter = Filter::new(expression)?;
        Ok(self
            .list()
            .into_iter()
            .filter(|flow| filter.matches(flow))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.flows.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut flows) = self.flows.write() {
            flows.clear();
        }
    }
}
