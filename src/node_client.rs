//! Node Client: fetches `chaininfo` and full blocks by hash over the
//! node's REST interface, plus `validateaddress` over JSON-RPC, with
//! bounded retries and jittered backoff on transport failure.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{IndexerError, Result};

const RETRY_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeVout {
    pub n: u32,
    pub value: String,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeVin {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeTx {
    pub txid: String,
    pub vin: Vec<NodeVin>,
    pub vout: Vec<NodeVout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeBlock {
    pub hash: String,
    pub height: i64,
    pub time: i64,
    pub tx: Vec<NodeTx>,
    #[serde(default)]
    pub nextblockhash: Option<String>,
    #[serde(default)]
    pub previousblockhash: Option<String>,
    pub confirmations: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub blocks: i64,
    pub bestblockhash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAddressResult {
    pub isvalid: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct NodeClient {
    http: reqwest::blocking::Client,
    server: String,
    rpcauth: Option<(String, String)>,
}

impl NodeClient {
    pub fn new(server: impl Into<String>) -> Self {
        Self::with_rpcauth(server, None)
    }

    /// `rpcauth` is parsed as `"user:password"`; anything else is ignored
    /// (the node is reached without credentials).
    pub fn with_rpcauth(server: impl Into<String>, rpcauth: Option<&str>) -> Self {
        let rpcauth = rpcauth.and_then(|raw| {
            let (user, password) = raw.split_once(':')?;
            Some((user.to_string(), password.to_string()))
        });
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            server: server.into(),
            rpcauth,
        }
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.rpcauth {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    fn jitter_sleep(attempt: u32) {
        let factor = rand::thread_rng().gen_range(1..=3);
        let seconds = 10 * attempt * factor;
        std::thread::sleep(Duration::from_secs(seconds as u64));
    }

    /// Shared retry shell: transport errors are retried with jittered
    /// backoff up to `RETRY_LIMIT` attempts; any HTTP response (success
    /// or not) returns immediately without retry.
    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        for attempt in 0..RETRY_LIMIT {
            tracing::debug!(url, attempt, "requesting node REST endpoint");
            match self.authed(self.http.get(url)).send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: T = response
                            .json()
                            .map_err(|e| IndexerError::InvalidData(format!("bad JSON from {url}: {e}")))?;
                        return Ok(Some(body));
                    }
                    if status.as_u16() == 404 {
                        tracing::warn!(url, "404: be sure the daemon was started with -rest");
                    } else if status.as_u16() == 503 {
                        tracing::warn!(url, "503: daemon may still be starting");
                    } else {
                        tracing::warn!(url, %status, "node REST request failed");
                    }
                    return Ok(None);
                }
                Err(e) => {
                    if attempt + 1 < RETRY_LIMIT {
                        tracing::warn!(url, attempt, error = %e, "retrying after transport failure");
                        Self::jitter_sleep(attempt);
                    } else {
                        return Err(IndexerError::RetryExhausted(format!(
                            "{url} failed after {RETRY_LIMIT} attempts: {e}"
                        )));
                    }
                }
            }
        }
        Err(IndexerError::RetryExhausted(url.to_string()))
    }

    pub fn get_chain_info(&self) -> Result<Option<ChainInfo>> {
        let url = format!("http://{}/rest/chaininfo.json", self.server);
        self.get_json(&url)
    }

    pub fn get_block(&self, hash: &str) -> Result<Option<NodeBlock>> {
        let url = format!("http://{}/rest/block/{}.json", self.server, hash);
        self.get_json(&url)
    }

    pub fn validate_address(&self, address: &str) -> Result<ValidateAddressResult> {
        let url = format!("http://{}/", self.server);
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "chainidx",
            "method": "validateaddress",
            "params": [address],
        });
        let response = self
            .authed(self.http.post(&url).json(&body))
            .send()
            .map_err(IndexerError::from)?;
        if !response.status().is_success() {
            return Err(IndexerError::PermanentHttp {
                status: response.status().as_u16(),
                message: "validateaddress RPC failed".to_string(),
            });
        }
        #[derive(Deserialize)]
        struct RpcEnvelope {
            result: ValidateAddressResult,
        }
        let envelope: RpcEnvelope = response
            .json()
            .map_err(|e| IndexerError::InvalidData(format!("bad RPC response: {e}")))?;
        Ok(envelope.result)
    }

    pub fn get_block_count(&self) -> Result<i64> {
        let url = format!("http://{}/", self.server);
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "chainidx",
            "method": "getblockcount",
            "params": [],
        });
        let response = self.authed(self.http.post(&url).json(&body)).send().map_err(IndexerError::from)?;
        #[derive(Deserialize)]
        struct RpcEnvelope {
            result: i64,
        }
        let envelope: RpcEnvelope = response
            .json()
            .map_err(|e| IndexerError::InvalidData(format!("bad RPC response: {e}")))?;
        Ok(envelope.result)
    }
}
