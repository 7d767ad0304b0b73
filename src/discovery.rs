//! Upstream discovery against an etcd-style registry.
//!
//! Membership lives under a single directory key; each child node's value is
//! one upstream address. [`Registry::obtain`] fetches the current member list
//! once; [`Registry::watch`] long-polls for changes and emits a fresh,
//! complete snapshot after every change newer than the cursor. Snapshots are
//! never deltas.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

/// Delay before retrying after a failed watch poll.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Buffered snapshots between the watch task and its consumer.
const SNAPSHOT_BACKLOG: usize = 8;

/// Discovery registry settings.
#[derive(Debug, Clone, Default)]
pub struct DiscOptions {
    /// Key the member list is registered under.
    pub service: String,
    /// Registry base URLs, tried in order.
    pub endpoints: Vec<String>,
    /// Watch cursor; only changes with an index at or past this are delivered.
    pub after_index: u64,
}

/// Source of upstream membership.
///
/// Implementations must deliver complete ordered member lists, both from
/// `obtain` and on every `watch` emission.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Fetch the current member list for `opts.service`.
    async fn obtain(&self, opts: &DiscOptions) -> Result<Vec<String>, Error>;

    /// Stream membership snapshots until `token` fires.
    ///
    /// The returned [`oneshot::Receiver`] resolves exactly once, after the
    /// watch has released all of its resources. The snapshot stream closing
    /// means the watch ended, not that membership changed.
    fn watch(
        &self,
        token: CancellationToken,
        opts: DiscOptions,
    ) -> (mpsc::Receiver<Vec<String>>, oneshot::Receiver<()>);
}

/// Registry client speaking the etcd v2 keys API over HTTP.
#[derive(Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn obtain(&self, opts: &DiscOptions) -> Result<Vec<String>, Error> {
        obtain_members(&self.client, opts).await
    }

    fn watch(
        &self,
        token: CancellationToken,
        opts: DiscOptions,
    ) -> (mpsc::Receiver<Vec<String>>, oneshot::Receiver<()>) {
        let client = self.client.clone();
        let (tx, rx) = mpsc::channel(SNAPSHOT_BACKLOG);
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut cursor = opts.after_index;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = wait_for_change(&client, &opts, cursor) => match changed {
                        Ok(index) => {
                            cursor = index + 1;
                            match obtain_members(&client, &opts).await {
                                Ok(members) => {
                                    debug!(service = %opts.service, index, count = members.len(), "membership changed");
                                    if tx.send(members).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(service = %opts.service, error = %e, "snapshot fetch failed after change event");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(service = %opts.service, error = %e, "watch poll failed, backing off");
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
            drop(tx);
            let _ = stop_tx.send(());
        });

        (rx, stop_rx)
    }
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Node,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Node {
    key: String,
    value: Option<String>,
    #[serde(rename = "modifiedIndex")]
    modified_index: u64,
    nodes: Vec<Node>,
}

impl Node {
    /// Collect leaf values ordered by key.
    fn members(&self) -> Vec<String> {
        let mut leaves: Vec<(&str, &str)> = Vec::new();
        collect_leaves(self, &mut leaves);
        leaves.sort_by(|a, b| a.0.cmp(b.0));
        leaves.into_iter().map(|(_, v)| v.to_string()).collect()
    }

    /// Largest modification index in the subtree.
    fn latest_index(&self) -> u64 {
        self.nodes
            .iter()
            .map(Node::latest_index)
            .fold(self.modified_index, u64::max)
    }
}

fn collect_leaves<'a>(node: &'a Node, out: &mut Vec<(&'a str, &'a str)>) {
    if let Some(value) = node.value.as_deref() {
        if !value.is_empty() {
            out.push((node.key.as_str(), value));
        }
    }
    for child in &node.nodes {
        collect_leaves(child, out);
    }
}

fn keys_url(endpoint: &str, service: &str) -> String {
    format!(
        "{}/v2/keys/{}",
        endpoint.trim_end_matches('/'),
        service.trim_start_matches('/')
    )
}

async fn get_keys(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<KeysResponse, Error> {
    let resp = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| Error::Discovery(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Discovery(format!(
            "registry returned {status}: {body}"
        )));
    }

    resp.json::<KeysResponse>()
        .await
        .map_err(|e| Error::Discovery(e.to_string()))
}

/// Fetch the full member list, trying each endpoint in order.
async fn obtain_members(
    client: &reqwest::Client,
    opts: &DiscOptions,
) -> Result<Vec<String>, Error> {
    let mut last = Error::Discovery("no registry endpoints configured".to_string());
    for endpoint in &opts.endpoints {
        let url = keys_url(endpoint, &opts.service);
        match get_keys(client, &url, &[("recursive", "true".to_string())]).await {
            Ok(resp) => return Ok(resp.node.members()),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "registry endpoint failed");
                last = e;
            }
        }
    }
    Err(last)
}

/// Long-poll for the next change at or past `cursor`.
///
/// Returns the index of the observed change.
async fn wait_for_change(
    client: &reqwest::Client,
    opts: &DiscOptions,
    cursor: u64,
) -> Result<u64, Error> {
    let mut last = Error::Discovery("no registry endpoints configured".to_string());
    for endpoint in &opts.endpoints {
        let url = keys_url(endpoint, &opts.service);
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
        ];
        if cursor > 0 {
            query.push(("waitIndex", cursor.to_string()));
        }
        match get_keys(client, &url, &query).await {
            Ok(resp) => return Ok(resp.node.latest_index()),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "registry endpoint failed");
                last = e;
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_leaf_values_ordered_by_key() {
        let raw = r#"{
            "action": "get",
            "node": {
                "key": "/backends",
                "dir": true,
                "modifiedIndex": 7,
                "nodes": [
                    {"key": "/backends/b", "value": "10.0.0.2:80", "modifiedIndex": 9},
                    {"key": "/backends/a", "value": "10.0.0.1:80", "modifiedIndex": 8},
                    {"key": "/backends/empty", "value": "", "modifiedIndex": 10}
                ]
            }
        }"#;
        let resp: KeysResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.node.members(), vec!["10.0.0.1:80", "10.0.0.2:80"]);
        assert_eq!(resp.node.latest_index(), 10);
    }

    #[test]
    fn single_node_response_parses() {
        let raw = r#"{"action":"set","node":{"key":"/svc","value":"127.0.0.1:9000","modifiedIndex":3}}"#;
        let resp: KeysResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.node.members(), vec!["127.0.0.1:9000"]);
        assert_eq!(resp.node.latest_index(), 3);
    }

    #[test]
    fn keys_url_normalizes_slashes() {
        assert_eq!(
            keys_url("http://reg:2379/", "/backends/web"),
            "http://reg:2379/v2/keys/backends/web"
        );
    }
}
