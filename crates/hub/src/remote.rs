//! Client for the remote channel store.
//!
//! Two calls are all the hub needs: read the latest feed entries of a
//! channel, and submit one combined field update. Both are plain `GET`s.
//! The HTTP agent is blocking (`ureq`), so every call runs on the blocking
//! pool and is bounded by a tokio timeout on top of the agent's own.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::feed::FeedPage;

/// Transport-level failures. None of them is fatal: callers log, keep their
/// last good state and try again later.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("channel returned no entries")]
    Empty,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request worker failed: {0}")]
    Worker(String),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the newest `results` entries of a channel.
    async fn read_feeds(
        &self,
        channel_id: &str,
        read_api_key: Option<&str>,
        results: u32,
    ) -> Result<FeedPage, RemoteError>;

    /// Submit one update carrying every `(field, value)` pair together.
    /// Returns the raw response body (the new entry id, or `"0"`).
    async fn write_fields(
        &self,
        write_api_key: &str,
        fields: &[(u8, u8)],
    ) -> Result<String, RemoteError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpStore {
    base_url: String,
    timeout: Duration,
    agent: ureq::Agent,
}

impl HttpStore {
    pub fn new(cfg: &RemoteConfig) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("fieldlink-hub/", env!("CARGO_PKG_VERSION")))
            .build();

        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            timeout,
            agent,
        }
    }

    async fn get_text(
        &self,
        path: String,
        query: Vec<(&'static str, String)>,
    ) -> Result<String, RemoteError> {
        let url = format!("{}{path}", self.base_url);
        let agent = self.agent.clone();

        debug!(%path, "remote request");

        let call = tokio::task::spawn_blocking(move || {
            let mut request = agent.get(&url);
            for (name, value) in &query {
                request = request.query(name, value);
            }
            match request.call() {
                Ok(resp) => resp
                    .into_string()
                    .map_err(|e| RemoteError::Transport(e.to_string())),
                Err(ureq::Error::Status(status, resp)) => Err(RemoteError::Status {
                    status,
                    body: resp.into_string().unwrap_or_default(),
                }),
                Err(ureq::Error::Transport(e)) => Err(RemoteError::Transport(e.to_string())),
            }
        });

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(RemoteError::Worker(join.to_string())),
            Err(_) => Err(RemoteError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn read_feeds(
        &self,
        channel_id: &str,
        read_api_key: Option<&str>,
        results: u32,
    ) -> Result<FeedPage, RemoteError> {
        let mut query = vec![("results", results.to_string())];
        if let Some(key) = read_api_key {
            query.push(("api_key", key.to_string()));
        }

        let body = self
            .get_text(format!("/channels/{channel_id}/feeds.json"), query)
            .await?;
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn write_fields(
        &self,
        write_api_key: &str,
        fields: &[(u8, u8)],
    ) -> Result<String, RemoteError> {
        let query = std::iter::once(("api_key", write_api_key.to_string()))
            .chain(fields.iter().map(|(n, v)| (field_param(*n), v.to_string())))
            .collect();

        self.get_text("/update".to_string(), query).await
    }
}

fn field_param(n: u8) -> &'static str {
    match n {
        1 => "field1",
        2 => "field2",
        3 => "field3",
        4 => "field4",
        5 => "field5",
        6 => "field6",
        7 => "field7",
        _ => "field8",
    }
}

// ===========================================================================
// Test double
// ===========================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::feed::Feed;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use tokio::sync::{Notify, Semaphore};

    /// Scripted store. Each channel has a queue of read results; the last
    /// one repeats once the queue is down to a single entry. Writes answer
    /// from their own queue (default: accepted with entry id `"1"`).
    #[derive(Default)]
    pub(crate) struct FakeStore {
        reads: Mutex<HashMap<String, VecDeque<Result<FeedPage, RemoteError>>>>,
        writes: Mutex<VecDeque<Result<String, RemoteError>>>,
        read_calls: Mutex<Vec<String>>,
        write_calls: Mutex<Vec<Vec<(u8, u8)>>>,
        write_gate: Mutex<Option<Arc<Semaphore>>>,
        pub(crate) write_started: Notify,
    }

    impl FakeStore {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn push_read(&self, channel_id: &str, result: Result<FeedPage, RemoteError>) {
            self.reads
                .lock()
                .unwrap()
                .entry(channel_id.to_string())
                .or_default()
                .push_back(result);
        }

        pub(crate) fn push_write(&self, result: Result<String, RemoteError>) {
            self.writes.lock().unwrap().push_back(result);
        }

        /// Park every subsequent write until a permit is added to the
        /// returned semaphore.
        pub(crate) fn hold_writes(&self) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            *self.write_gate.lock().unwrap() = Some(Arc::clone(&gate));
            gate
        }

        pub(crate) fn read_calls(&self) -> Vec<String> {
            self.read_calls.lock().unwrap().clone()
        }

        pub(crate) fn write_calls(&self) -> Vec<Vec<(u8, u8)>> {
            self.write_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteStore for FakeStore {
        async fn read_feeds(
            &self,
            channel_id: &str,
            _read_api_key: Option<&str>,
            _results: u32,
        ) -> Result<FeedPage, RemoteError> {
            self.read_calls.lock().unwrap().push(channel_id.to_string());
            let mut reads = self.reads.lock().unwrap();
            let queue = reads.entry(channel_id.to_string()).or_default();
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            next.unwrap_or_else(|| Err(RemoteError::Transport("no scripted response".into())))
        }

        async fn write_fields(
            &self,
            _write_api_key: &str,
            fields: &[(u8, u8)],
        ) -> Result<String, RemoteError> {
            self.write_calls.lock().unwrap().push(fields.to_vec());
            self.write_started.notify_one();

            let gate = self.write_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }

            self.writes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("1".to_string()))
        }
    }

    /// A single-entry page with the given numbered fields set.
    pub(crate) fn page(entry_id: u64, fields: &[(u8, &str)]) -> FeedPage {
        let mut feed = Feed {
            created_at: Some("2024-05-01T10:00:00Z".into()),
            entry_id: Some(entry_id),
            ..Feed::default()
        };
        for (n, value) in fields {
            let slot = match n {
                1 => &mut feed.field1,
                2 => &mut feed.field2,
                3 => &mut feed.field3,
                4 => &mut feed.field4,
                5 => &mut feed.field5,
                6 => &mut feed.field6,
                7 => &mut feed.field7,
                _ => &mut feed.field8,
            };
            *slot = Some(value.to_string());
        }
        FeedPage { feeds: vec![feed] }
    }
}
