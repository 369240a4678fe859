// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the message broker.
//!
//! Two endpoints are used: the bulk publish endpoint
//! (`POST /mpub?topic=<topic>`, body = record JSON encodings joined by
//! newline, one request per batch) and the status endpoint
//! (`GET /stats?format=json&topic=<topic>`), which reports per-topic backlog
//! depth. The per-topic list appears either under a top-level `topics` key
//! or nested under `data.topics`; both shapes are accepted.

use bytes::Bytes;
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::record::Record;

#[derive(Debug, Deserialize)]
struct TopicStats {
    topic_name: String,
    depth: u64,
}

#[derive(Debug, Deserialize)]
struct StatsData {
    #[serde(default)]
    topics: Vec<TopicStats>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    topics: Vec<TopicStats>,
    data: Option<StatsData>,
}

impl StatsResponse {
    fn into_topics(self) -> Vec<TopicStats> {
        if !self.topics.is_empty() {
            return self.topics;
        }
        self.data.map(|d| d.topics).unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct BrokerClient {
    client: HyperClient<HttpConnector, Full<Bytes>>,
    mpub_uri: Uri,
    stats_uri: Uri,
    topic: String,
}

impl BrokerClient {
    /// `address` is the broker's HTTP address (`host:port`), `topic` the
    /// target topic for both publishing and depth checks.
    pub fn new(address: &str, topic: &str) -> Result<Self> {
        let mpub_uri: Uri = format!("http://{}/mpub?topic={}", address, topic)
            .parse()
            .map_err(|e| Error::Config(format!("invalid broker address: {}", e)))?;
        let stats_uri: Uri = format!("http://{}/stats?format=json&topic={}", address, topic)
            .parse()
            .map_err(|e| Error::Config(format!("invalid broker address: {}", e)))?;

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .timer(TokioTimer::new())
            .build_http();

        Ok(Self {
            client,
            mpub_uri,
            stats_uri,
            topic: topic.to_string(),
        })
    }

    /// Encode a batch for the bulk publish endpoint. Done once per batch so
    /// retries send a byte-identical body.
    pub fn encode_batch<'a>(records: impl IntoIterator<Item = &'a Record>) -> Result<Bytes> {
        let mut body = Vec::new();
        for (i, record) in records.into_iter().enumerate() {
            if i > 0 {
                body.push(b'\n');
            }
            serde_json::to_writer(&mut body, record)?;
        }
        Ok(Bytes::from(body))
    }

    /// Publish one encoded batch. Any transport failure or non-2xx status is
    /// an error; the caller decides whether to retry.
    pub async fn mpub(&self, body: Bytes) -> Result<()> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.mpub_uri.clone())
            .body(Full::new(body))
            .map_err(|e| Error::Broker(format!("failed to build publish request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Broker(format!("publish request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Broker(format!(
                "broker rejected publish with status {}",
                status
            )));
        }
        Ok(())
    }

    /// Current backlog depth of the configured topic, or `None` when the
    /// topic is absent from the status response.
    pub async fn topic_depth(&self) -> Result<Option<u64>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.stats_uri.clone())
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::Broker(format!("failed to build stats request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Broker(format!("stats request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Broker(format!(
                "stats endpoint returned status {}",
                status
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Broker(format!("failed to read stats response: {}", e)))?
            .to_bytes();

        let stats: StatsResponse = serde_json::from_slice(&body)?;

        Ok(stats
            .into_topics()
            .into_iter()
            .find(|t| t.topic_name == self.topic)
            .map(|t| t.depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer, topic: &str) -> BrokerClient {
        BrokerClient::new(&server.address().to_string(), topic).unwrap()
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new("/var/log/app.log", "host1", "raw", format!("line {}", i)))
            .collect()
    }

    #[test]
    fn batch_body_is_newline_joined_json() {
        let recs = records(3);
        let body = BrokerClient::encode_batch(recs.iter()).unwrap();
        let text = std::str::from_utf8(&body).unwrap();

        let lines: Vec<_> = text.split('\n').collect();
        assert_eq!(3, lines.len());
        for (i, line) in lines.iter().enumerate() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["raw"], format!("line {}", i));
        }
    }

    #[tokio::test]
    async fn mpub_posts_to_topic() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/mpub")
                .query_param("topic", "logs")
                .body_contains("line 0");
            then.status(200).body("OK");
        });

        let client = client_for(&server, "logs");
        let body = BrokerClient::encode_batch(records(1).iter()).unwrap();
        client.mpub(body).await.unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn mpub_error_status_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/mpub");
            then.status(500);
        });

        let client = client_for(&server, "logs");
        let body = BrokerClient::encode_batch(records(1).iter()).unwrap();
        assert!(client.mpub(body).await.is_err());
    }

    #[tokio::test]
    async fn depth_from_top_level_topics() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/stats");
            then.status(200).json_body(serde_json::json!({
                "topics": [
                    {"topic_name": "other", "depth": 5},
                    {"topic_name": "logs", "depth": 1234},
                ]
            }));
        });

        let client = client_for(&server, "logs");
        assert_eq!(Some(1234), client.topic_depth().await.unwrap());
    }

    #[tokio::test]
    async fn depth_from_nested_data_topics() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/stats");
            then.status(200).json_body(serde_json::json!({
                "data": {"topics": [{"topic_name": "logs", "depth": 42}]}
            }));
        });

        let client = client_for(&server, "logs");
        assert_eq!(Some(42), client.topic_depth().await.unwrap());
    }

    #[tokio::test]
    async fn missing_topic_reports_none() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/stats");
            then.status(200).json_body(serde_json::json!({"topics": []}));
        });

        let client = client_for(&server, "logs");
        assert_eq!(None, client.topic_depth().await.unwrap());
    }

    #[tokio::test]
    async fn malformed_stats_body_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/stats");
            then.status(200).body("not json");
        });

        let client = client_for(&server, "logs");
        assert!(client.topic_depth().await.is_err());
    }
}
