//! Upstream model gateway client.
//!
//! The gateway accepts an ordered list of `{role, text}` turns plus a
//! knowledge-source handle and answers with retrieval-grounded text. Two
//! call shapes are used:
//!
//! - **Streaming** (`stream_generate`): newline-delimited JSON units, each
//!   optionally carrying a text delta and/or grounding references.
//! - **Single response** (`generate`): used for the short title call.
//!
//! The client deliberately applies no whole-request timeout to the streaming
//! call: a long answer takes as long as it takes, and the transport's
//! own limits are the only bound. The title call uses the configured
//! request timeout.
//!
//! Requires the API key environment variable named by
//! `upstream.api_key_env` to be set.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::UpstreamConfig;
use crate::models::Role;

/// One `{role, text}` turn of the request context.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

/// A grounding reference attached to a streamed unit.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GroundingRef {
    pub title: String,
    /// Internal store URI, used as a fallback link when the title cannot
    /// be resolved against the file mapping.
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
}

/// One incremental unit of a streamed generation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateUnit {
    /// Incremental answer text.
    #[serde(default)]
    pub delta: Option<String>,
    /// Grounding references; typically complete only near stream end.
    #[serde(default)]
    pub references: Option<Vec<GroundingRef>>,
    /// In-band error signal; terminates the turn.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    turns: &'a [ChatTurn],
    #[serde(skip_serializing_if = "Option::is_none")]
    knowledge_source: Option<&'a str>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

pub type UnitStream = Pin<Box<dyn Stream<Item = Result<GenerateUnit>> + Send>>;

/// Interface to the hosted model/retrieval service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Submit the request context and stream back incremental units.
    async fn stream_generate(
        &self,
        turns: &[ChatTurn],
        knowledge_source: &str,
    ) -> Result<UnitStream>;

    /// Single-shot generation without retrieval grounding (title calls).
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// HTTP implementation of [`UpstreamClient`].
pub struct HttpUpstreamClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpUpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            client,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn endpoint(&self, verb: &str) -> String {
        format!("{}/v1/models/{}:{}", self.base_url, self.model, verb)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn stream_generate(
        &self,
        turns: &[ChatTurn],
        knowledge_source: &str,
    ) -> Result<UnitStream> {
        let body = GenerateRequest {
            turns,
            knowledge_source: Some(knowledge_source),
        };

        let response = self
            .client
            .post(self.endpoint("streamGenerate"))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Upstream request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Upstream error {}: {}", status, body_text);
        }

        Ok(decode_unit_stream(response.bytes_stream()))
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let turns = [ChatTurn {
            role: Role::User,
            text: prompt.to_string(),
        }];
        let body = GenerateRequest {
            turns: &turns,
            knowledge_source: None,
        };

        let response = self
            .client
            .post(self.endpoint("generate"))
            .header("x-api-key", &self.api_key)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .context("Upstream request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Upstream error {}: {}", status, body_text);
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Invalid upstream response body")?;
        Ok(parsed.text)
    }
}

/// Turn a raw byte stream into a stream of parsed units.
///
/// Units arrive newline-delimited, but network reads chunk at arbitrary
/// boundaries, so a line buffer carries partial lines across chunks. A
/// complete line that fails to parse is skipped with a warning; a transport
/// error is surfaced as an `Err` item and ends the turn upstream of here.
fn decode_unit_stream<S, E>(bytes: S) -> UnitStream
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let buffered = bytes.scan(String::new(), |buffer, chunk| {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                return futures::future::ready(Some(vec![Err(anyhow::Error::new(e)
                    .context("Upstream stream read failed"))]));
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));

        let mut units = Vec::new();
        let mut last_newline_pos = 0;
        for (idx, _) in buffer.match_indices('\n') {
            let line = buffer[last_newline_pos..idx].trim();
            last_newline_pos = idx + 1;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<GenerateUnit>(line) {
                Ok(unit) => units.push(Ok(unit)),
                Err(e) => {
                    warn!(error = %e, "skipping malformed upstream unit");
                }
            }
        }
        *buffer = buffer[last_newline_pos..].to_string();

        futures::future::ready(Some(units))
    });

    Box::pin(buffered.flat_map(stream::iter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn byte_chunks(chunks: &[&str]) -> Vec<std::result::Result<bytes::Bytes, std::io::Error>> {
        chunks
            .iter()
            .map(|c| Ok(bytes::Bytes::from(c.as_bytes().to_vec())))
            .collect()
    }

    async fn collect_units(
        chunks: Vec<std::result::Result<bytes::Bytes, std::io::Error>>,
    ) -> Vec<Result<GenerateUnit>> {
        decode_unit_stream(stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_units_split_across_chunks() {
        let units = collect_units(byte_chunks(&[
            "{\"delta\":\"Hel",
            "\"}\n{\"delta\":\"lo\",\"references\":[{\"title\":\"Doc.pdf\"}]}\n",
        ]))
        .await;

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].as_ref().unwrap().delta.as_deref(), Some("Hel"));
        let second = units[1].as_ref().unwrap();
        assert_eq!(second.delta.as_deref(), Some("lo"));
        assert_eq!(
            second.references.as_ref().unwrap()[0].title,
            "Doc.pdf".to_string()
        );
    }

    #[tokio::test]
    async fn test_malformed_unit_skipped() {
        let units = collect_units(byte_chunks(&[
            "{\"delta\":\"ok\"}\n{not json}\n{\"delta\":\"still ok\"}\n",
        ]))
        .await;

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].as_ref().unwrap().delta.as_deref(), Some("ok"));
        assert_eq!(
            units[1].as_ref().unwrap().delta.as_deref(),
            Some("still ok")
        );
    }

    #[tokio::test]
    async fn test_transport_error_surfaced() {
        let chunks: Vec<std::result::Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"delta\":\"a\"}\n")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            )),
        ];
        let units = collect_units(chunks).await;

        assert_eq!(units.len(), 2);
        assert!(units[0].is_ok());
        assert!(units[1].is_err());
    }

    #[tokio::test]
    async fn test_in_band_error_unit() {
        let units = collect_units(byte_chunks(&["{\"error\":\"quota exceeded\"}\n"])).await;
        assert_eq!(
            units[0].as_ref().unwrap().error.as_deref(),
            Some("quota exceeded")
        );
    }
}
