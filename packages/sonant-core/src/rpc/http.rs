//! Streaming HTTP transport for the model RPC.
//!
//! Events go up as newline-delimited JSON on a streaming POST body;
//! responses come back the same way on the response body. The provider
//! endpoint and model identifier come from configuration; auth material
//! is injected as a bearer token by the process environment (signing
//! belongs to the deployment, not this crate).

use async_stream::stream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::BedrockConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::rpc::{ModelConnector, ModelDuplex, ResponseStream};

/// Depth of the outgoing event channel between driver and transport.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// NDJSON duplex connector against the provider's streaming endpoint.
pub struct HttpModelConnector {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
}

impl HttpModelConnector {
    /// Builds a connector from the model configuration.
    pub fn new(config: &BedrockConfig) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| BridgeError::RpcInternal(format!("http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!(
                "https://bedrock-runtime.{}.amazonaws.com/model/{}/invoke-with-bidirectional-stream",
                config.region, config.model_id
            ),
            model_id: config.model_id.clone(),
        })
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> BridgeError {
        use reqwest::StatusCode;
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                BridgeError::RpcValidation(body)
            }
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => BridgeError::RpcAccessDenied(body),
            StatusCode::TOO_MANY_REQUESTS => BridgeError::RpcThrottled(body),
            status if status.is_server_error() => BridgeError::RpcInternal(body),
            status => BridgeError::RpcStreamError(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Splits a byte stream into newline-delimited documents.
///
/// Carriage returns are trimmed and empty lines (keepalives) skipped. A
/// trailing document without a newline is flushed at stream end.
fn split_lines(
    mut bytes: impl futures::Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
) -> ResponseStream {
    Box::pin(stream! {
        let mut pending = BytesMut::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    pending.extend_from_slice(&chunk);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let mut line = pending.split_to(pos + 1);
                        line.truncate(line.len() - 1);
                        if line.last() == Some(&b'\r') {
                            line.truncate(line.len() - 1);
                        }
                        if !line.is_empty() {
                            yield Ok(line.freeze());
                        }
                    }
                }
                Err(err) => {
                    yield Err(BridgeError::RpcStreamError(err.to_string()));
                    return;
                }
            }
        }
        if !pending.is_empty() {
            yield Ok(pending.freeze());
        }
    })
}

#[async_trait]
impl ModelConnector for HttpModelConnector {
    async fn connect(&self) -> BridgeResult<ModelDuplex> {
        let (events_tx, events_rx) = mpsc::channel::<Vec<u8>>(EVENT_CHANNEL_CAPACITY);

        let body_stream = ReceiverStream::new(events_rx).map(|mut event| {
            event.push(b'\n');
            Ok::<_, std::io::Error>(Bytes::from(event))
        });

        log::debug!("[Rpc] Opening model stream: model={}", self.model_id);
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    BridgeError::RpcTimeout(0)
                } else {
                    BridgeError::RpcStreamError(format!("connection failed: {err}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        Ok(ModelDuplex {
            events: events_tx,
            responses: split_lines(Box::pin(response.bytes_stream())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl futures::Stream<Item = reqwest::Result<Bytes>> + Send + Unpin {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    async fn collect(stream: ResponseStream) -> Vec<String> {
        stream
            .map(|item| String::from_utf8(item.expect("chunk").to_vec()).expect("utf8"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn lines_split_on_newlines() {
        let lines = collect(split_lines(byte_stream(vec![
            b"{\"a\":1}\n{\"b\":2}\n" as &[u8],
        ])))
        .await;
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn documents_split_across_chunks_reassemble() {
        let lines = collect(split_lines(byte_stream(vec![
            b"{\"a\"" as &[u8],
            b":1}\n{\"b\"",
            b":2}\n",
        ])))
        .await;
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn trailing_document_without_newline_is_flushed() {
        let lines = collect(split_lines(byte_stream(vec![b"{\"a\":1}" as &[u8]]))).await;
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[tokio::test]
    async fn crlf_and_keepalive_lines_are_normalized() {
        let lines = collect(split_lines(byte_stream(vec![
            b"{\"a\":1}\r\n\n\r\n{\"b\":2}\n" as &[u8],
        ])))
        .await;
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn status_classification_matches_error_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            HttpModelConnector::classify_status(StatusCode::BAD_REQUEST, String::new()),
            BridgeError::RpcValidation(_)
        ));
        assert!(matches!(
            HttpModelConnector::classify_status(StatusCode::FORBIDDEN, String::new()),
            BridgeError::RpcAccessDenied(_)
        ));
        assert!(matches!(
            HttpModelConnector::classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            BridgeError::RpcThrottled(_)
        ));
        assert!(matches!(
            HttpModelConnector::classify_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                String::new()
            ),
            BridgeError::RpcInternal(_)
        ));
    }

    #[test]
    fn endpoint_is_derived_from_region_and_model() {
        let connector = HttpModelConnector::new(&BedrockConfig::default()).expect("builds");
        assert!(connector.endpoint.contains("us-east-1"));
        assert!(connector.endpoint.contains("amazon.nova-sonic-v1:0"));
    }
}
