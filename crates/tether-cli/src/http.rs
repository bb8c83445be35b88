//! Turn backend over HTTP with server-sent event streams.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use tether_core::{ByteStream, Result, TetherError, TurnBackend};
use tether_types::{ActiveTurnStatus, ApplyDraftRequest, Draft, SubmitRequest, TurnCoordinates};
use tracing::{debug, info};

pub struct HttpTurnBackend {
    client: Client,
    base: Url,
}

impl HttpTurnBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| TetherError::Protocol(format!("invalid api base url '{}': {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(TetherError::Protocol(format!("api base url '{}' cannot have paths", base_url)));
        }
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    /// Append percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn open_stream(&self, request: reqwest::RequestBuilder) -> Result<ByteStream> {
        let response = request
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(transport_error))
            .boxed())
    }

    async fn post_empty(&self, url: Url) -> Result<()> {
        let response = self.client.post(url).send().await.map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> TetherError {
    TetherError::Transport(e.to_string())
}

/// Map a non-2xx response to a backend error carrying its body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    debug!(target: "tether::http", "Backend returned {}: {}", status, message);
    Err(TetherError::Backend {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl TurnBackend for HttpTurnBackend {
    async fn submit_turn(&self, request: &SubmitRequest) -> Result<ByteStream> {
        info!(target: "tether::http", "POST turn {} for {}", request.turn_id, request.target);
        let url = self.endpoint(&["turns"]);
        self.open_stream(self.client.post(url).json(request)).await
    }

    async fn query_active_turn(&self, turn_id: &str) -> Result<ActiveTurnStatus> {
        let url = self.endpoint(&["turns", turn_id]);
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let response = check(response).await?;
        response
            .json::<ActiveTurnStatus>()
            .await
            .map_err(|e| TetherError::Protocol(format!("bad turn status: {}", e)))
    }

    async fn attach_turn_events(&self, coordinates: &TurnCoordinates) -> Result<ByteStream> {
        info!(target: "tether::http", "Attaching to turn {} on thread {}", coordinates.turn_id, coordinates.thread_id);
        let url = self.endpoint(&[
            "agents",
            &coordinates.agent,
            "threads",
            &coordinates.thread_id,
            "turns",
            &coordinates.turn_id,
            "events",
        ]);
        self.open_stream(self.client.get(url)).await
    }

    async fn interrupt_turn(&self, target: &str) -> Result<()> {
        self.post_empty(self.endpoint(&["targets", target, "interrupt"])).await
    }

    async fn reset_thread(&self, key: &str) -> Result<()> {
        self.post_empty(self.endpoint(&["threads", key, "reset"])).await
    }

    async fn get_draft(&self, target: &str) -> Result<Option<Draft>> {
        let url = self.endpoint(&["targets", target, "draft"]);
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        let draft = response
            .json::<Draft>()
            .await
            .map_err(|e| TetherError::Protocol(format!("bad draft: {}", e)))?;
        Ok(Some(draft))
    }

    async fn apply_draft(&self, target: &str, force: bool) -> Result<()> {
        let url = self.endpoint(&["targets", target, "draft", "apply"]);
        let response = self
            .client
            .post(url)
            .json(&ApplyDraftRequest { force })
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }

    async fn discard_draft(&self, target: &str) -> Result<()> {
        let url = self.endpoint(&["targets", target, "draft"]);
        let response = self.client.delete(url).send().await.map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_segments() {
        let backend = HttpTurnBackend::new("http://localhost:9000/api/").unwrap();
        let url = backend.endpoint(&["targets", "doc:todo list", "draft"]);
        assert_eq!(url.as_str(), "http://localhost:9000/api/targets/doc:todo%20list/draft");
    }

    #[test]
    fn test_rejects_non_base_url() {
        assert!(HttpTurnBackend::new("mailto:someone@example.com").is_err());
        assert!(HttpTurnBackend::new("not a url").is_err());
    }
}
