//! Embedding provider for OpenAI-compatible `/embeddings` endpoints.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    embedding::EmbeddingProvider,
    error::{Error, Result},
};

pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSIONS: usize = 1536;
/// Most inputs the API accepts per request.
pub const MAX_BATCH_SIZE: usize = 100;

const PROVIDER: &str = "remote";

/// Blocking client for an OpenAI-compatible embeddings API.
///
/// The API key is read from an environment variable on every request and
/// is optional, so local servers without auth work too.
#[derive(Debug)]
pub struct RemoteEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    /// Passed to the API when set (Matryoshka truncation).
    request_dimensions: Option<usize>,
    api_key_env: String,
    batch_size: usize,
    timeout: Duration,
}

impl RemoteEmbedder {
    /// Create a provider for the API rooted at `base_url`.
    ///
    /// `/embeddings` is appended unless the URL already ends with it.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::embedding(PROVIDER, "API URL must not be empty"));
        }
        let endpoint = if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        };

        let timeout = Duration::from_secs(30);
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            model: DEFAULT_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            request_dimensions: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            batch_size: MAX_BATCH_SIZE,
            timeout,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the expected vector size and ask the API to truncate to it.
    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self.request_dimensions = Some(dims);
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = var.into();
        self
    }

    /// Cap the batch size, never above [`MAX_BATCH_SIZE`].
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout != self.timeout {
            match build_client(timeout) {
                Ok(client) => {
                    self.client = client;
                    self.timeout = timeout;
                }
                Err(e) => {
                    warn!(error = %e, "keeping default HTTP timeout");
                }
            }
        }
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()?)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl EmbeddingProvider for RemoteEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            batch_size = texts.len(),
            "requesting embeddings"
        );

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.request_dimensions,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = self.api_key() {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            Error::embedding(PROVIDER, format!("request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(Error::embedding(
                PROVIDER,
                format!("API returned {status}: {detail}"),
            ));
        }

        let mut parsed: EmbeddingResponse = response.json().map_err(|e| {
            Error::embedding(PROVIDER, format!("failed to parse response: {e}"))
        })?;

        // Servers may return items out of order when they carry an index.
        if parsed.data.iter().all(|d| d.index.is_some()) {
            parsed.data.sort_by_key(|d| d.index);
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;

    /// Serve exactly one HTTP request with `status` and `body`, returning
    /// the base URL and a handle yielding the raw request body.
    fn one_shot_server(
        status: &'static str,
        body: &'static str,
    ) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(v) = line
                    .to_ascii_lowercase()
                    .strip_prefix("content-length:")
                {
                    content_length = v.trim().parse().unwrap();
                }
            }
            let mut request_body = vec![0; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            String::from_utf8(request_body).unwrap()
        });
        (format!("http://{addr}/v1"), handle)
    }

    #[test]
    fn endpoint_is_normalized() {
        let a = RemoteEmbedder::new("http://localhost:8080/v1/").unwrap();
        assert_eq!(a.endpoint(), "http://localhost:8080/v1/embeddings");
        let b = RemoteEmbedder::new("http://h/v1/embeddings").unwrap();
        assert_eq!(b.endpoint(), "http://h/v1/embeddings");
        assert!(RemoteEmbedder::new("  ").is_err());
    }

    #[test]
    fn batch_size_is_capped() {
        let p = RemoteEmbedder::new("http://h").unwrap().with_batch_size(500);
        assert_eq!(p.max_batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn parses_embeddings_in_index_order() {
        let (url, server) = one_shot_server(
            "200 OK",
            r#"{"data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]}"#,
        );
        let provider = RemoteEmbedder::new(&url)
            .unwrap()
            .with_model("test-model")
            .with_dimensions(2)
            .with_api_key_env("DOCRAG_TEST_UNSET_KEY");

        let vectors = provider.embed_batch(&["first", "second"]).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        let request: serde_json::Value =
            serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(request["model"], "test-model");
        assert_eq!(request["input"][1], "second");
        assert_eq!(request["dimensions"], 2);
    }

    #[test]
    fn api_errors_carry_the_message() {
        let (url, server) = one_shot_server(
            "401 Unauthorized",
            r#"{"error": {"message": "bad key"}}"#,
        );
        let provider = RemoteEmbedder::new(&url).unwrap();
        let err = provider.embed_batch(&["x"]).unwrap_err();
        server.join().unwrap();

        let msg = err.to_string();
        assert!(msg.contains("401"), "{msg}");
        assert!(msg.contains("bad key"), "{msg}");
    }

    #[test]
    fn unreachable_server_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = RemoteEmbedder::new(&format!("http://{addr}"))
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        assert!(matches!(
            provider.embed_batch(&["x"]),
            Err(Error::Embedding { .. })
        ));
    }
}
