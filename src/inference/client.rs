use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{FragmentStream, Generate};

pub const ERROR_MARKER: &str = "⚠️ Ollama error:";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    stream: bool,
}

/// One NDJSON record of the generate endpoint's response body.
#[derive(Debug, Default, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

impl GenerateChunk {
    fn into_fragment(self) -> String {
        self.response
            .filter(|s| !s.is_empty())
            .or(self.output)
            .unwrap_or_default()
    }
}

/// Streaming client for a local Ollama-style `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    max_tokens: u32,
    /// Bound on each network wait: the response head and every body read.
    read_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, max_tokens: u32, read_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            max_tokens,
            read_timeout,
        })
    }
}

impl Generate for OllamaClient {
    fn stream(&self, prompt: &str, model: &str) -> FragmentStream {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let prompt = prompt.to_string();
        let model = model.to_string();
        let max_tokens = self.max_tokens;
        let read_timeout = self.read_timeout;

        let stream = async_stream::stream! {
            let request = GenerateRequest {
                model: &model,
                prompt: &prompt,
                max_tokens,
                stream: true,
            };
            debug!("-> POST {} (model={})", endpoint, model);

            let sent = match timeout(read_timeout, http.post(&endpoint).json(&request).send()).await {
                Ok(sent) => sent,
                Err(_) => {
                    warn!("Inference request got no response within {:?}", read_timeout);
                    yield timeout_fragment(read_timeout);
                    return;
                }
            };
            let response = match sent.and_then(|r| r.error_for_status()) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Inference request failed: {}", e);
                    yield error_fragment(&e);
                    return;
                }
            };

            let mut decoder = LineDecoder::default();
            let mut body = response.bytes_stream();
            loop {
                let chunk = match timeout(read_timeout, body.next()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(_) => {
                        warn!("Inference stream stalled for {:?}", read_timeout);
                        yield timeout_fragment(read_timeout);
                        return;
                    }
                };
                match chunk {
                    Ok(bytes) => {
                        for line in decoder.feed(&bytes) {
                            if let Some(fragment) = parse_record(&line) {
                                yield fragment;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Inference stream interrupted: {}", e);
                        yield error_fragment(&e);
                        return;
                    }
                }
            }

            if let Some(line) = decoder.finish() {
                if let Some(fragment) = parse_record(&line) {
                    yield fragment;
                }
            }
            debug!("<- inference stream closed");
        };

        stream.boxed()
    }
}

fn error_fragment(e: &impl Display) -> String {
    format!("{} {}", ERROR_MARKER, e)
}

fn timeout_fragment(limit: Duration) -> String {
    error_fragment(&format!("no data within {:?}, operation timed out", limit))
}

/// Parse one NDJSON record. Malformed records are skipped.
fn parse_record(line: &str) -> Option<String> {
    match serde_json::from_str::<GenerateChunk>(line) {
        Ok(chunk) => Some(chunk.into_fragment()),
        Err(e) => {
            debug!("Skipping malformed record {:?}: {}", line, e);
            None
        }
    }
}

/// Splits a byte stream into non-blank lines, holding back a trailing
/// partial line until more bytes arrive.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        decode_line(&raw)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OllamaClient {
        OllamaClient::new(&server.uri(), 200, Duration::from_secs(5)).unwrap()
    }

    async fn collect(client: &OllamaClient, prompt: &str) -> Vec<String> {
        client.stream(prompt, "llama2:latest").collect().await
    }

    #[tokio::test]
    async fn streams_fragments_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"response\":\"Hel\",\"done\":false}\n",
            "{\"response\":\"lo, \",\"done\":false}\n",
            "{\"response\":\"world\",\"done\":true}\n",
        );

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama2:latest",
                "prompt": "hi",
                "max_tokens": 200,
                "stream": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let fragments = collect(&client_for(&server), "hi").await;
        assert_eq!(fragments, vec!["Hel", "lo, ", "world"]);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"response\":\"one \"}\n",
            "{not json\n",
            "\n",
            "{\"response\":\"two\"}\n",
        );

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let fragments = collect(&client_for(&server), "hi").await;
        assert_eq!(fragments.concat(), "one two");
        assert!(fragments.iter().all(|f| !f.contains(ERROR_MARKER)));
    }

    #[tokio::test]
    async fn falls_back_to_output_then_empty() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"output\":\"from output\"}\n",
            "{\"response\":\"\",\"output\":\"!\"}\n",
            "{\"done\":true}",
        );

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let fragments = collect(&client_for(&server), "hi").await;
        assert_eq!(fragments, vec!["from output", "!", ""]);
    }

    #[tokio::test]
    async fn error_status_yields_single_marker() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fragments = collect(&client_for(&server), "hi").await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].starts_with(ERROR_MARKER));
    }

    #[tokio::test]
    async fn connection_refused_yields_single_marker() {
        // Nothing listens on this port.
        let client = OllamaClient::new("http://127.0.0.1:59998", 200, Duration::from_secs(2)).unwrap();

        let fragments = collect(&client, "hi").await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].starts_with(ERROR_MARKER));
    }

    /// Serves one chunked NDJSON response, sleeping `gap` before each record.
    /// With `stall` set the body is never terminated.
    async fn drip_server(records: &[&str], gap: Duration, stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let records: Vec<String> = records.iter().map(|r| format!("{r}\n")).collect();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // The JSON request body is the last thing sent.
            while !request.ends_with(b"}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }

            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            for record in records {
                tokio::time::sleep(gap).await;
                let chunk = format!("{:x}\r\n{}\r\n", record.len(), record);
                socket.write_all(chunk.as_bytes()).await.unwrap();
            }
            if !stall {
                socket.write_all(b"0\r\n\r\n").await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn slow_generation_longer_than_limit_completes() {
        let records = [
            "{\"response\":\"p0 \"}",
            "{\"response\":\"p1 \"}",
            "{\"response\":\"p2 \"}",
            "{\"response\":\"p3 \"}",
            "{\"response\":\"p4 \",\"done\":true}",
        ];
        let url = drip_server(&records, Duration::from_millis(300), false).await;
        // 5 x 300ms in total, each gap well inside the limit.
        let client = OllamaClient::new(&url, 200, Duration::from_secs(1)).unwrap();

        let fragments = collect(&client, "hi").await;
        assert!(fragments.iter().all(|f| !f.contains(ERROR_MARKER)), "got {fragments:?}");
        assert_eq!(fragments.concat(), "p0 p1 p2 p3 p4 ");
    }

    #[tokio::test]
    async fn stall_after_fragments_ends_with_marker() {
        let records = ["{\"response\":\"par\"}", "{\"response\":\"tial\"}"];
        let url = drip_server(&records, Duration::from_millis(20), true).await;
        let client = OllamaClient::new(&url, 200, Duration::from_millis(500)).unwrap();

        let fragments = collect(&client, "hi").await;
        assert_eq!(fragments.len(), 3, "got {fragments:?}");
        assert_eq!(fragments[..2].concat(), "partial");
        assert!(fragments[2].starts_with(ERROR_MARKER));
        assert!(fragments[2].contains("timed out"));
    }

    #[tokio::test]
    async fn silent_server_yields_single_marker() {
        let url = drip_server(&[], Duration::ZERO, true).await;
        let client = OllamaClient::new(&url, 200, Duration::from_millis(300)).unwrap();

        // Headers arrive but no record ever does.
        let fragments = collect(&client, "hi").await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].starts_with(ERROR_MARKER));
    }

    #[test]
    fn line_decoder_joins_split_records() {
        let mut decoder = LineDecoder::default();

        assert!(decoder.feed(b"{\"respon").is_empty());
        assert_eq!(decoder.feed(b"se\":\"a\"}\n{\"res"), vec!["{\"response\":\"a\"}"]);
        assert!(decoder.feed(b"ponse\":\"b\"}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("{\"response\":\"b\"}"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let client = OllamaClient::new("http://localhost:11434/", 200, Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint, "http://localhost:11434/api/generate");
    }
}
