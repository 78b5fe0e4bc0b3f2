//! Gemini API dispatch: look up a tool, build its request and execute it.

use crate::config::Config;
use crate::error::{GeminiError, Result};
use crate::registry::{ToolDescriptor, ToolRegistry};
use crate::request::{self, HttpRequest, RequestBody};
use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use url::Url;

/// Response headers of a resumable upload session worth returning to the caller.
const UPLOAD_HEADER_PREFIX: &str = "x-goog-upload-";

/// Outcome of a successful tool invocation.
pub enum ToolOutput {
    Json(Value),
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    Stream(ChunkStream),
}

impl std::fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Bytes { data, content_type } => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Chunks of a streaming response, yielded as they arrive.
///
/// The stream is finite and cannot be restarted; it ends when the upstream closes the
/// connection. Dropping it aborts the in-flight request.
pub struct ChunkStream {
    inner: BoxStream<'static, Result<Value>>,
}

impl ChunkStream {
    fn new(inner: BoxStream<'static, Result<Value>>) -> Self {
        Self { inner }
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_chunks(mut self) -> Result<Vec<Value>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.inner.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }
}

impl Stream for ChunkStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Dispatches tool calls against the Gemini API.
///
/// Cheap to clone; the registry and HTTP client are shared.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: ToolRegistry,
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, config: &Config) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        let client = builder.build()?;

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                registry,
                client,
                base_url: config.base_url.clone(),
                api_key: config.api_key.clone(),
            }),
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    /// Build the request `name` would send, without sending it.
    pub fn prepare(&self, name: &str, arguments: &Value) -> Result<HttpRequest> {
        let descriptor = self.inner.registry.lookup(name)?;
        self.build_request(descriptor, arguments)
    }

    fn build_request(&self, descriptor: &ToolDescriptor, arguments: &Value) -> Result<HttpRequest> {
        let mut req = request::build(&self.inner.base_url, descriptor, arguments)?;
        req.apply_api_key(self.inner.api_key.as_deref())?;
        Ok(req)
    }

    /// Invoke the tool `name` with `arguments`.
    ///
    /// Returns once response headers arrive. Streaming tools yield a [`ChunkStream`]; other
    /// tools return the parsed JSON body, or raw bytes for non-JSON content.
    pub async fn invoke(&self, name: &str, arguments: &Value) -> Result<ToolOutput> {
        let descriptor = self.inner.registry.lookup(name)?;
        let req = self.build_request(descriptor, arguments)?;

        tracing::debug!(
            tool = %descriptor.name,
            method = %req.method,
            path = %req.url.path(),
            "dispatching Gemini API request"
        );

        let response = self.send(req).await?;
        let status = response.status();

        if !status.is_success() {
            let bytes = response.bytes().await?;
            let body = parse_body_lossy(&bytes);
            tracing::warn!(tool = %descriptor.name, status = status.as_u16(), "Gemini API error");
            return Err(GeminiError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        if descriptor.streaming {
            return Ok(ToolOutput::Stream(open_stream(descriptor, response)));
        }

        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        Ok(decode_response(&headers, &bytes))
    }

    async fn send(&self, req: HttpRequest) -> Result<reqwest::Response> {
        let mut builder = self.inner.client.request(req.method.to_reqwest(), req.url);
        let has_content_type = req.headers.iter().any(|(k, _)| *k == CONTENT_TYPE);
        for (name, value) in req.headers {
            builder = builder.header(name, value);
        }
        builder = match req.body {
            RequestBody::None => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Binary(bytes) => {
                if !has_content_type {
                    builder = builder.header(CONTENT_TYPE, "application/octet-stream");
                }
                builder.body(bytes)
            }
        };
        Ok(builder.send().await?)
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let essence = ct.split(';').next().unwrap_or_default().trim();
        essence == "application/json" || essence.ends_with("+json")
    })
}

fn parse_body_lossy(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn decode_response(headers: &HeaderMap, bytes: &[u8]) -> ToolOutput {
    let ct = content_type(headers);

    let mut body = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(v) => v,
            Err(_) if is_json_content_type(ct.as_deref()) => {
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            Err(_) => {
                return ToolOutput::Bytes {
                    data: bytes.to_vec(),
                    content_type: ct,
                }
            }
        }
    };

    let upload_headers: Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with(UPLOAD_HEADER_PREFIX))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();

    if !upload_headers.is_empty() {
        body = match body {
            Value::Object(mut obj) => {
                obj.insert("uploadHeaders".into(), Value::Object(upload_headers));
                Value::Object(obj)
            }
            other => json!({ "body": other, "uploadHeaders": upload_headers }),
        };
    }

    ToolOutput::Json(body)
}

fn open_stream(descriptor: &ToolDescriptor, response: reqwest::Response) -> ChunkStream {
    let ct = content_type(response.headers());
    let is_sse = ct
        .as_deref()
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    tracing::debug!(tool = %descriptor.name, sse = is_sse, "streaming Gemini API response");

    if is_sse {
        ChunkStream::new(sse_chunks(response))
    } else {
        ChunkStream::new(json_array_chunks(response))
    }
}

fn sse_chunks(response: reqwest::Response) -> BoxStream<'static, Result<Value>> {
    sse_stream::SseStream::from_byte_stream(response.bytes_stream())
        .filter_map(|event| async move {
            match event {
                Ok(sse) => {
                    let data = sse.data.unwrap_or_default();
                    if data.trim().is_empty() {
                        return None;
                    }
                    Some(Ok(serde_json::from_str(&data).unwrap_or(Value::String(data))))
                }
                Err(e) => Some(Err(GeminiError::Transport(format!(
                    "Failed to read event stream: {e}"
                )))),
            }
        })
        .boxed()
}

/// Without `alt=sse` the API streams one JSON array; each element is yielded as soon as
/// its closing byte arrives.
fn json_array_chunks(response: reqwest::Response) -> BoxStream<'static, Result<Value>> {
    let state = Some((response.bytes_stream().boxed(), JsonArraySplitter::default()));
    stream::unfold(state, |state| async move {
        let (mut bytes, mut splitter) = state?;
        match bytes.next().await {
            Some(Ok(chunk)) => Some((stream::iter(splitter.push(&chunk)), Some((bytes, splitter)))),
            Some(Err(e)) => Some((stream::iter(vec![Err(e.into())]), None)),
            None => Some((stream::iter(splitter.finish()), None)),
        }
    })
    .flatten()
    .boxed()
}

/// Splits a top-level JSON array into its elements as bytes arrive.
///
/// A body that is not an array is buffered and yielded as a single value at the end.
#[derive(Default)]
struct JsonArraySplitter {
    buf: Vec<u8>,
    state: SplitState,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

#[derive(Default, PartialEq)]
enum SplitState {
    #[default]
    Start,
    Array,
    Closed,
    Whole,
}

impl JsonArraySplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value>> {
        let mut out = Vec::new();
        for &b in chunk {
            match self.state {
                SplitState::Start => match b {
                    b'[' => self.state = SplitState::Array,
                    _ if b.is_ascii_whitespace() => {}
                    _ => {
                        self.state = SplitState::Whole;
                        self.buf.push(b);
                    }
                },
                SplitState::Whole => self.buf.push(b),
                SplitState::Closed => {}
                SplitState::Array => self.push_array_byte(b, &mut out),
            }
        }
        out
    }

    fn push_array_byte(&mut self, b: u8, out: &mut Vec<Result<Value>>) {
        if self.in_string {
            self.buf.push(b);
            match b {
                _ if self.escaped => self.escaped = false,
                b'\\' => self.escaped = true,
                b'"' => self.in_string = false,
                _ => {}
            }
            return;
        }

        if self.depth > 0 {
            self.buf.push(b);
            match b {
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.emit(out);
                    }
                }
                b'"' => self.in_string = true,
                _ => {}
            }
            return;
        }

        match b {
            b',' => self.emit(out),
            b']' => {
                self.emit(out);
                self.state = SplitState::Closed;
            }
            _ if b.is_ascii_whitespace() => {}
            _ => {
                self.buf.push(b);
                match b {
                    b'{' | b'[' => self.depth = 1,
                    b'"' => self.in_string = true,
                    _ => {}
                }
            }
        }
    }

    fn emit(&mut self, out: &mut Vec<Result<Value>>) {
        if self.buf.is_empty() {
            return;
        }
        let element = std::mem::take(&mut self.buf);
        out.push(serde_json::from_slice(&element).map_err(GeminiError::from));
    }

    fn finish(self) -> Vec<Result<Value>> {
        match self.state {
            SplitState::Start | SplitState::Closed => Vec::new(),
            SplitState::Whole => vec![Ok(parse_body_lossy(&self.buf))],
            SplitState::Array => vec![Err(GeminiError::Transport(
                "Stream ended before the JSON array was closed".into(),
            ))],
        }
    }
}
