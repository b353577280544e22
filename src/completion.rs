//! Streaming completion backends.
//!
//! A [`CompletionSource`] turns an assistant context and a user prompt into
//! a stream of plain-text fragments. Backend framing (OpenAI server-sent
//! events, Ollama newline-delimited JSON) is decoded here so that the sink
//! only ever sees text.

use crate::{
    config::{Backend, Config},
    error::{Error, Result},
};
use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, pin::Pin, sync::Arc};
use tracing::{debug, trace};

/// Text fragments of one completion, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Produces a streamed completion for a prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Starts a completion and returns its fragment stream.
    ///
    /// Errors raised before the first fragment (connection refused, HTTP
    /// status) are returned directly; later ones arrive inside the stream.
    async fn complete(&self, assistant: &str, prompt: &str) -> Result<FragmentStream>;
}

/// Builds the completion source selected by `config.model.backend`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be initialised.
pub fn from_config(config: &Config) -> Result<Arc<dyn CompletionSource>> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("jenngen/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let source: Arc<dyn CompletionSource> = match config.model.backend {
        Backend::OpenAi => Arc::new(OpenAiCompletion::new(client, config)),
        Backend::Ollama => Arc::new(OllamaCompletion::new(client, config)),
    };

    debug!("Using {} completion backend", config.model);
    Ok(source)
}

/// OpenAI-compatible `chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Deserialize, Default)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

impl OpenAiCompletion {
    /// Creates a client for the model and endpoint in `config`.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
            model: config.model.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

#[async_trait]
impl CompletionSource for OpenAiCompletion {
    async fn complete(&self, assistant: &str, prompt: &str) -> Result<FragmentStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "assistant",
                    content: assistant,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            top_p: self.top_p,
            stream: true,
        };

        trace!("POST {}", url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = ensure_success(request.send().await?).await?;
        Ok(frames(response.bytes_stream(), parse_sse_line))
    }
}

/// Ollama `api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaCompletion {
    client: reqwest::Client,
    host: String,
    model: String,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

impl OllamaCompletion {
    /// Creates a client for the model and host in `config`.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            host: config.ollama_host.trim_end_matches('/').to_string(),
            model: config.model.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

#[async_trait]
impl CompletionSource for OllamaCompletion {
    async fn complete(&self, assistant: &str, prompt: &str) -> Result<FragmentStream> {
        let url = format!("{}/api/generate", self.host);
        let body = GenerateRequest {
            model: &self.model,
            system: assistant,
            prompt,
            stream: true,
            options: GenerateOptions {
                temperature: self.temperature,
                top_p: self.top_p,
            },
        };

        trace!("POST {}", url);
        let response = ensure_success(self.client.post(&url).json(&body).send().await?).await?;
        Ok(frames(response.bytes_stream(), parse_ndjson_line))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::completion(format!("{status}: {}", body.trim())))
}

/// Splits a byte stream into lines regardless of how it was chunked.
#[derive(Debug, Default)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Appends `chunk` and returns every line it completed, without the
    /// line terminator.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = memchr::memchr(b'\n', &self.buf) {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&line[..pos]));
        }
        lines
    }

    /// Returns the unterminated last line, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

/// One decoded protocol line.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Text(String),
    Done,
    Skip,
}

type LineParser = fn(&str) -> Result<Frame>;

fn parse_sse_line(line: &str) -> Result<Frame> {
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:` and `id:` fields carry no text.
        return Ok(Frame::Skip);
    };

    let data = data.trim();
    if data.is_empty() {
        return Ok(Frame::Skip);
    }
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }

    let chunk: ChatChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        return Err(Error::completion(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map_or(Frame::Skip, Frame::Text))
}

fn parse_ndjson_line(line: &str) -> Result<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Frame::Skip);
    }

    let chunk: GenerateChunk = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        return Err(Error::completion(error));
    }

    if !chunk.response.is_empty() {
        Ok(Frame::Text(chunk.response))
    } else if chunk.done {
        Ok(Frame::Done)
    } else {
        Ok(Frame::Skip)
    }
}

struct Framer<S> {
    body: Pin<Box<S>>,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    failed: Option<Error>,
    done: bool,
    parse: LineParser,
}

impl<S> Framer<S> {
    fn accept(&mut self, line: &str) {
        if self.done {
            return;
        }
        match (self.parse)(line) {
            Ok(Frame::Text(text)) => self.ready.push_back(text),
            Ok(Frame::Done) => self.done = true,
            Ok(Frame::Skip) => {}
            Err(e) => {
                // Fragments decoded before the failure are still delivered.
                self.failed = Some(e);
                self.done = true;
            }
        }
    }
}

async fn next_fragment<S, B>(mut framer: Framer<S>) -> Result<Option<(String, Framer<S>)>>
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    loop {
        if let Some(text) = framer.ready.pop_front() {
            return Ok(Some((text, framer)));
        }
        if let Some(e) = framer.failed.take() {
            return Err(e);
        }
        if framer.done {
            return Ok(None);
        }

        match framer.body.next().await {
            Some(chunk) => {
                let chunk = chunk?;
                for line in framer.decoder.push(chunk.as_ref()) {
                    framer.accept(&line);
                }
            }
            None => {
                if let Some(line) = framer.decoder.finish() {
                    framer.accept(&line);
                }
                framer.done = true;
            }
        }
    }
}

/// Re-frames a response body into text fragments using `parse` per line.
fn frames<S, B>(body: S, parse: LineParser) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let framer = Framer {
        body: Box::pin(body),
        decoder: LineDecoder::default(),
        ready: VecDeque::new(),
        failed: None,
        done: false,
        parse,
    };

    stream::try_unfold(framer, next_fragment::<S, B>).boxed()
}
