use std::env;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use image::GenericImageView;
use lumo_contracts::chat::{
    classify_request, extract_topic, greeting_response, is_greeting, RequestKind,
};
use lumo_contracts::events::EventPayload;
use lumo_contracts::models::{CandidatePlanner, ModelRegistry};
use lumo_contracts::prompt::build_prompt;
use lumo_contracts::reference::{ReferenceDocument, SearchSnippet};
use lumo_contracts::session::SessionContext;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use thiserror::Error;

const DEFAULT_INFERENCE_API_BASE: &str = "https://api-inference.huggingface.co/models";
const DEFAULT_WIKIPEDIA_API_BASE: &str = "https://en.wikipedia.org/w/api.php";
const DEFAULT_SEARCH_API_BASE: &str = "https://api.duckduckgo.com";

const SEARCH_RESULT_LIMIT: usize = 5;
const IMAGE_REQUEST_TIMEOUT_S: u64 = 30;

/// Raw reply from one inference call, before acceptance checks.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: Vec<u8>,
}

pub trait InferenceTransport {
    fn send(&self, model: &str, payload: &Value, timeout: Option<Duration>)
        -> Result<TransportReply>;
}

/// Bearer-authenticated POST to `<api_base>/<model>`.
pub struct BearerTransport {
    api_base: String,
    token: String,
    http: HttpClient,
}

impl BearerTransport {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: non_empty_env("LUMO_INFERENCE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_INFERENCE_API_BASE.to_string()),
            token: token.into(),
            http: HttpClient::new(),
        }
    }
}

impl InferenceTransport for BearerTransport {
    fn send(
        &self,
        model: &str,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<TransportReply> {
        let endpoint = format!("{}/{model}", self.api_base);
        let mut request = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .with_context(|| format!("inference request failed ({endpoint})"))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .with_context(|| format!("inference response body read failed ({endpoint})"))?
            .to_vec();
        Ok(TransportReply { status, body })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    TransientFailure,
    PermanentFailure,
    Timeout,
}

/// Why one candidate dropped out of the fallback sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub model: String,
    pub status: AttemptStatus,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("inference API rejected the token (HTTP 401)")]
    Unauthorized,
    #[error("all candidate models exhausted after {} failures", .0.len())]
    Exhausted(Vec<AttemptOutcome>),
}

/// Decides whether a 200 reply is good enough to stop the fallback loop.
/// Injected into the executor so text and image runs share one loop.
pub trait ResponseAcceptor {
    type Output;
    fn accept(&self, reply: &TransportReply) -> std::result::Result<Self::Output, String>;
}

pub struct TextAcceptor {
    /// Minimum trimmed length before a reply counts as a real answer.
    /// Inherited heuristic; tunable, not a correctness invariant.
    pub min_chars: usize,
}

impl Default for TextAcceptor {
    fn default() -> Self {
        Self { min_chars: 20 }
    }
}

impl ResponseAcceptor for TextAcceptor {
    type Output = String;

    fn accept(&self, reply: &TransportReply) -> std::result::Result<String, String> {
        let parsed: Value = serde_json::from_slice(&reply.body)
            .map_err(|err| format!("reply is not valid JSON: {err}"))?;
        let Some(rows) = parsed.as_array() else {
            return Err("reply is not a generation list".to_string());
        };
        let text = rows
            .first()
            .and_then(|row| row.get("generated_text"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            return Err("reply carries no generated text".to_string());
        }
        if text.chars().count() <= self.min_chars {
            return Err(format!(
                "generated text too short ({} chars)",
                text.chars().count()
            ));
        }
        Ok(text.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
pub struct ImageAcceptor;

impl ResponseAcceptor for ImageAcceptor {
    type Output = DecodedImage;

    fn accept(&self, reply: &TransportReply) -> std::result::Result<DecodedImage, String> {
        let decoded = image::load_from_memory(&reply.body)
            .map_err(|err| format!("reply bytes do not decode as an image: {err}"))?;
        let (width, height) = decoded.dimensions();
        Ok(DecodedImage {
            bytes: reply.body.clone(),
            width,
            height,
        })
    }
}

/// Sequential fallback over an ordered candidate list: each candidate gets
/// up to `retry_cap` attempts with `backoff_base_s * 2^attempt` sleeps on
/// transient failures, then the loop moves on. HTTP 401 aborts the whole
/// sequence because the credential applies to every candidate identically.
#[derive(Debug, Clone)]
pub struct FallbackExecutor {
    pub retry_cap: usize,
    pub backoff_base_s: f64,
}

impl Default for FallbackExecutor {
    fn default() -> Self {
        Self {
            retry_cap: 3,
            backoff_base_s: 1.0,
        }
    }
}

impl FallbackExecutor {
    pub fn run<A: ResponseAcceptor>(
        &self,
        candidates: &[String],
        payload: &Value,
        timeout: Option<Duration>,
        transport: &dyn InferenceTransport,
        acceptor: &A,
    ) -> std::result::Result<(String, A::Output), FallbackError> {
        let attempts_per_candidate = self.retry_cap.max(1);
        let mut outcomes = Vec::new();

        'candidates: for model in candidates {
            for attempt in 0..attempts_per_candidate {
                let last_attempt = attempt + 1 >= attempts_per_candidate;

                let reply = match transport.send(model, payload, timeout) {
                    Ok(reply) => reply,
                    Err(err) => {
                        if !last_attempt {
                            self.wait(attempt);
                            continue;
                        }
                        let status = if is_timeout_error(&err) {
                            AttemptStatus::Timeout
                        } else {
                            AttemptStatus::TransientFailure
                        };
                        outcomes.push(AttemptOutcome {
                            model: model.clone(),
                            status,
                            detail: error_chain_text(&err, 256),
                        });
                        continue 'candidates;
                    }
                };

                if reply.status == 401 {
                    return Err(FallbackError::Unauthorized);
                }

                if let Some(reason) = transient_reason(&reply) {
                    if !last_attempt {
                        self.wait(attempt);
                        continue;
                    }
                    outcomes.push(AttemptOutcome {
                        model: model.clone(),
                        status: AttemptStatus::TransientFailure,
                        detail: reason,
                    });
                    continue 'candidates;
                }

                if reply.status == 200 {
                    match acceptor.accept(&reply) {
                        Ok(output) => return Ok((model.clone(), output)),
                        Err(reason) => {
                            outcomes.push(AttemptOutcome {
                                model: model.clone(),
                                status: AttemptStatus::PermanentFailure,
                                detail: reason,
                            });
                            continue 'candidates;
                        }
                    }
                }

                outcomes.push(AttemptOutcome {
                    model: model.clone(),
                    status: AttemptStatus::PermanentFailure,
                    detail: format!("HTTP {}", reply.status),
                });
                continue 'candidates;
            }
        }

        Err(FallbackError::Exhausted(outcomes))
    }

    fn wait(&self, attempt: usize) {
        if self.backoff_base_s <= 0.0 {
            return;
        }
        let delay_s = self.backoff_base_s * f64::powi(2.0, attempt as i32);
        thread::sleep(Duration::from_secs_f64(delay_s));
    }
}

/// A 503 or a 200 body reporting that the remote model is still loading is
/// retryable on the same candidate.
fn transient_reason(reply: &TransportReply) -> Option<String> {
    if reply.status == 503 {
        return Some("service unavailable (HTTP 503)".to_string());
    }
    if reply.status == 200 {
        if let Ok(parsed) = serde_json::from_slice::<Value>(&reply.body) {
            let error_text = parsed
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if error_text.to_ascii_lowercase().contains("loading") {
                return Some(format!("remote model not ready: {error_text}"));
            }
        }
    }
    None
}

pub trait ReferenceSource {
    fn lookup(&self, topic: &str) -> Option<ReferenceDocument>;
}

pub trait SnippetSource {
    fn search(&self, query: &str, max_results: usize) -> Vec<SearchSnippet>;
}

/// MediaWiki-backed encyclopedia lookup: search for the topic, take the
/// first hit, pull the intro extract as summary and the full plain-text
/// extract as content. Any failure collapses to "no reference".
pub struct WikipediaClient {
    api_base: String,
    http: HttpClient,
}

impl WikipediaClient {
    pub fn new() -> Self {
        Self {
            api_base: non_empty_env("LUMO_WIKIPEDIA_API_BASE")
                .unwrap_or_else(|| DEFAULT_WIKIPEDIA_API_BASE.to_string()),
            http: HttpClient::new(),
        }
    }

    fn get_json(&self, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .get(&self.api_base)
            .query(query)
            .send()
            .with_context(|| format!("wikipedia request failed ({})", self.api_base))?;
        if !response.status().is_success() {
            bail!(
                "wikipedia request failed (HTTP {})",
                response.status().as_u16()
            );
        }
        response
            .json::<Value>()
            .context("wikipedia returned invalid JSON")
    }

    fn first_search_hit(&self, topic: &str) -> Result<Option<String>> {
        let parsed = self.get_json(&[
            ("action", "query"),
            ("list", "search"),
            ("srsearch", topic),
            ("srlimit", "1"),
            ("format", "json"),
        ])?;
        let title = parsed["query"]["search"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(title)
    }

    fn page_field(parsed: &Value, field: &str) -> Option<String> {
        parsed["query"]["pages"]
            .as_object()?
            .values()
            .next()?
            .get(field)?
            .as_str()
            .map(str::to_string)
    }

    fn fetch_page(&self, title: &str) -> Result<ReferenceDocument> {
        let intro = self.get_json(&[
            ("action", "query"),
            ("prop", "extracts|info"),
            ("exintro", "1"),
            ("explaintext", "1"),
            ("redirects", "1"),
            ("inprop", "url"),
            ("titles", title),
            ("format", "json"),
        ])?;
        let summary = Self::page_field(&intro, "extract")
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .context("wikipedia page has no intro extract")?;
        let url = Self::page_field(&intro, "fullurl").unwrap_or_else(|| {
            format!("https://en.wikipedia.org/wiki/{}", title.replace(' ', "_"))
        });

        let full = self.get_json(&[
            ("action", "query"),
            ("prop", "extracts"),
            ("explaintext", "1"),
            ("redirects", "1"),
            ("titles", title),
            ("format", "json"),
        ])?;
        let content = Self::page_field(&full, "extract")
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| summary.clone());

        Ok(ReferenceDocument {
            title: title.to_string(),
            summary,
            content,
            url,
        })
    }
}

impl Default for WikipediaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSource for WikipediaClient {
    fn lookup(&self, topic: &str) -> Option<ReferenceDocument> {
        let topic = topic.trim();
        if topic.is_empty() {
            return None;
        }
        let title = self.first_search_hit(topic).ok().flatten()?;
        self.fetch_page(&title).ok()
    }
}

/// DuckDuckGo instant-answer search. Total failure yields an empty list,
/// never an error.
pub struct DuckDuckGoClient {
    api_base: String,
    http: HttpClient,
}

impl DuckDuckGoClient {
    pub fn new() -> Self {
        Self {
            api_base: non_empty_env("LUMO_SEARCH_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SEARCH_API_BASE.to_string()),
            http: HttpClient::new(),
        }
    }

    fn try_search(&self, query: &str, max_results: usize) -> Result<Vec<SearchSnippet>> {
        let endpoint = format!("{}/", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("no_redirect", "1"),
            ])
            .send()
            .with_context(|| format!("search request failed ({endpoint})"))?;
        if !response.status().is_success() {
            bail!(
                "search request failed (HTTP {})",
                response.status().as_u16()
            );
        }
        let parsed: Value = response.json().context("search returned invalid JSON")?;

        let mut snippets = Vec::new();
        let abstract_text = parsed["AbstractText"].as_str().unwrap_or_default().trim();
        if !abstract_text.is_empty() {
            snippets.push(SearchSnippet {
                title: parsed["Heading"].as_str().unwrap_or_default().to_string(),
                body: abstract_text.to_string(),
                url: parsed["AbstractURL"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        for row in flatten_related_topics(&parsed["RelatedTopics"]) {
            if snippets.len() >= max_results {
                break;
            }
            snippets.push(row);
        }
        snippets.truncate(max_results);
        Ok(snippets)
    }
}

impl Default for DuckDuckGoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SnippetSource for DuckDuckGoClient {
    fn search(&self, query: &str, max_results: usize) -> Vec<SearchSnippet> {
        self.try_search(query, max_results).unwrap_or_default()
    }
}

/// Related topics arrive either as result rows or as one-level category
/// groups holding their own `Topics` array.
fn flatten_related_topics(related: &Value) -> Vec<SearchSnippet> {
    let mut out = Vec::new();
    let rows = related.as_array().cloned().unwrap_or_default();
    for row in rows {
        if let Some(nested) = row.get("Topics").and_then(Value::as_array) {
            for topic in nested {
                if let Some(snippet) = snippet_from_topic(topic) {
                    out.push(snippet);
                }
            }
            continue;
        }
        if let Some(snippet) = snippet_from_topic(&row) {
            out.push(snippet);
        }
    }
    out
}

fn snippet_from_topic(topic: &Value) -> Option<SearchSnippet> {
    let body = topic.get("Text")?.as_str()?.trim();
    if body.is_empty() {
        return None;
    }
    Some(SearchSnippet {
        title: String::new(),
        body: body.to_string(),
        url: topic
            .get("FirstURL")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub model: String,
}

/// Orchestrates one chat turn: greeting short-circuit, reference fetch,
/// prompt assembly, then the fallback run over the text candidates.
pub struct AssistantEngine {
    planner: CandidatePlanner,
    executor: FallbackExecutor,
    transport: Box<dyn InferenceTransport>,
    reference_source: Box<dyn ReferenceSource>,
    snippet_source: Box<dyn SnippetSource>,
    out_dir: PathBuf,
    text_model: Option<String>,
    image_model: Option<String>,
    last_fallback_reason: Option<String>,
}

impl AssistantEngine {
    /// A blank token is a hard precondition failure: no generation call is
    /// ever attempted without a credential.
    pub fn new(out_dir: impl Into<PathBuf>, token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            bail!("missing API token; set HUGGINGFACE_TOKEN or pass --token");
        }
        Ok(Self::with_components(
            out_dir,
            Box::new(BearerTransport::new(token)),
            Box::new(WikipediaClient::new()),
            Box::new(DuckDuckGoClient::new()),
        ))
    }

    pub fn with_components(
        out_dir: impl Into<PathBuf>,
        transport: Box<dyn InferenceTransport>,
        reference_source: Box<dyn ReferenceSource>,
        snippet_source: Box<dyn SnippetSource>,
    ) -> Self {
        Self {
            planner: CandidatePlanner::new(Some(ModelRegistry::new(None))),
            executor: FallbackExecutor::default(),
            transport,
            reference_source,
            snippet_source,
            out_dir: out_dir.into(),
            text_model: None,
            image_model: None,
            last_fallback_reason: None,
        }
    }

    pub fn set_executor(&mut self, executor: FallbackExecutor) {
        self.executor = executor;
    }

    pub fn set_text_model(&mut self, model: Option<String>) {
        self.text_model = model;
    }

    pub fn text_model(&self) -> Option<&str> {
        self.text_model.as_deref()
    }

    pub fn set_image_model(&mut self, model: Option<String>) {
        self.image_model = model;
    }

    pub fn image_model(&self) -> Option<&str> {
        self.image_model.as_deref()
    }

    pub fn last_fallback_reason(&self) -> Option<&str> {
        self.last_fallback_reason.as_deref()
    }

    pub fn respond(&mut self, session: &mut SessionContext, input: &str) -> Result<String> {
        session.record_user(input)?;

        if is_greeting(input) {
            let reply = greeting_response(timestamp_millis() as u64);
            session.record_assistant(reply)?;
            return Ok(reply.to_string());
        }

        let kind = classify_request(input);
        let (reference, snippets) = self.fetch_context(session, kind, input)?;
        let prompt = build_prompt(kind, input.trim(), reference.as_ref(), &snippets);

        let plan = self
            .planner
            .plan(self.text_model.as_deref(), "text")
            .map_err(|reason| anyhow::anyhow!(reason))?;
        self.last_fallback_reason = plan.fallback_reason.clone();

        let payload = text_generation_payload(&prompt);
        match self.executor.run(
            &plan.models,
            &payload,
            None,
            self.transport.as_ref(),
            &TextAcceptor::default(),
        ) {
            Ok((model, text)) => {
                let mut payload = EventPayload::new();
                payload.insert("model".to_string(), Value::String(model));
                payload.insert("chars".to_string(), Value::Number(text.len().into()));
                session.events().emit("generation_accepted", payload)?;
                session.record_assistant(&text)?;
                Ok(text)
            }
            Err(FallbackError::Unauthorized) => {
                bail!("invalid API token; the inference API rejected it (HTTP 401)")
            }
            Err(FallbackError::Exhausted(outcomes)) => {
                self.emit_exhausted(session, "text", &outcomes)?;
                bail!(
                    "I'm having trouble generating a response right now. \
                     Please try again in a moment."
                )
            }
        }
    }

    pub fn create_image(
        &mut self,
        session: &mut SessionContext,
        prompt: &str,
    ) -> Result<ImageArtifact> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("image generation needs a prompt");
        }

        let plan = self
            .planner
            .plan(self.image_model.as_deref(), "image")
            .map_err(|reason| anyhow::anyhow!(reason))?;
        self.last_fallback_reason = plan.fallback_reason.clone();

        let payload = image_generation_payload(prompt);
        let (model, decoded) = match self.executor.run(
            &plan.models,
            &payload,
            Some(Duration::from_secs(IMAGE_REQUEST_TIMEOUT_S)),
            self.transport.as_ref(),
            &ImageAcceptor,
        ) {
            Ok(accepted) => accepted,
            Err(FallbackError::Unauthorized) => {
                bail!("invalid API token; the inference API rejected it (HTTP 401)")
            }
            Err(FallbackError::Exhausted(outcomes)) => {
                self.emit_exhausted(session, "image", &outcomes)?;
                bail!("Failed to generate image. Please try again.")
            }
        };

        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed creating {}", self.out_dir.display()))?;
        let path = self
            .out_dir
            .join(format!("lumo-art-{}.png", timestamp_millis()));
        fs::write(&path, &decoded.bytes)
            .with_context(|| format!("failed to save {}", path.display()))?;

        let mut event = EventPayload::new();
        event.insert(
            "path".to_string(),
            Value::String(path.display().to_string()),
        );
        event.insert("model".to_string(), Value::String(model.clone()));
        event.insert("width".to_string(), Value::Number(decoded.width.into()));
        event.insert("height".to_string(), Value::Number(decoded.height.into()));
        session.events().emit("image_saved", event)?;

        Ok(ImageArtifact {
            path,
            width: decoded.width,
            height: decoded.height,
            model,
        })
    }

    /// Exactly one reference-fetch attempt per non-greeting turn; a failed
    /// lookup degrades silently to no reference.
    fn fetch_context(
        &self,
        session: &SessionContext,
        kind: RequestKind,
        input: &str,
    ) -> Result<(Option<ReferenceDocument>, Vec<SearchSnippet>)> {
        if kind.wants_reference() {
            let topic = match kind {
                RequestKind::Essay => extract_topic(input),
                _ => input.trim().to_string(),
            };
            let reference = self.reference_source.lookup(&topic);
            if let Some(reference) = reference.as_ref() {
                let mut payload = EventPayload::new();
                payload.insert("title".to_string(), Value::String(reference.title.clone()));
                payload.insert("url".to_string(), Value::String(reference.url.clone()));
                session.events().emit("reference_attached", payload)?;
            }
            return Ok((reference, Vec::new()));
        }
        let snippets = self
            .snippet_source
            .search(input.trim(), SEARCH_RESULT_LIMIT);
        Ok((None, snippets))
    }

    fn emit_exhausted(
        &self,
        session: &SessionContext,
        task: &str,
        outcomes: &[AttemptOutcome],
    ) -> Result<()> {
        let mut payload = EventPayload::new();
        payload.insert("task".to_string(), Value::String(task.to_string()));
        payload.insert(
            "failures".to_string(),
            Value::Array(outcomes.iter().map(outcome_payload).collect()),
        );
        session.events().emit("generation_failed", payload)?;
        Ok(())
    }
}

fn outcome_payload(outcome: &AttemptOutcome) -> Value {
    let mut row = Map::new();
    row.insert("model".to_string(), Value::String(outcome.model.clone()));
    row.insert(
        "status".to_string(),
        Value::String(
            match outcome.status {
                AttemptStatus::TransientFailure => "transient-failure",
                AttemptStatus::PermanentFailure => "permanent-failure",
                AttemptStatus::Timeout => "timeout",
            }
            .to_string(),
        ),
    );
    row.insert(
        "detail".to_string(),
        Value::String(truncate_text(&outcome.detail, 256)),
    );
    Value::Object(row)
}

fn text_generation_payload(prompt: &str) -> Value {
    json!({
        "inputs": prompt,
        "parameters": {
            "max_length": 500,
            "num_return_sequences": 1,
            "temperature": 0.7,
            "top_p": 0.9,
            "do_sample": true,
        }
    })
}

fn image_generation_payload(prompt: &str) -> Value {
    json!({
        "inputs": prompt,
        "parameters": {
            "num_inference_steps": 30,
            "guidance_scale": 7.5,
            "width": 512,
            "height": 512,
            "negative_prompt": "blurry, distorted, low quality, bad anatomy",
            "num_images_per_prompt": 1,
        }
    })
}

fn is_timeout_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(reqwest::Error::is_timeout)
            .unwrap_or(false)
    })
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::rc::Rc;
    use std::time::Duration;

    use image::{DynamicImage, RgbImage};
    use lumo_contracts::reference::{ReferenceDocument, SearchSnippet};
    use lumo_contracts::session::SessionContext;
    use serde_json::{json, Value};

    use super::{
        flatten_related_topics, AssistantEngine, AttemptStatus, FallbackError, FallbackExecutor,
        ImageAcceptor, InferenceTransport, ReferenceSource, ResponseAcceptor, SnippetSource,
        TextAcceptor, TransportReply,
    };

    struct ScriptedTransport {
        replies: RefCell<VecDeque<anyhow::Result<TransportReply>>>,
        calls: RefCell<Vec<String>>,
        payloads: RefCell<Vec<Value>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<anyhow::Result<TransportReply>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                calls: RefCell::new(Vec::new()),
                payloads: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl InferenceTransport for ScriptedTransport {
        fn send(
            &self,
            model: &str,
            payload: &Value,
            _timeout: Option<Duration>,
        ) -> anyhow::Result<TransportReply> {
            self.calls.borrow_mut().push(model.to_string());
            self.payloads.borrow_mut().push(payload.clone());
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("scripted transport ran out of replies")))
        }
    }

    impl InferenceTransport for Rc<ScriptedTransport> {
        fn send(
            &self,
            model: &str,
            payload: &Value,
            timeout: Option<Duration>,
        ) -> anyhow::Result<TransportReply> {
            self.as_ref().send(model, payload, timeout)
        }
    }

    struct StubReference {
        document: Option<ReferenceDocument>,
        lookups: RefCell<Vec<String>>,
    }

    impl StubReference {
        fn with(document: Option<ReferenceDocument>) -> Rc<Self> {
            Rc::new(Self {
                document,
                lookups: RefCell::new(Vec::new()),
            })
        }
    }

    impl ReferenceSource for Rc<StubReference> {
        fn lookup(&self, topic: &str) -> Option<ReferenceDocument> {
            self.lookups.borrow_mut().push(topic.to_string());
            self.document.clone()
        }
    }

    struct StubSnippets {
        snippets: Vec<SearchSnippet>,
        searches: RefCell<Vec<String>>,
    }

    impl StubSnippets {
        fn with(snippets: Vec<SearchSnippet>) -> Rc<Self> {
            Rc::new(Self {
                snippets,
                searches: RefCell::new(Vec::new()),
            })
        }
    }

    impl SnippetSource for Rc<StubSnippets> {
        fn search(&self, query: &str, _max_results: usize) -> Vec<SearchSnippet> {
            self.searches.borrow_mut().push(query.to_string());
            self.snippets.clone()
        }
    }

    fn reply(status: u16, body: &[u8]) -> anyhow::Result<TransportReply> {
        Ok(TransportReply {
            status,
            body: body.to_vec(),
        })
    }

    fn accepted_text_body() -> Vec<u8> {
        serde_json::to_vec(&json!([
            {"generated_text": "A detailed answer that clears the length bar."}
        ]))
        .unwrap_or_default()
    }

    fn quiet_executor() -> FallbackExecutor {
        FallbackExecutor {
            retry_cap: 3,
            backoff_base_s: 0.0,
        }
    }

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn png_bytes() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .expect("in-memory png encode");
        buffer.into_inner()
    }

    fn everest_reference() -> ReferenceDocument {
        ReferenceDocument {
            title: "Mount Everest".to_string(),
            summary: "Mount Everest is Earth's highest mountain above sea level.".to_string(),
            content: "Mount Everest is Earth's highest mountain above sea level.".to_string(),
            url: "https://en.wikipedia.org/wiki/Mount_Everest".to_string(),
        }
    }

    fn test_engine(
        out_dir: std::path::PathBuf,
        transport: &Rc<ScriptedTransport>,
        reference: &Rc<StubReference>,
        snippets: &Rc<StubSnippets>,
    ) -> AssistantEngine {
        let mut engine = AssistantEngine::with_components(
            out_dir,
            Box::new(Rc::clone(transport)),
            Box::new(Rc::clone(reference)),
            Box::new(Rc::clone(snippets)),
        );
        engine.set_executor(quiet_executor());
        engine
    }

    #[test]
    fn executor_tries_candidates_strictly_in_order() {
        let transport = ScriptedTransport::new(vec![
            reply(503, b""),
            reply(503, b""),
            reply(503, b""),
            reply(503, b""),
            reply(503, b""),
            reply(503, b""),
            reply(200, &accepted_text_body()),
        ]);
        let (model, text) = quiet_executor()
            .run(
                &candidates(&["a", "b", "c"]),
                &json!({"inputs": "prompt"}),
                None,
                &transport,
                &TextAcceptor::default(),
            )
            .expect("third candidate should be accepted");

        assert_eq!(model, "c");
        assert!(text.contains("detailed answer"));
        // retry_cap x 2 transient candidates + 1 accepted call.
        assert_eq!(transport.calls(), vec!["a", "a", "a", "b", "b", "b", "c"]);
    }

    #[test]
    fn http_401_aborts_the_whole_sequence() {
        let transport = ScriptedTransport::new(vec![reply(401, b"")]);
        let err = quiet_executor()
            .run(
                &candidates(&["a", "b", "c"]),
                &json!({"inputs": "prompt"}),
                None,
                &transport,
                &TextAcceptor::default(),
            )
            .err()
            .expect("401 must be terminal");

        assert!(matches!(err, FallbackError::Unauthorized));
        assert_eq!(transport.calls(), vec!["a"]);
    }

    #[test]
    fn model_loading_body_is_retried_on_the_same_candidate() {
        let transport = ScriptedTransport::new(vec![
            reply(200, br#"{"error": "Model is loading"}"#),
            reply(200, &accepted_text_body()),
        ]);
        let (model, _) = quiet_executor()
            .run(
                &candidates(&["a", "b"]),
                &json!({"inputs": "prompt"}),
                None,
                &transport,
                &TextAcceptor::default(),
            )
            .expect("retry on the same candidate should succeed");

        assert_eq!(model, "a");
        assert_eq!(transport.calls(), vec!["a", "a"]);
    }

    #[test]
    fn rejected_response_moves_on_without_local_retries() {
        let short =
            serde_json::to_vec(&json!([{"generated_text": "too short"}])).unwrap_or_default();
        let transport = ScriptedTransport::new(vec![
            reply(200, &short),
            reply(200, &accepted_text_body()),
        ]);
        let (model, _) = quiet_executor()
            .run(
                &candidates(&["a", "b"]),
                &json!({"inputs": "prompt"}),
                None,
                &transport,
                &TextAcceptor::default(),
            )
            .expect("second candidate should be accepted");

        assert_eq!(model, "b");
        assert_eq!(transport.calls(), vec!["a", "b"]);
    }

    #[test]
    fn exhaustion_reports_every_candidate_failure() {
        let transport = ScriptedTransport::new(vec![reply(500, b""), reply(404, b"")]);
        let err = quiet_executor()
            .run(
                &candidates(&["a", "b"]),
                &json!({"inputs": "prompt"}),
                None,
                &transport,
                &TextAcceptor::default(),
            )
            .err()
            .expect("no candidate should be accepted");

        let FallbackError::Exhausted(outcomes) = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].model, "a");
        assert_eq!(outcomes[0].status, AttemptStatus::PermanentFailure);
        assert_eq!(outcomes[0].detail, "HTTP 500");
        assert_eq!(outcomes[1].model, "b");
        assert_eq!(outcomes[1].detail, "HTTP 404");
    }

    #[test]
    fn transport_errors_retry_then_skip_to_next_candidate() {
        let transport = ScriptedTransport::new(vec![
            Err(anyhow::anyhow!("connection refused")),
            Err(anyhow::anyhow!("connection refused")),
            Err(anyhow::anyhow!("connection refused")),
            reply(200, &accepted_text_body()),
        ]);
        let (model, _) = quiet_executor()
            .run(
                &candidates(&["a", "b"]),
                &json!({"inputs": "prompt"}),
                None,
                &transport,
                &TextAcceptor::default(),
            )
            .expect("second candidate should be accepted");

        assert_eq!(model, "b");
        assert_eq!(transport.calls(), vec!["a", "a", "a", "b"]);
    }

    #[test]
    fn text_acceptor_enforces_the_length_threshold() {
        let acceptor = TextAcceptor::default();
        let exactly_twenty = "x".repeat(20);
        let over_twenty = "x".repeat(21);

        let rejected = TransportReply {
            status: 200,
            body: serde_json::to_vec(&json!([{"generated_text": exactly_twenty}]))
                .unwrap_or_default(),
        };
        assert!(acceptor.accept(&rejected).is_err());

        let accepted = TransportReply {
            status: 200,
            body: serde_json::to_vec(&json!([{"generated_text": over_twenty}]))
                .unwrap_or_default(),
        };
        assert_eq!(acceptor.accept(&accepted).ok(), Some("x".repeat(21)));
    }

    #[test]
    fn text_acceptor_rejects_malformed_payloads() {
        let acceptor = TextAcceptor::default();
        let not_json = TransportReply {
            status: 200,
            body: b"<html>".to_vec(),
        };
        assert!(acceptor.accept(&not_json).is_err());

        let not_a_list = TransportReply {
            status: 200,
            body: br#"{"generated_text": "long enough but wrong shape"}"#.to_vec(),
        };
        assert!(acceptor.accept(&not_a_list).is_err());

        let empty_list = TransportReply {
            status: 200,
            body: b"[]".to_vec(),
        };
        assert!(acceptor.accept(&empty_list).is_err());
    }

    #[test]
    fn image_acceptor_requires_decodable_bytes() {
        let decoded = ImageAcceptor
            .accept(&TransportReply {
                status: 200,
                body: png_bytes(),
            })
            .expect("png bytes should decode");
        assert_eq!((decoded.width, decoded.height), (4, 4));

        assert!(ImageAcceptor
            .accept(&TransportReply {
                status: 200,
                body: b"not an image".to_vec(),
            })
            .is_err());
    }

    #[test]
    fn greeting_turn_makes_no_network_or_source_calls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Rc::new(ScriptedTransport::new(Vec::new()));
        let reference = StubReference::with(None);
        let snippets = StubSnippets::with(Vec::new());

        let mut engine = test_engine(
            temp.path().join("out"),
            &transport,
            &reference,
            &snippets,
        );
        let mut session = SessionContext::open(temp.path().join("events.jsonl"))?;
        let answer = engine.respond(&mut session, "hello")?;

        assert!(lumo_contracts::chat::GREETING_RESPONSES.contains(&answer.as_str()));
        assert!(transport.calls().is_empty());
        assert!(reference.lookups.borrow().is_empty());
        assert!(snippets.searches.borrow().is_empty());
        assert_eq!(session.messages().len(), 2);
        Ok(())
    }

    #[test]
    fn essay_turn_fetches_one_reference_and_embeds_it_in_the_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Rc::new(ScriptedTransport::new(vec![reply(
            200,
            &accepted_text_body(),
        )]));
        let reference = StubReference::with(Some(everest_reference()));
        let snippets = StubSnippets::with(Vec::new());

        let mut engine = test_engine(
            temp.path().join("out"),
            &transport,
            &reference,
            &snippets,
        );
        let mut session = SessionContext::open(temp.path().join("events.jsonl"))?;
        let answer = engine.respond(&mut session, "write essay on Mount Everest")?;
        assert!(answer.contains("detailed answer"));

        assert_eq!(reference.lookups.borrow().as_slice(), ["mount everest"]);
        assert!(snippets.searches.borrow().is_empty());

        let sent = transport.payloads.borrow();
        let prompt = sent[0]["inputs"].as_str().unwrap_or_default();
        assert!(prompt.contains("Mount Everest is Earth's highest mountain above sea level."));
        assert!(prompt.contains("Source: https://en.wikipedia.org/wiki/Mount_Everest"));
        Ok(())
    }

    #[test]
    fn story_turn_uses_web_search_instead_of_the_encyclopedia() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Rc::new(ScriptedTransport::new(vec![reply(
            200,
            &accepted_text_body(),
        )]));
        let reference = StubReference::with(Some(everest_reference()));
        let snippets = StubSnippets::with(vec![SearchSnippet {
            title: "Dragons".to_string(),
            body: "Dragons appear across many mythologies.".to_string(),
            url: "https://example.com/dragons".to_string(),
        }]);

        let mut engine = test_engine(
            temp.path().join("out"),
            &transport,
            &reference,
            &snippets,
        );
        let mut session = SessionContext::open(temp.path().join("events.jsonl"))?;
        engine.respond(&mut session, "tell me a story about dragons")?;

        assert!(reference.lookups.borrow().is_empty());
        assert_eq!(
            snippets.searches.borrow().as_slice(),
            ["tell me a story about dragons"]
        );

        let sent = transport.payloads.borrow();
        let prompt = sent[0]["inputs"].as_str().unwrap_or_default();
        assert!(prompt.contains("Dragons appear across many mythologies."));
        Ok(())
    }

    #[test]
    fn exhausted_text_run_surfaces_the_generic_retry_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let failures: Vec<anyhow::Result<TransportReply>> =
            (0..4).map(|_| reply(500, b"")).collect();
        let transport = Rc::new(ScriptedTransport::new(failures));
        let reference = StubReference::with(None);
        let snippets = StubSnippets::with(Vec::new());

        let mut engine = test_engine(
            temp.path().join("out"),
            &transport,
            &reference,
            &snippets,
        );
        let mut session = SessionContext::open(temp.path().join("events.jsonl"))?;
        let err = engine
            .respond(&mut session, "how do glaciers form")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("try again"), "unexpected error: {err}");
        // The failure goes to the transcript, not into the message log.
        assert_eq!(session.messages().len(), 1);
        Ok(())
    }

    #[test]
    fn create_image_saves_the_accepted_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Rc::new(ScriptedTransport::new(vec![
            reply(503, b""),
            reply(503, b""),
            reply(503, b""),
            reply(200, &png_bytes()),
        ]));
        let reference = StubReference::with(None);
        let snippets = StubSnippets::with(Vec::new());

        let out_dir = temp.path().join("out");
        let mut engine = test_engine(out_dir.clone(), &transport, &reference, &snippets);
        let mut session = SessionContext::open(temp.path().join("events.jsonl"))?;
        let artifact = engine.create_image(&mut session, "a magical forest")?;

        assert_eq!(artifact.model, "CompVis/stable-diffusion-v1-4");
        assert_eq!((artifact.width, artifact.height), (4, 4));
        assert!(artifact.path.starts_with(&out_dir));
        let saved = std::fs::read(&artifact.path)?;
        assert!(image::load_from_memory(&saved).is_ok());
        Ok(())
    }

    #[test]
    fn blank_token_is_rejected_before_any_network_call() {
        let err = AssistantEngine::new("/tmp/out", "   ")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("missing API token"));
    }

    #[test]
    fn related_topics_flatten_one_level_of_nesting() {
        let related = json!([
            {"Text": "First result", "FirstURL": "https://example.com/1"},
            {"Name": "Category", "Topics": [
                {"Text": "Nested result", "FirstURL": "https://example.com/2"},
                {"Text": "", "FirstURL": "https://example.com/blank"},
            ]},
        ]);
        let snippets = flatten_related_topics(&related);
        let bodies: Vec<&str> = snippets
            .iter()
            .map(|snippet| snippet.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["First result", "Nested result"]);
    }
}
