use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use lens_contracts::error::AnalyzeError;
use lens_contracts::events::{EventPayload, EventWriter};
use lens_contracts::media::{
    declared_mime_mismatch, detect_media_type, DetectionSource, ImageUpload, MediaType,
};
use lens_contracts::models::{ModelSelection, ModelSelector, ModelSpec};
use lens_contracts::payload::encode_image_content;
use lens_contracts::session::{ConversationTurn, Role, Session};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const ERROR_TEXT_MAX_CHARS: usize = 600;

/// Everything the upstream model needs for one completion: the whole ordered
/// history, latest user turn last.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<&'a str>,
    pub turns: &'a [ConversationTurn],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub model: String,
    pub stop_reason: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply>;
}

#[derive(Default)]
pub struct ChatProviderRegistry {
    providers: BTreeMap<String, Box<dyn ChatProvider>>,
}

impl ChatProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ChatProvider + 'static>(&mut self, provider: P) {
        self.providers.insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ChatProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Answers without any network access; used for offline sessions.
pub struct DryrunProvider;

impl ChatProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply> {
        let Some(last) = request
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role() == Role::User)
        else {
            bail!("dryrun request has no user turn");
        };
        let image = last
            .image()
            .map(|image| format!("{} ({})", image.name, image.media_type))
            .unwrap_or_else(|| "no image".to_string());
        let text = format!(
            "[dryrun] {} message(s) in context. Latest question \"{}\" about {image}.",
            request.turns.len(),
            last.text()
        );
        Ok(ChatReply {
            text,
            model: request.model.to_string(),
            stop_reason: Some("end_turn".to_string()),
            input_tokens: None,
            output_tokens: None,
        })
    }
}

/// Anthropic Messages API over a blocking HTTP client.
pub struct AnthropicProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl AnthropicProvider {
    pub fn new(
        api_key: impl Into<String>,
        api_base: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self::with_http_client(api_key, api_base, http))
    }

    pub fn with_http_client(
        api_key: impl Into<String>,
        api_base: Option<&str>,
        http: HttpClient,
    ) -> Self {
        Self {
            api_base: normalize_api_base(api_base.unwrap_or(ANTHROPIC_API_BASE)),
            api_key: api_key.into(),
            http,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.api_base)
    }
}

impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply> {
        let payload = messages_payload(request)?;
        let endpoint = self.endpoint();
        debug!(
            endpoint = %endpoint,
            model = request.model,
            turns = request.turns.len(),
            "sending Anthropic messages request"
        );
        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .context("Anthropic request transport failed")?;
        let parsed = response_json_or_error("Anthropic", response)?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Anthropic response received"
        );
        reply_from_response(&parsed, request.model)
    }
}

/// Builds the `/v1/messages` body. User turns carry their `[text, image]`
/// blocks; assistant turns carry a single text block.
pub fn messages_payload(request: &ChatRequest<'_>) -> Result<Value> {
    let mut messages = Vec::with_capacity(request.turns.len());
    for turn in request.turns {
        let content = serde_json::to_value(turn.content_blocks())
            .context("failed to serialize message content")?;
        messages.push(json!({
            "role": turn.role().as_str(),
            "content": content,
        }));
    }

    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::String(request.model.to_string()));
    payload.insert("max_tokens".to_string(), json!(request.max_tokens));
    if let Some(temperature) = request.temperature {
        payload.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(system) = request.system.map(str::trim).filter(|value| !value.is_empty()) {
        payload.insert("system".to_string(), Value::String(system.to_string()));
    }
    payload.insert("messages".to_string(), Value::Array(messages));
    Ok(Value::Object(payload))
}

fn reply_from_response(response: &Value, requested_model: &str) -> Result<ChatReply> {
    let text = response
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        bail!("Anthropic response contained no text content");
    }
    let usage = response.get("usage");
    Ok(ChatReply {
        text: text.trim().to_string(),
        model: response
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string(),
        stop_reason: response
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        input_tokens: usage
            .and_then(|value| value.get("input_tokens"))
            .and_then(Value::as_u64),
        output_tokens: usage
            .and_then(|value| value.get("output_tokens"))
            .and_then(Value::as_u64),
    })
}

fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let base = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    if base.is_empty() {
        return ANTHROPIC_API_BASE.to_string();
    }
    base.to_string()
}

/// Builds the registry for a session: `dryrun` always, `anthropic` when a
/// key is available.
pub fn default_provider_registry(
    anthropic_api_key: Option<&str>,
    anthropic_api_base: Option<&str>,
    timeout: Duration,
) -> Result<ChatProviderRegistry> {
    let mut registry = ChatProviderRegistry::new();
    registry.register(DryrunProvider);
    if let Some(api_key) = anthropic_api_key.map(str::trim).filter(|value| !value.is_empty()) {
        registry.register(AnthropicProvider::new(api_key, anthropic_api_base, timeout)?);
    }
    Ok(registry)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: Some(0.7),
            system_prompt: None,
        }
    }
}

/// Where the most recent `analyze` call got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Validating,
    Encoding,
    AppendedUser,
    AwaitingModel,
    AppendedAssistant,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageActivation {
    pub name: String,
    pub media_type: MediaType,
    pub source: DetectionSource,
    pub history_reset: bool,
    pub declared_mismatch: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub reply: ChatReply,
    pub history_len: usize,
}

/// Owns the session and runs one chat action at a time.
pub struct ChatEngine {
    session: Session,
    providers: ChatProviderRegistry,
    selector: ModelSelector,
    model: ModelSpec,
    settings: ChatSettings,
    events: EventWriter,
    last_turn_state: TurnState,
}

impl ChatEngine {
    pub fn new(
        providers: ChatProviderRegistry,
        selector: ModelSelector,
        requested_model: Option<&str>,
        settings: ChatSettings,
        events_path: Option<&Path>,
    ) -> Result<Self> {
        let session = Session::new();
        let events = match events_path {
            Some(path) => EventWriter::new(path, session.session_id()),
            None => EventWriter::disabled(session.session_id()),
        };
        let selection = select_model(&selector, &providers, requested_model)?;
        let engine = Self {
            session,
            providers,
            selector,
            model: selection.model.clone(),
            settings,
            events,
            last_turn_state: TurnState::Idle,
        };

        let mut payload = EventPayload::new();
        payload.insert("providers".to_string(), json!(engine.providers.names()));
        engine.events.emit("session_started", payload)?;
        engine.emit_model_selected(&selection)?;
        Ok(engine)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn last_turn_state(&self) -> TurnState {
        self.last_turn_state
    }

    /// Switches models for later turns; history is kept.
    pub fn set_model(&mut self, requested: &str) -> Result<ModelSelection> {
        let selection = select_model(&self.selector, &self.providers, Some(requested))?;
        self.model = selection.model.clone();
        self.emit_model_selected(&selection)?;
        Ok(selection)
    }

    /// Detects the real format of an upload and makes it the active image.
    /// A different image name clears the history; a rejected upload leaves
    /// the session as it was.
    pub fn upload_image(&mut self, upload: ImageUpload) -> Result<ImageActivation, AnalyzeError> {
        let detection = match detect_media_type(&upload.bytes, Some(&upload.name)) {
            Ok(detection) => detection,
            Err(err) => {
                let mut payload = EventPayload::new();
                payload.insert("name".to_string(), Value::String(upload.name.clone()));
                self.record_failure("image_rejected", &err, payload);
                warn!(name = %upload.name, error = %err, "image rejected");
                return Err(err);
            }
        };
        let declared_mismatch =
            declared_mime_mismatch(upload.declared_mime.as_deref(), detection.media_type);
        if let Some(message) = declared_mismatch.as_deref() {
            warn!(name = %upload.name, "{message}");
        }

        let digest = hex::encode(Sha256::digest(&upload.bytes));
        let byte_len = upload.bytes.len();
        let history_reset =
            self.session
                .set_active_image(upload.name.clone(), upload.bytes, detection.media_type);
        info!(
            name = %upload.name,
            media_type = %detection.media_type,
            history_reset,
            "active image set"
        );

        let mut payload = EventPayload::new();
        payload.insert("name".to_string(), Value::String(upload.name.clone()));
        payload.insert(
            "media_type".to_string(),
            Value::String(detection.media_type.as_mime().to_string()),
        );
        payload.insert(
            "detection_source".to_string(),
            Value::String(detection.source.as_str().to_string()),
        );
        payload.insert("bytes".to_string(), json!(byte_len));
        payload.insert("sha256".to_string(), Value::String(digest));
        payload.insert("history_reset".to_string(), Value::Bool(history_reset));
        self.record("image_activated", payload);

        Ok(ImageActivation {
            name: upload.name,
            media_type: detection.media_type,
            source: detection.source,
            history_reset,
            declared_mismatch,
        })
    }

    /// Explicit reset action: clears the history, keeps the active image.
    pub fn reset(&mut self) {
        let cleared = self.session.len();
        self.session.reset();
        self.last_turn_state = TurnState::Idle;
        let mut payload = EventPayload::new();
        payload.insert("cleared_turns".to_string(), json!(cleared));
        self.record("session_reset", payload);
    }

    /// Runs one question against the active image.
    ///
    /// Validation and encoding failures leave the session untouched. Once the
    /// user turn is appended it stays, even if the upstream call fails.
    pub fn analyze(&mut self, question: &str) -> Result<TurnOutcome, AnalyzeError> {
        self.last_turn_state = TurnState::Validating;
        if let Err(err) = self.validate(question) {
            return Err(self.fail(err));
        }

        self.last_turn_state = TurnState::Encoding;
        let turn = match self.encode_user_turn(question) {
            Ok(turn) => turn,
            Err(err) => return Err(self.fail(err)),
        };

        self.session.append_turn(turn);
        self.last_turn_state = TurnState::AppendedUser;
        self.record_turn_appended(Role::User);

        self.last_turn_state = TurnState::AwaitingModel;
        let provider_name = self.model.provider.clone();
        let result = match self.providers.get(&provider_name) {
            Some(provider) => provider.complete(&ChatRequest {
                model: &self.model.name,
                max_tokens: self.max_tokens(),
                temperature: self.settings.temperature,
                system: self.settings.system_prompt.as_deref(),
                turns: self.session.turns(),
            }),
            None => Err(anyhow!("provider '{provider_name}' is not registered")),
        };

        match result {
            Ok(reply) => {
                debug!(
                    model = %reply.model,
                    stop_reason = reply.stop_reason.as_deref().unwrap_or("unknown"),
                    input_tokens = reply.input_tokens,
                    output_tokens = reply.output_tokens,
                    "model replied"
                );
                self.session
                    .append_turn(ConversationTurn::assistant(reply.text.clone()));
                self.last_turn_state = TurnState::AppendedAssistant;
                self.record_reply_appended(&reply);
                Ok(TurnOutcome {
                    reply,
                    history_len: self.session.len(),
                })
            }
            Err(err) => Err(self.fail(AnalyzeError::UpstreamFailure {
                provider: provider_name,
                message: error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
            })),
        }
    }

    /// Configured output budget, capped by what the model can produce.
    fn max_tokens(&self) -> u32 {
        match self.model.max_output_tokens {
            Some(cap) => self.settings.max_tokens.min(cap),
            None => self.settings.max_tokens,
        }
    }

    fn validate(&self, question: &str) -> Result<(), AnalyzeError> {
        if self.session.active_image().is_none() {
            return Err(AnalyzeError::MissingImage);
        }
        if question.trim().is_empty() {
            return Err(AnalyzeError::EmptyQuestion);
        }
        Ok(())
    }

    fn encode_user_turn(&self, question: &str) -> Result<ConversationTurn, AnalyzeError> {
        let active = self
            .session
            .active_image()
            .ok_or(AnalyzeError::MissingImage)?;
        let blocks = encode_image_content(active.bytes(), Some(active.name()), question)?;
        Ok(ConversationTurn::user(
            question.trim(),
            active.image_ref(),
            blocks,
        ))
    }

    fn fail(&mut self, err: AnalyzeError) -> AnalyzeError {
        self.last_turn_state = TurnState::Failed;
        warn!(kind = err.kind(), error = %err, "chat turn failed");
        let mut payload = EventPayload::new();
        payload.insert("history_len".to_string(), json!(self.session.len()));
        self.record_failure("turn_failed", &err, payload);
        err
    }

    fn turn_payload(&self, role: Role) -> EventPayload {
        let mut payload = EventPayload::new();
        payload.insert("role".to_string(), Value::String(role.as_str().to_string()));
        payload.insert("index".to_string(), json!(self.session.len().saturating_sub(1)));
        payload.insert("model".to_string(), Value::String(self.model.name.clone()));
        payload
    }

    fn record_turn_appended(&self, role: Role) {
        self.record("turn_appended", self.turn_payload(role));
    }

    fn record_reply_appended(&self, reply: &ChatReply) {
        let mut payload = self.turn_payload(Role::Assistant);
        payload.insert("reply_model".to_string(), Value::String(reply.model.clone()));
        payload.insert("stop_reason".to_string(), json!(reply.stop_reason));
        payload.insert("input_tokens".to_string(), json!(reply.input_tokens));
        payload.insert("output_tokens".to_string(), json!(reply.output_tokens));
        self.record("turn_appended", payload);
    }

    fn emit_model_selected(&self, selection: &ModelSelection) -> Result<()> {
        if let Some(reason) = &selection.fallback_reason {
            info!(model = %selection.model.name, "{reason}");
        }
        let mut payload = EventPayload::new();
        payload.insert(
            "model".to_string(),
            Value::String(selection.model.name.clone()),
        );
        payload.insert(
            "provider".to_string(),
            Value::String(selection.model.provider.clone()),
        );
        payload.insert("requested".to_string(), json!(selection.requested));
        payload.insert(
            "fallback_reason".to_string(),
            json!(selection.fallback_reason.as_ref().map(ToString::to_string)),
        );
        self.events.emit("model_selected", payload)?;
        Ok(())
    }

    // Event-log write failures never fail the chat action.
    fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event_type, error = %err, "failed to write event");
        }
    }

    fn record_failure(&self, event_type: &str, err: &AnalyzeError, payload: EventPayload) {
        if let Err(write_err) = self.events.emit_failure(event_type, err, payload) {
            warn!(event_type, error = %write_err, "failed to write event");
        }
    }
}

fn select_model(
    selector: &ModelSelector,
    providers: &ChatProviderRegistry,
    requested: Option<&str>,
) -> Result<ModelSelection> {
    let selection = selector.select_vision(requested).map_err(|err| anyhow!(err))?;
    if providers.get(&selection.model.provider).is_none() {
        bail!(
            "model '{}' needs provider '{}', which is not configured",
            selection.model.name,
            selection.model.provider
        );
    }
    Ok(selection)
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
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
