//! The execution context: process-local mutable state for one workflow run,
//! and the Unified API expressions are evaluated against.
//!
//! Each mutable map is guarded by its own `parking_lot::RwLock` so a read on
//! `outputs` never blocks a write to `items` — each logical operation
//! acquires the minimum lock it needs.

use crate::error::{EngineError, Result};
use crate::mime::SelectorChain;
use crate::request::{RequestSnapshot, UploadedFile};
use crate::store::{MemoryStore, SessionStore};
use crate::workflow::Resource;
use glob::glob;
use parking_lot::RwLock;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tooling::error::ErrorContext;

/// Prefix marking a session id as engine-generated rather than caller- or
/// workflow-supplied; such ids surface as empty to callers.
pub const AUTO_SESSION_PREFIX: &str = "auto_";

/// Model/backend captured from the last LLM invocation, merged into
/// API-response meta.
#[derive(Clone, Debug, Default)]
pub struct LlmMetadata {
    pub model: String,
    pub backend: String,
}

/// The well-known iteration keys the engine owns.
pub const ITEM_KEYS: &[&str] = &[
    "item", "current", "index", "count", "prev", "next", "items", "all",
];

pub struct ExecutionContext {
    resources: RwLock<HashMap<String, Resource>>,
    outputs: RwLock<HashMap<String, Value>>,
    items: RwLock<HashMap<String, Value>>,
    item_histories: RwLock<HashMap<String, Vec<Value>>>,
    iterating: RwLock<bool>,

    memory: Arc<dyn MemoryStore>,
    session_store: Arc<dyn SessionStore>,
    session_id: String,
    session_id_is_auto: bool,

    request: Option<RequestSnapshot>,
    input_transcript: RwLock<Option<String>>,
    input_media: RwLock<Option<Value>>,
    tts_output: RwLock<Option<Value>>,

    allowed_headers: RwLock<Vec<String>>,
    allowed_params: RwLock<Vec<String>>,

    llm_metadata: RwLock<Option<LlmMetadata>>,

    fs_root: PathBuf,
    pub debug: bool,
}

impl ExecutionContext {
    pub fn new(
        request: Option<RequestSnapshot>,
        explicit_session_id: Option<String>,
        memory: Arc<dyn MemoryStore>,
        session_store: Arc<dyn SessionStore>,
        fs_root: PathBuf,
        debug: bool,
    ) -> Self {
        let (session_id, is_auto) = resolve_session_id(request.as_ref(), explicit_session_id);
        Self {
            resources: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
            item_histories: RwLock::new(HashMap::new()),
            iterating: RwLock::new(false),
            memory,
            session_store,
            session_id,
            session_id_is_auto: is_auto,
            request,
            input_transcript: RwLock::new(None),
            input_media: RwLock::new(None),
            tts_output: RwLock::new(None),
            allowed_headers: RwLock::new(Vec::new()),
            allowed_params: RwLock::new(Vec::new()),
            llm_metadata: RwLock::new(None),
            fs_root,
            debug,
        }
    }

    /// The resolved session id, or empty if it was auto-generated.
    pub fn session_id(&self) -> &str {
        if self.session_id_is_auto {
            ""
        } else {
            &self.session_id
        }
    }

    /// The raw session id used to key the session store, even when
    /// auto-generated (callers wiring a cookie need this one).
    pub fn internal_session_id(&self) -> &str {
        &self.session_id
    }

    pub fn request(&self) -> Option<&RequestSnapshot> {
        self.request.as_ref()
    }

    pub fn load_resources(&self, resources: &[Resource]) {
        let mut table = self.resources.write();
        for r in resources {
            table.insert(r.action_id.clone(), r.clone());
        }
    }

    pub fn resource(&self, action_id: &str) -> Option<Resource> {
        self.resources.read().get(action_id).cloned()
    }

    // --- filters ---

    pub fn set_allowed_headers(&self, headers: Option<Vec<String>>) {
        *self.allowed_headers.write() = headers.unwrap_or_default();
    }

    pub fn set_allowed_params(&self, params: Option<Vec<String>>) {
        *self.allowed_params.write() = params.unwrap_or_default();
    }

    fn check_allowed_param(&self, name: &str) -> Result<()> {
        let allowed = self.allowed_params.read();
        if !allowed.is_empty() && !allowed.iter().any(|a| a == name) {
            return Err(EngineError::FilterDenied {
                domain: "param",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_allowed_header(&self, name: &str) -> Result<()> {
        let allowed = self.allowed_headers.read();
        if !allowed.is_empty() && !allowed.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            return Err(EngineError::FilterDenied {
                domain: "header",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // --- outputs ---

    pub fn set_output(&self, action_id: &str, value: Value) {
        self.outputs.write().insert(action_id.to_string(), value);
    }

    pub async fn output(&self, action_id: &str) -> Result<Value> {
        self.outputs
            .read()
            .get(action_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("output '{action_id}'")))
    }

    /// Non-erroring, lock-only read used by the synchronous accessor
    /// closures the engine builds for the evaluation environment.
    pub fn output_sync(&self, action_id: &str) -> Option<Value> {
        self.outputs.read().get(action_id).cloned()
    }

    // --- iteration ---

    pub fn is_iterating(&self) -> bool {
        *self.iterating.read()
    }

    pub fn set_iterating(&self, value: bool) {
        *self.iterating.write() = value;
    }

    pub fn begin_item_history(&self, action_id: &str, values: Vec<Value>) {
        self.item_histories.write().insert(action_id.to_string(), values);
    }

    pub fn item_values(&self, action_id: &str) -> Vec<Value> {
        self.item_histories
            .read()
            .get(action_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes the iteration-scoped keys for the k-th (0-indexed) element of
    /// `values` before that iteration's body executes.
    pub fn write_iteration_step(&self, index: usize, values: &[Value]) {
        let mut items = self.items.write();
        let count = values.len();
        items.insert("item".to_string(), values[index].clone());
        items.insert("current".to_string(), values[index].clone());
        items.insert("index".to_string(), json!(index));
        items.insert("count".to_string(), json!(count));
        items.insert("items".to_string(), Value::Array(values.to_vec()));
        items.insert("all".to_string(), Value::Array(values.to_vec()));
        if index > 0 {
            items.insert("prev".to_string(), values[index - 1].clone());
        } else {
            items.remove("prev");
        }
        if index + 1 < count {
            items.insert("next".to_string(), values[index + 1].clone());
        } else {
            items.remove("next");
        }
    }

    /// Removes the transient iteration keys after the fan-out loop
    /// completes; per-action histories are left in place.
    pub fn clear_iteration_keys(&self) {
        let mut items = self.items.write();
        for key in ITEM_KEYS {
            items.remove(*key);
        }
    }

    pub fn items_snapshot(&self) -> HashMap<String, Value> {
        self.items.read().clone()
    }

    // --- input-processor artifacts ---

    pub fn set_input_transcript(&self, transcript: String) {
        *self.input_transcript.write() = Some(transcript);
    }

    pub fn set_input_media(&self, media: Value) {
        *self.input_media.write() = Some(media);
    }

    pub fn set_tts_output(&self, output: Value) {
        *self.tts_output.write() = Some(output);
    }

    pub fn input_transcript(&self) -> Option<String> {
        self.input_transcript.read().clone()
    }

    pub fn input_media(&self) -> Option<Value> {
        self.input_media.read().clone()
    }

    pub fn tts_output(&self) -> Option<Value> {
        self.tts_output.read().clone()
    }

    // --- LLM metadata ---

    pub fn set_llm_metadata(&self, model: impl Into<String>, backend: impl Into<String>) {
        *self.llm_metadata.write() = Some(LlmMetadata {
            model: model.into(),
            backend: backend.into(),
        });
    }

    pub fn llm_metadata(&self) -> Option<LlmMetadata> {
        self.llm_metadata.read().clone()
    }

    // --- unified API: set ---

    pub async fn set(&self, key: &str, value: Value, scope: Option<&str>) -> Result<()> {
        match scope.unwrap_or("memory") {
            "memory" => {
                self.memory.set(key, value).await;
                Ok(())
            }
            "session" => {
                self.session_store.set(&self.session_id, key, value).await;
                Ok(())
            }
            "items" | "item" => {
                self.items.write().insert(key.to_string(), value);
                Ok(())
            }
            other => Err(EngineError::UnknownScope(other.to_string())),
        }
    }

    pub async fn session(&self) -> Result<Value> {
        let snapshot = self.session_store.snapshot(&self.session_id).await;
        Ok(Value::Object(snapshot.into_iter().collect()))
    }

    pub fn env(&self, name: &str) -> Value {
        std::env::var(name).map(Value::String).unwrap_or(Value::Null)
    }

    // --- unified API: info ---

    pub fn info(&self, field: &str) -> Result<Value> {
        match field {
            "sessionId" => Ok(Value::String(self.session_id().to_string())),
            "debug" => Ok(Value::Bool(self.debug)),
            "method" => self.require_request().map(|r| json!(r.method)),
            "path" => self.require_request().map(|r| json!(r.path)),
            "ip" => self.require_request().map(|r| json!(r.ip)),
            "requestId" => self.require_request().map(|r| json!(r.id)),
            other => Err(EngineError::NotFound(format!("info field '{other}'"))),
        }
    }

    fn require_request(&self) -> Result<&RequestSnapshot> {
        self.request
            .as_ref()
            .ok_or_else(|| EngineError::NotFound("no request attached to this run".to_string()))
    }

    // --- unified API: item ---

    pub fn item(&self, type_hint: Option<&str>) -> Result<Value> {
        let key = type_hint.unwrap_or("item");
        self.items
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("item field '{key}'")))
    }

    // --- unified API: input (request-centric chain only) ---

    pub fn input(&self, name: &str, type_hint: Option<&str>) -> Result<Value> {
        let request = self.require_request()?;
        match type_hint {
            Some("param") => {
                self.check_allowed_param(name)?;
                request
                    .query_param(name)
                    .map(|v| Value::String(v.to_string()))
                    .ok_or_else(|| EngineError::NotFound(format!("query param '{name}'")))
            }
            Some("body") => {
                self.check_allowed_param(name)?;
                body_field(&request.body, name)
                    .ok_or_else(|| EngineError::NotFound(format!("body field '{name}'")))
            }
            Some("header") => {
                self.check_allowed_header(name)?;
                request
                    .header(name)
                    .map(|v| Value::String(v.to_string()))
                    .ok_or_else(|| EngineError::NotFound(format!("header '{name}'")))
            }
            _ => self.request_chain(name),
        }
    }

    fn request_chain(&self, name: &str) -> Result<Value> {
        let request = self.require_request()?;

        self.check_allowed_param(name)?;
        if let Some(v) = request.query_param(name) {
            return Ok(Value::String(v.to_string()));
        }
        if let Some(v) = body_field(&request.body, name) {
            return Ok(v);
        }

        self.check_allowed_header(name)?;
        if let Some(v) = request.header(name) {
            return Ok(Value::String(v.to_string()));
        }

        if let Some(file) = find_uploaded_file(request, name) {
            return Ok(uploaded_file_to_value(file));
        }

        Err(EngineError::NotFound(format!(
            "'{name}' not found in query params, body, headers or uploaded files"
        )))
    }

    // --- unified API: get (auto-detection chain) ---

    pub async fn get(&self, name: &str, type_hint: Option<&str>) -> Result<Value> {
        match type_hint {
            Some("item") => self.item(Some(name)),
            Some("memory") => self
                .memory
                .get(name)
                .await
                .ok_or_else(|| EngineError::NotFound(format!("memory key '{name}'"))),
            Some("session") => self
                .session_store
                .get(&self.session_id, name)
                .await
                .ok_or_else(|| EngineError::NotFound(format!("session key '{name}'"))),
            Some("output") => self.output(name).await,
            Some("param") | Some("body") | Some("header") => self.input(name, type_hint),
            Some("file") => self.get_file_by_name(name).await,
            _ => self.get_auto(name).await,
        }
    }

    async fn get_auto(&self, name: &str) -> Result<Value> {
        if let Some(v) = self.items.read().get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.memory.get(name).await {
            return Ok(v);
        }
        if let Some(v) = self.session_store.get(&self.session_id, name).await {
            return Ok(v);
        }
        if let Some(v) = self.outputs.read().get(name) {
            return Ok(v.clone());
        }
        match name {
            "inputTranscript" => {
                if let Some(v) = self.input_transcript() {
                    return Ok(Value::String(v));
                }
            }
            "inputMedia" => {
                if let Some(v) = self.input_media() {
                    return Ok(v);
                }
            }
            "ttsOutput" => {
                if let Some(v) = self.tts_output() {
                    return Ok(v);
                }
            }
            _ => {}
        }

        if self.request.is_some() {
            if let Ok(v) = self.request_chain(name) {
                return Ok(v);
            }
            // request_chain already raised FilterDenied for a denied param;
            // re-check explicitly so the chain short-circuits instead of
            // falling through to the metadata/file stages.
            self.check_allowed_param(name)?;
        }

        if let Ok(v) = self.info(name) {
            return Ok(v);
        }

        if let Ok(v) = self.get_file_by_name(name).await {
            return Ok(v);
        }

        self.file(name, &[]).map_err(|_| {
            EngineError::NotFound(format!(
                "'{name}' not found in items, memory, session, outputs, request, or files"
            ))
        })
    }

    async fn get_file_by_name(&self, name: &str) -> Result<Value> {
        if let Some(request) = &self.request {
            let shortcut = match name {
                "file" | "file[]" | "files" => request.files.first(),
                _ if name.starts_with("file[") && name.ends_with(']') => {
                    let idx: usize = name[5..name.len() - 1].parse().unwrap_or(usize::MAX);
                    request.files.get(idx)
                }
                _ => find_uploaded_file(request, name),
            };
            if let Some(file) = shortcut {
                return Ok(uploaded_file_to_value(file));
            }
        }
        self.file(name, &[])
    }

    // --- unified API: file ---

    pub fn file(&self, pattern: &str, selectors: &[String]) -> Result<Value> {
        if !pattern.contains('*') {
            let path = self.fs_root.join(pattern);
            if path.is_dir() {
                let mut entries: Vec<String> = std::fs::read_dir(&path)
                    .context(format!("failed to read directory '{pattern}'"))
                    .map_err(|e| EngineError::Other(e.to_string()))?
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_file())
                    .map(|entry| entry.path().to_string_lossy().to_string())
                    .collect();
                entries.sort();
                return Ok(Value::Array(entries.into_iter().map(Value::String).collect()));
            }
            let content = std::fs::read_to_string(&path)
                .context(format!("failed to read file '{pattern}'"))
                .map_err(|e| EngineError::NotFound(e.to_string()))?;
            return Ok(Value::String(content));
        }

        let full_pattern = self.fs_root.join(pattern);
        let mut matches: Vec<String> = glob(&full_pattern.to_string_lossy())
            .map_err(|e| EngineError::Other(format!("invalid glob pattern: {e}")))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        matches.sort();

        let chain = SelectorChain::parse(selectors);
        match chain.apply(matches) {
            crate::mime::SelectorResult::One(path) => Ok(Value::String(path)),
            crate::mime::SelectorResult::Many(paths) => {
                Ok(Value::Array(paths.into_iter().map(Value::String).collect()))
            }
            crate::mime::SelectorResult::Count(n) => Ok(json!(n)),
            crate::mime::SelectorResult::Empty => {
                Err(EngineError::NotFound(format!("no file matched pattern '{pattern}'")))
            }
        }
    }
}

fn resolve_session_id(
    request: Option<&RequestSnapshot>,
    explicit: Option<String>,
) -> (String, bool) {
    if let Some(request) = request {
        if let Some(id) = request.header("X-Session-ID") {
            if !id.is_empty() {
                return (id.to_string(), false);
            }
        }
        if let Some(id) = request.query_param("session_id") {
            if !id.is_empty() {
                return (id.to_string(), false);
            }
        }
    }
    if let Some(id) = explicit {
        if !id.is_empty() {
            return (id, false);
        }
    }
    (generate_auto_session_id(), true)
}

fn generate_auto_session_id() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{AUTO_SESSION_PREFIX}{suffix:016x}")
}

fn body_field(body: &Value, name: &str) -> Option<Value> {
    body.as_object().and_then(|m| m.get(name)).cloned()
}

fn find_uploaded_file<'a>(request: &'a RequestSnapshot, name: &str) -> Option<&'a UploadedFile> {
    request.files.iter().find(|f| f.name == name)
}

fn uploaded_file_to_value(file: &UploadedFile) -> Value {
    json!({
        "name": file.name,
        "path": file.path,
        "mime": file.mime,
        "size": file.size,
    })
}
