//! Mock implementations for engine tests
//!
//! These mocks stand in for the three consumed REST interfaces and record
//! every call, so tests can assert not just on outcomes but on what did
//! (and did not) go over the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use super::{ChatEngine, ChatState, EngineHandle, EngineView};
use crate::error::ApiError;
use crate::log::{Interaction, InteractionStore, NewInteraction};
use crate::stream::{ByteStream, CompletionClient, CompletionRequest};
use crate::tools::{ToolBackend, ToolDescriptor, ToolOutcome};

// ============================================================================
// In-memory interaction store
// ============================================================================

/// Log store over a `Vec`, with deterministic ids and timestamps.
pub struct InMemoryStore {
    records: Mutex<Vec<Interaction>>,
    next_id: Mutex<i64>,
    fail_next_create: Mutex<bool>,
    pub list_calls: AtomicUsize,
    pub delete_calls: Mutex<Vec<Vec<i64>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::seeded(Vec::new())
    }

    pub fn seeded(records: Vec<Interaction>) -> Self {
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        Self {
            records: Mutex::new(records),
            next_id: Mutex::new(next_id),
            fail_next_create: Mutex::new(false),
            list_calls: AtomicUsize::new(0),
            delete_calls: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `create` call fail with a server error.
    pub fn fail_next_create(&self) {
        *self.fail_next_create.lock().unwrap() = true;
    }

    pub fn records(&self) -> Vec<Interaction> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl InteractionStore for InMemoryStore {
    async fn list(&self) -> Result<Vec<Interaction>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records())
    }

    async fn create(&self, draft: &NewInteraction) -> Result<Interaction, ApiError> {
        if std::mem::take(&mut *self.fail_next_create.lock().unwrap()) {
            return Err(ApiError::server_error("injected create failure"));
        }
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        let stored = Interaction {
            id,
            kind: draft.kind,
            content: draft.content.clone(),
            metadata: draft.metadata.clone(),
            is_read: false,
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        };
        self.records.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn bulk_delete(&self, ids: &[i64]) -> Result<u64, ApiError> {
        self.delete_calls.lock().unwrap().push(ids.to_vec());
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| !ids.contains(&r.id));
        Ok((before - records.len()) as u64)
    }

    async fn delete_all(&self) -> Result<u64, ApiError> {
        let mut records = self.records.lock().unwrap();
        let deleted = records.len() as u64;
        records.clear();
        Ok(deleted)
    }

    async fn mark_all_read(&self) -> Result<(), ApiError> {
        for record in self.records.lock().unwrap().iter_mut() {
            record.is_read = true;
        }
        Ok(())
    }
}

// ============================================================================
// Scripted completion streams
// ============================================================================

enum ScriptEnd {
    /// End of body after the chunks: a normal completion.
    Complete,
    /// Never produce anything after the chunks (until cancelled).
    Hang,
    /// Fail the read after the chunks.
    Fail(ApiError),
}

/// One scripted response body.
pub struct Script {
    chunks: Vec<Vec<u8>>,
    end: ScriptEnd,
}

impl Script {
    pub fn text(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            end: ScriptEnd::Complete,
        }
    }

    pub fn raw(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            end: ScriptEnd::Complete,
        }
    }

    pub fn hang_after(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            end: ScriptEnd::Hang,
        }
    }

    pub fn fail_after(chunks: &[&str], error: ApiError) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            end: ScriptEnd::Fail(error),
        }
    }
}

/// Completion client that plays back queued scripts and records requests.
pub struct ScriptedCompletions {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletions {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletions {
    async fn open(&self, request: &CompletionRequest) -> Result<ByteStream, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script {
                chunks: Vec::new(),
                end: ScriptEnd::Complete,
            });

        let head = futures::stream::iter(script.chunks.into_iter().map(Ok));
        let body: ByteStream = match script.end {
            ScriptEnd::Complete => Box::pin(head),
            ScriptEnd::Hang => Box::pin(head.chain(futures::stream::pending())),
            ScriptEnd::Fail(err) => {
                Box::pin(head.chain(futures::stream::iter(vec![Err(err)])))
            }
        };
        Ok(body)
    }
}

// ============================================================================
// Counting tool backend
// ============================================================================

/// Tool backend with a fixed registry that counts execution requests.
pub struct CountingToolBackend {
    descriptors: Vec<ToolDescriptor>,
    next_outcome: Mutex<Option<ToolOutcome>>,
    pub executions: Mutex<Vec<(String, Map<String, Value>)>>,
    pub list_calls: AtomicUsize,
}

impl CountingToolBackend {
    pub fn new() -> Self {
        Self {
            descriptors: vec![
                crate::tools::fixtures::create_goal(),
                crate::tools::fixtures::add_expense(),
                crate::tools::fixtures::complete_habit(),
            ],
            next_outcome: Mutex::new(None),
            executions: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Queue the outcome of the next execution.
    pub fn set_outcome(&self, outcome: ToolOutcome) {
        *self.next_outcome.lock().unwrap() = Some(outcome);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolBackend for CountingToolBackend {
    async fn list(&self) -> Result<Vec<ToolDescriptor>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.descriptors.clone())
    }

    async fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolOutcome, ApiError> {
        self.executions
            .lock()
            .unwrap()
            .push((name.to_string(), params.clone()));
        Ok(self
            .next_outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(ToolOutcome {
                ok: true,
                tool: name.to_string(),
                result: Some(json!({ "id": 1 })),
                error: None,
            }))
    }
}

// ============================================================================
// Test engine builder
// ============================================================================

pub struct TestEngine {
    pub handle: EngineHandle,
    pub view: watch::Receiver<EngineView>,
    pub store: Arc<InMemoryStore>,
    pub completions: Arc<ScriptedCompletions>,
    pub tools: Arc<CountingToolBackend>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }

    pub fn with_store(store: InMemoryStore) -> Self {
        let store = Arc::new(store);
        let completions = Arc::new(ScriptedCompletions::new());
        let tools = Arc::new(CountingToolBackend::new());
        let handle = ChatEngine::spawn(store.clone(), completions.clone(), tools.clone());
        let view = handle.subscribe();
        Self {
            handle,
            view,
            store,
            completions,
            tools,
        }
    }

    pub async fn wait_idle(&mut self) -> bool {
        self.wait_until(|v| v.state == ChatState::Idle).await
    }

    pub async fn wait_until(&mut self, predicate: impl Fn(&EngineView) -> bool) -> bool {
        wait_for_view(&mut self.view, Duration::from_secs(2), predicate).await
    }
}

/// Poll a view watch until the predicate holds or the timeout elapses.
pub async fn wait_for_view(
    view: &mut watch::Receiver<EngineView>,
    timeout: Duration,
    predicate: impl Fn(&EngineView) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate(&view.borrow_and_update()) {
            return true;
        }
        let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            return false;
        };
        match tokio::time::timeout(remaining, view.changed()).await {
            Ok(Ok(())) => {}
            _ => return predicate(&view.borrow()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
