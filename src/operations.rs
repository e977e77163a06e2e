#![allow(clippy::module_name_repetitions)]
//! Operation tracking and progress reporting for long-running provisioning calls.
//!
//! Every tracked call gets a fresh `OperationId` when it starts. The id is listed in
//! the active set while the call runs and is retired on every exit path: success,
//! error, panic unwinding or the future being dropped mid-flight. Progress events
//! are fanned out on a broadcast channel, each attributed to the id that produced it.
//!
//! There is no global lock across operations. The active map is only touched by
//! short synchronous critical sections, never across an await.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::{KapsuleError, Result};
use crate::util::id::{decode_base36, encode_base36};

/// Object path prefix under which operations are addressable by clients.
pub const OPERATIONS_PATH: &str = "/org/kde/kapsule/operations";

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    pub fn token(&self) -> String {
        encode_base36(self.0)
    }

    pub fn path(&self) -> String {
        format!("{}/{}", OPERATIONS_PATH, self.token())
    }

    /// Parse either a bare token or a full operation path.
    pub fn parse(s: &str) -> Option<Self> {
        let token = s
            .strip_prefix(OPERATIONS_PATH)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(s);
        decode_base36(token).map(OperationId)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Finished,
    Failed,
}

/// Message levels, numbered as clients expect them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageLevel {
    Info = 0,
    Success = 1,
    Warning = 2,
    Error = 3,
    Dim = 4,
    Hint = 5,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Started {
        kind: String,
        description: String,
        target: String,
    },
    Stage(String),
    Message {
        level: MessageLevel,
        text: String,
        indent: u8,
    },
    Completed {
        state: OperationState,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationEvent {
    pub operation: OperationId,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub id: OperationId,
    pub kind: String,
    pub description: String,
    pub target: String,
    pub state: OperationState,
    pub started: SystemTime,
}

/// Handle a tracked call uses to emit progress attributed to its operation.
///
/// A detached reporter (no operation) silently discards everything; it is used for
/// internal runs such as auto-creating the default container on enter.
#[derive(Clone)]
pub struct ProgressReporter {
    operation: Option<OperationId>,
    events: Option<broadcast::Sender<OperationEvent>>,
}

impl ProgressReporter {
    pub fn detached() -> Self {
        Self {
            operation: None,
            events: None,
        }
    }

    pub fn operation(&self) -> Option<OperationId> {
        self.operation
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(MessageLevel::Info, text, 0);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.message(MessageLevel::Success, text, 0);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.message(MessageLevel::Warning, text, 0);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.message(MessageLevel::Error, text, 0);
    }

    pub fn dim(&self, text: impl Into<String>) {
        self.message(MessageLevel::Dim, text, 1);
    }

    pub fn hint(&self, text: impl Into<String>) {
        self.message(MessageLevel::Hint, text, 0);
    }

    pub fn stage(&self, stage: &str) {
        self.emit(EventPayload::Stage(stage.to_string()));
    }

    pub fn message(&self, level: MessageLevel, text: impl Into<String>, indent: u8) {
        self.emit(EventPayload::Message {
            level,
            text: text.into(),
            indent,
        });
    }

    fn emit(&self, payload: EventPayload) {
        if let (Some(operation), Some(events)) = (self.operation, &self.events) {
            // No subscribers is fine; events are fire-and-forget.
            let _ = events.send(OperationEvent { operation, payload });
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("operation", &self.operation)
            .finish()
    }
}

/// Declarative description of a tracked call: its kind, a description template with
/// `{arg}` placeholders, and which argument names the target.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    kind: &'static str,
    template: &'static str,
    target_param: &'static str,
    args: Vec<(&'static str, String)>,
}

impl OperationSpec {
    pub fn new(kind: &'static str, template: &'static str, target_param: &'static str) -> Self {
        Self {
            kind,
            template,
            target_param,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.args.push((key, value.into()));
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn target(&self) -> Result<String> {
        self.lookup(self.target_param)
            .map(str::to_string)
            .ok_or_else(|| {
                KapsuleError::Internal(format!(
                    "operation '{}' has no argument '{}' to use as target",
                    self.kind, self.target_param
                ))
            })
    }

    /// Substitute every `{key}` in the template with its argument value.
    pub fn description(&self) -> Result<String> {
        let mut out = String::with_capacity(self.template.len() + 16);
        let mut rest = self.template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                KapsuleError::Internal(format!("unterminated placeholder in '{}'", self.template))
            })?;
            let key = &after[..close];
            let value = self.lookup(key).ok_or_else(|| {
                KapsuleError::Internal(format!(
                    "description of '{}' references unknown argument '{}'",
                    self.kind, key
                ))
            })?;
            out.push_str(value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

struct TrackerInner {
    active: Mutex<BTreeMap<OperationId, OperationInfo>>,
    events: broadcast::Sender<OperationEvent>,
    next_id: AtomicU64,
}

impl TrackerInner {
    fn active(&self) -> MutexGuard<'_, BTreeMap<OperationId, OperationInfo>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, operation: OperationId, payload: EventPayload) {
        let _ = self.events.send(OperationEvent { operation, payload });
    }
}

/// Registry of in-flight operations plus the event stream observers subscribe to.
#[derive(Clone)]
pub struct OperationTracker {
    inner: Arc<TrackerInner>,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                active: Mutex::new(BTreeMap::new()),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.inner.events.subscribe()
    }

    pub fn active_ids(&self) -> Vec<OperationId> {
        self.inner.active().keys().copied().collect()
    }

    pub fn list_paths(&self) -> Vec<String> {
        self.inner.active().keys().map(OperationId::path).collect()
    }

    pub fn get(&self, id: OperationId) -> Option<OperationInfo> {
        self.inner.active().get(&id).cloned()
    }

    pub fn is_active(&self, id: OperationId) -> bool {
        self.inner.active().contains_key(&id)
    }

    /// Run `f` as a tracked operation.
    ///
    /// The description is resolved before `f` starts; a bad template fails the call
    /// without allocating an id.
    pub async fn track<T, F, Fut>(&self, spec: OperationSpec, f: F) -> Result<T>
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let description = spec.description()?;
        let target = spec.target()?;
        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        self.inner.active().insert(
            id,
            OperationInfo {
                id,
                kind: spec.kind().to_string(),
                description: description.clone(),
                target: target.clone(),
                state: OperationState::Running,
                started: SystemTime::now(),
            },
        );
        info!(operation = %id, kind = spec.kind(), %target, "{description}");
        self.inner.send(
            id,
            EventPayload::Started {
                kind: spec.kind().to_string(),
                description,
                target,
            },
        );

        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            id,
            completed: false,
        };
        let reporter = ProgressReporter {
            operation: Some(id),
            events: Some(self.inner.events.clone()),
        };

        let result = f(reporter.clone()).await;
        match &result {
            Ok(_) => guard.complete(OperationState::Finished, None),
            Err(e) => {
                reporter.error(e.to_string());
                guard.complete(OperationState::Failed, Some(e.to_string()));
            }
        }
        result
    }
}

/// Retires an operation id from the active set when dropped.
struct ActiveGuard {
    inner: Arc<TrackerInner>,
    id: OperationId,
    completed: bool,
}

impl ActiveGuard {
    fn complete(mut self, state: OperationState, error: Option<String>) {
        self.completed = true;
        self.retire(state, error);
    }

    fn retire(&self, state: OperationState, error: Option<String>) {
        self.inner.active().remove(&self.id);
        debug!(operation = %self.id, ?state, "operation retired");
        self.inner
            .send(self.id, EventPayload::Completed { state, error });
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.retire(
                OperationState::Failed,
                Some("operation was interrupted".to_string()),
            );
        }
    }
}
