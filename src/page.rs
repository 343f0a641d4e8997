use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::PageError;
use crate::types::{Direction, NetworkRecord};

/// The live page a run drives. Owned by the run loop, borrowed per call.
///
/// Selectors handed to the effectful methods always come from a capture made
/// immediately before the call.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn url(&self) -> Result<String, PageError>;
    async fn title(&self) -> Result<String, PageError>;
    /// Serialized DOM of the main document.
    async fn content(&self) -> Result<String, PageError>;
    /// Evaluates an expression and returns its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError>;
    async fn goto(&self, url: &str) -> Result<(), PageError>;
    async fn click(&self, selector: &str) -> Result<(), PageError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError>;
    async fn select_option(&self, selector: &str, value: &str) -> Result<(), PageError>;
    async fn upload(&self, selector: &str, path: &Path) -> Result<(), PageError>;
    async fn navigate(&self, direction: Direction) -> Result<(), PageError>;
}

/// Evaluates a script that returns `JSON.stringify(..)` and decodes the payload.
pub async fn evaluate_json<P>(page: &P, script: &str) -> Result<serde_json::Value, PageError>
where
    P: PageHandle + ?Sized,
{
    match page.evaluate(script).await? {
        serde_json::Value::String(raw) => {
            serde_json::from_str(&raw).map_err(|e| PageError::Script(format!("bad json from page: {e}")))
        }
        other => Ok(other),
    }
}

/// JSON responses captured between snapshots. Shared between the browser's
/// response handler and the snapshot builder.
#[derive(Clone, Default)]
pub struct NetworkBuffer {
    inner: Arc<Mutex<Vec<NetworkRecord>>>,
}

const NETWORK_BUFFER_CAP: usize = 200;

impl NetworkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: NetworkRecord) {
        let mut records = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= NETWORK_BUFFER_CAP {
            records.remove(0);
        }
        records.push(record);
    }

    /// Takes everything captured since the previous drain.
    pub fn drain(&self) -> Vec<NetworkRecord> {
        let mut records = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *records)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
