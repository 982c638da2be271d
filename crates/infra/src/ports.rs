//! Secondary-store adapter ports.
//!
//! The executor only knows these three operations. Whatever search or index
//! client backs a deployment implements [`ProjectionPort`] for each aggregate
//! type; every call either fully succeeds or returns an error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, anyhow};
use async_trait::async_trait;

use projector_core::{Counter, TargetId};

/// Operations the executor applies to the secondary store.
#[async_trait]
pub trait ProjectionPort<C: Counter>: Send + Sync {
    async fn soft_delete(&self, target_id: TargetId) -> anyhow::Result<()>;

    async fn restore(&self, target_id: TargetId) -> anyhow::Result<()>;

    /// Add `delta` (either sign) to one counter of the projected document.
    async fn increment(&self, target_id: TargetId, counter: C, delta: i64) -> anyhow::Result<()>;
}

#[async_trait]
impl<C: Counter, P: ProjectionPort<C> + ?Sized> ProjectionPort<C> for Arc<P> {
    async fn soft_delete(&self, target_id: TargetId) -> anyhow::Result<()> {
        (**self).soft_delete(target_id).await
    }

    async fn restore(&self, target_id: TargetId) -> anyhow::Result<()> {
        (**self).restore(target_id).await
    }

    async fn increment(&self, target_id: TargetId, counter: C, delta: i64) -> anyhow::Result<()> {
        (**self).increment(target_id, counter, delta).await
    }
}

/// A call received by an [`InMemoryIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCall<C: Counter> {
    SoftDelete(TargetId),
    Restore(TargetId),
    Increment {
        target_id: TargetId,
        counter: C,
        delta: i64,
    },
}

impl<C: Counter> PortCall<C> {
    pub fn target_id(&self) -> TargetId {
        match *self {
            PortCall::SoftDelete(target_id) | PortCall::Restore(target_id) => target_id,
            PortCall::Increment { target_id, .. } => target_id,
        }
    }
}

/// Projected document held by an [`InMemoryIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument<C: Counter> {
    pub deleted: bool,
    counters: HashMap<C, i64>,
}

impl<C: Counter> IndexedDocument<C> {
    fn new() -> Self {
        Self {
            deleted: false,
            counters: HashMap::new(),
        }
    }

    pub fn counter(&self, counter: C) -> i64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct IndexState<C: Counter> {
    documents: HashMap<TargetId, IndexedDocument<C>>,
    calls: Vec<PortCall<C>>,
    record_calls: bool,
}

/// In-process secondary index for tests and local runs.
///
/// Behaves like a document index updated by scripts: counter updates and
/// soft deletes require the document to exist, restore upserts it. By
/// default every call is recorded, including the ones that fail; the log is
/// unbounded, so long-lived local runs should use
/// [`InMemoryIndex::without_call_log`].
#[derive(Debug)]
pub struct InMemoryIndex<C: Counter> {
    state: RwLock<IndexState<C>>,
}

impl<C: Counter> Default for InMemoryIndex<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Counter> InMemoryIndex<C> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState {
                documents: HashMap::new(),
                calls: Vec::new(),
                record_calls: true,
            }),
        }
    }

    /// Index that keeps documents but does not record calls.
    pub fn without_call_log() -> Self {
        let index = Self::new();
        index.state.write().unwrap_or_else(|e| e.into_inner()).record_calls = false;
        index
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Index a fresh, visible document with all counters at zero.
    pub fn index_document(&self, target_id: TargetId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.documents.insert(target_id, IndexedDocument::new());
    }

    pub fn document(&self, target_id: TargetId) -> Option<IndexedDocument<C>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.documents.get(&target_id).cloned()
    }

    /// Calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<PortCall<C>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.calls.clone()
    }

    fn apply<F>(&self, call: PortCall<C>, update: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut HashMap<TargetId, IndexedDocument<C>>) -> anyhow::Result<()>,
    {
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("index state lock poisoned"))?;
        if state.record_calls {
            state.calls.push(call);
        }
        update(&mut state.documents)
    }
}

fn existing<C: Counter>(
    documents: &mut HashMap<TargetId, IndexedDocument<C>>,
    target_id: TargetId,
) -> anyhow::Result<&mut IndexedDocument<C>> {
    documents
        .get_mut(&target_id)
        .with_context(|| format!("document {} missing from {}", target_id, C::INDEX_NAME))
}

#[async_trait]
impl<C: Counter> ProjectionPort<C> for InMemoryIndex<C> {
    async fn soft_delete(&self, target_id: TargetId) -> anyhow::Result<()> {
        self.apply(PortCall::SoftDelete(target_id), |docs| {
            existing(docs, target_id)?.deleted = true;
            Ok(())
        })
    }

    async fn restore(&self, target_id: TargetId) -> anyhow::Result<()> {
        self.apply(PortCall::Restore(target_id), |docs| {
            docs.entry(target_id).or_insert_with(IndexedDocument::new).deleted = false;
            Ok(())
        })
    }

    async fn increment(&self, target_id: TargetId, counter: C, delta: i64) -> anyhow::Result<()> {
        let call = PortCall::Increment {
            target_id,
            counter,
            delta,
        };
        self.apply(call, |docs| {
            let doc = existing(docs, target_id)?;
            let value = doc.counters.entry(counter).or_insert(0);
            *value = value.saturating_add(delta);
            Ok(())
        })
    }
}
