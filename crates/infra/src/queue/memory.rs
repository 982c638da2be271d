//! In-memory queue store for tests/dev.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use projector_core::{
    Clock, Counter, DeadLetterRecord, NewProjectionTask, ProjectionTask, SystemClock, TargetId,
    TaskId, TaskStatus,
};

use super::store::{DeadLetterStore, QueueError, QueueStats, QueueWriter, TaskStore, UnitOfWork};

#[derive(Debug)]
struct State<C: Counter> {
    tasks: BTreeMap<TaskId, ProjectionTask<C>>,
    dead_letters: Vec<DeadLetterRecord<C>>,
}

#[derive(Debug)]
struct Shared<C: Counter> {
    state: RwLock<State<C>>,
    next_id: AtomicI64,
}

impl<C: Counter> Shared<C> {
    fn read(&self) -> Result<RwLockReadGuard<'_, State<C>>, QueueError> {
        self.state
            .read()
            .map_err(|_| QueueError::Storage("queue state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State<C>>, QueueError> {
        self.state
            .write()
            .map_err(|_| QueueError::Storage("queue state lock poisoned".to_string()))
    }
}

/// In-memory queue and dead-letter store.
///
/// Units of work buffer their writes and apply them atomically on commit,
/// which gives the same isolation the Postgres store gets from transactions.
/// Ids come from a sequence, so ids handed out to rolled-back units are
/// skipped, as with `BIGSERIAL`.
pub struct InMemoryTaskStore<C: Counter> {
    shared: Arc<Shared<C>>,
    clock: Arc<dyn Clock>,
}

impl<C: Counter> InMemoryTaskStore<C> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store that stamps new rows with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    tasks: BTreeMap::new(),
                    dead_letters: Vec::new(),
                }),
                next_id: AtomicI64::new(1),
            }),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a unit of work with its concrete type, for callers that want to
    /// enqueue without boxing.
    pub fn unit(&self) -> InMemoryUnit<C> {
        InMemoryUnit {
            shared: self.shared.clone(),
            clock: self.clock.clone(),
            ops: Vec::new(),
            finished: false,
        }
    }

    /// Every active task, in id order.
    pub fn snapshot(&self) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        Ok(self.shared.read()?.tasks.values().cloned().collect())
    }
}

impl<C: Counter> Default for InMemoryTaskStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Counter> std::fmt::Debug for InMemoryTaskStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTaskStore")
            .field("target_kind", &C::TARGET_KIND)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Op<C: Counter> {
    Insert(ProjectionTask<C>),
    Delete(TaskId),
    Update(ProjectionTask<C>),
    DeadLetter(DeadLetterRecord<C>),
}

/// Buffered unit of work over an [`InMemoryTaskStore`].
pub struct InMemoryUnit<C: Counter> {
    shared: Arc<Shared<C>>,
    clock: Arc<dyn Clock>,
    ops: Vec<Op<C>>,
    finished: bool,
}

impl<C: Counter> InMemoryUnit<C> {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.finished {
            Err(QueueError::Finished)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<C: Counter> QueueWriter<C> for InMemoryUnit<C> {
    async fn insert_task(&mut self, task: NewProjectionTask<C>) -> Result<TaskId, QueueError> {
        self.ensure_open()?;
        let id = TaskId::new(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        self.ops.push(Op::Insert(task.into_task(id, self.clock.now())));
        Ok(id)
    }
}

#[async_trait]
impl<C: Counter> UnitOfWork<C> for InMemoryUnit<C> {
    async fn delete_task(&mut self, id: TaskId) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ops.push(Op::Delete(id));
        Ok(())
    }

    async fn update_task(&mut self, task: &ProjectionTask<C>) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ops.push(Op::Update(task.clone()));
        Ok(())
    }

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord<C>) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.ops.push(Op::DeadLetter(record.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);

        let mut state = self.shared.write()?;

        // Validate every op before applying any, so a failing commit leaves
        // the store exactly as it was.
        let mut inserted = HashSet::new();
        let mut removed = HashSet::new();
        for op in &ops {
            let exists = |id: &TaskId| {
                !removed.contains(id) && (inserted.contains(id) || state.tasks.contains_key(id))
            };
            match op {
                Op::Insert(task) => {
                    inserted.insert(task.id);
                }
                Op::Delete(id) => {
                    if !exists(id) {
                        return Err(QueueError::NotFound(*id));
                    }
                    removed.insert(*id);
                }
                Op::Update(task) => {
                    if !exists(&task.id) {
                        return Err(QueueError::NotFound(task.id));
                    }
                }
                Op::DeadLetter(_) => {}
            }
        }

        for op in ops {
            match op {
                Op::Insert(task) | Op::Update(task) => {
                    state.tasks.insert(task.id, task);
                }
                Op::Delete(id) => {
                    state.tasks.remove(&id);
                }
                Op::DeadLetter(record) => state.dead_letters.push(record),
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.finished = true;
        self.ops.clear();
        Ok(())
    }
}

#[async_trait]
impl<C: Counter> TaskStore<C> for InMemoryTaskStore<C> {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork<C>>, QueueError> {
        Ok(Box::new(self.unit()))
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        let state = self.shared.read()?;
        let mut due: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();

        due.sort_by_key(|t| t.poll_key());
        due.truncate(limit);
        Ok(due)
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask<C>>, QueueError> {
        Ok(self.shared.read()?.tasks.get(&id).cloned())
    }

    async fn tasks_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<ProjectionTask<C>>, QueueError> {
        let state = self.shared.read()?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.target_id == target_id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.shared.read()?;
        let mut stats = QueueStats {
            dead_lettered: state.dead_letters.len(),
            ..QueueStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Retrying => stats.retrying += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl<C: Counter> DeadLetterStore<C> for InMemoryTaskStore<C> {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord<C>>, QueueError> {
        let state = self.shared.read()?;
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn dead_letters_for_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<DeadLetterRecord<C>>, QueueError> {
        let state = self.shared.read()?;
        Ok(state
            .dead_letters
            .iter()
            .filter(|r| r.target_id() == target_id)
            .cloned()
            .collect())
    }
}
