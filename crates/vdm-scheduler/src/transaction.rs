//! Transaction cells - snapshot isolation for shared instance variables
//!
//! Each cell holds a committed value visible to every thread and at most one
//! working value visible only to the thread that wrote it. A thread's working
//! values are committed together when it finishes a scheduling step.

use crate::error::{SchedulerError, SchedulerResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use vdm_primitives::{ObjectId, ThreadId, Value};

/// Versioned holder for one piece of shared state
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCell<T> {
    committed: T,
    working: Option<T>,
    owner: Option<ThreadId>,
}

impl<T: Clone> TransactionCell<T> {
    /// Create a cell with a committed value and no pending write
    pub fn new(committed: T) -> Self {
        Self {
            committed,
            working: None,
            owner: None,
        }
    }

    /// Value as seen by `reader`: its own working value if it has one,
    /// otherwise the committed value
    pub fn get(&self, reader: Option<ThreadId>) -> &T {
        match (&self.working, self.owner) {
            (Some(working), Some(owner)) if reader == Some(owner) => working,
            _ => &self.committed,
        }
    }

    /// Committed value
    pub fn committed(&self) -> &T {
        &self.committed
    }

    /// Pending working value, if any
    pub fn working(&self) -> Option<&T> {
        self.working.as_ref()
    }

    /// Thread owning the pending write
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Write a working value.
    ///
    /// Returns `Err(owner)` if another thread has a pending write.
    pub fn set(&mut self, writer: ThreadId, value: T) -> Result<(), ThreadId> {
        match self.owner {
            Some(owner) if owner != writer => Err(owner),
            _ => {
                self.owner = Some(writer);
                self.working = Some(value);
                Ok(())
            }
        }
    }

    /// Promote the working value. Returns true if there was one.
    pub fn commit(&mut self) -> bool {
        self.owner = None;
        match self.working.take() {
            Some(value) => {
                self.committed = value;
                true
            }
            None => false,
        }
    }

    /// Discard the working value
    pub fn rollback(&mut self) {
        self.owner = None;
        self.working = None;
    }
}

/// Address of an instance variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    /// Owning object
    pub object: ObjectId,
    /// Field name
    pub field: String,
}

impl CellKey {
    /// Create a key
    pub fn new(object: ObjectId, field: impl Into<String>) -> Self {
        Self {
            object,
            field: field.into(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.field)
    }
}

/// Every transaction cell of a simulation, with per-thread dirty sets
#[derive(Debug, Default)]
pub struct TransactionStore {
    cells: BTreeMap<CellKey, TransactionCell<Value>>,
    pending: HashMap<ThreadId, BTreeSet<CellKey>>,
    initial: BTreeMap<CellKey, Value>,
}

impl TransactionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the committed (and initial) value of a cell
    pub fn define(&mut self, key: CellKey, value: Value) {
        self.initial.insert(key.clone(), value.clone());
        match self.cells.get_mut(&key) {
            Some(cell) => cell.committed = value,
            None => {
                self.cells.insert(key, TransactionCell::new(value));
            }
        }
    }

    /// Read as `reader` would see it; missing cells read as void
    pub fn read(&self, key: &CellKey, reader: Option<ThreadId>) -> Value {
        self.cells
            .get(key)
            .map(|cell| cell.get(reader).clone())
            .unwrap_or_default()
    }

    /// Committed value of a cell
    pub fn committed(&self, key: &CellKey) -> Value {
        self.read(key, None)
    }

    /// Write a working value, creating the cell on first write
    pub fn write(&mut self, key: CellKey, writer: ThreadId, value: Value) -> SchedulerResult<()> {
        let cell = self
            .cells
            .entry(key.clone())
            .or_insert_with(|| TransactionCell::new(Value::Void));
        cell.set(writer, value)
            .map_err(|owner| SchedulerError::CellConflict {
                key: key.to_string(),
                owner,
                writer,
            })?;
        self.pending.entry(writer).or_default().insert(key);
        Ok(())
    }

    /// Commit every pending write of a thread. Returns the number of cells changed.
    pub fn commit_thread(&mut self, thread: ThreadId) -> usize {
        let Some(keys) = self.pending.remove(&thread) else {
            return 0;
        };
        let mut changed = 0;
        for key in keys {
            if let Some(cell) = self.cells.get_mut(&key) {
                if cell.owner() == Some(thread) && cell.commit() {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Discard every pending write of a thread
    pub fn rollback_thread(&mut self, thread: ThreadId) {
        if let Some(keys) = self.pending.remove(&thread) {
            for key in keys {
                if let Some(cell) = self.cells.get_mut(&key) {
                    if cell.owner() == Some(thread) {
                        cell.rollback();
                    }
                }
            }
        }
    }

    /// Read-only view as seen by `reader` (`None` = committed values only)
    pub fn view(&self, reader: Option<ThreadId>) -> StoreView<'_> {
        StoreView {
            store: self,
            reader,
        }
    }

    /// Restore the defined initial values and drop everything else
    pub fn reset(&mut self) {
        self.pending.clear();
        self.cells = self
            .initial
            .iter()
            .map(|(key, value)| (key.clone(), TransactionCell::new(value.clone())))
            .collect();
    }
}

/// Read-only view of the store, used by permission guards
#[derive(Debug, Clone, Copy)]
pub struct StoreView<'a> {
    store: &'a TransactionStore,
    reader: Option<ThreadId>,
}

impl StoreView<'_> {
    /// Value of an instance variable
    pub fn get(&self, object: ObjectId, field: &str) -> Value {
        self.store.read(&CellKey::new(object, field), self.reader)
    }

    /// Integer value of an instance variable; void and non-integers read as 0
    pub fn int(&self, object: ObjectId, field: &str) -> i64 {
        self.get(object, field).as_int().unwrap_or(0)
    }
}
