//! The snapshot bridge: capture settled entries in one execution pass and
//! replay them verbatim in another.
//!
//! A recording store notes every entry definition it touches. Flushing
//! serializes the settled ones — value payload included when the definition
//! carries a [`Codec`], dependency names only otherwise — and defers pending
//! ones to a later flush. A replaying store consumes records on first
//! access: dependency edges are wired, the settled value or error is
//! pre-seeded, and recomputation is skipped for that pass.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use ahash::RandomState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entry::{AnyEntry, EntryCell, EntryState};
pub use crate::error::SnapshotError;
use crate::key::Key;
use crate::store::Store;
use crate::tracer::FlowEvent;
use crate::value::Cause;

/// Per-entry value codec for the snapshot wire format.
pub trait Codec<T> {
    /// Encode a settled value.
    fn encode(&self, value: &T) -> Result<serde_json::Value, anyhow::Error>;

    /// Decode a previously encoded value.
    fn decode(&self, data: serde_json::Value) -> Result<T, anyhow::Error>;
}

/// Codec backed by the value's serde implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<serde_json::Value, anyhow::Error> {
        Ok(serde_json::to_value(value)?)
    }

    fn decode(&self, data: serde_json::Value) -> Result<T, anyhow::Error> {
        Ok(serde_json::from_value(data)?)
    }
}

/// One entry's snapshot: dependency names, and the encoded value or failure
/// message when available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Names of the entries read during the recorded computation pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Encoded value, or the failure message when `error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Marks a settled failure; `data` carries its message.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

/// An ordered sequence of named records, applied in emission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: Vec<(String, SnapshotRecord)>,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when no record was emitted.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The records in emission order.
    pub fn records(&self) -> &[(String, SnapshotRecord)] {
        &self.records
    }

    /// Append the records of a later flush.
    pub fn extend(&mut self, later: Snapshot) {
        self.records.extend(later.records);
    }

    fn push(&mut self, name: String, record: SnapshotRecord) {
        self.records.push((name, record));
    }
}

/// Type-erased view of a noted entry definition.
pub(crate) trait SnapshotSource {
    fn key(&self) -> &Key;
    /// `true` when the definition carries a value codec.
    fn full(&self) -> bool;
    /// Serialize the entry now; `None` when it has not settled yet.
    fn record(&self, store: &Store) -> Result<Option<SnapshotRecord>, SnapshotError>;
}

pub(crate) struct SourceAdapter<T> {
    key: Key,
    codec: Option<Rc<dyn Codec<T>>>,
}

impl<T: Clone + 'static> SourceAdapter<T> {
    pub(crate) fn new(key: Key, codec: Option<Rc<dyn Codec<T>>>) -> Self {
        Self { key, codec }
    }
}

impl<T: Clone + 'static> SnapshotSource for SourceAdapter<T> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn full(&self) -> bool {
        self.codec.is_some()
    }

    fn record(&self, store: &Store) -> Result<Option<SnapshotRecord>, SnapshotError> {
        let Some(cell) = store.existing_cell::<T>(&self.key) else {
            return Err(SnapshotError::MissingEntry {
                key: self.key.to_string(),
            });
        };
        if cell.state() != EntryState::Settled {
            return Ok(None);
        }
        let dependencies = cell.up_deps().iter().map(|k| k.to_string()).collect();
        let outcome = cell
            .last_settled()
            .expect("settled entry carries an outcome");
        let record = match outcome {
            Ok(value) => {
                let data = match &self.codec {
                    Some(codec) => {
                        Some(codec.encode(&value).map_err(|source| SnapshotError::Encode {
                            key: self.key.to_string(),
                            source,
                        })?)
                    }
                    None => None,
                };
                SnapshotRecord {
                    dependencies,
                    data,
                    error: false,
                }
            }
            Err(cause) => SnapshotRecord {
                dependencies,
                data: Some(serde_json::Value::String(cause.to_string())),
                error: true,
            },
        };
        Ok(Some(record))
    }
}

#[derive(Default)]
struct Recording {
    notes: Vec<Rc<dyn SnapshotSource>>,
    noted: HashMap<Key, bool, RandomState>,
    serialized: HashMap<Key, bool, RandomState>,
}

struct Replaying {
    records: HashMap<Key, SnapshotRecord, RandomState>,
    /// Dependency name → dependents waiting for that cell to materialize.
    pending_edges: HashMap<Key, Vec<(Key, Weak<dyn AnyEntry>)>, RandomState>,
}

enum BridgeMode {
    Direct,
    Recording(RefCell<Recording>),
    Replaying(RefCell<Replaying>),
}

/// The store's attachment point for snapshotting and replay.
pub(crate) struct Bridge {
    mode: BridgeMode,
}

impl Bridge {
    pub(crate) fn direct() -> Self {
        Self {
            mode: BridgeMode::Direct,
        }
    }

    pub(crate) fn recording() -> Self {
        Self {
            mode: BridgeMode::Recording(RefCell::new(Recording::default())),
        }
    }

    pub(crate) fn replaying(snapshot: Snapshot) -> Self {
        let mut records = HashMap::with_hasher(RandomState::new());
        for (name, record) in snapshot.records {
            // Applied in emission order: a later record for a name wins.
            records.insert(Key::new(name), record);
        }
        Self {
            mode: BridgeMode::Replaying(RefCell::new(Replaying {
                records,
                pending_edges: HashMap::with_hasher(RandomState::new()),
            })),
        }
    }

    pub(crate) fn is_recording(&self) -> bool {
        matches!(self.mode, BridgeMode::Recording(_))
    }

    /// Note a touched definition for later serialization.
    pub(crate) fn note(&self, source: Rc<dyn SnapshotSource>) {
        let BridgeMode::Recording(recording) = &self.mode else {
            return;
        };
        let mut recording = recording.borrow_mut();
        match recording.noted.get(source.key()) {
            // A second definition in the same mode adds nothing.
            Some(full) if *full == source.full() => {}
            _ => {
                recording.noted.insert(source.key().clone(), source.full());
                recording.notes.push(source);
            }
        }
    }

    /// Wire queued replay edges once the dependency's cell exists.
    pub(crate) fn wire_pending_edges(&self, key: &Key, entry: &Rc<dyn AnyEntry>) {
        let BridgeMode::Replaying(replaying) = &self.mode else {
            return;
        };
        let waiting = replaying.borrow_mut().pending_edges.remove(key);
        for (dependent_key, dependent) in waiting.unwrap_or_default() {
            entry.register_dependent(dependent_key, dependent);
        }
    }

    pub(crate) fn flush(&self, store: &Store, last: bool) -> Result<Snapshot, SnapshotError> {
        let BridgeMode::Recording(recording) = &self.mode else {
            panic!("snapshot flush on a store that is not recording");
        };
        let notes: Vec<Rc<dyn SnapshotSource>> = recording.borrow().notes.clone();
        let mut snapshot = Snapshot::new();
        for source in notes {
            let key = source.key().clone();
            let full = source.full();
            match recording.borrow().serialized.get(&key) {
                Some(mode) if *mode == full => continue,
                Some(_) => {
                    return Err(SnapshotError::ModeMismatch {
                        key: key.to_string(),
                    })
                }
                None => {}
            }
            match source.record(store)? {
                Some(record) => {
                    recording.borrow_mut().serialized.insert(key.clone(), full);
                    store.tracer().emit(FlowEvent::EntrySerialized {
                        key: key.clone(),
                        full: !record.error && record.data.is_some(),
                    });
                    snapshot.push(key.to_string(), record);
                }
                None if last => {
                    return Err(SnapshotError::PendingAtFlush {
                        key: key.to_string(),
                    })
                }
                None => {}
            }
        }
        Ok(snapshot)
    }
}

/// Consume a waiting replay record for `key`, seeding dependency edges and
/// the settled outcome. Returns `true` when recomputation should be skipped.
///
/// A record whose payload mode does not match the definition (data but no
/// codec, or the reverse) only wires edges and stays available for a
/// definition that can finish the job.
pub(crate) fn try_restore<T: Clone + 'static>(
    store: &Store,
    key: &Key,
    cell: &Rc<EntryCell<T>>,
    codec: Option<&Rc<dyn Codec<T>>>,
) -> bool {
    let BridgeMode::Replaying(replaying) = &store.bridge().mode else {
        return false;
    };
    if cell.state() != EntryState::Init {
        return false;
    }
    let (record, consumed) = {
        let mut replaying = replaying.borrow_mut();
        let Some(found) = replaying.records.get_mut(key) else {
            return false;
        };
        let consumable = found.error || (found.data.is_some() == codec.is_some());
        if consumable {
            let record = replaying.records.remove(key).expect("record just found");
            (record, true)
        } else {
            let record = found.clone();
            // Edges are wired exactly once even when the record stays.
            found.dependencies.clear();
            (record, false)
        }
    };

    for name in &record.dependencies {
        let dep = Key::new(name);
        cell.seed_up_dep(dep.clone());
        let dependent = Rc::downgrade(&(cell.clone() as Rc<dyn AnyEntry>));
        match store.existing_any(&dep) {
            Some(dep_entry) => dep_entry.register_dependent(key.clone(), dependent),
            None => replaying
                .borrow_mut()
                .pending_edges
                .entry(dep)
                .or_default()
                .push((key.clone(), dependent)),
        }
    }

    if record.error {
        let message = record
            .data
            .as_ref()
            .and_then(|data| data.as_str())
            .unwrap_or("restored failure")
            .to_string();
        cell.preset(Err(Cause::fault(anyhow::anyhow!("{message}"))));
        store
            .tracer()
            .emit(FlowEvent::EntryRestored { key: key.clone() });
        return true;
    }
    if !consumed {
        return false;
    }
    match (record.data, codec) {
        (Some(data), Some(codec)) => {
            // A decode failure becomes the entry's error outcome.
            cell.preset(codec.decode(data).map_err(Cause::fault));
            store
                .tracer()
                .emit(FlowEvent::EntryRestored { key: key.clone() });
            true
        }
        // Dependencies-only record: link structure restored, value recomputed.
        _ => false,
    }
}
