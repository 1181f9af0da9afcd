//! Views: isolated, versioned, copy-on-write object stores.
//!
//! A base [`View`] holds the replayed [`ClusterSnapshot`]. Sandbox views are
//! chained to a delegate: writes land in the sandbox's own overlay, reads
//! fall through to the delegate unless the key was overridden or deleted
//! locally. Resource versions come from one counter shared by the whole
//! lineage, so they increase monotonically across base and sandboxes.
//!
//! Each view also carries an append-only event sink (scheduling outcomes)
//! and a broadcast watch stream of object changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

type ObjectKey = (ResourceKind, String);

const WATCH_CAPACITY: usize = 256;

/// An object together with the resource version of its last write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub object: ClusterObject,
    pub resource_version: u64,
}

/// Reason attached to a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    /// A workload was bound to a node.
    Scheduled,
    /// A scheduling attempt found no fitting node.
    FailedScheduling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewEvent {
    pub sequence: u64,
    pub reason: EventReason,
    pub workload: WorkloadKey,
    pub node_name: Option<String>,
    pub message: String,
    pub resource_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kind: ResourceKind,
    pub key: String,
    pub resource_version: u64,
}

#[derive(Default)]
struct ViewState {
    overlay: BTreeMap<ObjectKey, StoredObject>,
    /// Keys deleted locally that may still exist in the delegate.
    deleted: BTreeSet<ObjectKey>,
    events: Vec<ViewEvent>,
    closed: bool,
}

/// A copy-on-write object store bound to at most one writer at a time.
pub struct View {
    name: String,
    delegate: Option<Arc<View>>,
    versions: Arc<AtomicU64>,
    state: RwLock<ViewState>,
    watch_tx: broadcast::Sender<WatchEvent>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("delegate", &self.delegate.as_ref().map(|d| d.name()))
            .finish()
    }
}

impl View {
    /// Create an empty root view.
    pub fn new_base(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, None, Arc::new(AtomicU64::new(0))))
    }

    /// Create a sandbox over `delegate`. The delegate is only ever read.
    pub fn sandbox(name: &str, delegate: &Arc<View>) -> Arc<Self> {
        Arc::new(Self::build(
            name,
            Some(Arc::clone(delegate)),
            Arc::clone(&delegate.versions),
        ))
    }

    fn build(name: &str, delegate: Option<Arc<View>>, versions: Arc<AtomicU64>) -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            name: name.to_string(),
            delegate,
            versions,
            state: RwLock::new(ViewState::default()),
            watch_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delegate(&self) -> Option<&Arc<View>> {
        self.delegate.as_ref()
    }

    /// Latest resource version handed out anywhere in this lineage.
    pub fn resource_version(&self) -> u64 {
        self.versions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Facade handed to scheduler instances.
    pub fn client(self: &Arc<Self>) -> ClientFacade {
        ClientFacade {
            view: Arc::clone(self),
        }
    }

    /// Replay a snapshot into this view.
    pub fn load_snapshot(&self, snapshot: &ClusterSnapshot) -> StateResult<()> {
        let mut count = 0usize;
        for object in snapshot.objects() {
            self.create_object(object)?;
            count += 1;
        }
        debug!(view = %self.name, objects = count, "snapshot loaded");
        Ok(())
    }

    // ── Object CRUD ────────────────────────────────────────────────

    pub fn create_object(&self, object: ClusterObject) -> StateResult<u64> {
        let key = (object.kind(), object.key());
        let mut state = self.write_open()?;
        if self.lookup_locked(&state, &key).is_some() {
            return Err(self.already_exists(key));
        }
        let version = self.next_version();
        state.deleted.remove(&key);
        state.overlay.insert(
            key.clone(),
            StoredObject {
                object,
                resource_version: version,
            },
        );
        drop(state);
        self.notify(WatchEventType::Added, key, version);
        Ok(version)
    }

    pub fn get_object(&self, kind: ResourceKind, key: &str) -> StateResult<Option<StoredObject>> {
        let state = self.read_open()?;
        Ok(self.lookup_locked(&state, &(kind, key.to_string())))
    }

    /// List all objects of `kind`, ordered by key.
    pub fn list_objects(&self, kind: ResourceKind) -> StateResult<Vec<StoredObject>> {
        let state = self.read_open()?;
        let mut merged: BTreeMap<String, StoredObject> = match &self.delegate {
            Some(delegate) => delegate
                .list_objects(kind)?
                .into_iter()
                .map(|o| (o.object.key(), o))
                .collect(),
            None => BTreeMap::new(),
        };
        for (_, key) in state.deleted.iter().filter(|(k, _)| *k == kind) {
            merged.remove(key);
        }
        for ((k, key), stored) in state.overlay.iter() {
            if *k == kind {
                merged.insert(key.clone(), stored.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Replace an existing object.
    pub fn update_object(&self, object: ClusterObject) -> StateResult<u64> {
        let key = (object.kind(), object.key());
        let mut state = self.write_open()?;
        if self.lookup_locked(&state, &key).is_none() {
            return Err(self.not_found(key));
        }
        let version = self.next_version();
        state.overlay.insert(
            key.clone(),
            StoredObject {
                object,
                resource_version: version,
            },
        );
        drop(state);
        self.notify(WatchEventType::Modified, key, version);
        Ok(version)
    }

    pub fn delete_object(&self, kind: ResourceKind, key: &str) -> StateResult<()> {
        let key = (kind, key.to_string());
        let mut state = self.write_open()?;
        if self.lookup_locked(&state, &key).is_none() {
            return Err(self.not_found(key));
        }
        state.overlay.remove(&key);
        if self.delegate.is_some() {
            state.deleted.insert(key.clone());
        }
        let version = self.next_version();
        drop(state);
        self.notify(WatchEventType::Deleted, key, version);
        Ok(())
    }

    // ── Typed accessors ────────────────────────────────────────────

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        Ok(self
            .list_objects(ResourceKind::Node)?
            .into_iter()
            .filter_map(|o| match o.object {
                ClusterObject::Node(n) => Some(n),
                _ => None,
            })
            .collect())
    }

    pub fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        Ok(self
            .list_objects(ResourceKind::Workload)?
            .into_iter()
            .filter_map(|o| match o.object {
                ClusterObject::Workload(w) => Some(w),
                _ => None,
            })
            .collect())
    }

    pub fn get_workload(&self, key: &WorkloadKey) -> StateResult<Option<Workload>> {
        Ok(self
            .get_object(ResourceKind::Workload, &key.to_string())?
            .and_then(|o| match o.object {
                ClusterObject::Workload(w) => Some(w),
                _ => None,
            }))
    }

    pub fn unscheduled_workloads(&self) -> StateResult<Vec<Workload>> {
        Ok(self
            .list_workloads()?
            .into_iter()
            .filter(Workload::is_unscheduled)
            .collect())
    }

    pub fn priority_classes(&self) -> StateResult<Vec<PriorityClass>> {
        Ok(self
            .list_objects(ResourceKind::PriorityClass)?
            .into_iter()
            .filter_map(|o| match o.object {
                ClusterObject::PriorityClass(p) => Some(p),
                _ => None,
            })
            .collect())
    }

    pub fn runtime_classes(&self) -> StateResult<Vec<RuntimeClass>> {
        Ok(self
            .list_objects(ResourceKind::RuntimeClass)?
            .into_iter()
            .filter_map(|o| match o.object {
                ClusterObject::RuntimeClass(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    /// Bind a pending workload to an existing node.
    pub fn bind_workload(&self, key: &WorkloadKey, node_name: &str) -> StateResult<u64> {
        let mut workload = self.get_workload(key)?.ok_or_else(|| {
            self.not_found((ResourceKind::Workload, key.to_string()))
        })?;
        if let Some(node) = workload.node_name.as_deref().filter(|n| !n.is_empty()) {
            return Err(StateError::AlreadyBound {
                workload: key.to_string(),
                node: node.to_string(),
            });
        }
        if self.get_object(ResourceKind::Node, node_name)?.is_none() {
            return Err(self.not_found((ResourceKind::Node, node_name.to_string())));
        }
        workload.node_name = Some(node_name.to_string());
        self.update_object(ClusterObject::Workload(workload))
    }

    // ── Events and watch ───────────────────────────────────────────

    /// Append an event to this view's sink. Returns its sequence number.
    pub fn record_event(
        &self,
        reason: EventReason,
        workload: &WorkloadKey,
        node_name: Option<&str>,
        message: impl Into<String>,
    ) -> StateResult<u64> {
        let mut state = self.write_open()?;
        let sequence = state.events.len() as u64;
        let resource_version = self.resource_version();
        state.events.push(ViewEvent {
            sequence,
            reason,
            workload: workload.clone(),
            node_name: node_name.map(str::to_string),
            message: message.into(),
            resource_version,
        });
        Ok(sequence)
    }

    /// Events recorded in this view from position `cursor` onwards.
    ///
    /// Events of the delegate are not included.
    pub fn events_since(&self, cursor: usize) -> StateResult<Vec<ViewEvent>> {
        let state = self.read_open()?;
        Ok(state.events.iter().skip(cursor).cloned().collect())
    }

    /// Subscribe to object changes made in this view.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Drop every local change and event, exposing the delegate again.
    pub fn reset(&self) -> StateResult<()> {
        let mut state = self.write_open()?;
        state.overlay.clear();
        state.deleted.clear();
        state.events.clear();
        debug!(view = %self.name, "view reset");
        Ok(())
    }

    /// Close the view. Every later operation fails with [`StateError::Closed`].
    pub fn close(&self) {
        let mut state = self.write();
        if !state.closed {
            state.closed = true;
            state.overlay.clear();
            state.deleted.clear();
            state.events.clear();
            debug!(view = %self.name, "view closed");
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn lookup_locked(&self, state: &ViewState, key: &ObjectKey) -> Option<StoredObject> {
        if let Some(obj) = state.overlay.get(key) {
            return Some(obj.clone());
        }
        if state.deleted.contains(key) {
            return None;
        }
        self.delegate
            .as_ref()
            .and_then(|d| d.get_object(key.0, &key.1).ok().flatten())
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event_type: WatchEventType, key: ObjectKey, resource_version: u64) {
        // No subscribers is fine.
        let _ = self.watch_tx.send(WatchEvent {
            event_type,
            kind: key.0,
            key: key.1,
            resource_version,
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_open(&self) -> StateResult<RwLockReadGuard<'_, ViewState>> {
        let state = self.read();
        if state.closed {
            return Err(StateError::Closed(self.name.clone()));
        }
        Ok(state)
    }

    fn write_open(&self) -> StateResult<RwLockWriteGuard<'_, ViewState>> {
        let state = self.write();
        if state.closed {
            return Err(StateError::Closed(self.name.clone()));
        }
        Ok(state)
    }

    fn already_exists(&self, key: ObjectKey) -> StateError {
        StateError::AlreadyExists {
            view: self.name.clone(),
            kind: key.0,
            key: key.1,
        }
    }

    fn not_found(&self, key: ObjectKey) -> StateError {
        StateError::NotFound {
            view: self.name.clone(),
            kind: key.0,
            key: key.1,
        }
    }
}

// ── Client facade ──────────────────────────────────────────────────

/// The narrow surface a scheduler instance uses to talk to its view.
#[derive(Clone)]
pub struct ClientFacade {
    view: Arc<View>,
}

impl ClientFacade {
    pub fn view_name(&self) -> &str {
        self.view.name()
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.view.list_nodes()
    }

    pub fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        self.view.list_workloads()
    }

    pub fn priority_classes(&self) -> StateResult<Vec<PriorityClass>> {
        self.view.priority_classes()
    }

    pub fn runtime_classes(&self) -> StateResult<Vec<RuntimeClass>> {
        self.view.runtime_classes()
    }

    /// Bind a workload and record a `Scheduled` event for it.
    pub fn bind(&self, key: &WorkloadKey, node_name: &str) -> StateResult<u64> {
        let version = self.view.bind_workload(key, node_name)?;
        self.view.record_event(
            EventReason::Scheduled,
            key,
            Some(node_name),
            format!("successfully assigned {key} to {node_name}"),
        )?;
        Ok(version)
    }

    /// Append an arbitrary event to the view's sink.
    pub fn record_event(
        &self,
        reason: EventReason,
        key: &WorkloadKey,
        node_name: Option<&str>,
        message: &str,
    ) -> StateResult<u64> {
        self.view.record_event(reason, key, node_name, message)
    }

    pub fn report_unschedulable(&self, key: &WorkloadKey, message: &str) -> StateResult<()> {
        self.view
            .record_event(EventReason::FailedScheduling, key, None, message)?;
        Ok(())
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.view.watch()
    }
}

// ── View access ────────────────────────────────────────────────────

/// Hands out the base view and named sandboxes over arbitrary delegates.
pub struct ViewAccess {
    base: Arc<View>,
    sandboxes: Mutex<HashMap<String, Arc<View>>>,
}

impl ViewAccess {
    pub fn new(base: Arc<View>) -> Self {
        Self {
            base,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_view(&self) -> Arc<View> {
        Arc::clone(&self.base)
    }

    /// Return the sandbox named `name` over `delegate`, creating it if needed.
    ///
    /// An existing sandbox with the same name but a different delegate is
    /// closed and replaced.
    pub fn sandbox_view_over(&self, name: &str, delegate: &Arc<View>) -> Arc<View> {
        let mut sandboxes = self.sandboxes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sandboxes.get(name) {
            if existing
                .delegate()
                .is_some_and(|d| Arc::ptr_eq(d, delegate))
                && !existing.is_closed()
            {
                return Arc::clone(existing);
            }
            existing.close();
        }
        let view = View::sandbox(name, delegate);
        sandboxes.insert(name.to_string(), Arc::clone(&view));
        debug!(sandbox = name, delegate = delegate.name(), "sandbox view created");
        view
    }

    /// Forget a sandbox. Closes it unless `keep_open` is set.
    pub fn release(&self, name: &str, keep_open: bool) {
        let removed = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if let Some(view) = removed
            && !keep_open
        {
            view.close();
        }
    }

    /// Number of sandboxes currently registered.
    pub fn sandbox_count(&self) -> usize {
        self.sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
