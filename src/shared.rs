//! State shared between the interpreter-owning thread and the loader
//! threads that produce object notifications.
//!
//! One mutex guards the identity registry, the candidate queue and the
//! retired-teardown queue together; critical sections stay insert/remove/
//! lookup only. Binding work never runs while the lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::host::{
    DynamicBinding, HostObject, ObjectArray, ObjectId, ASYNC_LOAD_FLAGS, DESTROY_FLAGS,
    ObjectFlags,
};

/// Non-owning record of a host object the bridge has seen.
#[derive(Debug)]
pub(crate) struct ObjectRecord {
    pub(crate) slot: usize,
    pub(crate) debug_name: Option<String>,
}

#[derive(Default)]
struct PendingState {
    records: HashMap<ObjectId, ObjectRecord>,
    /// Objects whose bind attempt was deferred until the owning thread is
    /// safe to touch the interpreter.
    candidates: Vec<ObjectId>,
    /// Deletions observed off the owning thread; script-side teardown for
    /// them runs on the next flush.
    retired: Vec<ObjectId>,
}

pub struct SharedState {
    pending: Mutex<PendingState>,
    dynamic_binding: Mutex<Option<DynamicBinding>>,
    enabled: AtomicBool,
    async_loading: AtomicBool,
    exit_requested: AtomicBool,
    owning_thread: ThreadId,
    objects: Arc<ObjectArray>,
    track_debug_names: bool,
}

impl SharedState {
    pub(crate) fn new(objects: Arc<ObjectArray>, track_debug_names: bool) -> Arc<Self> {
        Arc::new(SharedState {
            pending: Mutex::new(PendingState::default()),
            dynamic_binding: Mutex::new(None),
            enabled: AtomicBool::new(false),
            async_loading: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            owning_thread: thread::current().id(),
            objects,
            track_debug_names,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// True on the thread that owns the interpreter. Every interpreter
    /// mutation is gated on this.
    pub fn is_owning_thread(&self) -> bool {
        thread::current().id() == self.owning_thread
    }

    pub fn is_async_loading(&self) -> bool {
        self.async_loading.load(Ordering::Acquire)
    }

    /// Host loader signal: asynchronous loading started or finished.
    pub fn set_async_loading(&self, active: bool) {
        self.async_loading.store(active, Ordering::Release);
    }

    pub fn request_engine_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Records a created object. Safe from any thread.
    pub(crate) fn record_created(&self, object: &Arc<HostObject>, slot: usize) {
        let record = ObjectRecord {
            slot,
            debug_name: self
                .track_debug_names
                .then(|| object.qualified_name()),
        };
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        pending.records.insert(object.id, record);
    }

    /// Removes the record for a deleted object, returning it if present.
    pub(crate) fn record_deleted(&self, id: ObjectId) -> Option<ObjectRecord> {
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        pending.records.remove(&id)
    }

    pub(crate) fn debug_name(&self, id: ObjectId) -> Option<String> {
        let pending = self.pending.lock().expect("bridge state poisoned");
        pending
            .records
            .get(&id)
            .and_then(|record| record.debug_name.clone())
    }

    /// Double-checked liveness: the locally cached slot must still map to
    /// the same identity in the authoritative table, with no destruction in
    /// progress and the slot still reachable. The second check runs outside
    /// the lock because deletion notifications race with it.
    pub fn is_object_valid(&self, id: ObjectId) -> bool {
        let slot = {
            let pending = self.pending.lock().expect("bridge state poisoned");
            match pending.records.get(&id) {
                Some(record) => record.slot,
                None => return false,
            }
        };

        match self.objects.object_at(slot) {
            Some(object) => {
                object.id == id
                    && !object.flags().intersects(DESTROY_FLAGS)
                    && !object.flags().intersects(ObjectFlags::UNREACHABLE)
            }
            None => false,
        }
    }

    pub(crate) fn enqueue_candidate(&self, id: ObjectId) {
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        if !pending.candidates.contains(&id) {
            pending.candidates.push(id);
        }
    }

    /// Depth of the deferred-bind queue, for host diagnostics.
    pub fn candidate_count(&self) -> usize {
        self.pending
            .lock()
            .expect("bridge state poisoned")
            .candidates
            .len()
    }

    /// One reconciliation pass over the candidate queue, run on the owning
    /// thread. Partitions under the lock: invalid identities are dropped,
    /// entries still mid-load stay queued, the rest come back as the batch
    /// to bind. Binding happens at the call site, outside the lock, because
    /// a bind may legitimately re-queue.
    pub(crate) fn take_ready_candidates(&self) -> Vec<Arc<HostObject>> {
        let mut ready = Vec::new();
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        let mut index = pending.candidates.len();
        while index > 0 {
            index -= 1;
            let id = pending.candidates[index];

            let object = pending
                .records
                .get(&id)
                .map(|record| record.slot)
                .and_then(|slot| self.objects.object_at(slot))
                .filter(|object| object.id == id);
            let object = match object {
                Some(object) if !object.flags().intersects(DESTROY_FLAGS) => object,
                _ => {
                    // identity died while queued
                    pending.candidates.remove(index);
                    continue;
                }
            };

            if object.flags().intersects(ObjectFlags::NEED_POST_LOAD)
                || object.flags().intersects(ASYNC_LOAD_FLAGS)
                || object.class.flags().intersects(ASYNC_LOAD_FLAGS)
            {
                // still mid-load; retry on the next flush
                continue;
            }

            pending.candidates.remove(index);
            ready.push(object);
        }
        ready
    }

    pub(crate) fn push_retired(&self, id: ObjectId) {
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        pending.retired.push(id);
    }

    pub(crate) fn take_retired(&self) -> Vec<ObjectId> {
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        std::mem::take(&mut pending.retired)
    }

    /// Drops every queued candidate and retired entry. Used by full cleanup;
    /// registry records survive so late deletion notifications still find
    /// them.
    pub(crate) fn discard_queues(&self) {
        let mut pending = self.pending.lock().expect("bridge state poisoned");
        pending.candidates.clear();
        pending.retired.clear();
    }

    pub fn set_dynamic_binding(&self, binding: Option<DynamicBinding>) {
        *self
            .dynamic_binding
            .lock()
            .expect("dynamic binding poisoned") = binding;
    }

    /// Reads the current dynamic binding request without retaining it.
    pub(crate) fn with_dynamic_binding<R>(
        &self,
        read: impl FnOnce(Option<&DynamicBinding>) -> R,
    ) -> R {
        let guard = self
            .dynamic_binding
            .lock()
            .expect("dynamic binding poisoned");
        read(guard.as_ref())
    }
}

/// Clonable producer handle for threads that discover objects during
/// asynchronous loading. Everything it does defers interpreter work to the
/// owning thread: created objects become candidates, deleted objects become
/// retired-teardown entries.
#[derive(Clone)]
pub struct ObjectNotifier {
    shared: Arc<SharedState>,
}

impl ObjectNotifier {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        ObjectNotifier { shared }
    }

    pub fn notify_object_created(&self, object: &Arc<HostObject>, slot: usize) {
        self.shared.record_created(object, slot);
        if self.shared.is_enabled() {
            self.shared.enqueue_candidate(object.id);
        }
    }

    pub fn notify_object_deleted(&self, id: ObjectId) {
        let removed = self.shared.record_deleted(id);
        if removed.is_some() && self.shared.is_enabled() {
            self.shared.push_retired(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ClassDescriptor, ClassKind, ObjectFlags};
    use std::sync::Arc;

    fn state() -> (Arc<SharedState>, Arc<ObjectArray>) {
        let objects = ObjectArray::new();
        (SharedState::new(objects.clone(), false), objects)
    }

    fn normal_class() -> Arc<ClassDescriptor> {
        Arc::new(ClassDescriptor::new("Prop", ClassKind::Normal))
    }

    #[test]
    fn validity_requires_record_and_authoritative_match() {
        let (shared, objects) = state();
        let (object, slot) = objects.spawn("prop", normal_class(), None, ObjectFlags::default());

        assert!(!shared.is_object_valid(object.id), "unrecorded object");

        shared.record_created(&object, slot);
        assert!(shared.is_object_valid(object.id));

        object.set_flags(ObjectFlags::BEGIN_DESTROYED);
        assert!(!shared.is_object_valid(object.id), "destroying object");
        object.clear_flags(ObjectFlags::BEGIN_DESTROYED);

        object.set_flags(ObjectFlags::UNREACHABLE);
        assert!(!shared.is_object_valid(object.id), "unreachable object");
        object.clear_flags(ObjectFlags::UNREACHABLE);

        // slot reuse: a different identity in the same slot must not validate
        objects.release(slot);
        let (_other, reused) = objects.spawn("other", normal_class(), None, ObjectFlags::default());
        assert_eq!(slot, reused);
        assert!(!shared.is_object_valid(object.id));
    }

    #[test]
    fn create_then_delete_pair_leaves_registry_empty() {
        let (shared, objects) = state();
        let (a, slot_a) = objects.spawn("a", normal_class(), None, ObjectFlags::default());
        let (b, slot_b) = objects.spawn("b", normal_class(), None, ObjectFlags::default());
        shared.record_created(&a, slot_a);
        shared.record_created(&b, slot_b);

        objects.release(slot_a);
        shared.record_deleted(a.id);
        assert!(!shared.is_object_valid(a.id));
        assert!(shared.is_object_valid(b.id));

        objects.release(slot_b);
        shared.record_deleted(b.id);
        assert!(!shared.is_object_valid(b.id));
        assert_eq!(shared.pending.lock().unwrap().records.len(), 0);
    }

    #[test]
    fn candidates_enqueue_once_per_identity() {
        let (shared, objects) = state();
        let (object, slot) = objects.spawn("prop", normal_class(), None, ObjectFlags::default());
        shared.record_created(&object, slot);
        shared.enqueue_candidate(object.id);
        shared.enqueue_candidate(object.id);
        assert_eq!(shared.candidate_count(), 1);
    }

    #[test]
    fn reconciliation_partitions_candidates() {
        let (shared, objects) = state();
        let class = normal_class();

        let (ready, ready_slot) = objects.spawn("ready", class.clone(), None, ObjectFlags::default());
        let (loading, loading_slot) = objects.spawn(
            "loading",
            class.clone(),
            None,
            ObjectFlags::NEED_POST_LOAD,
        );
        let (dead, dead_slot) = objects.spawn("dead", class, None, ObjectFlags::default());

        shared.record_created(&ready, ready_slot);
        shared.record_created(&loading, loading_slot);
        shared.record_created(&dead, dead_slot);
        shared.enqueue_candidate(ready.id);
        shared.enqueue_candidate(loading.id);
        shared.enqueue_candidate(dead.id);

        objects.release(dead_slot);
        shared.record_deleted(dead.id);

        let batch = shared.take_ready_candidates();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, ready.id);
        // the mid-load entry is retained for the next pass
        assert_eq!(shared.candidate_count(), 1);

        loading.clear_flags(ObjectFlags::NEED_POST_LOAD);
        let batch = shared.take_ready_candidates();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, loading.id);
        assert_eq!(shared.candidate_count(), 0);
    }

    #[test]
    fn notifier_defers_work_only_while_enabled() {
        let (shared, objects) = state();
        let notifier = ObjectNotifier::new(shared.clone());
        let (object, slot) = objects.spawn("prop", normal_class(), None, ObjectFlags::default());

        notifier.notify_object_created(&object, slot);
        assert_eq!(shared.candidate_count(), 0, "disabled: record only");
        notifier.notify_object_deleted(object.id);
        assert!(shared.take_retired().is_empty());

        shared.set_enabled(true);
        let (object, slot) = objects.spawn("prop2", normal_class(), None, ObjectFlags::default());
        notifier.notify_object_created(&object, slot);
        assert_eq!(shared.candidate_count(), 1);
        notifier.notify_object_deleted(object.id);
        assert_eq!(shared.take_retired(), vec![object.id]);
    }

    #[test]
    fn deletions_race_with_reconciliation() {
        let (shared, objects) = state();
        shared.set_enabled(true);
        let notifier = ObjectNotifier::new(shared.clone());

        let mut spawned = Vec::new();
        for index in 0..64 {
            let (object, slot) = objects.spawn(
                format!("obj{index}"),
                normal_class(),
                None,
                ObjectFlags::default(),
            );
            notifier.notify_object_created(&object, slot);
            spawned.push((object, slot));
        }

        let deleter = {
            let notifier = notifier.clone();
            let objects = objects.clone();
            let victims = spawned.clone();
            std::thread::spawn(move || {
                for (object, slot) in victims {
                    objects.release(slot);
                    notifier.notify_object_deleted(object.id);
                }
            })
        };

        let mut attempted = 0;
        for _ in 0..200 {
            attempted += shared.take_ready_candidates().len();
            if shared.candidate_count() == 0 {
                break;
            }
        }
        deleter.join().expect("deleter thread");
        attempted += shared.take_ready_candidates().len();

        assert!(attempted <= 64);
        assert_eq!(shared.candidate_count(), 0);
        for (object, _) in &spawned {
            assert!(!shared.is_object_valid(object.id));
        }
    }
}
