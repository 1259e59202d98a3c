//! Boundary types for the Ember object system.
//!
//! The bridge never owns host objects; it observes their creation and
//! deletion and keeps non-owning records keyed by [`ObjectId`]. The
//! [`ObjectArray`] here is the authoritative slot table the liveness check
//! consults, a minimal stand-in for the host's own object array exposed
//! only at the interface the bridge needs.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mlua::RegistryKey;

/// Opaque identity of a host object. Stable for the object's lifetime and
/// never reused while a registry record for it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Bit set describing an object's lifecycle state. The host flips these
/// during loading and destruction, so they live in an `AtomicU32` on each
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectFlags(pub u32);

impl ObjectFlags {
    pub const CLASS_DEFAULT: ObjectFlags = ObjectFlags(1 << 0);
    pub const ARCHETYPE: ObjectFlags = ObjectFlags(1 << 1);
    pub const NEED_INIT: ObjectFlags = ObjectFlags(1 << 2);
    pub const NEED_POST_LOAD: ObjectFlags = ObjectFlags(1 << 3);
    pub const NEED_POST_LOAD_SUBOBJECTS: ObjectFlags = ObjectFlags(1 << 4);
    pub const ASYNC: ObjectFlags = ObjectFlags(1 << 5);
    pub const ASYNC_LOADING: ObjectFlags = ObjectFlags(1 << 6);
    pub const BEGIN_DESTROYED: ObjectFlags = ObjectFlags(1 << 7);
    pub const FINISH_DESTROYED: ObjectFlags = ObjectFlags(1 << 8);
    pub const UNREACHABLE: ObjectFlags = ObjectFlags(1 << 9);
    /// Class-only flag: a recompiled replacement for this class exists.
    pub const NEWER_VERSION_EXISTS: ObjectFlags = ObjectFlags(1 << 10);

    pub const fn union(self, other: ObjectFlags) -> ObjectFlags {
        ObjectFlags(self.0 | other.0)
    }

    /// True when every bit of `other` is set.
    pub fn contains_all(self, other: ObjectFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set.
    pub fn intersects(self, other: ObjectFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ObjectFlags {
    type Output = ObjectFlags;

    fn bitor(self, rhs: ObjectFlags) -> ObjectFlags {
        self.union(rhs)
    }
}

/// Flags that mark an object (or its class) as still owned by the async
/// loader.
pub const ASYNC_LOAD_FLAGS: ObjectFlags = ObjectFlags::ASYNC.union(ObjectFlags::ASYNC_LOADING);

/// Flags set while the host is tearing an object down.
pub const DESTROY_FLAGS: ObjectFlags =
    ObjectFlags::BEGIN_DESTROYED.union(ObjectFlags::FINISH_DESTROYED);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Ordinary instantiable class.
    Normal,
    /// Asset package container; never receives script behavior.
    Package,
    /// The class-of-classes; never receives script behavior.
    ClassType,
}

/// Capability bits carried by a class descriptor. These replace the
/// marker-interface and `IsA` checks of the reflected host type system with
/// explicit predicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassCapabilities {
    /// The class opted into script binding (static, interface-style path).
    pub script_interface: bool,
    /// Instances are input components eligible for input replacement.
    pub input_component: bool,
    /// Instances are actors under local player control.
    pub player_controlled: bool,
}

/// Resolves the script module name for a class. Stands in for the host's
/// reflective `GetScriptModule` entry point; absent when the class never
/// declared one.
pub type ModuleNameFn = Arc<dyn Fn(&ClassDescriptor) -> String + Send + Sync>;

/// Reflected description of a host class.
pub struct ClassDescriptor {
    pub name: String,
    pub kind: ClassKind,
    /// Whether the class participates in host reflection. Controls which
    /// exported-class partition a static export lands in.
    pub reflected: bool,
    pub capabilities: ClassCapabilities,
    flags: AtomicU32,
    module_name_entry: Option<ModuleNameFn>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>, kind: ClassKind) -> Self {
        ClassDescriptor {
            name: name.into(),
            kind,
            reflected: true,
            capabilities: ClassCapabilities::default(),
            flags: AtomicU32::new(0),
            module_name_entry: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: ClassCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_script_interface(mut self) -> Self {
        self.capabilities.script_interface = true;
        self
    }

    pub fn with_module_entry(mut self, entry: ModuleNameFn) -> Self {
        self.module_name_entry = Some(entry);
        self
    }

    /// Fixed module name convenience for classes whose script module is
    /// known statically.
    pub fn with_module_name(self, module: impl Into<String>) -> Self {
        let module = module.into();
        self.with_module_entry(Arc::new(move |_| module.clone()))
    }

    pub fn module_name_entry(&self) -> Option<ModuleNameFn> {
        self.module_name_entry.clone()
    }

    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.0, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.0, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("reflected", &self.reflected)
            .field("flags", &self.flags())
            .finish()
    }
}

/// A live host object as seen across the bridge boundary.
#[derive(Debug)]
pub struct HostObject {
    pub id: ObjectId,
    pub name: String,
    pub class: Arc<ClassDescriptor>,
    /// Containing object, when nested. The chain only points upward, so
    /// `Arc` cycles cannot form.
    pub outer: Option<Arc<HostObject>>,
    flags: AtomicU32,
}

impl HostObject {
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.0, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.0, Ordering::AcqRel);
    }

    /// Path-style name including the outer chain, e.g. `Level.TemplateTree:Button`.
    /// Used by the binder's archetype filters.
    pub fn qualified_name(&self) -> String {
        let mut segments = Vec::new();
        let mut cursor = self.outer.as_deref();
        while let Some(outer) = cursor {
            segments.push(outer.name.as_str());
            cursor = outer.outer.as_deref();
        }
        segments.reverse();
        if segments.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", segments.join("."), self.name)
        }
    }
}

/// Authoritative identity-to-slot table owned by the host. The registry's
/// liveness check re-validates every cached slot against this table.
pub struct ObjectArray {
    slots: RwLock<Vec<Option<Arc<HostObject>>>>,
    free: Mutex<Vec<usize>>,
    next_id: AtomicU64,
}

impl ObjectArray {
    pub fn new() -> Arc<Self> {
        Arc::new(ObjectArray {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Creates an object in the first free slot and returns it with its slot
    /// index. Slots are reused, which is exactly why the liveness check
    /// compares identities and not just slot occupancy.
    pub fn spawn(
        self: &Arc<Self>,
        name: impl Into<String>,
        class: Arc<ClassDescriptor>,
        outer: Option<Arc<HostObject>>,
        flags: ObjectFlags,
    ) -> (Arc<HostObject>, usize) {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = ObjectId(NonZeroU64::new(raw).expect("object id counter starts at 1"));
        let object = Arc::new(HostObject {
            id,
            name: name.into(),
            class,
            outer,
            flags: AtomicU32::new(flags.0),
        });

        let slot = {
            let reused = self.free.lock().expect("free list poisoned").pop();
            let mut slots = self.slots.write().expect("object array poisoned");
            match reused {
                Some(slot) => {
                    slots[slot] = Some(object.clone());
                    slot
                }
                None => {
                    slots.push(Some(object.clone()));
                    slots.len() - 1
                }
            }
        };
        (object, slot)
    }

    pub fn object_at(&self, slot: usize) -> Option<Arc<HostObject>> {
        self.slots
            .read()
            .expect("object array poisoned")
            .get(slot)
            .and_then(|entry| entry.clone())
    }

    /// Releases a slot back to the free list, returning the object that
    /// occupied it.
    pub fn release(&self, slot: usize) -> Option<Arc<HostObject>> {
        let taken = {
            let mut slots = self.slots.write().expect("object array poisoned");
            slots.get_mut(slot).and_then(|entry| entry.take())
        };
        if taken.is_some() {
            self.free.lock().expect("free list poisoned").push(slot);
        }
        taken
    }
}

/// A loaded world as the bridge sees it: the map name plus the objects the
/// map-loaded hook offers for binding.
#[derive(Debug, Default)]
pub struct World {
    pub name: String,
    pub game_instance: Option<Arc<HostObject>>,
    pub subsystems: Vec<Arc<HostObject>>,
}

impl World {
    pub fn new(name: impl Into<String>) -> Self {
        World {
            name: name.into(),
            ..World::default()
        }
    }
}

/// Out-of-band request to bind a specific module to instances of a class
/// that does not carry the script-interface capability. Set externally
/// before the object is spawned, consumed (read, never retained) by the
/// binder.
pub struct DynamicBinding {
    pub class_name: String,
    pub module_name: String,
    /// Shared so the binder can copy the request out of the lock before it
    /// dispatches; a bind must never run while the request is held.
    pub initializer: Option<Arc<RegistryKey>>,
}

impl DynamicBinding {
    /// Whether this request applies to `class`.
    pub fn targets(&self, class: &ClassDescriptor) -> bool {
        !self.module_name.is_empty() && self.class_name == class.name
    }
}
