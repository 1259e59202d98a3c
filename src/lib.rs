//! Lua scripting bridge for the Ember engine: object-to-module binding,
//! interpreter lifecycle, and the host notification fan-out.
//!
//! The entry point is [`LuaContext`]. A host constructs one on the thread
//! that will own the interpreter, hands it a [`ManagerFactory`] for the
//! binding backend and a [`HostCollaborators`] implementation for its own
//! services, then relays engine lifecycle events into it. Loader threads
//! report object creation and deletion through the cloneable
//! [`ObjectNotifier`]; the context reconciles their queues on the next
//! async-loading flush.

mod binder;
pub mod context;
pub mod host;
pub mod manager;
pub mod settings;
pub mod shared;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::{
    context_with_roots, ContextEvent, CustomLoader, ExportedClass, ExportedEnum, ExportedFunction,
    LuaContext, ThreadRef,
};
pub use host::{
    ClassCapabilities, ClassDescriptor, ClassKind, DynamicBinding, HostObject, ObjectArray,
    ObjectFlags, ObjectId, World,
};
pub use manager::{HostCollaborators, ManagerFactory, NullCollaborators, ScriptManager};
pub use settings::{BridgeSettings, GcTuning, SettingsError};
pub use shared::{ObjectNotifier, SharedState};
