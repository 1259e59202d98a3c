//! Outbound collaborator interfaces.
//!
//! The bridge drives two collaborators it does not implement: the script
//! manager that performs the actual module attachment, and the grab bag of
//! host services (reflection registry, delegate bridge, property creator,
//! collision helper, object referencer) it must notify at fixed lifecycle
//! points. Both are injected at construction; every call is fire-and-forget
//! from the bridge's point of view.

use std::sync::Arc;

use mlua::{Lua, RegistryKey, Result as LuaResult, Value};

use crate::host::{ClassDescriptor, HostObject, ObjectId, World};

/// The binding backend. Implementations attach script modules to host
/// objects and own the per-object script instances.
pub trait ScriptManager {
    /// Attaches `module` to `object`. Returns whether the bind took effect.
    fn bind(
        &mut self,
        lua: &Lua,
        object: &Arc<HostObject>,
        class: &Arc<ClassDescriptor>,
        module: &str,
        initializer: Option<&RegistryKey>,
    ) -> bool;

    fn on_map_loaded(&mut self, lua: &Lua, world: &World);

    fn on_actor_spawned(&mut self, lua: &Lua, actor: &Arc<HostObject>);

    /// Tears down the script instance for a deleted object.
    fn notify_object_deleted(&mut self, lua: &Lua, id: ObjectId, is_class: bool);

    /// Reroutes input events from `input` (owned by `actor`) into script
    /// handlers.
    fn replace_inputs(&mut self, lua: &Lua, actor: &Arc<HostObject>, input: &Arc<HostObject>);

    fn cleanup(&mut self, full: bool);
}

/// Builds a fresh manager each time the bridge is (re-)initialized.
pub type ManagerFactory = Box<dyn Fn() -> Box<dyn ScriptManager>>;

/// Host-side services notified at fixed lifecycle points. Every method has
/// a no-op default so hosts implement only what they carry.
#[allow(unused_variables)]
pub trait HostCollaborators {
    /// Reflection-registry deletion hook. Returns whether the deleted object
    /// was itself a class.
    fn reflection_object_deleted(&self, id: ObjectId) -> bool {
        false
    }

    fn reflection_cleanup(&self) {}

    fn delegate_object_deleted(&self, id: ObjectId) {}

    fn delegate_cleanup(&self, full: bool) {}

    /// Clears the dynamic-property-creation cache.
    fn property_cache_clear(&self) {}

    fn referencer_cleanup(&self) {}

    /// Registers collision-related enum tables into a fresh interpreter.
    fn collision_setup(&self, lua: &Lua) -> LuaResult<()> {
        Ok(())
    }

    fn collision_cleanup(&self) {}

    /// Builds the default-parameter collection after engine init.
    fn create_default_params(&self) {}

    /// GC tuning override. Return `true` to suppress the bridge's default
    /// tuning.
    fn configure_gc(&self, lua: &Lua) -> bool {
        false
    }

    /// Optional companion-module setup (socket support, debug bridge). Runs
    /// last during state creation.
    fn companion_setup(&self, lua: &Lua) -> LuaResult<()> {
        Ok(())
    }

    /// Interpreter memory accounting, reported as byte deltas.
    fn lua_memory_delta(&self, delta: i64) {}

    /// Reflection-layer registration of a class into the interpreter.
    fn register_class(&self, lua: &Lua, name: &str) -> LuaResult<()> {
        Ok(())
    }

    fn unregister_class(&self, name: &str) {}

    fn register_enum(&self, lua: &Lua, name: &str) -> LuaResult<()> {
        Ok(())
    }

    /// Reflection-layer property access for the script globals.
    fn get_property<'lua>(
        &self,
        lua: &'lua Lua,
        target: Value<'lua>,
        name: &str,
    ) -> LuaResult<Value<'lua>> {
        Ok(Value::Nil)
    }

    fn set_property<'lua>(
        &self,
        lua: &'lua Lua,
        target: Value<'lua>,
        name: &str,
        value: Value<'lua>,
    ) -> LuaResult<()> {
        Ok(())
    }

    fn load_object<'lua>(&self, lua: &'lua Lua, path: &str) -> LuaResult<Value<'lua>> {
        Ok(Value::Nil)
    }

    fn load_class<'lua>(&self, lua: &'lua Lua, path: &str) -> LuaResult<Value<'lua>> {
        Ok(Value::Nil)
    }

    fn new_object<'lua>(&self, lua: &'lua Lua, class_path: &str) -> LuaResult<Value<'lua>> {
        Ok(Value::Nil)
    }
}

/// Default collaborator set with every hook left at its no-op.
#[derive(Debug, Default)]
pub struct NullCollaborators;

impl HostCollaborators for NullCollaborators {}
