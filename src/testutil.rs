//! Shared fixtures for the crate's tests: a script manager that records
//! every outbound call, collaborators that count their invocations, and
//! class/object builders.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use mlua::{Lua, RegistryKey};

use crate::host::{
    ClassCapabilities, ClassDescriptor, ClassKind, HostObject, ObjectId, World,
};
use crate::manager::{HostCollaborators, ManagerFactory, ScriptManager};

pub(crate) type CallLog = Rc<RefCell<Vec<String>>>;

pub(crate) struct RecordingManager {
    log: CallLog,
}

impl ScriptManager for RecordingManager {
    fn bind(
        &mut self,
        _lua: &Lua,
        object: &Arc<HostObject>,
        _class: &Arc<ClassDescriptor>,
        module: &str,
        initializer: Option<&RegistryKey>,
    ) -> bool {
        let suffix = if initializer.is_some() { " +init" } else { "" };
        self.log
            .borrow_mut()
            .push(format!("bind {} -> {module}{suffix}", object.name));
        true
    }

    fn on_map_loaded(&mut self, _lua: &Lua, world: &World) {
        self.log.borrow_mut().push(format!("map {}", world.name));
    }

    fn on_actor_spawned(&mut self, _lua: &Lua, actor: &Arc<HostObject>) {
        self.log.borrow_mut().push(format!("spawned {}", actor.name));
    }

    fn notify_object_deleted(&mut self, _lua: &Lua, id: ObjectId, is_class: bool) {
        self.log
            .borrow_mut()
            .push(format!("deleted #{} class={is_class}", id.get()));
    }

    fn replace_inputs(&mut self, _lua: &Lua, actor: &Arc<HostObject>, input: &Arc<HostObject>) {
        self.log
            .borrow_mut()
            .push(format!("inputs {} <- {}", actor.name, input.name));
    }

    fn cleanup(&mut self, full: bool) {
        self.log.borrow_mut().push(format!("cleanup full={full}"));
    }
}

/// Factory plus the log the produced managers write into.
pub(crate) fn recording_factory() -> (ManagerFactory, CallLog) {
    let log: CallLog = Rc::new(RefCell::new(Vec::new()));
    let manager_log = log.clone();
    let factory: ManagerFactory = Box::new(move || {
        Box::new(RecordingManager {
            log: manager_log.clone(),
        })
    });
    (factory, log)
}

pub(crate) fn log_contains(log: &CallLog, needle: &str) -> bool {
    log.borrow().iter().any(|entry| entry.contains(needle))
}

pub(crate) fn log_count(log: &CallLog, needle: &str) -> usize {
    log.borrow()
        .iter()
        .filter(|entry| entry.contains(needle))
        .count()
}

#[derive(Default)]
pub(crate) struct CountingCollaborators {
    pub(crate) calls: RefCell<Vec<String>>,
    pub(crate) memory_deltas: RefCell<Vec<i64>>,
}

impl HostCollaborators for CountingCollaborators {
    fn reflection_object_deleted(&self, _id: ObjectId) -> bool {
        self.calls.borrow_mut().push("reflection_deleted".into());
        false
    }

    fn reflection_cleanup(&self) {
        self.calls.borrow_mut().push("reflection_cleanup".into());
    }

    fn delegate_object_deleted(&self, _id: ObjectId) {
        self.calls.borrow_mut().push("delegate_deleted".into());
    }

    fn delegate_cleanup(&self, full: bool) {
        self.calls
            .borrow_mut()
            .push(format!("delegate_cleanup({full})"));
    }

    fn property_cache_clear(&self) {
        self.calls.borrow_mut().push("property_cache_clear".into());
    }

    fn referencer_cleanup(&self) {
        self.calls.borrow_mut().push("referencer_cleanup".into());
    }

    fn collision_setup(&self, _lua: &Lua) -> mlua::Result<()> {
        self.calls.borrow_mut().push("collision_setup".into());
        Ok(())
    }

    fn collision_cleanup(&self) {
        self.calls.borrow_mut().push("collision_cleanup".into());
    }

    fn create_default_params(&self) {
        self.calls.borrow_mut().push("default_params".into());
    }

    fn register_class(&self, _lua: &Lua, name: &str) -> mlua::Result<()> {
        self.calls.borrow_mut().push(format!("register_class({name})"));
        Ok(())
    }

    fn lua_memory_delta(&self, delta: i64) {
        self.memory_deltas.borrow_mut().push(delta);
    }
}

pub(crate) fn script_class(name: &str, module: &str) -> Arc<ClassDescriptor> {
    Arc::new(
        ClassDescriptor::new(name, ClassKind::Normal)
            .with_script_interface()
            .with_module_name(module),
    )
}

pub(crate) fn plain_class(name: &str) -> Arc<ClassDescriptor> {
    Arc::new(ClassDescriptor::new(name, ClassKind::Normal))
}

pub(crate) fn input_component_class() -> Arc<ClassDescriptor> {
    Arc::new(
        ClassDescriptor::new("InputComponent", ClassKind::Normal).with_capabilities(
            ClassCapabilities {
                input_component: true,
                ..ClassCapabilities::default()
            },
        ),
    )
}

pub(crate) fn pawn_class() -> Arc<ClassDescriptor> {
    Arc::new(
        ClassDescriptor::new("Pawn", ClassKind::Normal).with_capabilities(ClassCapabilities {
            player_controlled: true,
            ..ClassCapabilities::default()
        }),
    )
}
