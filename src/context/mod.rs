//! The bridge lifecycle manager.
//!
//! [`LuaContext`] owns the interpreter, decides per object whether a script
//! module should be attached, and relays every host lifecycle event to the
//! injected script manager and collaborators. The context lives on one
//! thread; notifications arriving from loader threads are funneled through
//! [`SharedState`](crate::shared::SharedState) and reconciled here on the
//! next async-loading flush.

pub(crate) mod coroutines;
pub(crate) mod exports;
pub(crate) mod setup;

use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use mlua::{Lua, RegistryKey, Thread};

use crate::binder::{Binder, ModuleResolution};
use crate::host::{
    ClassKind, HostObject, ObjectArray, ObjectFlags, ObjectId, World, DESTROY_FLAGS,
};
use crate::manager::{HostCollaborators, ManagerFactory, ScriptManager};
use crate::settings::BridgeSettings;
use crate::shared::{ObjectNotifier, SharedState};

pub use coroutines::ThreadRef;
pub use exports::{ExportedClass, ExportedEnum, ExportedFunction};
pub use setup::CustomLoader;

use coroutines::CoroutineRegistry;
use exports::ExportTables;
use setup::BuiltinSources;

/// Lifecycle notifications delivered to registered listeners, in the order
/// the bridge reaches each point.
#[derive(Clone, Copy)]
pub enum ContextEvent<'a> {
    /// The interpreter exists but no static export has been registered yet.
    PreStaticExport,
    /// State creation finished; the interpreter is fully configured.
    StateCreated(&'a Lua),
    /// The bridge is enabled and bindings may proceed.
    Initialized,
    PreCleanup { full: bool },
    PostCleanup { full: bool },
}

type Listener = Box<dyn Fn(ContextEvent<'_>)>;

pub struct LuaContext {
    settings: BridgeSettings,
    shared: Arc<SharedState>,
    lua: Option<Lua>,
    manager: Option<Box<dyn ScriptManager>>,
    manager_factory: ManagerFactory,
    collaborators: Rc<dyn HostCollaborators>,
    binder: Binder,
    coroutines: CoroutineRegistry,
    exports: ExportTables,
    builtin_sources: BuiltinSources,
    custom_loader: Option<CustomLoader>,
    listeners: Vec<Listener>,
    /// Game instances already bound; each binds at most once per lifetime.
    game_instances: HashSet<ObjectId>,
    /// Input components waiting for their owner's inputs to be rerouted on
    /// the next world tick.
    candidate_inputs: Vec<Arc<HostObject>>,
    tick_armed: bool,
    /// Spawned-actor notifications are forwarded only between map load and
    /// world cleanup.
    actor_spawn_hook: bool,
}

impl LuaContext {
    pub fn new(
        settings: BridgeSettings,
        objects: Arc<ObjectArray>,
        manager_factory: ManagerFactory,
        collaborators: Rc<dyn HostCollaborators>,
    ) -> Result<Self> {
        let binder = Binder::new(&settings)?;
        let shared = SharedState::new(objects, settings.debug_object_names);
        Ok(LuaContext {
            settings,
            shared,
            lua: None,
            manager: None,
            manager_factory,
            collaborators,
            binder,
            coroutines: CoroutineRegistry::default(),
            exports: ExportTables::default(),
            builtin_sources: BuiltinSources::default(),
            custom_loader: None,
            listeners: Vec::new(),
            game_instances: HashSet::new(),
            candidate_inputs: Vec::new(),
            tick_armed: false,
            actor_spawn_hook: false,
        })
    }

    pub fn notifier(&self) -> ObjectNotifier {
        ObjectNotifier::new(self.shared.clone())
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Non-null between state creation and full cleanup.
    pub fn lua(&self) -> Option<&Lua> {
        self.lua.as_ref()
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn add_listener(&mut self, listener: impl Fn(ContextEvent<'_>) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn emit(&self, event: ContextEvent<'_>) {
        for listener in &self.listeners {
            listener(event);
        }
    }

    // ---- static exports and module sources -------------------------------

    /// Effective on the next state creation; same-name exports are
    /// last-write-wins.
    pub fn export_class(&mut self, class: Arc<dyn ExportedClass>) {
        self.exports.add_class(class);
    }

    pub fn export_function(&mut self, function: Arc<dyn ExportedFunction>) {
        self.exports.add_function(function);
    }

    pub fn export_enum(&mut self, exported: Arc<dyn ExportedEnum>) {
        self.exports.add_enum(exported);
    }

    pub fn find_exported_class(&self, name: &str) -> Option<Arc<dyn ExportedClass>> {
        self.exports.find_class(name)
    }

    pub fn find_exported_reflected_class(&self, name: &str) -> Option<Arc<dyn ExportedClass>> {
        self.exports.find_reflected_class(name)
    }

    pub fn find_exported_non_reflected_class(&self, name: &str) -> Option<Arc<dyn ExportedClass>> {
        self.exports.find_non_reflected_class(name)
    }

    /// Adds (or replaces) an in-memory module source served by the builtin
    /// searcher.
    pub fn register_builtin_module(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.builtin_sources
            .borrow_mut()
            .insert(name.into(), source.into());
    }

    /// Installs a loader consulted before the filesystem searcher.
    pub fn set_custom_loader(&mut self, loader: CustomLoader) {
        self.custom_loader = Some(loader);
    }

    // ---- state lifecycle -------------------------------------------------

    /// Builds and configures the interpreter. Idempotent; a second call with
    /// a live state does nothing. A failure at any step is logged and leaves
    /// the context without a state.
    pub fn create_state(&mut self) {
        if self.lua.is_some() {
            return;
        }

        let lua = match setup::new_interpreter() {
            Ok(lua) => lua,
            Err(err) => {
                log::error!("failed to create Lua state: {err}");
                return;
            }
        };

        let configured: mlua::Result<()> = (|| {
            setup::install_searchers(
                &lua,
                self.custom_loader.clone(),
                self.settings.script_roots.clone(),
                self.builtin_sources.clone(),
            )?;
            setup::create_weak_registry_tables(&lua)?;
            setup::install_namespace(&lua, &self.settings.namespace)?;
            setup::install_globals(&lua, self.collaborators.clone())?;
            self.collaborators.collision_setup(&lua)?;
            setup::apply_gc_policy(&lua, self.collaborators.as_ref(), &self.settings.gc);
            setup::extend_package_path(&lua, &self.settings.script_roots)?;
            Ok(())
        })();
        if let Err(err) = configured {
            log::error!("failed to configure Lua state: {err}");
            return;
        }

        self.emit(ContextEvent::PreStaticExport);
        if let Err(err) = self.collaborators.register_class(&lua, "Object") {
            log::error!("failed to register root class: {err}");
            return;
        }
        if let Err(err) = self.exports.register_all(&lua) {
            log::error!("failed to register static exports: {err}");
            return;
        }
        if let Err(err) = self.collaborators.companion_setup(&lua) {
            log::warn!("companion module setup failed: {err}");
        }

        self.collaborators.lua_memory_delta(lua.used_memory() as i64);
        self.lua = Some(lua);
        if let Some(lua) = &self.lua {
            self.emit(ContextEvent::StateCreated(lua));
        }
        log::info!("Lua state created");
    }

    /// Brings the bridge up: interpreter, fresh script manager, enabled
    /// binding. Idempotent while enabled.
    pub fn initialize(&mut self) {
        if self.is_enabled() {
            return;
        }
        self.create_state();
        self.manager = Some((self.manager_factory)());
        if self.lua.is_some() {
            self.collaborators.property_cache_clear();
            self.shared.set_enabled(true);
            self.emit(ContextEvent::Initialized);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lua.is_some() && self.shared.is_enabled()
    }

    /// Toggles the bridge. Enabling initializes; disabling runs a full
    /// cleanup.
    pub fn set_enable(&mut self, enable: bool) {
        if enable {
            self.initialize();
        } else {
            self.cleanup(true, None);
        }
    }

    /// Tears the bridge down. Partial cleanup keeps the interpreter and only
    /// drives a garbage-collection pass; full cleanup closes the state and
    /// resets every per-lifetime structure. No-op when the bridge is not
    /// enabled.
    pub fn cleanup(&mut self, full: bool, world: Option<&World>) {
        if !self.shared.is_enabled() || self.lua.is_none() {
            return;
        }
        if let Some(world) = world {
            log::debug!("cleanup (full={full}) for world {}", world.name);
        }
        self.emit(ContextEvent::PreCleanup { full });

        if !full {
            if let Some(lua) = &self.lua {
                let before = lua.used_memory();
                for _ in 0..2 {
                    if let Err(err) = lua.gc_collect() {
                        log::warn!("garbage collection failed: {err}");
                    }
                }
                let after = lua.used_memory();
                self.collaborators
                    .lua_memory_delta(after as i64 - before as i64);
            }
        } else {
            self.shared.set_enabled(false);

            let released = self.lua.as_ref().map(Lua::used_memory).unwrap_or(0);
            self.lua = None;
            self.collaborators.lua_memory_delta(-(released as i64));

            self.collaborators.collision_cleanup();
            self.collaborators.referencer_cleanup();
            self.coroutines.cleanup();
            self.binder.clear_cache();
            self.collaborators.delegate_cleanup(full);
            if let Some(mut manager) = self.manager.take() {
                manager.cleanup(full);
            }
            self.collaborators.property_cache_clear();
            self.collaborators.reflection_cleanup();
            self.game_instances.clear();
            self.shared.discard_queues();
            self.candidate_inputs.clear();
            self.tick_armed = false;
            self.actor_spawn_hook = false;
            log::info!("Lua state closed");
        }

        self.emit(ContextEvent::PostCleanup { full });
    }

    // ---- binding ---------------------------------------------------------

    /// Attempts to attach a script module to `object`. Returns whether a
    /// bind was dispatched. Objects that cannot bind right now but might
    /// later (off-thread discovery, active async loading) are queued as
    /// candidates instead.
    pub fn try_bind(&mut self, object: &Arc<HostObject>) -> bool {
        if !self.shared.is_enabled() || !self.shared.is_object_valid(object.id) {
            return false;
        }
        if object
            .flags()
            .intersects(ObjectFlags::CLASS_DEFAULT | ObjectFlags::ARCHETYPE)
        {
            return false;
        }

        let class = object.class.clone();
        if !matches!(class.kind, ClassKind::Normal) {
            return false;
        }
        if class.flags().intersects(ObjectFlags::NEWER_VERSION_EXISTS) {
            // superseded by a recompiled version
            return false;
        }

        if !self.shared.is_owning_thread() || self.shared.is_async_loading() {
            self.shared.enqueue_candidate(object.id);
            return false;
        }

        if !class.capabilities.script_interface {
            // only an explicit dynamic request binds a class without the
            // script interface; copy the request out of the lock, because
            // the bind below runs script code that may replace it
            let request = self.shared.with_dynamic_binding(|binding| match binding {
                Some(binding) if binding.targets(&class) => {
                    Some((binding.module_name.clone(), binding.initializer.clone()))
                }
                _ => None,
            });
            let Some((module, initializer)) = request else {
                return false;
            };
            return self.dispatch_bind(object, &module, initializer.as_deref());
        }

        if self.binder.is_template_nested(object) {
            return false;
        }
        let qualified = object.qualified_name();
        if self.binder.matches_archetype_filter(&qualified) {
            log::warn!("filtered template object {qualified}");
            return false;
        }

        let module = match self.binder.resolve_module_name(&class) {
            ModuleResolution::Unbound | ModuleResolution::Empty => return false,
            ModuleResolution::Module(module) => module,
        };

        let initializer = self.shared.with_dynamic_binding(|binding| match binding {
            Some(binding) if binding.targets(&class) => {
                if binding.module_name != module {
                    log::warn!(
                        "dynamic binding '{}' for class {} ignored; static binding '{}' wins",
                        binding.module_name,
                        class.name,
                        module
                    );
                }
                binding.initializer.clone()
            }
            _ => None,
        });
        self.dispatch_bind(object, &module, initializer.as_deref())
    }

    fn dispatch_bind(
        &mut self,
        object: &Arc<HostObject>,
        module: &str,
        initializer: Option<&RegistryKey>,
    ) -> bool {
        let Some(lua) = self.lua.as_ref() else {
            return false;
        };
        let Some(manager) = self.manager.as_mut() else {
            return false;
        };
        manager.bind(lua, object, &object.class, module, initializer)
    }

    // ---- host object events ----------------------------------------------

    /// Owning-thread creation notification: records the identity, attempts a
    /// bind, and tracks input components owned by player-controlled objects
    /// for input replacement on the next tick.
    pub fn notify_object_created(&mut self, object: &Arc<HostObject>, slot: usize) {
        self.shared.record_created(object, slot);
        if !self.shared.is_enabled() {
            return;
        }

        self.try_bind(object);

        if object
            .flags()
            .intersects(ObjectFlags::CLASS_DEFAULT | ObjectFlags::ARCHETYPE)
        {
            return;
        }
        if !object.class.capabilities.input_component {
            return;
        }
        let player_owned = object
            .outer
            .as_ref()
            .map_or(false, |outer| outer.class.capabilities.player_controlled);
        if player_owned {
            if !self
                .candidate_inputs
                .iter()
                .any(|candidate| candidate.id == object.id)
            {
                self.candidate_inputs.push(object.clone());
            }
            self.tick_armed = true;
        }
    }

    /// Owning-thread deletion notification: tears down the script side, then
    /// removes the identity record.
    pub fn notify_object_deleted(&mut self, id: ObjectId) {
        if !self.shared.is_enabled() {
            self.shared.record_deleted(id);
            return;
        }

        if let Some(name) = self.shared.debug_name(id) {
            log::debug!("object deleted: {name}");
        }

        self.teardown_object(id);

        if !self.candidate_inputs.is_empty() {
            self.candidate_inputs.retain(|candidate| candidate.id != id);
            if self.candidate_inputs.is_empty() {
                self.tick_armed = false;
            }
        }

        self.shared.record_deleted(id);
    }

    fn teardown_object(&mut self, id: ObjectId) {
        let is_class = self.collaborators.reflection_object_deleted(id);
        if let (Some(lua), Some(manager)) = (self.lua.as_ref(), self.manager.as_mut()) {
            manager.notify_object_deleted(lua, id, is_class);
        }
        self.collaborators.delegate_object_deleted(id);
    }

    /// Reconciliation point, run on the owning thread whenever the host
    /// flushes asynchronous loading: retired deletions are torn down first,
    /// then every candidate that finished loading gets its bind attempt.
    pub fn on_async_loading_flush_update(&mut self) {
        if !self.shared.is_enabled() {
            return;
        }
        for id in self.shared.take_retired() {
            self.teardown_object(id);
        }
        for object in self.shared.take_ready_candidates() {
            self.try_bind(&object);
        }
    }

    // ---- world and engine events -----------------------------------------

    /// Map-load notification. Binds the world's game instance and its
    /// subsystems exactly once per lifetime, tells the manager, and starts
    /// forwarding spawned-actor notifications.
    pub fn post_load_map(&mut self, world: &World) {
        if !self.shared.is_enabled() {
            return;
        }

        if let Some(instance) = world.game_instance.clone() {
            if self.game_instances.insert(instance.id) {
                self.try_bind(&instance);
                for subsystem in &world.subsystems {
                    self.try_bind(subsystem);
                }
            }
        }

        if let (Some(lua), Some(manager)) = (self.lua.as_ref(), self.manager.as_mut()) {
            manager.on_map_loaded(lua, world);
        }
        self.actor_spawn_hook = true;
    }

    pub fn on_actor_spawned(&mut self, actor: &Arc<HostObject>) {
        if !self.actor_spawn_hook {
            return;
        }
        if let (Some(lua), Some(manager)) = (self.lua.as_ref(), self.manager.as_mut()) {
            manager.on_actor_spawned(lua, actor);
        }
    }

    /// World teardown. A pending engine exit escalates this to a full
    /// cleanup; otherwise the interpreter survives with a collection pass.
    pub fn on_world_cleanup(&mut self, world: &World) {
        if !self.shared.is_enabled() {
            return;
        }
        self.actor_spawn_hook = false;
        let full = self.shared.is_exit_requested();
        self.cleanup(full, Some(world));
    }

    /// Engine-startup notification. Auto-starts the bridge when configured
    /// and builds the host's default-parameter collection.
    pub fn on_post_engine_init(&mut self) {
        if self.settings.auto_startup {
            self.set_enable(true);
        }
        self.collaborators.create_default_params();
    }

    /// Engine shutdown: unconditional full cleanup.
    pub fn on_pre_exit(&mut self) {
        self.shared.request_engine_exit();
        self.cleanup(true, None);
    }

    /// Crash hook. Logs the script call stack when invoked on the owning
    /// thread with a live interpreter; any other situation only notes why
    /// no stack is available.
    pub fn on_crash(&self) {
        if !self.shared.is_owning_thread() {
            log::warn!("crash reported off the interpreter thread; no script stack");
            return;
        }
        match &self.lua {
            None => log::warn!("crash before Lua state creation; no script stack"),
            Some(lua) => {
                let stack = setup::lua_callstack(lua);
                if stack.is_empty() {
                    log::error!("script call stack: <no active Lua frames>");
                } else {
                    log::error!("script call stack:\n{stack}");
                }
            }
        }
    }

    /// Per-tick drain of queued input components: each still-live component
    /// gets its owner's input events rerouted into script handlers, then the
    /// queue empties and disarms.
    pub fn on_world_tick_start(&mut self) {
        if !self.tick_armed {
            return;
        }
        let inputs = std::mem::take(&mut self.candidate_inputs);
        self.tick_armed = false;

        for input in inputs {
            if input.flags().intersects(DESTROY_FLAGS | ObjectFlags::UNREACHABLE) {
                continue;
            }
            if !self.shared.is_object_valid(input.id) {
                continue;
            }
            let Some(actor) = input.outer.clone() else {
                continue;
            };
            if let (Some(lua), Some(manager)) = (self.lua.as_ref(), self.manager.as_mut()) {
                manager.replace_inputs(lua, &actor, &input);
            }
        }
    }

    // ---- play-session hooks ----------------------------------------------

    /// Editor play session is about to start: bring the bridge up.
    pub fn pre_begin_play(&mut self) {
        self.set_enable(true);
    }

    /// The session's world finished starting; treat it as a map load.
    pub fn post_play_started(&mut self, world: &World) {
        self.post_load_map(world);
    }

    /// Editor play session ended: tear the bridge down.
    pub fn pre_play_ended(&mut self) {
        self.set_enable(false);
    }

    // ---- coroutines ------------------------------------------------------

    pub fn add_thread(&mut self, thread: &Thread) -> Option<ThreadRef> {
        let lua = self.lua.as_ref()?;
        match self.coroutines.add_thread(lua, thread) {
            Ok(reference) => Some(reference),
            Err(err) => {
                log::warn!("failed to register coroutine: {err}");
                None
            }
        }
    }

    pub fn find_thread(&self, thread: &Thread) -> Option<ThreadRef> {
        self.coroutines.find_thread(thread)
    }

    /// Resumes a registered coroutine; unknown references are ignored.
    pub fn resume_thread(&mut self, reference: ThreadRef) {
        let Some(lua) = self.lua.as_ref() else {
            return;
        };
        if let Err(err) = self.coroutines.resume_thread(lua, reference) {
            log::warn!("coroutine resume failed: {err}");
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_thread_count(&self) -> usize {
        self.coroutines.len()
    }
}

/// Convenience constructor wiring default settings with explicit script
/// roots, for hosts that do not carry a settings file.
pub fn context_with_roots(
    roots: Vec<PathBuf>,
    objects: Arc<ObjectArray>,
    manager_factory: ManagerFactory,
    collaborators: Rc<dyn HostCollaborators>,
) -> Result<LuaContext> {
    let settings = BridgeSettings {
        script_roots: roots,
        ..BridgeSettings::default()
    };
    LuaContext::new(settings, objects, manager_factory, collaborators)
}
