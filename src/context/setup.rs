//! Interpreter construction: std libs, module searchers, weak-value
//! registry tables, the host namespace, global functions, GC tuning and
//! package-path extension. Everything here runs on the owning thread while
//! the state is being created.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::{
    Error as LuaError, Function, Lua, LuaOptions, Result as LuaResult, StdLib, Table, Value,
    Variadic,
};
use thiserror::Error;

use crate::manager::HostCollaborators;
use crate::settings::GcTuning;

/// Registry names of the weak-value tables the marshalling layer uses to
/// deduplicate wrapped host values.
pub(crate) const WEAK_TABLE_NAMES: [&str; 4] =
    ["ObjectMap", "StructMap", "ScriptContainerMap", "ArrayMap"];

/// Registry name of the class whitelist maintained by the script-facing
/// whitelist globals.
pub(crate) const CLASS_WHITELIST: &str = "ClassWhitelist";

/// Source provider for the custom (highest-priority) module searcher.
pub type CustomLoader = Rc<dyn Fn(&str) -> Option<String>>;

/// Builtin module sources registered before interpreter creation.
pub(crate) type BuiltinSources = Rc<RefCell<BTreeMap<String, String>>>;

#[derive(Debug, Error)]
pub(crate) enum ScriptSourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub(crate) fn new_interpreter() -> LuaResult<Lua> {
    Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
}

/// Creates the four weak-value singletons in the interpreter registry.
/// Entries vanish as soon as the collector reclaims the wrapped value, so
/// these tables never keep a host value alive.
pub(crate) fn create_weak_registry_tables(lua: &Lua) -> LuaResult<()> {
    for name in WEAK_TABLE_NAMES {
        let table = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.set("__mode", "v")?;
        table.set_metatable(Some(meta));
        lua.set_named_registry_value(name, table)?;
    }
    Ok(())
}

/// Creates the top-level namespace table host types are registered under.
pub(crate) fn install_namespace(lua: &Lua, namespace: &str) -> LuaResult<()> {
    let table = lua.create_table()?;
    lua.globals().set(namespace, table)?;
    Ok(())
}

/// Inserts `searcher` into `package.searchers` at `index` (one-based),
/// shifting existing entries up.
pub(crate) fn add_searcher(lua: &Lua, searcher: Function, index: usize) -> LuaResult<()> {
    let package: Table = lua.globals().get("package")?;
    let searchers: Table = package.get("searchers")?;
    let len = searchers.raw_len();
    let mut slot = len + 1;
    while slot > index {
        let previous: Value = searchers.raw_get(slot - 1)?;
        searchers.raw_set(slot, previous)?;
        slot -= 1;
    }
    searchers.raw_set(index, searcher)?;
    Ok(())
}

/// Installs the three custom module search strategies in priority order:
/// custom loader, filesystem loader, builtin-library loader.
pub(crate) fn install_searchers(
    lua: &Lua,
    custom_loader: Option<CustomLoader>,
    script_roots: Vec<PathBuf>,
    builtin_sources: BuiltinSources,
) -> LuaResult<()> {
    let custom = lua.create_function(move |lua, name: String| {
        let source = custom_loader.as_ref().and_then(|loader| loader(&name));
        match source {
            Some(source) => loader_from_source(lua, &name, &source).map(Value::Function),
            None => message(lua, format!("no custom source for module '{name}'")),
        }
    })?;
    add_searcher(lua, custom, 2)?;

    let filesystem = lua.create_function(move |lua, name: String| {
        for path in candidate_paths(&script_roots, &name) {
            match read_script(&path) {
                Ok(Some(source)) => {
                    return loader_from_source(lua, &name, &source).map(Value::Function)
                }
                Ok(None) => continue,
                Err(err) => return Err(LuaError::external(err)),
            }
        }
        message(lua, format!("module '{name}' not found in script roots"))
    })?;
    add_searcher(lua, filesystem, 3)?;

    let builtin = lua.create_function(move |lua, name: String| {
        let source = builtin_sources.borrow().get(&name).cloned();
        match source {
            Some(source) => loader_from_source(lua, &name, &source).map(Value::Function),
            None => message(lua, format!("no builtin module '{name}'")),
        }
    })?;
    add_searcher(lua, builtin, 4)?;

    Ok(())
}

fn loader_from_source<'lua>(lua: &'lua Lua, name: &str, source: &str) -> LuaResult<Function<'lua>> {
    lua.load(source).set_name(name).into_function()
}

fn message<'lua>(lua: &'lua Lua, text: String) -> LuaResult<Value<'lua>> {
    Ok(Value::String(lua.create_string(&format!("\n\t{text}"))?))
}

/// Candidate paths for a module name, `a.b` mapping to `a/b.lua` and
/// `a/b/init.lua` under each root in order.
pub(crate) fn candidate_paths(roots: &[PathBuf], name: &str) -> Vec<PathBuf> {
    let relative = name.replace('.', "/");
    let mut paths = Vec::new();
    for root in roots {
        paths.push(root.join(format!("{relative}.lua")));
        paths.push(root.join(&relative).join("init.lua"));
    }
    paths
}

fn read_script(path: &Path) -> Result<Option<String>, ScriptSourceError> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| ScriptSourceError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Registers the fixed set of global callables the script side expects.
/// Reflection-backed ones route straight to the collaborators; the
/// whitelist pair maintains a registry-held set.
pub(crate) fn install_globals(
    lua: &Lua,
    collaborators: Rc<dyn HostCollaborators>,
) -> LuaResult<()> {
    let globals = lua.globals();

    let whitelist = lua.create_table()?;
    lua.set_named_registry_value(CLASS_WHITELIST, whitelist)?;

    let collab = collaborators.clone();
    globals.set(
        "RegisterEnum",
        lua.create_function(move |lua, name: String| collab.register_enum(lua, &name))?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "RegisterClass",
        lua.create_function(move |lua, name: String| collab.register_class(lua, &name))?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "GetProperty",
        lua.create_function(move |lua, (target, name): (Value, String)| {
            collab.get_property(lua, target, &name)
        })?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "SetProperty",
        lua.create_function(move |lua, (target, name, value): (Value, String, Value)| {
            collab.set_property(lua, target, &name, value)
        })?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "LoadObject",
        lua.create_function(move |lua, path: String| collab.load_object(lua, &path))?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "LoadClass",
        lua.create_function(move |lua, path: String| collab.load_class(lua, &path))?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "NewObject",
        lua.create_function(move |lua, class_path: String| collab.new_object(lua, &class_path))?,
    )?;

    globals.set(
        "AddToClassWhitelist",
        lua.create_function(move |lua, name: String| {
            let whitelist: Table = lua.named_registry_value(CLASS_WHITELIST)?;
            whitelist.set(name, true)
        })?,
    )?;

    globals.set(
        "RemoveFromClassWhitelist",
        lua.create_function(move |lua, name: String| {
            let whitelist: Table = lua.named_registry_value(CLASS_WHITELIST)?;
            whitelist.set(name, Value::Nil)
        })?,
    )?;

    let collab = collaborators.clone();
    globals.set(
        "UnregisterClass",
        lua.create_function(move |_, name: String| {
            collab.unregister_class(&name);
            Ok(())
        })?,
    )?;

    globals.set(
        "EmberPrint",
        lua.create_function(|_, args: Variadic<Value>| {
            let rendered: Vec<String> = args.iter().map(describe_value).collect();
            log::info!("[lua] {}", rendered.join("\t"));
            Ok(())
        })?,
    )?;

    Ok(())
}

pub(crate) fn describe_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.to_string_lossy().into_owned(),
        other => format!("<{}>", other.type_name()),
    }
}

/// Applies GC tuning: the host override wins when bound, otherwise the
/// configured policy (generational by default on Lua 5.4).
pub(crate) fn apply_gc_policy(lua: &Lua, collaborators: &dyn HostCollaborators, tuning: &GcTuning) {
    if collaborators.configure_gc(lua) {
        return;
    }
    match *tuning {
        GcTuning::Generational => {
            let _ = lua.gc_gen(0, 0);
        }
        GcTuning::Incremental {
            pause,
            step_multiplier,
            step_size,
        } => {
            let _ = lua.gc_inc(pause, step_multiplier, step_size);
        }
    }
}

/// Appends `<root>/?.lua` for each script root to `package.path`.
pub(crate) fn extend_package_path(lua: &Lua, roots: &[PathBuf]) -> LuaResult<()> {
    if roots.is_empty() {
        return Ok(());
    }
    let package: Table = lua.globals().get("package")?;
    let mut path: String = package.get("path")?;
    for root in roots {
        path.push_str(&format!(";{}/?.lua", root.display()));
    }
    package.set("path", path)
}

/// Best-effort script call stack for crash logging. Empty when no Lua
/// frames are live.
pub(crate) fn lua_callstack(lua: &Lua) -> String {
    let mut lines = Vec::new();
    let mut level = 0;
    while let Some(frame) = lua.inspect_stack(level) {
        let source = frame.source();
        let location = source
            .short_src
            .as_deref()
            .unwrap_or("?")
            .to_string();
        let name = frame
            .names()
            .name
            .as_deref()
            .unwrap_or("?")
            .to_string();
        lines.push(format!("#{level} {location}:{} in {name}", frame.curr_line()));
        level += 1;
    }
    lines.join("\n")
}
