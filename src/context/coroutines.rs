//! Coroutine bookkeeping tied to the interpreter's registry.
//!
//! Each script-spawned coroutine gets a [`ThreadRef`] and a pinned registry
//! entry so the host can resume it later. A coroutine that finishes its
//! execution is erased from both directions of the mapping and its registry
//! entry released; cleanup abandons everything without completion
//! callbacks.

use std::collections::HashMap;

use mlua::{Lua, RegistryKey, Result as LuaResult, Thread, ThreadStatus, Value};

/// Stable handle for a registered coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef(u32);

#[derive(Default)]
pub(crate) struct CoroutineRegistry {
    thread_to_ref: HashMap<usize, ThreadRef>,
    ref_to_thread: HashMap<ThreadRef, RegistryKey>,
    next_ref: u32,
}

fn thread_identity(thread: &Thread) -> usize {
    Value::Thread(thread.clone()).to_pointer() as usize
}

impl CoroutineRegistry {
    /// Registers a coroutine, pinning it in the interpreter registry.
    pub(crate) fn add_thread(&mut self, lua: &Lua, thread: &Thread) -> LuaResult<ThreadRef> {
        let key = lua.create_registry_value(thread.clone())?;
        self.next_ref = self.next_ref.wrapping_add(1);
        let reference = ThreadRef(self.next_ref);
        self.thread_to_ref.insert(thread_identity(thread), reference);
        self.ref_to_thread.insert(reference, key);
        Ok(reference)
    }

    pub(crate) fn find_thread(&self, thread: &Thread) -> Option<ThreadRef> {
        self.thread_to_ref.get(&thread_identity(thread)).copied()
    }

    /// Resumes a registered coroutine with no arguments. A completed
    /// coroutine (finished or failed) is erased from both maps and its
    /// registry entry released. Unknown references are a no-op.
    pub(crate) fn resume_thread(&mut self, lua: &Lua, reference: ThreadRef) -> LuaResult<()> {
        let Some(key) = self.ref_to_thread.get(&reference) else {
            return Ok(());
        };
        let thread: Thread = lua.registry_value(key)?;

        if matches!(thread.status(), ThreadStatus::Resumable) {
            if let Err(err) = thread.resume::<_, mlua::MultiValue>(()) {
                log::warn!("coroutine resume failed: {err}");
            }
        }

        if !matches!(thread.status(), ThreadStatus::Resumable) {
            self.thread_to_ref.remove(&thread_identity(&thread));
            if let Some(key) = self.ref_to_thread.remove(&reference) {
                lua.remove_registry_value(key)?;
            }
        }
        Ok(())
    }

    /// Abandons every registered coroutine. In-flight coroutines get no
    /// completion callback.
    pub(crate) fn cleanup(&mut self) {
        self.thread_to_ref.clear();
        self.ref_to_thread.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ref_to_thread.len()
    }
}
