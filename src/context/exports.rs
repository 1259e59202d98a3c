//! Statically exported classes, functions and enums.
//!
//! Exports accumulate before the interpreter exists and are registered into
//! it exactly once per interpreter lifetime, classes first (non-reflected
//! before reflected) so functions and enums that reference them resolve.

use std::collections::BTreeMap;
use std::sync::Arc;

use mlua::{Lua, Result as LuaResult};

pub trait ExportedClass {
    fn name(&self) -> &str;
    /// Reflected classes already exist in the host type system; the two
    /// partitions register in a fixed relative order.
    fn reflected(&self) -> bool;
    fn register(&self, lua: &Lua) -> LuaResult<()>;
}

pub trait ExportedFunction {
    fn name(&self) -> &str;
    fn register(&self, lua: &Lua) -> LuaResult<()>;
}

pub trait ExportedEnum {
    fn name(&self) -> &str;
    fn register(&self, lua: &Lua) -> LuaResult<()>;
}

#[derive(Default)]
pub(crate) struct ExportTables {
    non_reflected_classes: BTreeMap<String, Arc<dyn ExportedClass>>,
    reflected_classes: BTreeMap<String, Arc<dyn ExportedClass>>,
    functions: Vec<Arc<dyn ExportedFunction>>,
    enums: Vec<Arc<dyn ExportedEnum>>,
}

impl ExportTables {
    /// Last write wins per name within a partition.
    pub(crate) fn add_class(&mut self, class: Arc<dyn ExportedClass>) {
        let partition = if class.reflected() {
            &mut self.reflected_classes
        } else {
            &mut self.non_reflected_classes
        };
        partition.insert(class.name().to_string(), class);
    }

    pub(crate) fn add_function(&mut self, function: Arc<dyn ExportedFunction>) {
        self.functions.push(function);
    }

    pub(crate) fn add_enum(&mut self, exported: Arc<dyn ExportedEnum>) {
        self.enums.push(exported);
    }

    pub(crate) fn find_class(&self, name: &str) -> Option<Arc<dyn ExportedClass>> {
        self.reflected_classes
            .get(name)
            .or_else(|| self.non_reflected_classes.get(name))
            .cloned()
    }

    pub(crate) fn find_reflected_class(&self, name: &str) -> Option<Arc<dyn ExportedClass>> {
        self.reflected_classes.get(name).cloned()
    }

    pub(crate) fn find_non_reflected_class(&self, name: &str) -> Option<Arc<dyn ExportedClass>> {
        self.non_reflected_classes.get(name).cloned()
    }

    /// Registers every accumulated export into a fresh interpreter:
    /// classes (non-reflected first), then functions, then enums.
    pub(crate) fn register_all(&self, lua: &Lua) -> LuaResult<()> {
        for class in self.non_reflected_classes.values() {
            class.register(lua)?;
        }
        for class in self.reflected_classes.values() {
            class.register(lua)?;
        }
        for function in &self.functions {
            function.register(lua)?;
        }
        for exported in &self.enums {
            exported.register(lua)?;
        }
        Ok(())
    }
}
