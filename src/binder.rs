//! Module-name resolution and the host-specific exclusion filters applied
//! before a bind is dispatched to the script manager.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::RegexSet;

use crate::host::{ClassDescriptor, HostObject, ModuleNameFn, ObjectFlags};
use crate::settings::BridgeSettings;

/// Outcome of asking a class for its script module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ModuleResolution {
    /// The class never declared a module-name entry point.
    Unbound,
    /// The entry point exists but returned an empty name.
    Empty,
    Module(String),
}

/// Per-context binding helper. Owns the lazily populated resolver cache
/// (confined to the interpreter's owning thread) and the compiled exclusion
/// filters.
pub(crate) struct Binder {
    template_outer: String,
    archetype_patterns: RegexSet,
    /// Resolved module-name entry per class, populated on first use. `None`
    /// caches the absence of an entry point so the warning fires once.
    resolver_cache: HashMap<String, Option<ModuleNameFn>>,
}

impl Binder {
    pub(crate) fn new(settings: &BridgeSettings) -> Result<Self> {
        let archetype_patterns = RegexSet::new(&settings.archetype_patterns)
            .context("compiling archetype exclusion patterns")?;
        Ok(Binder {
            template_outer: settings.template_outer.clone(),
            archetype_patterns,
            resolver_cache: HashMap::new(),
        })
    }

    /// Resolves the script module for `class`, binding the entry point into
    /// the cache on first use.
    pub(crate) fn resolve_module_name(&mut self, class: &Arc<ClassDescriptor>) -> ModuleResolution {
        let entry = match self.resolver_cache.entry(class.name.clone()) {
            Entry::Occupied(cached) => cached.into_mut(),
            Entry::Vacant(vacant) => {
                let resolver = class.module_name_entry();
                if resolver.is_none() {
                    log::warn!(
                        "module name entry point missing on class {}; binding aborted",
                        class.name
                    );
                }
                vacant.insert(resolver)
            }
        };
        let Some(resolver) = entry else {
            return ModuleResolution::Unbound;
        };
        let module = resolver(class);
        if module.is_empty() {
            ModuleResolution::Empty
        } else {
            ModuleResolution::Module(module)
        }
    }

    /// Filters out template-tree subobjects that are still initializing;
    /// binding them would attach script state to an object the host is about
    /// to rebuild.
    pub(crate) fn is_template_nested(&self, object: &HostObject) -> bool {
        let under_template = object
            .outer
            .as_deref()
            .map_or(false, |outer| outer.name == self.template_outer);
        under_template
            && object.flags().contains_all(
                ObjectFlags::NEED_INIT
                    | ObjectFlags::NEED_POST_LOAD
                    | ObjectFlags::NEED_POST_LOAD_SUBOBJECTS,
            )
    }

    /// Name-pattern filter for archetype and template-tree objects that slip
    /// past the flag checks.
    pub(crate) fn matches_archetype_filter(&self, qualified_name: &str) -> bool {
        self.archetype_patterns.is_match(qualified_name)
    }

    /// Drops every cached resolver. Run on full cleanup so a hot-reloaded
    /// class re-binds its entry point on the next lifetime.
    pub(crate) fn clear_cache(&mut self) {
        self.resolver_cache.clear();
    }
}
