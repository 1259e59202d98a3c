//! Bridge configuration. Hosts usually ship these settings as JSON next to
//! their script roots.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid bridge settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Garbage-collector tuning applied when the host does not install a GC
/// override hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GcTuning {
    /// Lua 5.4 generational collector with stock multipliers.
    Generational,
    /// Incremental collector with explicit pacing. A zero leaves the
    /// interpreter default in place.
    Incremental {
        pause: i32,
        step_multiplier: i32,
        step_size: i32,
    },
}

impl Default for GcTuning {
    fn default() -> Self {
        GcTuning::Generational
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Name of the global namespace table the bridge creates for host types.
    pub namespace: String,
    /// Directories the filesystem searcher checks for `<module>.lua` and
    /// `<module>/init.lua`, in order.
    pub script_roots: Vec<PathBuf>,
    pub gc: GcTuning,
    /// Keep a qualified-name snapshot per registry record for log output.
    pub debug_object_names: bool,
    /// Outer name marking template-tree subobjects the binder must skip.
    pub template_outer: String,
    /// Qualified-name patterns excluded from binding (archetypes, template
    /// trees).
    pub archetype_patterns: Vec<String>,
    /// Enable the bridge from the engine-init hook without an explicit
    /// `set_enable(true)`.
    pub auto_startup: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        BridgeSettings {
            namespace: "Ember".to_string(),
            script_roots: Vec::new(),
            gc: GcTuning::default(),
            debug_object_names: false,
            template_outer: "TemplateTree".to_string(),
            archetype_patterns: vec![
                r"\.WidgetArchetype:".to_string(),
                r"\.TemplateTree:".to_string(),
            ],
            auto_startup: false,
        }
    }
}

impl BridgeSettings {
    pub fn from_json(source: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(source)?)
    }
}
