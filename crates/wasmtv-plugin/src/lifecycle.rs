//! Host-enforced lifecycle of a plugin instance.
//!
//! `Unloaded → Loaded → Unloading → Unloaded`. The last `Unloaded` is
//! terminal: once an instance is discarded nothing may be called on it
//! again, including a second load.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unloaded,
    Loaded,
    Unloading,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// State guard owned by the host-side instance.
///
/// Each `begin_*`/`ensure_*` method either performs the transition or
/// returns [`PluginError::InvalidState`] without touching the plugin.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    plugin: String,
    state: LifecycleState,
    /// `on_load` has returned 0.
    load_completed: bool,
    discarded: bool,
}

impl Lifecycle {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            state: LifecycleState::Unloaded,
            load_completed: false,
            discarded: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LifecycleState::Loaded && self.load_completed
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Host services are only served while the instance is `Loaded`,
    /// which includes the run of `on_load` itself.
    pub fn services_open(&self) -> bool {
        self.state == LifecycleState::Loaded
    }

    fn reject(&self, operation: &'static str) -> PluginError {
        PluginError::InvalidState {
            plugin: self.plugin.clone(),
            operation,
            state: self.state,
        }
    }

    /// Before `on_load`. The instance is provisionally `Loaded` for the
    /// duration of the call.
    pub fn begin_load(&mut self) -> Result<(), PluginError> {
        if self.discarded || self.state != LifecycleState::Unloaded {
            return Err(self.reject("load"));
        }
        self.state = LifecycleState::Loaded;
        Ok(())
    }

    /// After `on_load` returned 0.
    pub fn complete_load(&mut self) -> Result<(), PluginError> {
        if self.discarded || self.state != LifecycleState::Loaded || self.load_completed {
            return Err(self.reject("complete loading of"));
        }
        self.load_completed = true;
        Ok(())
    }

    /// Before `on_file_found`.
    pub fn ensure_ready(&self) -> Result<(), PluginError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(self.reject("deliver file to"))
        }
    }

    /// Before `on_unload`. Only a fully loaded instance is unloaded; a
    /// failed load goes straight to [`discard`](Self::discard).
    pub fn begin_unload(&mut self) -> Result<(), PluginError> {
        if !self.is_ready() {
            return Err(self.reject("unload"));
        }
        self.state = LifecycleState::Unloading;
        Ok(())
    }

    /// Terminal. Valid from any state.
    pub fn discard(&mut self) {
        self.state = LifecycleState::Unloaded;
        self.load_completed = false;
        self.discarded = true;
    }
}
