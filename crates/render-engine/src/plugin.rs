//! Plugin processing contract and registry.
//!
//! A plugin implementation only sees sub-fragments that never cross one of
//! its keyframes: the attachment point splits every request and positions
//! the buffers before calling [`PluginProcessor::process_audio`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use montage_common::error::{MontageError, MontageResult};
use montage_timeline::{Direction, Keyframe, KeyframeSpan};

use crate::buffers::{Frame, FrameLocation, Samples};
use crate::builtin;

/// Everything a plugin may know about the sub-fragment it processes.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext<'a> {
    /// Cursor of the first unit, in `rate` units. Reverse playback covers
    /// `[start - len, start)` with buffer index 0 holding unit `start - 1`.
    pub start: i64,
    pub rate: f64,
    pub project_rate: f64,
    pub direction: Direction,
    /// Playhead in seconds at `start`.
    pub playhead_secs: f64,
    /// Plugin range in `rate` units.
    pub plugin_start: i64,
    pub plugin_length: i64,
    /// Keyframes around the sub-fragment. `prev` governs every unit of it.
    pub keyframes: KeyframeSpan<'a>,
    /// Virtual channel requested by the caller.
    pub buffer_index: usize,
}

impl ProcessContext<'_> {
    /// Parameters in effect for this sub-fragment.
    pub fn keyframe(&self) -> &Keyframe {
        self.keyframes.prev
    }

    /// Absolute unit held at buffer index `i`.
    pub fn unit(&self, i: usize) -> i64 {
        match self.direction {
            Direction::Forward => self.start + i as i64,
            Direction::Reverse => self.start - 1 - i as i64,
        }
    }

    /// Parse the keyframe data as a number, falling back to `default`.
    pub fn parameter(&self, default: f64) -> f64 {
        self.keyframe().data.trim().parse().unwrap_or(default)
    }
}

/// A plugin implementation instance.
pub trait PluginProcessor: Send {
    fn name(&self) -> &str;

    /// One instance processes every attached channel together.
    fn multichannel(&self) -> bool {
        false
    }

    /// Where the plugin wants its frames.
    fn preferred_location(&self) -> FrameLocation {
        FrameLocation::Ram
    }

    /// Process `len` samples in place at each buffer's offset.
    fn process_audio(
        &mut self,
        _ctx: &ProcessContext<'_>,
        _buffers: &mut [Samples],
        _len: usize,
    ) -> MontageResult<()> {
        Ok(())
    }

    /// Process one frame per buffer in place.
    fn process_video(&mut self, _ctx: &ProcessContext<'_>, _frames: &mut [Frame]) -> MontageResult<()> {
        Ok(())
    }

    /// Drop internal history.
    fn reset(&mut self) {}
}

/// Creates processor instances.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn PluginProcessor> + Send + Sync>;

/// Static description of a registered implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub multichannel: bool,
    pub synthesis: bool,
    pub audio: bool,
    pub video: bool,
}

/// Registered plugin implementations by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, (PluginDescriptor, PluginFactory)>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in implementations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, descriptor: PluginDescriptor, factory: PluginFactory) {
        self.entries
            .insert(descriptor.name.clone(), (descriptor, factory));
    }

    pub fn factory(&self, name: &str) -> Option<PluginFactory> {
        self.entries.get(name).map(|(_, f)| Arc::clone(f))
    }

    pub fn create(&self, name: &str) -> MontageResult<Box<dyn PluginProcessor>> {
        self.factory(name)
            .map(|factory| factory())
            .ok_or_else(|| MontageError::plugin(format!("Unknown plugin implementation: {name}")))
    }

    pub fn descriptor(&self, name: &str) -> Option<&PluginDescriptor> {
        self.entries.get(name).map(|(d, _)| d)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.entries.values().map(|(d, _)| d)
    }
}
