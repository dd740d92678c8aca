//! Nested timelines read through their own console.

use std::sync::Arc;

use montage_common::error::MontageResult;
use montage_timeline::{rescale, Direction, Edl, MediaKind};

use super::{read_rescaled, VirtualConsole};
use crate::buffers::{Frame, Samples};
use crate::cache::AssetCache;
use crate::plugin::PluginRegistry;

/// A sub-timeline referenced from edits of the parent timeline.
///
/// The nested console always runs forward. Reverse playback in the parent
/// reads ascending ranges and reverses them afterwards.
pub(crate) struct NestedTimeline {
    console: Box<VirtualConsole>,
    outputs: Vec<Samples>,
}

impl NestedTimeline {
    pub fn new(
        edl: Arc<Edl>,
        kind: MediaKind,
        cache: Arc<AssetCache>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            console: Box::new(VirtualConsole::new(
                kind,
                edl,
                Direction::Forward,
                cache,
                registry,
            )),
            outputs: Vec::new(),
        }
    }

    /// Fill `target` from output `channel` of the nested mix, starting at
    /// `position` in `parent_rate` units.
    pub fn read_audio(
        &mut self,
        channel: usize,
        position: i64,
        parent_rate: f64,
        target: &mut [f64],
    ) -> MontageResult<()> {
        let rate = self.console.rate();
        let channels = self.console.edl().session.audio_channels.max(1);
        if self.outputs.len() < channels {
            self.outputs.resize_with(channels, Samples::default);
        }
        let channel = channel.min(channels - 1);
        let console = &mut self.console;
        let outputs = &mut self.outputs;

        read_rescaled(target, position, parent_rate, rate, |start, buffer| {
            let mut done = 0usize;
            while done < buffer.len() {
                let at = start + done as i64;
                let mut len = (buffer.len() - done) as i64;
                if console.test_reconfigure(at, &mut len) {
                    console.rebuild(at);
                }
                let len = len.max(1) as usize;
                console.render_audio(outputs, at, len)?;
                buffer[done..done + len].copy_from_slice(outputs[channel].window(len));
                done += len;
            }
            Ok(())
        })
    }

    /// Render the nested frame under `position`, given in `parent_rate` units.
    pub fn read_frame(&mut self, position: i64, parent_rate: f64, frame: &mut Frame) -> MontageResult<()> {
        let local = rescale(position, parent_rate, self.console.rate());
        let mut len = 1;
        if self.console.test_reconfigure(local, &mut len) {
            self.console.rebuild(local);
        }
        self.console.render_video(frame, local)
    }
}
