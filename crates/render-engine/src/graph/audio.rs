//! Audio pull through the console.

use std::sync::Arc;

use montage_common::error::{MontageError, MontageResult};
use montage_timeline::{Direction, Edit, EditSource, MediaKind, PluginKey, Track};

use super::{read_rescaled, Entry, NodeKind, VirtualConsole};
use crate::buffers::Samples;

impl VirtualConsole {
    /// Render `len` samples at `cursor` into `outputs`, one buffer per
    /// output channel, starting at each buffer's offset. The windows are
    /// zeroed first and every playable track is mixed in through its pan
    /// gains.
    pub fn render_audio(&mut self, outputs: &mut [Samples], cursor: i64, len: usize) -> MontageResult<()> {
        for output in outputs.iter_mut() {
            output.clear(len);
        }
        if len == 0 || self.entries.is_empty() {
            return Ok(());
        }

        if self.track_audio.len() < self.entries.len() {
            self.track_audio
                .resize_with(self.entries.len(), Samples::default);
        }
        self.reset_progress();

        let edl = Arc::clone(&self.edl);
        for entry in 0..self.entries.len() {
            self.pull_audio(entry, usize::MAX, cursor, len)?;
            if let Some(track) = edl.track(self.entries[entry].track) {
                self.mix_audio(entry, track, outputs, cursor, len);
            }
        }
        Ok(())
    }

    /// Run the nodes of `entry` up to, not including, chain position `until`.
    fn pull_audio(&mut self, entry: usize, until: usize, cursor: i64, len: usize) -> MontageResult<()> {
        self.entries[entry].busy = true;
        let result = self.pull_audio_nodes(entry, until, cursor, len);
        self.entries[entry].busy = false;
        result
    }

    fn pull_audio_nodes(&mut self, entry: usize, until: usize, cursor: i64, len: usize) -> MontageResult<()> {
        let edl = Arc::clone(&self.edl);
        let rate = self.rate();
        let playhead = cursor as f64 / rate;

        loop {
            let Entry { progress, nodes, .. } = &self.entries[entry];
            if *progress >= until.min(nodes.len()) {
                return Ok(());
            }
            let kind = self.nodes[nodes[*progress]].kind;
            match kind {
                NodeKind::Module => {
                    let track = edl.track(self.entries[entry].track).ok_or_else(|| {
                        MontageError::render(format!(
                            "Track {} left the timeline",
                            self.entries[entry].track.0
                        ))
                    })?;
                    let mut buffer = std::mem::take(&mut self.track_audio[entry]);
                    let result = self.read_track_audio(track, &mut buffer, cursor, len);
                    self.track_audio[entry] = buffer;
                    result?;
                }
                NodeKind::Plugin {
                    owner,
                    buffer_index,
                    ..
                } => {
                    let gather = self.plugins.get(&owner).map_or(false, |point| {
                        point.is_on()
                            && point.is_bound()
                            && point.is_multichannel()
                            && !point.is_processed(cursor, len, rate, self.direction)
                    });
                    if gather {
                        self.gather_audio(owner, entry, cursor, len)?;
                    }
                    if let Some(point) = self.plugins.get_mut(&owner) {
                        point.render_audio(
                            &mut self.track_audio[entry],
                            buffer_index,
                            cursor,
                            len,
                            rate,
                            playhead,
                            self.direction,
                        )?;
                    }
                }
            }
            self.entries[entry].progress += 1;
        }
    }

    /// Bring every other track attached to `owner` up to that plugin and
    /// hand its data to the attachment point.
    fn gather_audio(&mut self, owner: PluginKey, requester: usize, cursor: i64, len: usize) -> MontageResult<()> {
        let attached = match self.plugins.get(&owner) {
            Some(point) => point.attached().to_vec(),
            None => return Ok(()),
        };
        for (index, track) in attached.into_iter().enumerate() {
            let Some(other) = self.entry_of(track) else {
                continue;
            };
            if other == requester || self.entries[other].busy {
                continue;
            }
            let Some(stop) = self.chain_stop(other, owner) else {
                continue;
            };
            self.pull_audio(other, stop, cursor, len)?;
            if let Some(point) = self.plugins.get_mut(&owner) {
                point
                    .audio_input(index, len)
                    .copy_from(&self.track_audio[other], len);
            }
        }
        Ok(())
    }

    /// Read the edits of `track` under the fragment into `buffer`, in
    /// playback order.
    fn read_track_audio(&mut self, track: &Track, buffer: &mut Samples, cursor: i64, len: usize) -> MontageResult<()> {
        buffer.set_offset(0);
        buffer.clear(len);
        let low = self.direction.range_start(cursor, len as i64);
        let high = low + len as i64;

        let mut position = low;
        while position < high {
            let edit = track.edits.edit_at(position, Direction::Forward);
            let segment_end = match edit {
                Some(edit) => edit.end().min(high),
                None => track
                    .edits
                    .iter()
                    .map(|e| e.start)
                    .find(|start| *start > position)
                    .unwrap_or(high)
                    .min(high),
            };
            if let Some(edit) = edit.filter(|e| e.has_data()) {
                let offset = (position - low) as usize;
                let count = (segment_end - position) as usize;
                let target = &mut buffer.window_mut(len)[offset..offset + count];
                self.read_edit_audio(edit, position, target)?;
            }
            position = segment_end;
        }

        if self.direction.is_reverse() {
            buffer.reverse(len);
        }
        Ok(())
    }

    fn read_edit_audio(&mut self, edit: &Edit, position: i64, target: &mut [f64]) -> MontageResult<()> {
        let source_position = edit.source_position(position);
        let project_rate = self.rate();
        match edit.source {
            EditSource::Silence => Ok(()),
            EditSource::Asset { asset } => {
                let edl = Arc::clone(&self.edl);
                let asset = edl
                    .asset(asset)
                    .ok_or_else(|| MontageError::asset(format!("Unknown asset {}", asset.0)))?;
                let asset_rate = asset.sample_rate().ok_or_else(|| {
                    MontageError::asset(format!("Asset {} has no audio", asset.id.0))
                })?;
                let mut lease = self
                    .cache
                    .checkout(asset, true)?
                    .ok_or_else(|| MontageError::asset(format!("Asset {} is busy", asset.id.0)))?;
                read_rescaled(target, source_position, project_rate, asset_rate, |at, buffer| {
                    lease.set_position(MediaKind::Audio, at);
                    lease.read_samples(edit.channel, buffer)
                })
            }
            EditSource::Nested { index } => {
                self.nested_timeline(index)?
                    .read_audio(edit.channel, source_position, project_rate, target)
            }
        }
    }

    /// Fade, meter and pan one track's buffer into the outputs.
    fn mix_audio(&mut self, entry: usize, track: &Track, outputs: &mut [Samples], cursor: i64, len: usize) {
        if track.automation.is_muted(cursor, self.direction) {
            return;
        }
        let direction = self.direction;
        let buffer = &mut self.track_audio[entry];

        let fade = &track.automation.fade;
        if fade.points().is_empty() {
            if fade.default != 1.0 {
                let gain = fade.default;
                buffer.window_mut(len).iter_mut().for_each(|s| *s *= gain);
            }
        } else {
            for (i, sample) in buffer.window_mut(len).iter_mut().enumerate() {
                *sample *= fade.value_at(direction.step(cursor, i as i64), direction);
            }
        }

        if let Some(meter) = &self.meter {
            meter
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .record(track.id, buffer, cursor, len, direction);
        }

        for (channel, output) in outputs.iter_mut().enumerate() {
            let gain = track.pan_gain(channel);
            if gain == 0.0 {
                continue;
            }
            for (out, sample) in output.window_mut(len).iter_mut().zip(buffer.window(len)) {
                *out += sample * gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use montage_timeline::{
        AssetId, Edl, Interpolation, KeyframeList, Plugin, PluginKey, Track, TrackId,
    };

    use super::super::tests::{console, ramp, session};
    use super::*;
    use crate::audio::PeakMeter;

    fn ramp_value(position: i64) -> f64 {
        position.rem_euclid(1000) as f64 / 1000.0 * 2.0 - 1.0
    }

    fn render(console: &mut VirtualConsole, cursor: i64, len: usize) -> Vec<f64> {
        let mut len_i = len as i64;
        if console.test_reconfigure(cursor, &mut len_i) {
            console.rebuild(cursor);
        }
        let mut outputs = vec![Samples::new(len)];
        console.render_audio(&mut outputs, cursor, len).unwrap();
        outputs[0].window(len).to_vec()
    }

    #[test]
    fn test_reads_asset_with_offset_and_silence() {
        let edl = Edl::new(session()).with_asset(ramp(1, 1000)).with_track(
            Track::new(TrackId(1), MediaKind::Audio)
                .with_edit(Edit::asset(0, 10, AssetId(1)).with_source_offset(100))
                .with_edit(Edit::silence(10, 10)),
        );
        let mut console = console(edl, MediaKind::Audio, Direction::Forward);
        let out = render(&mut console, 8, 4);
        assert_eq!(out, vec![ramp_value(108), ramp_value(109), 0.0, 0.0]);
    }

    #[test]
    fn test_reverse_reads_descending() {
        let edl = Edl::new(session()).with_asset(ramp(1, 1000)).with_track(
            Track::new(TrackId(1), MediaKind::Audio).with_edit(Edit::asset(0, 100, AssetId(1))),
        );
        let mut console = console(edl, MediaKind::Audio, Direction::Reverse);
        let out = render(&mut console, 10, 3);
        assert_eq!(out, vec![ramp_value(9), ramp_value(8), ramp_value(7)]);
    }

    #[test]
    fn test_fade_pan_and_mute() {
        let mut track = Track::new(TrackId(1), MediaKind::Audio)
            .with_edit(Edit::asset(0, 100, AssetId(1)).with_source_offset(750));
        track.pan = vec![0.5];
        track.automation.fade = track
            .automation
            .fade
            .clone()
            .with_point(0, 0.5, Interpolation::Step);
        let muted = Track::new(TrackId(2), MediaKind::Audio)
            .with_edit(Edit::asset(0, 100, AssetId(1)))
            .with_automation({
                let mut automation = montage_timeline::Automation::default();
                automation.mute = automation.mute.with_point(0, 1.0, Interpolation::Step);
                automation
            });
        let edl = Edl::new(session())
            .with_asset(ramp(1, 1000))
            .with_track(track)
            .with_track(muted);
        let mut console = console(edl, MediaKind::Audio, Direction::Forward);
        let out = render(&mut console, 0, 2);
        assert_eq!(out, vec![0.25 * ramp_value(750), 0.25 * ramp_value(751)]);
        assert_eq!(console.entry_count(), 1);
    }

    #[test]
    fn test_plugin_chain_and_meter() {
        let meter = Arc::new(Mutex::new(PeakMeter::new(400, 1000)));
        let edl = Edl::new(session()).with_asset(ramp(1, 1000)).with_track(
            Track::new(TrackId(1), MediaKind::Audio)
                .with_edit(Edit::asset(0, 1000, AssetId(1)))
                .with_plugin(
                    Plugin::new("gain", 0, 1000).with_keyframes(KeyframeList::with_default("2")),
                )
                .with_plugin(Plugin::new("invert", 0, 1000)),
        );
        let mut console =
            console(edl, MediaKind::Audio, Direction::Forward).with_meter(Arc::clone(&meter));
        let out = render(&mut console, 0, 200);
        assert_eq!(out[10], -2.0 * ramp_value(10));

        let meter = meter.lock().unwrap();
        assert_eq!(meter.meter_fragment(), 100);
        assert_eq!(meter.history(TrackId(1)).len(), 2);
        let index = meter.history_index(TrackId(1), 120).unwrap();
        assert_eq!(meter.history(TrackId(1))[index].position, 100);
    }

    #[test]
    fn test_shared_multichannel_plugin_sees_every_track() {
        let owner = PluginKey {
            track: TrackId(1),
            index: 0,
        };
        let edl = Edl::new(session())
            .with_asset(ramp(1, 1000))
            .with_track(
                Track::new(TrackId(1), MediaKind::Audio)
                    .with_edit(Edit::asset(0, 100, AssetId(1)))
                    .with_plugin(Plugin::new("downmix", 0, 100)),
            )
            .with_track(
                Track::new(TrackId(2), MediaKind::Audio)
                    .with_edit(Edit::asset(0, 100, AssetId(1)).with_source_offset(500))
                    .with_plugin(Plugin::shared_with(owner, 0, 100)),
            );
        let mut console = console(edl, MediaKind::Audio, Direction::Forward);
        let out = render(&mut console, 0, 4);
        let expected: Vec<f64> = (0..4)
            .map(|i| ramp_value(i) + ramp_value(500 + i))
            .collect();
        for (got, want) in out.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_synthesis_track_without_edits() {
        let edl = Edl::new(session()).with_track(
            Track::new(TrackId(1), MediaKind::Audio).with_plugin(
                Plugin::new("tone", 0, 100)
                    .synthesis()
                    .with_keyframes(KeyframeList::with_default("250")),
            ),
        );
        let mut console = console(edl, MediaKind::Audio, Direction::Forward);
        let out = render(&mut console, 0, 4);
        assert!(out[0].abs() < 1e-12);
        assert!((out[1] - 0.5).abs() < 1e-12);
    }
}
