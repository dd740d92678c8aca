//! Video pull and compositing.

use std::sync::Arc;

use montage_common::error::{MontageError, MontageResult};
use montage_common::logging::GRAPH_TARGET;
use montage_timeline::{rescale, BlendMode, EditSource, MediaKind, PluginKey, Projector, Track};

use super::{Entry, NodeKind, VirtualConsole};
use crate::buffers::{Frame, FrameLocation};

impl VirtualConsole {
    /// Composite the frame under `cursor` into `output`.
    ///
    /// Tracks are composited bottom first, the last playable track being
    /// the bottom one. The bottom track always replaces the cleared output.
    pub fn render_video(&mut self, output: &mut Frame, cursor: i64) -> MontageResult<()> {
        output.transfer_to(FrameLocation::Ram);
        output.clear();
        if self.entries.is_empty() {
            return Ok(());
        }

        while self.track_frames.len() < self.entries.len() {
            self.track_frames
                .push(Frame::new(output.width(), output.height()));
        }
        for frame in &mut self.track_frames {
            frame.resize(output.width(), output.height());
        }
        self.reset_progress();

        let edl = Arc::clone(&self.edl);
        let mut bottom = true;
        for entry in (0..self.entries.len()).rev() {
            self.pull_video(entry, usize::MAX, cursor)?;
            let Some(track) = edl.track(self.entries[entry].track) else {
                continue;
            };

            let frame = &mut self.track_frames[entry];
            frame.transfer_to(FrameLocation::Ram);
            let fade = track.automation.fade.value_at(cursor, self.direction) as f32;
            let mask = track.automation.mask.value_at(cursor, self.direction) as f32;
            apply_alpha(frame, fade, mask);

            let mode = if bottom {
                BlendMode::Replace
            } else {
                track.blend_mode(cursor, self.direction)
            };
            composite(output, frame, track.projector, mode);
            bottom = false;
        }
        Ok(())
    }

    fn pull_video(&mut self, entry: usize, until: usize, cursor: i64) -> MontageResult<()> {
        self.entries[entry].busy = true;
        let result = self.pull_video_nodes(entry, until, cursor);
        self.entries[entry].busy = false;
        result
    }

    fn pull_video_nodes(&mut self, entry: usize, until: usize, cursor: i64) -> MontageResult<()> {
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
                    let mut frame = std::mem::replace(&mut self.track_frames[entry], Frame::new(0, 0));
                    let result = self.read_track_frame(track, &mut frame, cursor);
                    self.track_frames[entry] = frame;
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
                            && !point.is_processed(cursor, 1, rate, self.direction)
                    });
                    if gather {
                        self.gather_video(owner, entry, cursor)?;
                    }
                    if let Some(point) = self.plugins.get_mut(&owner) {
                        point.render_video(
                            &mut self.track_frames[entry],
                            buffer_index,
                            cursor,
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

    fn gather_video(&mut self, owner: PluginKey, requester: usize, cursor: i64) -> MontageResult<()> {
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
            self.pull_video(other, stop, cursor)?;
            if let Some(point) = self.plugins.get_mut(&owner) {
                let source = &self.track_frames[other];
                point.video_input(index, source).copy_from(source);
            }
        }
        Ok(())
    }

    fn read_track_frame(&mut self, track: &Track, frame: &mut Frame, cursor: i64) -> MontageResult<()> {
        frame.transfer_to(FrameLocation::Ram);
        frame.clear();
        let Some(edit) = track.edits.playable_edit(cursor, self.direction) else {
            return Ok(());
        };
        let source_position = edit.source_position(self.direction.unit_at(cursor));
        let project_rate = self.rate();

        match edit.source {
            EditSource::Silence => Ok(()),
            EditSource::Asset { asset } => {
                let edl = Arc::clone(&self.edl);
                let asset = edl
                    .asset(asset)
                    .ok_or_else(|| MontageError::asset(format!("Unknown asset {}", asset.0)))?;
                let asset_rate = asset.frame_rate().ok_or_else(|| {
                    MontageError::asset(format!("Asset {} has no video", asset.id.0))
                })?;
                let mut lease = self
                    .cache
                    .checkout(asset, true)?
                    .ok_or_else(|| MontageError::asset(format!("Asset {} is busy", asset.id.0)))?;
                lease.set_position(
                    MediaKind::Video,
                    rescale(source_position, project_rate, asset_rate),
                );
                lease.read_frame(edit.channel, frame)
            }
            EditSource::Nested { index } => {
                self.nested_timeline(index)?
                    .read_frame(source_position, project_rate, frame)
            }
        }
    }
}

/// Scale alpha by the fade and limit it by the mask.
fn apply_alpha(frame: &mut Frame, fade: f32, mask: f32) {
    if fade >= 1.0 && mask >= 1.0 {
        return;
    }
    for px in frame.pixels_mut() {
        px[3] = (px[3] * fade).min(mask);
    }
}

/// Draw `source` onto `target` shifted by the projector offset.
fn composite(target: &mut Frame, source: &Frame, projector: Projector, mode: BlendMode) {
    if source.location() != FrameLocation::Ram || target.location() != FrameLocation::Ram {
        tracing::warn!(
            target: GRAPH_TARGET,
            source = ?source.location(),
            target = ?target.location(),
            "Compositing frames outside RAM"
        );
    }
    let (width, height) = (target.width() as i64, target.height() as i64);
    let source_width = source.width() as usize;
    let target_width = target.width() as usize;
    let pixels = target.pixels_mut();

    for (i, src) in source.pixels().iter().enumerate() {
        let x = (i % source_width.max(1)) as i64 + projector.x as i64;
        let y = (i / source_width.max(1)) as i64 + projector.y as i64;
        if x < 0 || y < 0 || x >= width || y >= height {
            continue;
        }
        let dst = &mut pixels[y as usize * target_width + x as usize];
        *dst = blend(*dst, *src, mode);
    }
}

fn blend(dst: [f32; 4], src: [f32; 4], mode: BlendMode) -> [f32; 4] {
    let a = src[3];
    match mode {
        BlendMode::Replace => src,
        BlendMode::Normal => [
            src[0] * a + dst[0] * (1.0 - a),
            src[1] * a + dst[1] * (1.0 - a),
            src[2] * a + dst[2] * (1.0 - a),
            a + dst[3] * (1.0 - a),
        ],
        BlendMode::Add => [
            (dst[0] + src[0] * a).min(1.0),
            (dst[1] + src[1] * a).min(1.0),
            (dst[2] + src[2] * a).min(1.0),
            dst[3].max(a),
        ],
        BlendMode::Multiply => [
            dst[0] * (1.0 - a + src[0] * a),
            dst[1] * (1.0 - a + src[1] * a),
            dst[2] * (1.0 - a + src[2] * a),
            dst[3].max(a),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{console, session};
    use super::*;

    use montage_timeline::{
        Asset, AssetId, Direction, Edit, Edl, Generator, Interpolation, KeyframeList, Plugin,
        TrackId, VideoParams,
    };

    fn solid(id: u32, rgba: [f32; 4]) -> Asset {
        Asset::generated(
            AssetId(id),
            Generator::Solid { rgba },
            None,
            Some(VideoParams {
                layers: 1,
                frame_rate: 10.0,
                width: 2,
                height: 2,
                length: 100,
            }),
        )
    }

    fn ramp_video(id: u32) -> Asset {
        Asset::generated(
            AssetId(id),
            Generator::Ramp { period: 10 },
            None,
            Some(VideoParams {
                layers: 1,
                frame_rate: 10.0,
                width: 2,
                height: 2,
                length: 100,
            }),
        )
    }

    fn render(console: &mut VirtualConsole, cursor: i64) -> Frame {
        let mut len = 1;
        if console.test_reconfigure(cursor, &mut len) {
            console.rebuild(cursor);
        }
        let mut frame = Frame::new(2, 2);
        console.render_video(&mut frame, cursor).unwrap();
        frame
    }

    #[test]
    fn test_bottom_track_replaces() {
        let edl = Edl::new(session())
            .with_asset(solid(1, [1.0, 0.0, 0.0, 0.5]))
            .with_track(
                Track::new(TrackId(1), MediaKind::Video).with_edit(Edit::asset(0, 10, AssetId(1))),
            );
        let mut console = console(edl, MediaKind::Video, Direction::Forward);
        let frame = render(&mut console, 0);
        assert_eq!(frame.pixel(0, 0), Some([1.0, 0.0, 0.0, 0.5]));
    }

    #[test]
    fn test_top_track_blends_over_bottom() {
        let mut top = Track::new(TrackId(1), MediaKind::Video).with_edit(Edit::asset(0, 10, AssetId(1)));
        top.projector = Projector { x: 1, y: 0 };
        top.automation.fade = top
            .automation
            .fade
            .clone()
            .with_point(0, 0.5, Interpolation::Step);
        let bottom =
            Track::new(TrackId(2), MediaKind::Video).with_edit(Edit::asset(0, 10, AssetId(2)));
        let edl = Edl::new(session())
            .with_asset(solid(1, [1.0, 1.0, 1.0, 1.0]))
            .with_asset(solid(2, [0.0, 0.0, 0.0, 1.0]))
            .with_track(top)
            .with_track(bottom);
        let mut console = console(edl, MediaKind::Video, Direction::Forward);
        let frame = render(&mut console, 0);
        assert_eq!(frame.pixel(0, 0), Some([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(frame.pixel(1, 0), Some([0.5, 0.5, 0.5, 1.0]));
    }

    #[test]
    fn test_mask_limits_alpha() {
        let mut track =
            Track::new(TrackId(1), MediaKind::Video).with_edit(Edit::asset(0, 10, AssetId(1)));
        track.automation.mask = track
            .automation
            .mask
            .clone()
            .with_point(0, 0.25, Interpolation::Step);
        let edl = Edl::new(session())
            .with_asset(solid(1, [1.0, 1.0, 1.0, 1.0]))
            .with_track(track);
        let mut console = console(edl, MediaKind::Video, Direction::Forward);
        assert_eq!(render(&mut console, 0).pixel(0, 0).map(|p| p[3]), Some(0.25));
    }

    #[test]
    fn test_reverse_reads_unit_before_cursor() {
        let edl = Edl::new(session()).with_asset(ramp_video(1)).with_track(
            Track::new(TrackId(1), MediaKind::Video)
                .with_edit(Edit::asset(0, 10, AssetId(1)))
                .with_plugin(Plugin::new("invert", 0, 10).with_keyframes(KeyframeList::new())),
        );
        let mut console = console(edl, MediaKind::Video, Direction::Reverse);
        let px = render(&mut console, 5).pixel(0, 0).unwrap();
        assert!((px[0] - 0.6).abs() < 1e-6);
        assert_eq!(px[3], 1.0);
    }

    #[test]
    fn test_blend_modes() {
        let dst = [0.5, 0.5, 0.5, 1.0];
        let src = [1.0, 0.0, 0.5, 1.0];
        assert_eq!(blend(dst, src, BlendMode::Replace), src);
        assert_eq!(blend(dst, src, BlendMode::Add), [1.0, 0.5, 1.0, 1.0]);
        assert_eq!(blend(dst, src, BlendMode::Multiply), [0.5, 0.0, 0.25, 1.0]);
        assert_eq!(blend(dst, [0.0; 4], BlendMode::Normal), dst);
    }
}
