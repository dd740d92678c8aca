//! Plugin attachment points.
//!
//! An attachment point owns the processing instances of one plugin slot
//! and invokes them on behalf of every track attached to it. Requests are
//! split so that no call crosses a keyframe: forward playback stops each
//! sub-fragment at the next keyframe, reverse playback at the keyframe
//! governing the unit before the cursor.

use montage_common::error::MontageResult;
use montage_common::logging::PLUGIN_TARGET;
use montage_timeline::{rescale, Direction, KeyframeList, KeyframeSpan, Plugin, PluginKey, TrackId};

use crate::buffers::{Frame, Samples};
use crate::plugin::{PluginFactory, PluginProcessor, PluginRegistry, ProcessContext};

/// One keyframe-bounded piece of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeFragment {
    /// Offset from the start of the request, in buffer samples.
    pub offset: usize,
    /// Cursor where the piece starts.
    pub cursor: i64,
    pub len: usize,
    /// Index of the keyframe governing the piece.
    pub keyframe: usize,
}

/// Split `[start, start + len)` (or `[start - len, start)` in reverse) at
/// the keyframes of `keyframes`, whose positions are in `project_rate`
/// units and are converted to `rate` before use.
pub fn keyframe_fragments(
    keyframes: &KeyframeList,
    start: i64,
    len: usize,
    rate: f64,
    project_rate: f64,
    direction: Direction,
) -> Vec<KeyframeFragment> {
    let mut fragments = Vec::new();
    let mut offset = 0usize;
    while offset < len {
        let remaining = (len - offset) as i64;
        let cursor = direction.step(start, offset as i64);
        let (keyframe, distance) = match direction {
            Direction::Forward => (
                keyframes.prev_index_local(cursor, rate, project_rate),
                keyframes
                    .next_local_after(cursor, rate, project_rate)
                    .map(|next| next - cursor),
            ),
            Direction::Reverse => {
                let unit = cursor - 1;
                let index = keyframes.prev_index_local(unit, rate, project_rate);
                let boundary = rescale(keyframes.as_slice()[index].position, project_rate, rate);
                (index, (boundary <= unit).then(|| cursor - boundary))
            }
        };

        let mut fragment = distance.map_or(remaining, |d| d.min(remaining));
        if fragment <= 0 {
            debug_assert!(fragment > 0, "non-positive keyframe fragment at {cursor}");
            tracing::warn!(
                target: PLUGIN_TARGET,
                cursor,
                fragment,
                "Non-positive keyframe fragment, clamping to 1"
            );
            fragment = 1;
        }

        fragments.push(KeyframeFragment {
            offset,
            cursor,
            len: fragment as usize,
            keyframe,
        });
        offset += fragment as usize;
    }
    fragments
}

/// Parameters shared by every sub-fragment of one request.
#[derive(Debug, Clone, Copy)]
struct Request {
    rate: f64,
    project_rate: f64,
    direction: Direction,
    playhead_secs: f64,
    plugin_start: i64,
    plugin_length: i64,
    buffer_index: usize,
}

impl Request {
    fn context<'a>(&self, keyframes: &'a KeyframeList, fragment: &KeyframeFragment) -> ProcessContext<'a> {
        let frames = keyframes.as_slice();
        ProcessContext {
            start: fragment.cursor,
            rate: self.rate,
            project_rate: self.project_rate,
            direction: self.direction,
            playhead_secs: self.playhead_secs
                + fragment.offset as f64 * self.direction.sign() as f64 / self.rate,
            plugin_start: self.plugin_start,
            plugin_length: self.plugin_length,
            keyframes: KeyframeSpan {
                prev: &frames[fragment.keyframe],
                next: frames.get(fragment.keyframe + 1),
            },
            buffer_index: self.buffer_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Processed {
    start: i64,
    len: usize,
    rate: u64,
    direction: Direction,
}

/// Processing instances and per-channel state for one plugin slot.
pub struct AttachmentPoint {
    owner: PluginKey,
    implementation: String,
    factory: Option<PluginFactory>,
    multichannel: bool,
    processors: Vec<Box<dyn PluginProcessor>>,
    on: bool,
    start: i64,
    length: i64,
    keyframes: KeyframeList,
    project_rate: f64,
    attached: Vec<TrackId>,
    audio_scratch: Vec<Samples>,
    video_scratch: Vec<Frame>,
    processed: Option<Processed>,
}

impl std::fmt::Debug for AttachmentPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentPoint")
            .field("owner", &self.owner)
            .field("implementation", &self.implementation)
            .field("on", &self.on)
            .field("attached", &self.attached)
            .finish()
    }
}

impl AttachmentPoint {
    pub fn new(owner: PluginKey, plugin: &Plugin, project_rate: f64, registry: &PluginRegistry) -> Self {
        let factory = registry.factory(&plugin.implementation);
        if factory.is_none() {
            tracing::warn!(
                target: PLUGIN_TARGET,
                track = owner.track.0,
                index = owner.index,
                implementation = %plugin.implementation,
                "Plugin implementation not registered, passing data through"
            );
        }
        let multichannel = registry
            .descriptor(&plugin.implementation)
            .map(|d| d.multichannel)
            .unwrap_or(false);
        Self {
            owner,
            implementation: plugin.implementation.clone(),
            factory,
            multichannel,
            processors: Vec::new(),
            on: plugin.on,
            start: plugin.start,
            length: plugin.length,
            keyframes: plugin.keyframes.clone(),
            project_rate,
            attached: Vec::new(),
            audio_scratch: Vec::new(),
            video_scratch: Vec::new(),
            processed: None,
        }
    }

    pub fn owner(&self) -> PluginKey {
        self.owner
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// A processing implementation was found for the slot.
    pub fn is_bound(&self) -> bool {
        self.factory.is_some()
    }

    pub fn is_multichannel(&self) -> bool {
        self.multichannel
    }

    pub fn keyframes(&self) -> &KeyframeList {
        &self.keyframes
    }

    /// Tracks attached since the last [`AttachmentPoint::detach_all`], in
    /// buffer-index order.
    pub fn attached(&self) -> &[TrackId] {
        &self.attached
    }

    /// Refresh slot parameters from the owning plugin.
    pub fn update(&mut self, plugin: &Plugin, project_rate: f64) {
        self.on = plugin.on;
        self.start = plugin.start;
        self.length = plugin.length;
        self.project_rate = project_rate;
        if self.keyframes != plugin.keyframes {
            self.keyframes = plugin.keyframes.clone();
        }
        self.processed = None;
    }

    pub fn detach_all(&mut self) {
        self.attached.clear();
        self.processed = None;
    }

    /// Attach a track as the next virtual channel, returning its buffer index.
    pub fn attach(&mut self, track: TrackId) -> usize {
        self.attached.push(track);
        self.attached.len() - 1
    }

    /// Create processors for the attached channels. Existing instances keep
    /// their history.
    pub fn finalize(&mut self) {
        let Some(factory) = &self.factory else {
            return;
        };
        let wanted = if self.multichannel {
            1
        } else {
            self.attached.len()
        };
        while self.processors.len() < wanted {
            self.processors.push(factory());
            tracing::debug!(
                target: PLUGIN_TARGET,
                implementation = %self.implementation,
                instance = self.processors.len() - 1,
                "Created plugin instance"
            );
        }
        if self.audio_scratch.len() < self.attached.len() {
            self.audio_scratch
                .resize_with(self.attached.len(), Samples::default);
        }
    }

    /// Whether a multichannel result for this request is already available.
    pub fn is_processed(&self, start: i64, len: usize, rate: f64, direction: Direction) -> bool {
        self.processed == Some(Processed {
            start,
            len,
            rate: rate.to_bits(),
            direction,
        })
    }

    /// Input slot of virtual channel `index` for multichannel processing.
    pub fn audio_input(&mut self, index: usize, len: usize) -> &mut Samples {
        if self.audio_scratch.len() <= index {
            self.audio_scratch.resize_with(index + 1, Samples::default);
        }
        let scratch = &mut self.audio_scratch[index];
        scratch.ensure(len);
        scratch
    }

    /// Input slot of virtual channel `index` for multichannel video.
    pub fn video_input(&mut self, index: usize, like: &Frame) -> &mut Frame {
        while self.video_scratch.len() <= index {
            self.video_scratch.push(Frame::new(like.width(), like.height()));
        }
        let scratch = &mut self.video_scratch[index];
        scratch.resize(like.width(), like.height());
        scratch
    }

    fn request(&self, rate: f64, direction: Direction, playhead_secs: f64, buffer_index: usize) -> Request {
        Request {
            rate,
            project_rate: self.project_rate,
            direction,
            playhead_secs,
            plugin_start: rescale(self.start, self.project_rate, rate),
            plugin_length: rescale(self.length, self.project_rate, rate),
            buffer_index,
        }
    }

    /// Process `len` samples of `output` for virtual channel `buffer_index`.
    ///
    /// Off or unbound plugins leave `output` untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn render_audio(
        &mut self,
        output: &mut Samples,
        buffer_index: usize,
        start: i64,
        len: usize,
        rate: f64,
        playhead_secs: f64,
        direction: Direction,
    ) -> MontageResult<()> {
        if !self.on || self.processors.is_empty() || len == 0 {
            return Ok(());
        }
        let request = self.request(rate, direction, playhead_secs, buffer_index);
        let fragments =
            keyframe_fragments(&self.keyframes, start, len, rate, self.project_rate, direction);

        if !self.multichannel {
            let processor = match self.processors.get_mut(buffer_index) {
                Some(processor) => processor.as_mut(),
                None => return Ok(()),
            };
            return process_audio(
                processor,
                std::slice::from_mut(output),
                &fragments,
                &self.keyframes,
                &request,
            );
        }

        if !self.is_processed(start, len, rate, direction) {
            let channels = self.attached.len().max(buffer_index + 1);
            self.audio_input(buffer_index, len).copy_from(output, len);
            for scratch in self.audio_scratch.iter_mut().take(channels) {
                scratch.ensure(len);
            }
            process_audio(
                self.processors[0].as_mut(),
                &mut self.audio_scratch[..channels],
                &fragments,
                &self.keyframes,
                &request,
            )?;
            self.processed = Some(Processed {
                start,
                len,
                rate: rate.to_bits(),
                direction,
            });
        }
        output.copy_from(&self.audio_scratch[buffer_index], len);
        Ok(())
    }

    /// Process one frame at `position` for virtual channel `buffer_index`.
    pub fn render_video(
        &mut self,
        frame: &mut Frame,
        buffer_index: usize,
        position: i64,
        rate: f64,
        playhead_secs: f64,
        direction: Direction,
    ) -> MontageResult<()> {
        if !self.on || self.processors.is_empty() {
            return Ok(());
        }
        let request = self.request(rate, direction, playhead_secs, buffer_index);
        let fragments =
            keyframe_fragments(&self.keyframes, position, 1, rate, self.project_rate, direction);

        if !self.multichannel {
            let processor = match self.processors.get_mut(buffer_index) {
                Some(processor) => processor.as_mut(),
                None => return Ok(()),
            };
            frame.transfer_to(processor.preferred_location());
            return process_video(
                processor,
                std::slice::from_mut(frame),
                &fragments,
                &self.keyframes,
                &request,
            );
        }

        if !self.is_processed(position, 1, rate, direction) {
            let channels = self.attached.len().max(buffer_index + 1);
            self.video_input(buffer_index, frame).copy_from(frame);
            let location = self.processors[0].preferred_location();
            for scratch in self.video_scratch.iter_mut().take(channels) {
                scratch.transfer_to(location);
            }
            process_video(
                self.processors[0].as_mut(),
                &mut self.video_scratch[..channels],
                &fragments,
                &self.keyframes,
                &request,
            )?;
            self.processed = Some(Processed {
                start: position,
                len: 1,
                rate: rate.to_bits(),
                direction,
            });
        }
        frame.copy_from(&self.video_scratch[buffer_index]);
        Ok(())
    }

    /// Drop the history of every instance.
    pub fn reset(&mut self) {
        for processor in &mut self.processors {
            processor.reset();
        }
        self.processed = None;
    }
}

fn process_audio(
    processor: &mut dyn PluginProcessor,
    buffers: &mut [Samples],
    fragments: &[KeyframeFragment],
    keyframes: &KeyframeList,
    request: &Request,
) -> MontageResult<()> {
    for fragment in fragments {
        let saved: Vec<usize> = buffers.iter().map(Samples::offset).collect();
        for (buffer, offset) in buffers.iter_mut().zip(&saved) {
            buffer.set_offset(offset + fragment.offset);
        }
        let ctx = request.context(keyframes, fragment);
        tracing::trace!(
            target: PLUGIN_TARGET,
            plugin = processor.name(),
            start = fragment.cursor,
            len = fragment.len,
            keyframe = ctx.keyframe().position,
            "Process audio fragment"
        );
        let result = processor.process_audio(&ctx, buffers, fragment.len);
        for (buffer, offset) in buffers.iter_mut().zip(saved) {
            buffer.set_offset(offset);
        }
        result?;
    }
    Ok(())
}

fn process_video(
    processor: &mut dyn PluginProcessor,
    frames: &mut [Frame],
    fragments: &[KeyframeFragment],
    keyframes: &KeyframeList,
    request: &Request,
) -> MontageResult<()> {
    for fragment in fragments {
        let ctx = request.context(keyframes, fragment);
        tracing::trace!(
            target: PLUGIN_TARGET,
            plugin = processor.name(),
            position = fragment.cursor,
            keyframe = ctx.keyframe().position,
            "Process video frame"
        );
        processor.process_video(&ctx, frames)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use montage_timeline::Keyframe;

    use crate::plugin::PluginDescriptor;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        start: i64,
        len: usize,
        keyframe: i64,
        offset: usize,
        playhead_secs: f64,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl PluginProcessor for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn process_audio(
            &mut self,
            ctx: &ProcessContext<'_>,
            buffers: &mut [Samples],
            len: usize,
        ) -> MontageResult<()> {
            self.calls.lock().unwrap().push(Call {
                start: ctx.start,
                len,
                keyframe: ctx.keyframe().position,
                offset: buffers[0].offset(),
                playhead_secs: ctx.playhead_secs,
            });
            buffers[0].window_mut(len).fill(ctx.keyframe().position as f64);
            Ok(())
        }
    }

    fn registry(calls: Arc<Mutex<Vec<Call>>>) -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtins();
        registry.register(
            PluginDescriptor {
                name: "recorder".to_string(),
                description: String::new(),
                multichannel: false,
                synthesis: false,
                audio: true,
                video: false,
            },
            Arc::new(move || -> Box<dyn PluginProcessor> {
                Box::new(Recorder {
                    calls: Arc::clone(&calls),
                })
            }),
        );
        registry
    }

    fn keyframes(positions: &[i64]) -> KeyframeList {
        positions
            .iter()
            .map(|p| Keyframe::new(*p, p.to_string()))
            .collect::<Vec<_>>()
            .into()
    }

    fn point(plugin: &Plugin, registry: &PluginRegistry, channels: usize) -> AttachmentPoint {
        let owner = PluginKey {
            track: TrackId(1),
            index: 0,
        };
        let mut point = AttachmentPoint::new(owner, plugin, 48000.0, registry);
        for channel in 0..channels {
            point.attach(TrackId(channel as u32 + 1));
        }
        point.finalize();
        point
    }

    #[test]
    fn test_forward_render_splits_at_keyframe() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(Arc::clone(&calls));
        let plugin = Plugin::new("recorder", 0, 48000).with_keyframes(keyframes(&[0, 1000]));
        let mut point = point(&plugin, &registry, 1);

        let mut output = Samples::new(200);
        point
            .render_audio(&mut output, 0, 900, 200, 48000.0, 1.0, Direction::Forward)
            .unwrap();

        let calls = calls.lock().unwrap();
        let ranges: Vec<(i64, usize, i64)> =
            calls.iter().map(|c| (c.start, c.len, c.keyframe)).collect();
        assert_eq!(ranges, vec![(900, 100, 0), (1000, 100, 1000)]);
        assert_eq!(calls[1].offset, 100);
        assert!((calls[1].playhead_secs - (1.0 + 100.0 / 48000.0)).abs() < 1e-12);
        assert_eq!(output.offset(), 0);
        assert_eq!(output.window(200)[99], 0.0);
        assert_eq!(output.window(200)[100], 1000.0);
    }

    #[test]
    fn test_reverse_render_splits_at_governing_keyframe() {
        let fragments = keyframe_fragments(
            &keyframes(&[0, 1000]),
            1100,
            200,
            48000.0,
            48000.0,
            Direction::Reverse,
        );
        let ranges: Vec<(i64, usize, usize)> =
            fragments.iter().map(|f| (f.cursor, f.len, f.keyframe)).collect();
        assert_eq!(ranges, vec![(1100, 100, 1), (1000, 100, 0)]);
    }

    #[test]
    fn test_keyframes_are_rate_converted() {
        let fragments = keyframe_fragments(
            &keyframes(&[0, 48000]),
            44000,
            200,
            44100.0,
            48000.0,
            Direction::Forward,
        );
        let ranges: Vec<(i64, usize)> = fragments.iter().map(|f| (f.cursor, f.len)).collect();
        assert_eq!(ranges, vec![(44000, 100), (44100, 100)]);
    }

    #[test]
    fn test_negative_positions_use_default_keyframe() {
        let fragments =
            keyframe_fragments(&keyframes(&[0, 10]), -5, 20, 1.0, 1.0, Direction::Forward);
        let ranges: Vec<(i64, usize, usize)> =
            fragments.iter().map(|f| (f.cursor, f.len, f.keyframe)).collect();
        assert_eq!(ranges, vec![(-5, 5, 0), (0, 10, 0), (10, 5, 1)]);
    }

    #[test]
    fn test_off_and_unbound_plugins_pass_through() {
        let registry = PluginRegistry::with_builtins();
        let mut output = Samples::from_vec(vec![1.0, 2.0]);

        let off = Plugin::new("invert", 0, 10).with_on(false);
        point(&off, &registry, 1)
            .render_audio(&mut output, 0, 0, 2, 48000.0, 0.0, Direction::Forward)
            .unwrap();
        let unknown = Plugin::new("no_such_plugin", 0, 10);
        let mut unbound = point(&unknown, &registry, 1);
        assert!(!unbound.is_bound());
        unbound
            .render_audio(&mut output, 0, 0, 2, 48000.0, 0.0, Direction::Forward)
            .unwrap();
        assert_eq!(output.window(2), &[1.0, 2.0]);
    }

    #[test]
    fn test_multichannel_result_is_shared() {
        let registry = PluginRegistry::with_builtins();
        let plugin = Plugin::new("downmix", 0, 100);
        let mut point = point(&plugin, &registry, 2);

        point
            .audio_input(1, 2)
            .window_mut(2)
            .copy_from_slice(&[0.0, 1.0]);
        let mut first = Samples::from_vec(vec![1.0, 0.0]);
        point
            .render_audio(&mut first, 0, 0, 2, 48000.0, 0.0, Direction::Forward)
            .unwrap();
        assert_eq!(first.window(2), &[0.5, 0.5]);
        assert!(point.is_processed(0, 2, 48000.0, Direction::Forward));

        let mut second = Samples::from_vec(vec![9.0, 9.0]);
        point
            .render_audio(&mut second, 1, 0, 2, 48000.0, 0.0, Direction::Forward)
            .unwrap();
        assert_eq!(second.window(2), &[0.5, 0.5]);
    }

    #[test]
    fn test_instances_follow_attached_channels() {
        let registry = PluginRegistry::with_builtins();
        let plugin = Plugin::new("gain", 0, 100);
        let mut point = point(&plugin, &registry, 3);
        assert_eq!(point.processors.len(), 3);
        point.detach_all();
        point.attach(TrackId(9));
        point.finalize();
        assert_eq!(point.processors.len(), 3);
        assert_eq!(point.attached(), &[TrackId(9)]);
    }
}
