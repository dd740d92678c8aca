//! Audio schedule and peak meter history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use montage_common::clock::{PlaybackClock, RateController};
use montage_common::error::MontageResult;
use montage_common::logging::SCHEDULE_TARGET;
use montage_timeline::{to_secs, Direction, MediaKind, TrackId};

use crate::buffers::Samples;
use crate::device::AudioDevice;
use crate::engine::EngineShared;
use crate::graph::VirtualConsole;
use crate::schedule::{SchedulePolicy, ScheduleCursor};

/// Meter updates per second the UI polls at.
pub const TRACKING_RATE: u32 = 10;

/// Peak of one meter fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterPeak {
    pub peak: f64,
    /// Cursor at the start of the meter fragment.
    pub position: i64,
}

/// Rolling per-track history of peaks, so the UI can show the level of
/// what is audible now rather than what was just rendered.
#[derive(Debug, Clone)]
pub struct PeakMeter {
    meter_fragment: usize,
    total_peaks: usize,
    tracks: HashMap<TrackId, VecDeque<MeterPeak>>,
}

pub type SharedMeter = Arc<Mutex<PeakMeter>>;

impl PeakMeter {
    pub fn new(fragment_len: usize, sample_rate: u32) -> Self {
        let fragment_len = fragment_len.max(1);
        let limit = (sample_rate / TRACKING_RATE).max(1) as usize;
        let mut meter_fragment = fragment_len;
        while meter_fragment > limit {
            meter_fragment /= 2;
        }
        let meter_fragment = meter_fragment.max(1);
        Self {
            meter_fragment,
            total_peaks: 16 * fragment_len / meter_fragment,
            tracks: HashMap::new(),
        }
    }

    pub fn shared(fragment_len: usize, sample_rate: u32) -> SharedMeter {
        Arc::new(Mutex::new(Self::new(fragment_len, sample_rate)))
    }

    pub fn meter_fragment(&self) -> usize {
        self.meter_fragment
    }

    pub fn total_peaks(&self) -> usize {
        self.total_peaks
    }

    /// Record the peaks of `len` samples of `samples` rendered at `cursor`.
    pub fn record(&mut self, track: TrackId, samples: &Samples, cursor: i64, len: usize, direction: Direction) {
        let ring = self.tracks.entry(track).or_default();
        let window = samples.window(len);
        let mut offset = 0;
        while offset < window.len() {
            let end = (offset + self.meter_fragment).min(window.len());
            let peak = window[offset..end]
                .iter()
                .fold(0.0f64, |peak, s| peak.max(s.abs()));
            ring.push_back(MeterPeak {
                peak,
                position: direction.step(cursor, offset as i64),
            });
            if ring.len() > self.total_peaks {
                ring.pop_front();
            }
            offset = end;
        }
    }

    /// Index of the history entry closest to `position`.
    pub fn history_index(&self, track: TrackId, position: i64) -> Option<usize> {
        self.tracks
            .get(&track)?
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (p.position - position).abs())
            .map(|(index, _)| index)
    }

    /// Peak audible at `position`.
    pub fn peak_at(&self, track: TrackId, position: i64) -> Option<f64> {
        let index = self.history_index(track, position)?;
        self.tracks.get(&track).map(|ring| ring[index].peak)
    }

    pub fn history(&self, track: TrackId) -> Vec<MeterPeak> {
        self.tracks
            .get(&track)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

/// Walks the timeline in audio fragments, rendering each through the
/// audio console.
#[derive(Debug)]
pub struct AudioSchedule {
    console: VirtualConsole,
    cursor: ScheduleCursor,
    fragment_len: usize,
    outputs: Vec<Samples>,
    sub_fragments: Vec<(i64, usize)>,
    meter: SharedMeter,
}

impl AudioSchedule {
    /// `fragment_len` is the adjusted fragment length; `channels` the number
    /// of output channels.
    pub fn new(console: VirtualConsole, cursor: ScheduleCursor, fragment_len: usize, channels: usize) -> Self {
        let fragment_len = fragment_len.max(1);
        let meter = PeakMeter::shared(fragment_len, console.edl().session.sample_rate);
        let console = console.with_meter(Arc::clone(&meter));
        Self {
            console,
            cursor,
            fragment_len,
            outputs: vec![Samples::new(fragment_len); channels],
            sub_fragments: Vec::new(),
            meter,
        }
    }

    pub fn meter(&self) -> SharedMeter {
        Arc::clone(&self.meter)
    }

    pub fn console(&self) -> &VirtualConsole {
        &self.console
    }

    pub fn fragment_len(&self) -> usize {
        self.fragment_len
    }

    /// Output buffers of the last [`SchedulePolicy::render_fragment`].
    pub fn outputs(&self) -> &[Samples] {
        &self.outputs
    }

    /// Sub-fragments `(position, len)` of the last processed buffer.
    pub fn last_sub_fragments(&self) -> &[(i64, usize)] {
        &self.sub_fragments
    }

    /// Render `len` samples at `position` into `outputs`.
    ///
    /// The buffer is split wherever the graph could need rebuilding; each
    /// sub-fragment renders at its own offset into the outputs, which are
    /// restored before returning.
    pub fn process_buffer(&mut self, outputs: &mut [Samples], len: usize, position: i64) -> MontageResult<()> {
        let direction = self.cursor.direction();
        let saved: Vec<usize> = outputs.iter().map(Samples::offset).collect();
        self.sub_fragments.clear();

        let mut done = 0usize;
        let mut cursor = position;
        while done < len {
            let mut fragment = (len - done) as i64;
            if self.console.test_reconfigure(cursor, &mut fragment) {
                self.console.rebuild(cursor);
            }
            let fragment = fragment.max(1) as usize;

            for (output, offset) in outputs.iter_mut().zip(&saved) {
                output.set_offset(offset + done);
            }
            let result = self.console.render_audio(outputs, cursor, fragment);
            for (output, offset) in outputs.iter_mut().zip(&saved) {
                output.set_offset(*offset);
            }
            result?;

            tracing::trace!(target: SCHEDULE_TARGET, cursor, len = fragment, "Audio sub-fragment");
            self.sub_fragments.push((cursor, fragment));
            done += fragment;
            cursor = direction.step(cursor, fragment as i64);
        }
        Ok(())
    }

    /// Realtime loop: render, wait for the first video frame once, write
    /// and advance until the range ends or the engine is interrupted.
    pub fn run(&mut self, device: &dyn AudioDevice, shared: &EngineShared) -> MontageResult<()> {
        let rate = self.console.rate();
        let mut first = true;
        let clock = PlaybackClock::start();
        let mut tracking = RateController::new(TRACKING_RATE);

        while !shared.is_interrupted() {
            let mut len = self.fragment_len as i64;
            self.get_boundaries(&mut len);
            if len <= 0 {
                break;
            }
            let position = self.cursor.position();
            if let Err(e) = self.render_fragment(position, len) {
                tracing::warn!(target: SCHEDULE_TARGET, position, error = %e, "Audio render failed, writing silence");
                for output in &mut self.outputs {
                    output.clear(len as usize);
                }
            }

            if first {
                shared.latch().wait();
                first = false;
                if shared.is_interrupted() {
                    break;
                }
            }

            let windows: Vec<&[f64]> = self.outputs.iter().map(|o| o.window(len as usize)).collect();
            if let Err(e) = device.write(&windows) {
                tracing::warn!(target: SCHEDULE_TARGET, position, error = %e, "Audio device write failed");
                shared.interrupt();
                return Err(e);
            }
            self.advance(len);
            if tracking.should_tick(clock.elapsed_ns()) {
                shared.set_tracking(to_secs(self.cursor.project(device.position()), rate));
            }
        }

        if !shared.is_interrupted() {
            device.set_last_buffer();
            device.wait_for_completion();
        }
        shared.set_tracking(to_secs(self.cursor.project(device.position()), rate));
        tracing::debug!(
            target: SCHEDULE_TARGET,
            builds = self.console.build_count(),
            interrupted = shared.is_interrupted(),
            "Audio schedule finished"
        );
        Ok(())
    }
}

impl SchedulePolicy for AudioSchedule {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn cursor(&self) -> &ScheduleCursor {
        &self.cursor
    }

    fn cursor_mut(&mut self) -> &mut ScheduleCursor {
        &mut self.cursor
    }

    fn test_reconfigure(&mut self, position: i64, len: &mut i64) -> bool {
        self.console.test_reconfigure(position, len)
    }

    fn render_fragment(&mut self, position: i64, len: i64) -> MontageResult<()> {
        let mut outputs = std::mem::take(&mut self.outputs);
        let result = self.process_buffer(&mut outputs, len.max(0) as usize, position);
        self.outputs = outputs;
        result
    }
}
