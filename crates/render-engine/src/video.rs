//! Video schedule and the AV sync control loop.

use std::time::Duration;

use montage_common::clock::{DriftMeasurement, PlaybackClock};
use montage_common::error::MontageResult;
use montage_common::logging::SCHEDULE_TARGET;
use montage_timeline::{to_secs, MediaKind};

use crate::buffers::Frame;
use crate::device::VideoDevice;
use crate::engine::EngineShared;
use crate::graph::VirtualConsole;
use crate::schedule::{SchedulePolicy, ScheduleCursor};

/// Default hysteresis budget of the skip and delay counters.
pub const SYNC_THRESHOLD: u32 = 5;

/// Drift logged as a warning once it exceeds this many milliseconds.
const DRIFT_WARNING_MS: f64 = 200.0;

/// What the sync loop decided for one presented frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncDecision {
    /// Frames to move the session counter (and the cursor) by. Values
    /// above 1 drop frames.
    pub frame_step: i64,
    /// Time to wait before presenting the frame.
    pub sleep: Option<Duration>,
    pub late: bool,
    pub first_frame: bool,
}

/// Frame pacing against the sync position.
///
/// A late frame is presented immediately. While the skip budget lasts the
/// schedule still advances one frame at a time; once it runs out the
/// counter jumps to where the sync position is. An on-time frame waits
/// for its start time, except while the delay budget lasts after a run of
/// late frames. The budgets give the loop hysteresis so a single slow
/// frame neither drops frames nor stalls playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AvSync {
    frame_rate: f64,
    threshold: u32,
    every_frame: bool,
    skip_countdown: u32,
    delay_countdown: u32,
    session_frame: i64,
    first_frame: bool,
}

impl AvSync {
    pub fn new(frame_rate: f64, threshold: u32, every_frame: bool) -> Self {
        Self {
            frame_rate,
            threshold,
            every_frame,
            skip_countdown: threshold,
            delay_countdown: threshold,
            session_frame: 0,
            first_frame: true,
        }
    }

    /// Frames presented or dropped since playback started.
    pub fn session_frame(&self) -> i64 {
        self.session_frame
    }

    pub fn skip_countdown(&self) -> u32 {
        self.skip_countdown
    }

    pub fn delay_countdown(&self) -> u32 {
        self.delay_countdown
    }

    /// Decide how to present the next frame given the sync position
    /// `current_secs`, already scaled by the playback speed.
    pub fn decide(&mut self, current_secs: f64) -> SyncDecision {
        let rate = self.frame_rate;
        let start = (self.session_frame - 1) as f64 / rate;
        let end = self.session_frame as f64 / rate;
        let first_frame = self.first_frame;
        let late = first_frame || current_secs > end;

        let mut frame_step = 1;
        let mut sleep = None;
        if late {
            if self.every_frame {
                frame_step = 1;
            } else if self.skip_countdown > 0 {
                self.skip_countdown -= 1;
                frame_step = 1;
            } else {
                self.delay_countdown = self.threshold;
                frame_step = (1 + (current_secs * rate).floor() as i64 - (end * rate).floor() as i64).max(1);
            }
        } else if self.delay_countdown > 0 {
            self.delay_countdown -= 1;
        } else {
            self.skip_countdown = self.threshold;
            if start > current_secs {
                sleep = Some(Duration::from_secs_f64(start - current_secs));
            }
        }

        self.first_frame = false;
        self.session_frame += frame_step;
        SyncDecision {
            frame_step,
            sleep,
            late,
            first_frame,
        }
    }
}

/// Walks the timeline one frame at a time, rendering through the video
/// console.
#[derive(Debug)]
pub struct VideoSchedule {
    console: VirtualConsole,
    cursor: ScheduleCursor,
    frame: Frame,
    sync: AvSync,
    frames_presented: u64,
    frames_dropped: u64,
}

impl VideoSchedule {
    pub fn new(console: VirtualConsole, cursor: ScheduleCursor, sync: AvSync) -> Self {
        let session = &console.edl().session;
        let frame = Frame::new(session.output_width, session.output_height);
        Self {
            console,
            cursor,
            frame,
            sync,
            frames_presented: 0,
            frames_dropped: 0,
        }
    }

    pub fn console(&self) -> &VirtualConsole {
        &self.console
    }

    /// Frame of the last [`SchedulePolicy::render_fragment`].
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Render the frame under `position` into `frame`.
    pub fn process_buffer(&mut self, frame: &mut Frame, position: i64) -> MontageResult<()> {
        let mut len = 1;
        if self.console.test_reconfigure(position, &mut len) {
            self.console.rebuild(position);
        }
        self.console.render_video(frame, position)
    }

    /// Realtime loop: render, pace against the sync position, present and
    /// advance by the decided step until the range ends or the engine is
    /// interrupted.
    pub fn run(&mut self, device: &dyn VideoDevice, shared: &EngineShared) -> MontageResult<()> {
        let rate = self.console.rate();
        let speed = shared.speed().abs();
        let mut counter_clock = PlaybackClock::start();
        let mut counted: u64 = 0;
        let report_every = rate.round().max(1.0) as u64;

        while !shared.is_interrupted() {
            let mut len = 1;
            self.get_boundaries(&mut len);
            if len <= 0 {
                break;
            }
            let position = self.cursor.position();
            if let Err(e) = self.render_fragment(position, 1) {
                tracing::warn!(target: SCHEDULE_TARGET, position, error = %e, "Video render failed, showing black");
                self.frame.clear();
            }

            let current = shared.sync().position_secs() * speed;
            let decision = self.sync.decide(current);
            tracing::trace!(
                target: SCHEDULE_TARGET,
                position,
                current,
                step = decision.frame_step,
                late = decision.late,
                "Video sync decision"
            );

            if let Some(wait) = decision.sleep {
                shared.sleep(wait);
                if shared.is_interrupted() {
                    break;
                }
            }

            if let Err(e) = device.write_frame(&self.frame) {
                tracing::warn!(target: SCHEDULE_TARGET, position, error = %e, "Video device write failed");
                shared.interrupt();
                return Err(e);
            }
            self.frames_presented += 1;

            if decision.first_frame {
                shared.latch().release();
                shared.sync().reset();
            } else {
                let expected = (self.sync.session_frame() - decision.frame_step) as f64 / rate;
                let drift = DriftMeasurement::from_secs(expected, current);
                if drift.exceeds_threshold_ms(DRIFT_WARNING_MS) {
                    tracing::debug!(
                        target: SCHEDULE_TARGET,
                        drift_ms = drift.drift_ms(),
                        "Video drifting from sync position"
                    );
                }
            }

            let consumed = self.drain(decision.frame_step);
            self.frames_dropped += (consumed - 1).max(0) as u64;
            shared.set_tracking(to_secs(self.cursor.position(), rate));

            counted += 1;
            if counted >= report_every {
                let elapsed = counter_clock.elapsed_secs();
                if elapsed > 0.0 {
                    shared.report_framerate(counted as f64 / elapsed);
                }
                counter_clock = PlaybackClock::start();
                counted = 0;
            }
        }

        tracing::debug!(
            target: SCHEDULE_TARGET,
            presented = self.frames_presented,
            dropped = self.frames_dropped,
            builds = self.console.build_count(),
            "Video schedule finished"
        );
        Ok(())
    }
}

impl SchedulePolicy for VideoSchedule {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
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

    fn render_fragment(&mut self, position: i64, _len: i64) -> MontageResult<()> {
        let mut frame = std::mem::replace(&mut self.frame, Frame::new(0, 0));
        let result = self.process_buffer(&mut frame, position);
        self.frame = frame;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_is_presented_without_waiting() {
        let mut sync = AvSync::new(25.0, SYNC_THRESHOLD, false);
        let decision = sync.decide(0.0);
        assert!(decision.first_frame);
        assert_eq!(decision.frame_step, 1);
        assert_eq!(decision.sleep, None);
        assert!(!sync.decide(0.0).first_frame);
    }

    #[test]
    fn test_early_frame_sleeps_until_start() {
        let mut sync = AvSync::new(10.0, 0, false);
        sync.decide(0.0);
        sync.decide(0.0);
        let decision = sync.decide(0.0);
        assert!(!decision.late);
        let sleep = decision.sleep.unwrap().as_secs_f64();
        assert!((sleep - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_every_frame_never_drops() {
        let mut sync = AvSync::new(10.0, 0, true);
        for i in 0..20 {
            assert_eq!(sync.decide(i as f64).frame_step, 1);
        }
    }

    #[test]
    fn test_delay_budget_defers_sleep_after_lateness() {
        let mut sync = AvSync::new(10.0, 2, false);
        sync.decide(0.0);
        // Late with the skip budget left: no drop yet.
        assert_eq!(sync.decide(0.5).frame_step, 1);
        assert_eq!(sync.skip_countdown(), 0);
        // Budget exhausted: jump to the sync position.
        let jump = sync.decide(0.5);
        assert_eq!(jump.frame_step, 1 + 5 - 2);
        assert_eq!(sync.delay_countdown(), 2);
        assert_eq!(sync.session_frame(), 5);
        // On time again: the delay budget absorbs the sleeps first.
        assert_eq!(sync.decide(0.35).sleep, None);
        assert_eq!(sync.decide(0.35).sleep, None);
        assert!(sync.decide(0.35).sleep.is_some());
        assert_eq!(sync.skip_countdown(), 2);
    }
}
