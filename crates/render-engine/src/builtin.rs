//! Built-in plugin implementations.

use std::collections::VecDeque;
use std::sync::Arc;

use montage_common::error::MontageResult;

use crate::buffers::{Frame, Samples};
use crate::plugin::{
    PluginDescriptor, PluginFactory, PluginProcessor, PluginRegistry, ProcessContext,
};

pub(crate) fn register_all(registry: &mut PluginRegistry) {
    registry.register(
        descriptor("gain", "Scale by the keyframe value", false, false, true, false),
        factory::<Gain>(),
    );
    registry.register(
        descriptor(
            "moving_average",
            "Average over the last N samples, N from the keyframe (default 8)",
            false,
            false,
            true,
            false,
        ),
        factory::<MovingAverage>(),
    );
    registry.register(
        descriptor("invert", "Invert color channels or sample polarity", false, false, true, true),
        factory::<Invert>(),
    );
    registry.register(
        descriptor(
            "tone",
            "Sine tone at the keyframe frequency (default 440 Hz)",
            false,
            true,
            true,
            false,
        ),
        factory::<Tone>(),
    );
    registry.register(
        descriptor(
            "downmix",
            "Replace every attached channel with their average",
            true,
            false,
            true,
            true,
        ),
        factory::<Downmix>(),
    );
}

fn factory<P: PluginProcessor + Default + 'static>() -> PluginFactory {
    Arc::new(|| -> Box<dyn PluginProcessor> { Box::new(P::default()) })
}

fn descriptor(
    name: &str,
    description: &str,
    multichannel: bool,
    synthesis: bool,
    audio: bool,
    video: bool,
) -> PluginDescriptor {
    PluginDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        multichannel,
        synthesis,
        audio,
        video,
    }
}

/// Constant gain. Stateless, so forward and reverse output match.
#[derive(Default)]
pub struct Gain;

impl PluginProcessor for Gain {
    fn name(&self) -> &str {
        "gain"
    }

    fn process_audio(
        &mut self,
        ctx: &ProcessContext<'_>,
        buffers: &mut [Samples],
        len: usize,
    ) -> MontageResult<()> {
        let gain = ctx.parameter(1.0);
        for buffer in buffers {
            buffer.window_mut(len).iter_mut().for_each(|s| *s *= gain);
        }
        Ok(())
    }
}

/// Boxcar filter with a finite history of `taps - 1` samples.
///
/// History persists between calls while they are contiguous and is
/// cleared when a call does not start where the previous one ended.
#[derive(Default)]
pub struct MovingAverage {
    channels: Vec<AverageState>,
}

#[derive(Default)]
struct AverageState {
    history: VecDeque<f64>,
    expected_start: Option<i64>,
}

impl MovingAverage {
    pub const DEFAULT_TAPS: usize = 8;
}

impl PluginProcessor for MovingAverage {
    fn name(&self) -> &str {
        "moving_average"
    }

    fn process_audio(
        &mut self,
        ctx: &ProcessContext<'_>,
        buffers: &mut [Samples],
        len: usize,
    ) -> MontageResult<()> {
        let taps = ctx
            .keyframe()
            .data
            .trim()
            .parse::<usize>()
            .unwrap_or(Self::DEFAULT_TAPS)
            .max(1);
        let index = ctx.buffer_index;
        if self.channels.len() <= index {
            self.channels.resize_with(index + 1, AverageState::default);
        }
        let state = &mut self.channels[index];
        if state.expected_start != Some(ctx.start) || state.history.len() != taps {
            state.history = VecDeque::from(vec![0.0; taps]);
        }
        for buffer in buffers {
            for sample in buffer.window_mut(len) {
                state.history.pop_front();
                state.history.push_back(*sample);
                *sample = state.history.iter().sum::<f64>() / taps as f64;
            }
        }
        state.expected_start = Some(ctx.direction.step(ctx.start, len as i64));
        Ok(())
    }

    fn reset(&mut self) {
        self.channels.clear();
    }
}

/// Polarity or color inversion.
#[derive(Default)]
pub struct Invert;

impl PluginProcessor for Invert {
    fn name(&self) -> &str {
        "invert"
    }

    fn process_audio(
        &mut self,
        _ctx: &ProcessContext<'_>,
        buffers: &mut [Samples],
        len: usize,
    ) -> MontageResult<()> {
        for buffer in buffers {
            buffer.window_mut(len).iter_mut().for_each(|s| *s = -*s);
        }
        Ok(())
    }

    fn process_video(&mut self, _ctx: &ProcessContext<'_>, frames: &mut [Frame]) -> MontageResult<()> {
        for frame in frames {
            for px in frame.pixels_mut() {
                px[0] = 1.0 - px[0];
                px[1] = 1.0 - px[1];
                px[2] = 1.0 - px[2];
            }
        }
        Ok(())
    }
}

/// Synthesis plugin: replaces its input with a sine at absolute positions.
#[derive(Default)]
pub struct Tone;

impl PluginProcessor for Tone {
    fn name(&self) -> &str {
        "tone"
    }

    fn process_audio(
        &mut self,
        ctx: &ProcessContext<'_>,
        buffers: &mut [Samples],
        len: usize,
    ) -> MontageResult<()> {
        let frequency = ctx.parameter(440.0);
        for buffer in buffers {
            for (i, sample) in buffer.window_mut(len).iter_mut().enumerate() {
                let t = ctx.unit(i) as f64 / ctx.rate;
                *sample = 0.5 * (2.0 * std::f64::consts::PI * frequency * t).sin();
            }
        }
        Ok(())
    }
}

/// Multichannel plugin averaging every attached channel.
#[derive(Default)]
pub struct Downmix;

impl PluginProcessor for Downmix {
    fn name(&self) -> &str {
        "downmix"
    }

    fn multichannel(&self) -> bool {
        true
    }

    fn process_audio(
        &mut self,
        _ctx: &ProcessContext<'_>,
        buffers: &mut [Samples],
        len: usize,
    ) -> MontageResult<()> {
        if buffers.is_empty() {
            return Ok(());
        }
        let count = buffers.len() as f64;
        let mut mix = vec![0.0; len];
        for buffer in buffers.iter() {
            for (m, s) in mix.iter_mut().zip(buffer.window(len)) {
                *m += s / count;
            }
        }
        for buffer in buffers.iter_mut() {
            buffer.window_mut(len).copy_from_slice(&mix);
        }
        Ok(())
    }

    fn process_video(&mut self, _ctx: &ProcessContext<'_>, frames: &mut [Frame]) -> MontageResult<()> {
        let Some(first) = frames.first() else {
            return Ok(());
        };
        let count = frames.len() as f32;
        let mut mix = vec![[0.0f32; 4]; first.pixels().len()];
        for frame in frames.iter() {
            for (m, px) in mix.iter_mut().zip(frame.pixels()) {
                for c in 0..4 {
                    m[c] += px[c] / count;
                }
            }
        }
        for frame in frames.iter_mut() {
            for (px, m) in frame.pixels_mut().iter_mut().zip(&mix) {
                *px = *m;
            }
        }
        Ok(())
    }
}
