//! Automation curves render the same whether a range is processed in one
//! buffer or started part way through.

use std::sync::Arc;

use montage_render_engine::{
    AssetCache, AudioSchedule, GeneratorOpener, PlaybackRange, PluginRegistry, Samples,
    ScheduleCursor, VirtualConsole,
};
use montage_timeline::{
    Asset, AssetId, AudioParams, Autos, Direction, Edit, Edl, Generator, Interpolation, MediaKind,
    Session, Track, TrackId,
};
use proptest::prelude::*;

const LENGTH: i64 = 400;

fn edl(mute: Autos, fade: Autos) -> Edl {
    let session = Session {
        sample_rate: 1000,
        frame_rate: 10.0,
        audio_channels: 1,
        output_width: 2,
        output_height: 2,
    };
    let asset = Asset::generated(
        AssetId(1),
        Generator::Tone {
            frequency: 50.0,
            amplitude: 0.8,
        },
        Some(AudioParams {
            channels: 1,
            sample_rate: 1000,
            length: LENGTH,
        }),
        None,
    );
    let mut track = Track::new(TrackId(1), MediaKind::Audio).with_edit(Edit::asset(0, LENGTH, AssetId(1)));
    track.automation.mute = mute;
    track.automation.fade = fade;
    Edl::new(session).with_asset(asset).with_track(track)
}

/// Render `len` samples starting at `position` with a fresh schedule.
fn render(edl: &Arc<Edl>, position: i64, len: usize) -> Vec<f64> {
    let console = VirtualConsole::new(
        MediaKind::Audio,
        Arc::clone(edl),
        Direction::Forward,
        Arc::new(AssetCache::new(Arc::new(GeneratorOpener), 1 << 20)),
        Arc::new(PluginRegistry::with_builtins()),
    );
    let cursor = ScheduleCursor::new(PlaybackRange::new(0, LENGTH), Direction::Forward, false);
    let mut schedule = AudioSchedule::new(console, cursor, len, 1);
    let mut outputs = vec![Samples::new(len)];
    schedule.process_buffer(&mut outputs, len, position).unwrap();
    outputs[0].window(len).to_vec()
}

#[test]
fn test_linear_mute_ramp_matches_offset_start() {
    let mute = Autos::constant(0.0)
        .with_point(0, 0.0, Interpolation::Linear)
        .with_point(100, 1.0, Interpolation::Linear);
    let edl = Arc::new(edl(mute, Autos::constant(1.0)));

    let serial = render(&edl, 0, 100);
    let chunk = render(&edl, 60, 40);
    assert_eq!(&serial[60..100], &chunk[..]);
    assert!(chunk.iter().any(|s| *s != 0.0));

    // Muted from the point on, whichever side the buffer starts.
    assert!(render(&edl, 100, 50).iter().all(|s| *s == 0.0));
    assert!(render(&edl, 50, 100)[50..].iter().all(|s| *s == 0.0));
}

fn curve(default: f64, max_value: f64) -> impl Strategy<Value = Autos> {
    prop::collection::vec(
        (0i64..LENGTH, 0.0f64..max_value, any::<bool>()),
        0..5,
    )
    .prop_map(move |points| {
        points
            .into_iter()
            .fold(Autos::constant(default), |autos, (position, value, step)| {
                let interpolation = if step {
                    Interpolation::Step
                } else {
                    Interpolation::Linear
                };
                autos.with_point(position, value, interpolation)
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_automation_independent_of_buffer_start(
        mute in curve(0.0, 1.0),
        fade in curve(1.0, 2.0),
        start in 1i64..LENGTH,
    ) {
        let edl = Arc::new(edl(mute, fade));
        let serial = render(&edl, 0, LENGTH as usize);
        let chunk = render(&edl, start, (LENGTH - start) as usize);
        prop_assert_eq!(&serial[start as usize..], &chunk[..]);
    }
}
