//! Property tests for reconfiguration-driven sub-fragments.
//!
//! Sub-fragments of one processed buffer sum to its length and cover every
//! position exactly once, no matter where edits, plugins and mutes change
//! the graph.

use std::sync::Arc;

use montage_render_engine::{
    AssetCache, AudioSchedule, GeneratorOpener, PlaybackRange, PluginRegistry, Samples,
    ScheduleCursor, SchedulePolicy, VirtualConsole,
};
use montage_timeline::{
    Asset, AssetId, AudioParams, Direction, Edit, Edl, Generator, Interpolation, MediaKind, Plugin,
    Session, Track, TrackId,
};
use proptest::prelude::*;

fn session() -> Session {
    Session {
        sample_rate: 1000,
        frame_rate: 10.0,
        audio_channels: 2,
        output_width: 2,
        output_height: 2,
    }
}

fn ramp() -> Asset {
    Asset::generated(
        AssetId(1),
        Generator::Ramp { period: 500 },
        Some(AudioParams {
            channels: 1,
            sample_rate: 1000,
            length: 100_000,
        }),
        None,
    )
}

fn schedule(edl: Edl, len: i64) -> AudioSchedule {
    let console = VirtualConsole::new(
        MediaKind::Audio,
        Arc::new(edl),
        Direction::Forward,
        Arc::new(AssetCache::new(Arc::new(GeneratorOpener), 1 << 20)),
        Arc::new(PluginRegistry::with_builtins()),
    );
    let cursor = ScheduleCursor::new(PlaybackRange::new(0, len), Direction::Forward, false);
    AudioSchedule::new(console, cursor, len as usize, 2)
}

/// Track 1 silent on [0, 100) then playing; track 2 playing throughout.
fn silent_then_playing() -> Edl {
    Edl::new(session())
        .with_asset(ramp())
        .with_track(
            Track::new(TrackId(1), MediaKind::Audio)
                .with_edit(Edit::silence(0, 100))
                .with_edit(Edit::asset(100, 100, AssetId(1))),
        )
        .with_track(Track::new(TrackId(2), MediaKind::Audio).with_edit(Edit::asset(0, 200, AssetId(1))))
}

#[test]
fn test_silent_track_becoming_playable_bounds_fragment() {
    let mut schedule = schedule(silent_then_playing(), 200);
    schedule.render_fragment(0, 50).unwrap();

    let mut len = 100;
    assert!(!schedule.test_reconfigure(50, &mut len));
    assert_eq!(len, 50);

    let mut len = 100;
    assert!(schedule.test_reconfigure(100, &mut len));
}

#[test]
fn test_buffer_splits_where_playable_set_changes() {
    let mut schedule = schedule(silent_then_playing(), 200);
    let mut outputs = vec![Samples::new(200); 2];
    schedule.process_buffer(&mut outputs, 200, 0).unwrap();
    assert_eq!(schedule.last_sub_fragments(), &[(0, 100), (100, 100)]);
    assert_eq!(schedule.console().entry_count(), 2);
    assert!(outputs.iter().all(|o| o.offset() == 0));
}

/// A track described by (gap, length, has_data) edits laid end to end,
/// an optional plugin range and an optional mute point.
#[derive(Debug, Clone)]
struct TrackLayout {
    edits: Vec<(i64, i64, bool)>,
    plugin: Option<(i64, i64)>,
    mute_at: Option<i64>,
}

fn layout() -> impl Strategy<Value = TrackLayout> {
    (
        prop::collection::vec((0i64..40, 1i64..120, any::<bool>()), 1..6),
        prop::option::of((0i64..300, 1i64..200)),
        prop::option::of(0i64..400),
    )
        .prop_map(|(edits, plugin, mute_at)| TrackLayout {
            edits,
            plugin,
            mute_at,
        })
}

fn track(id: u32, layout: &TrackLayout) -> Track {
    let mut track = Track::new(TrackId(id), MediaKind::Audio);
    let mut cursor = 0;
    for (gap, length, has_data) in &layout.edits {
        cursor += gap;
        track = track.with_edit(if *has_data {
            Edit::asset(cursor, *length, AssetId(1))
        } else {
            Edit::silence(cursor, *length)
        });
        cursor += length;
    }
    if let Some((start, length)) = layout.plugin {
        track = track.with_plugin(Plugin::new("gain", start, length));
    }
    if let Some(position) = layout.mute_at {
        track.automation.mute = track
            .automation
            .mute
            .clone()
            .with_point(position, 1.0, Interpolation::Step);
    }
    track
}

proptest! {
    #[test]
    fn prop_sub_fragments_cover_run_once(
        layouts in prop::collection::vec(layout(), 1..4),
        len in 1i64..600,
    ) {
        let edl = layouts
            .iter()
            .enumerate()
            .fold(Edl::new(session()).with_asset(ramp()), |edl, (i, layout)| {
                edl.with_track(track(i as u32 + 1, layout))
            });
        let mut schedule = schedule(edl, len);
        let mut outputs = vec![Samples::new(len as usize); 2];
        schedule.process_buffer(&mut outputs, len as usize, 0).unwrap();

        let fragments = schedule.last_sub_fragments();
        let total: usize = fragments.iter().map(|(_, n)| *n).sum();
        prop_assert_eq!(total as i64, len);

        let mut expected = 0i64;
        for (position, n) in fragments {
            prop_assert_eq!(*position, expected);
            prop_assert!(*n > 0);
            expected += *n as i64;
        }
    }
}
