//! Show timeline information.

use std::path::PathBuf;

use montage_timeline::{EditSource, MediaKind};

use super::load_edl;

pub fn run(path: PathBuf) -> anyhow::Result<()> {
    let edl = load_edl(&path)?;
    let s = &edl.session;

    println!("Timeline: {} (version {})", path.display(), edl.version);
    println!("  Duration: {:.3}s", edl.duration_secs());
    println!("  Audio: {} channels @ {} Hz", s.audio_channels, s.sample_rate);
    println!("  Video: {}x{} @ {} fps", s.output_width, s.output_height, s.frame_rate);
    println!();

    println!("Assets:");
    for asset in &edl.assets {
        let kind = match &asset.generator {
            Some(generator) => format!("{generator:?}"),
            None => asset.path.display().to_string(),
        };
        println!("  #{}: {kind}", asset.id.0);
        if let Some(a) = &asset.audio {
            println!("      audio: {} ch @ {} Hz, {} samples", a.channels, a.sample_rate, a.length);
        }
        if let Some(v) = &asset.video {
            println!(
                "      video: {} layers {}x{} @ {} fps, {} frames",
                v.layers, v.width, v.height, v.frame_rate, v.length
            );
        }
    }
    println!();

    for kind in [MediaKind::Audio, MediaKind::Video] {
        println!("{kind:?} tracks ({} units):", edl.total_length(kind));
        for track in edl.tracks_of(kind) {
            let silent = track
                .edits
                .iter()
                .filter(|e| matches!(e.source, EditSource::Silence))
                .count();
            println!(
                "  #{} {:?}: {} edits ({silent} silent), {} plugins{}",
                track.id.0,
                track.title,
                track.edits.len(),
                track.plugins.len(),
                if track.play { "" } else { " [muted]" }
            );
            for plugin in &track.plugins {
                let name = match plugin.shared {
                    Some(owner) => format!("shared with #{}:{}", owner.track.0, owner.index),
                    None => plugin.implementation.clone(),
                };
                println!(
                    "      {name} [{}, {}) {} keyframes{}",
                    plugin.start,
                    plugin.end(),
                    plugin.keyframes.len(),
                    if plugin.on { "" } else { " (off)" }
                );
            }
        }
        println!();
    }

    if !edl.nested.is_empty() {
        println!("Nested timelines: {}", edl.nested.len());
    }

    Ok(())
}
