//! Composition graph ("virtual console").
//!
//! One console per media kind. The console owns an arena of nodes keyed by
//! `(track, chain position)`: every playable track contributes a module
//! node reading its edits, followed by one node per active plugin slot.
//! Plugin processing state lives in a separate table of attachment points
//! keyed by the owning plugin, so slots shared between tracks resolve to
//! one instance and survive rebuilds.
//!
//! The graph is rebuilt whenever the set of playable tracks or the state
//! of their active plugins changes, see [`VirtualConsole::test_reconfigure`].

mod audio;
mod nested;
mod video;

use std::collections::HashMap;
use std::sync::Arc;

use montage_common::error::{MontageError, MontageResult};
use montage_common::logging::GRAPH_TARGET;
use montage_timeline::{
    rescale, Direction, Edl, MediaKind, PlayableTracks, PluginKey, TrackId,
};

use crate::attachment::AttachmentPoint;
use crate::audio::SharedMeter;
use crate::buffers::{Frame, Samples};
use crate::cache::AssetCache;
use crate::plugin::PluginRegistry;

use nested::NestedTimeline;

/// Index of a node in the console arena.
pub type NodeId = usize;

/// Stable identity of a node across rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub track: TrackId,
    /// 0 for the module node, 1.. for plugin slots in chain order.
    pub chain_position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Reads the track's edits.
    Module,
    /// Runs a plugin slot through the attachment point of `owner`.
    Plugin {
        slot: PluginKey,
        owner: PluginKey,
        buffer_index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub key: NodeKey,
    pub kind: NodeKind,
}

/// Per playable track: its nodes in pull order and how far the current
/// request has progressed through them.
#[derive(Debug, Clone)]
struct Entry {
    track: TrackId,
    nodes: Vec<NodeId>,
    progress: usize,
    busy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotState {
    slot: PluginKey,
    on: bool,
    fingerprint: u64,
}

pub struct VirtualConsole {
    kind: MediaKind,
    edl: Arc<Edl>,
    direction: Direction,
    cache: Arc<AssetCache>,
    registry: Arc<PluginRegistry>,
    nodes: Vec<Node>,
    index: HashMap<NodeKey, NodeId>,
    entries: Vec<Entry>,
    plugins: HashMap<PluginKey, AttachmentPoint>,
    snapshot: Option<PlayableTracks>,
    slot_state: Vec<SlotState>,
    nested: HashMap<usize, NestedTimeline>,
    track_audio: Vec<Samples>,
    track_frames: Vec<Frame>,
    meter: Option<SharedMeter>,
    builds: u64,
}

impl std::fmt::Debug for VirtualConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConsole")
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("entries", &self.entry_tracks())
            .field("nodes", &self.nodes.len())
            .field("builds", &self.builds)
            .finish()
    }
}

impl VirtualConsole {
    pub fn new(
        kind: MediaKind,
        edl: Arc<Edl>,
        direction: Direction,
        cache: Arc<AssetCache>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            kind,
            edl,
            direction,
            cache,
            registry,
            nodes: Vec::new(),
            index: HashMap::new(),
            entries: Vec::new(),
            plugins: HashMap::new(),
            snapshot: None,
            slot_state: Vec::new(),
            nested: HashMap::new(),
            track_audio: Vec::new(),
            track_frames: Vec::new(),
            meter: None,
            builds: 0,
        }
    }

    /// Record per-track peaks of every audio render into `meter`.
    pub fn with_meter(mut self, meter: SharedMeter) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Project rate of this console's media kind.
    pub fn rate(&self) -> f64 {
        self.edl.rate(self.kind)
    }

    pub fn edl(&self) -> &Arc<Edl> {
        &self.edl
    }

    /// Swap the timeline. The graph is kept until the next
    /// [`VirtualConsole::test_reconfigure`] reports a change.
    pub fn set_edl(&mut self, edl: Arc<Edl>) {
        self.edl = edl;
        self.nested.clear();
    }

    pub fn is_built(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Number of completed builds.
    pub fn build_count(&self) -> u64 {
        self.builds
    }

    /// One entry per playable track of the last build.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_tracks(&self) -> Vec<TrackId> {
        self.entries.iter().map(|e| e.track).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_id(&self, key: NodeKey) -> Option<NodeId> {
        self.index.get(&key).copied()
    }

    pub fn attachment(&self, owner: PluginKey) -> Option<&AttachmentPoint> {
        self.plugins.get(&owner)
    }

    /// Whether the graph must be rebuilt before rendering at `cursor`, and
    /// narrow `len` so that the fragment ends where the answer could next
    /// change. Every track of the console's kind takes part in the
    /// narrowing, including tracks that are silent at `cursor`.
    pub fn test_reconfigure(&mut self, cursor: i64, len: &mut i64) -> bool {
        let reconfigure = match &self.snapshot {
            None => true,
            Some(current) => {
                let playable = self.edl.playable_tracks(self.kind, cursor, self.direction);
                playable != *current || self.slot_signature(&playable.tracks, cursor) != self.slot_state
            }
        };

        if *len == 1 {
            return reconfigure;
        }

        let requested = *len;
        for track in self.edl.tracks_of(self.kind) {
            *len = track.change_duration(cursor, *len, self.direction);
        }

        tracing::trace!(
            target: GRAPH_TARGET,
            kind = self.kind.as_str(),
            cursor,
            requested,
            len = *len,
            reconfigure,
            "Reconfigure test"
        );
        reconfigure
    }

    /// Whether the state of the active plugin slots at `cursor` differs
    /// from the last build: a slot became active or inactive, was switched
    /// on or off, or its keyframes changed.
    pub fn test_plugins(&self, cursor: i64, direction: Direction) -> bool {
        let playable = self.edl.playable_tracks(self.kind, cursor, direction);
        self.slot_signature_in(&playable.tracks, cursor, direction) != self.slot_state
    }

    fn slot_signature(&self, tracks: &[TrackId], cursor: i64) -> Vec<SlotState> {
        self.slot_signature_in(tracks, cursor, self.direction)
    }

    fn slot_signature_in(&self, tracks: &[TrackId], cursor: i64, direction: Direction) -> Vec<SlotState> {
        let mut signature = Vec::new();
        for track in tracks.iter().filter_map(|id| self.edl.track(*id)) {
            for index in track.active_plugins(cursor, direction) {
                let plugin = &track.plugins[index];
                let slot = PluginKey {
                    track: track.id,
                    index,
                };
                let owner = self.edl.plugin(plugin.shared.unwrap_or(slot));
                signature.push(SlotState {
                    slot,
                    on: plugin.on && owner.map(|p| p.on).unwrap_or(false),
                    fingerprint: owner.map(|p| p.keyframes.fingerprint()).unwrap_or(0),
                });
            }
        }
        signature
    }

    /// Build the graph for the tracks playable at `cursor`.
    pub fn rebuild(&mut self, cursor: i64) {
        let edl = Arc::clone(&self.edl);
        let rate = self.rate();
        let playable = edl.playable_tracks(self.kind, cursor, self.direction);

        self.nodes.clear();
        self.index.clear();
        self.entries.clear();
        for point in self.plugins.values_mut() {
            point.detach_all();
        }

        for track in playable.tracks.iter().filter_map(|id| edl.track(*id)) {
            let mut entry = Entry {
                track: track.id,
                nodes: Vec::new(),
                progress: 0,
                busy: false,
            };
            entry.nodes.push(self.push_node(Node {
                key: NodeKey {
                    track: track.id,
                    chain_position: 0,
                },
                kind: NodeKind::Module,
            }));

            for index in track.active_plugins(cursor, self.direction) {
                let plugin = &track.plugins[index];
                if !plugin.on {
                    continue;
                }
                let slot = PluginKey {
                    track: track.id,
                    index,
                };
                let owner = plugin.shared.unwrap_or(slot);
                let Some(owner_plugin) = edl.plugin(owner) else {
                    tracing::warn!(
                        target: GRAPH_TARGET,
                        track = track.id.0,
                        index,
                        "Shared plugin has no owner, skipping slot"
                    );
                    continue;
                };

                let point = self
                    .plugins
                    .entry(owner)
                    .or_insert_with(|| AttachmentPoint::new(owner, owner_plugin, rate, &self.registry));
                point.update(owner_plugin, rate);
                let buffer_index = point.attach(track.id);

                let chain_position = entry.nodes.len();
                entry.nodes.push(self.push_node(Node {
                    key: NodeKey {
                        track: track.id,
                        chain_position,
                    },
                    kind: NodeKind::Plugin {
                        slot,
                        owner,
                        buffer_index,
                    },
                }));
            }
            self.entries.push(entry);
        }

        for point in self.plugins.values_mut() {
            point.finalize();
        }

        self.slot_state = self.slot_signature(&playable.tracks, cursor);
        self.snapshot = Some(playable);
        self.builds += 1;

        tracing::debug!(
            target: GRAPH_TARGET,
            kind = self.kind.as_str(),
            cursor,
            entries = self.entries.len(),
            nodes = self.nodes.len(),
            "Rebuilt virtual console"
        );
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.index.insert(node.key, id);
        self.nodes.push(node);
        id
    }

    /// Forget per-request progress before pulling a new fragment.
    fn reset_progress(&mut self) {
        for entry in &mut self.entries {
            entry.progress = 0;
            entry.busy = false;
        }
    }

    fn entry_of(&self, track: TrackId) -> Option<usize> {
        self.entries.iter().position(|e| e.track == track)
    }

    /// Position of the node running `owner` in the chain of `entry`.
    fn chain_stop(&self, entry: usize, owner: PluginKey) -> Option<usize> {
        self.entries[entry].nodes.iter().position(|id| {
            matches!(self.nodes[*id].kind, NodeKind::Plugin { owner: o, .. } if o == owner)
        })
    }

    fn nested_timeline(&mut self, index: usize) -> MontageResult<&mut NestedTimeline> {
        if !self.nested.contains_key(&index) {
            let edl = self.edl.nested_edl(index).cloned().ok_or_else(|| {
                MontageError::timeline(format!("Nested timeline {index} does not exist"))
            })?;
            let timeline = NestedTimeline::new(
                edl,
                self.kind,
                Arc::clone(&self.cache),
                Arc::clone(&self.registry),
            );
            self.nested.insert(index, timeline);
        }
        self.nested
            .get_mut(&index)
            .ok_or_else(|| MontageError::render("Nested timeline vanished"))
    }
}

/// Fill `target` with `target.len()` units starting at `position` in
/// `project_rate` units, reading from a source running at `source_rate`.
/// Differing rates use nearest-lower unit selection.
fn read_rescaled<F>(
    target: &mut [f64],
    position: i64,
    project_rate: f64,
    source_rate: f64,
    mut read: F,
) -> MontageResult<()>
where
    F: FnMut(i64, &mut [f64]) -> MontageResult<()>,
{
    if target.is_empty() {
        return Ok(());
    }
    if project_rate == source_rate {
        return read(position, target);
    }
    let first = rescale(position, project_rate, source_rate);
    let last = rescale(position + target.len() as i64 - 1, project_rate, source_rate);
    let mut source = vec![0.0; (last - first + 1).max(1) as usize];
    read(first, &mut source)?;
    for (i, sample) in target.iter_mut().enumerate() {
        let index = rescale(position + i as i64, project_rate, source_rate) - first;
        *sample = source[(index.max(0) as usize).min(source.len() - 1)];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use montage_timeline::{
        Asset, AssetId, AudioParams, Edit, Generator, Keyframe, KeyframeList, Plugin, Session,
        Track,
    };

    use crate::source::GeneratorOpener;

    pub(super) fn session() -> Session {
        Session {
            sample_rate: 1000,
            frame_rate: 10.0,
            audio_channels: 1,
            output_width: 2,
            output_height: 2,
        }
    }

    pub(super) fn ramp(id: u32, length: i64) -> Asset {
        Asset::generated(
            AssetId(id),
            Generator::Ramp { period: 1000 },
            Some(AudioParams {
                channels: 1,
                sample_rate: 1000,
                length,
            }),
            None,
        )
    }

    pub(super) fn console(edl: Edl, kind: MediaKind, direction: Direction) -> VirtualConsole {
        VirtualConsole::new(
            kind,
            Arc::new(edl),
            direction,
            Arc::new(AssetCache::new(Arc::new(GeneratorOpener), 1 << 20)),
            Arc::new(PluginRegistry::with_builtins()),
        )
    }

    /// Track 1 silent on [0, 100) then playing; track 2 playing throughout.
    fn silent_then_playing() -> Edl {
        Edl::new(session())
            .with_asset(ramp(1, 1000))
            .with_track(
                Track::new(TrackId(1), MediaKind::Audio)
                    .with_edit(Edit::silence(0, 100))
                    .with_edit(Edit::asset(100, 100, AssetId(1))),
            )
            .with_track(
                Track::new(TrackId(2), MediaKind::Audio).with_edit(Edit::asset(0, 200, AssetId(1))),
            )
    }

    #[test]
    fn test_reconfigure_at_silence_boundary() {
        let mut console = console(silent_then_playing(), MediaKind::Audio, Direction::Forward);
        let mut len = 100;
        assert!(console.test_reconfigure(0, &mut len));
        console.rebuild(0);
        assert_eq!(console.entry_tracks(), vec![TrackId(2)]);

        let mut len = 100;
        assert!(!console.test_reconfigure(50, &mut len));
        assert_eq!(len, 50);

        let mut len = 100;
        assert!(console.test_reconfigure(100, &mut len));
        console.rebuild(100);
        assert_eq!(console.entry_count(), 2);
        assert_eq!(console.node_count(), 2);
    }

    #[test]
    fn test_single_unit_is_not_narrowed() {
        let mut console = console(silent_then_playing(), MediaKind::Audio, Direction::Forward);
        console.rebuild(0);
        let mut len = 1;
        assert!(!console.test_reconfigure(99, &mut len));
        assert_eq!(len, 1);
    }

    #[test]
    fn test_reverse_narrowing_stops_at_boundary() {
        let mut console = console(silent_then_playing(), MediaKind::Audio, Direction::Reverse);
        console.rebuild(200);
        assert_eq!(console.entry_count(), 2);
        let mut len = 150;
        assert!(!console.test_reconfigure(200, &mut len));
        assert_eq!(len, 100);
        let mut len = 50;
        assert!(console.test_reconfigure(100, &mut len));
    }

    #[test]
    fn test_shared_slots_resolve_to_owner() {
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
                    .with_edit(Edit::asset(0, 100, AssetId(1)))
                    .with_plugin(Plugin::shared_with(owner, 0, 100)),
            );
        let mut console = console(edl, MediaKind::Audio, Direction::Forward);
        console.rebuild(0);

        assert_eq!(console.node_count(), 4);
        let point = console.attachment(owner).unwrap();
        assert_eq!(point.attached(), &[TrackId(1), TrackId(2)]);
        let id = console
            .node_id(NodeKey {
                track: TrackId(2),
                chain_position: 1,
            })
            .unwrap();
        assert!(matches!(
            console.node(id).unwrap().kind,
            NodeKind::Plugin { owner: o, buffer_index: 1, .. } if o == owner
        ));
    }

    #[test]
    fn test_plugin_changes_trigger_rebuild() {
        let plugin = Plugin::new("gain", 50, 50).with_keyframes(KeyframeList::with_default("0.5"));
        let edl = Edl::new(session()).with_asset(ramp(1, 1000)).with_track(
            Track::new(TrackId(1), MediaKind::Audio)
                .with_edit(Edit::asset(0, 100, AssetId(1)))
                .with_plugin(plugin),
        );
        let mut console = console(edl.clone(), MediaKind::Audio, Direction::Forward);
        console.rebuild(0);

        let mut len = 100;
        assert!(!console.test_reconfigure(0, &mut len));
        assert_eq!(len, 50);
        assert!(console.test_plugins(50, Direction::Forward));
        console.rebuild(50);
        assert!(!console.test_plugins(60, Direction::Forward));

        let mut changed = edl;
        changed.tracks[0].plugins[0]
            .keyframes
            .insert(Keyframe::new(70, "0.25"));
        console.set_edl(Arc::new(changed.clone()));
        assert!(console.test_plugins(60, Direction::Forward));
        console.rebuild(60);

        changed.tracks[0].plugins[0].on = false;
        console.set_edl(Arc::new(changed));
        let mut len = 10;
        assert!(console.test_reconfigure(60, &mut len));
    }

    #[test]
    fn test_read_rescaled_selects_nearest_lower_unit() {
        let mut target = [0.0; 4];
        read_rescaled(&mut target, 2, 4.0, 2.0, |position, buffer| {
            for (i, sample) in buffer.iter_mut().enumerate() {
                *sample = (position + i as i64) as f64;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(target, [1.0, 1.0, 2.0, 2.0]);
    }
}
