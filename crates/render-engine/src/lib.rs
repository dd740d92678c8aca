//! Montage Render Engine
//!
//! Turns a timeline into audio buffers and video frames, either paced
//! against realtime devices or written to files in packages.
//!
//! # Pipeline Architecture
//!
//! ```text
//! Edl ──► RenderEngine::arm ──┬── AudioSchedule ── VirtualConsole ──► AudioDevice
//!                             │        │                 │
//!                             │   first-frame latch   AttachmentPoint ──► PluginProcessor
//!                             │        │                 │
//!                             └── VideoSchedule ── VirtualConsole ──► VideoDevice
//!                                      │
//!                                   AvSync (skip / delay hysteresis)
//!
//! Distributor ──► RenderPackage ──► PackageRenderer ──► OutputFile
//!                                   (preroll, interleaved audio/video)
//! ```
//!
//! Every asset read goes through the shared [`cache::AssetCache`].

pub mod attachment;
pub mod audio;
pub mod buffers;
mod builtin;
pub mod cache;
pub mod context;
pub mod device;
pub mod distributor;
pub mod engine;
pub mod graph;
pub mod output;
pub mod package;
pub mod plugin;
pub mod schedule;
pub mod source;
pub mod video;

pub use attachment::{keyframe_fragments, AttachmentPoint, KeyframeFragment};
pub use audio::{AudioSchedule, MeterPeak, PeakMeter, SharedMeter, TRACKING_RATE};
pub use buffers::{Frame, FrameLocation, Samples};
pub use cache::{AssetCache, CacheLease, CacheStats};
pub use context::RenderContext;
pub use device::{AudioDevice, AudioOutConfig, DeviceFactory, NullDevices, VideoDevice, VideoOutConfig};
pub use distributor::{package_path, split_packages, DistributionReport, Distributor};
pub use engine::{Duty, EngineShared, EngineState, PlaybackObserver, RenderEngine, TransportCommand};
pub use graph::VirtualConsole;
pub use output::{MemoryOutputFormat, OutputFile, OutputFormat, OutputSpec, RawOutputFormat};
pub use package::{PackageOutcome, PackageRenderer, PackageState, Preroll, RenderPackage};
pub use plugin::{PluginProcessor, PluginRegistry, ProcessContext};
pub use schedule::{PlaybackRange, ScheduleCursor, SchedulePolicy};
pub use source::{GeneratorOpener, MediaOpener, MediaSource};
pub use video::{AvSync, SyncDecision, VideoSchedule, SYNC_THRESHOLD};
