//! Montage Timeline Model
//!
//! Defines the timeline (EDL) data the render core consumes:
//! - **Tracks:** ordered edits, plugins and automation curves per media kind
//! - **Edits:** half-open ranges mapped to assets, nested timelines or silence
//! - **Plugins:** processing slots with ordered parameter keyframes
//! - **Automation:** fade, mute, mode and mask curves queried per direction
//!
//! Positions are integer sample or frame counts at a stated rate. In reverse
//! playback a cursor `p` addresses the unit at `p - 1`, see [`Direction`].

pub mod asset;
pub mod automation;
pub mod edit;
pub mod edl;
pub mod keyframe;
pub mod plugin;
pub mod track;
pub mod units;

pub use asset::*;
pub use automation::*;
pub use edit::*;
pub use edl::*;
pub use keyframe::*;
pub use plugin::*;
pub use track::*;
pub use units::*;
