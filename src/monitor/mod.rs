//! Monitors: per-target change detection on the shared event feed.
//!
//! A monitor receives every event the transport delivers, keeps only the ones
//! attributed to its own subscription and coordinates, runs them through a
//! change cache guarded by a keyed lock, and invokes its callback exactly once
//! per genuine change. Failures while parsing an event or inside the callback
//! are logged and contained so other monitors on the same dispatch thread keep
//! receiving events.

/// Change notification and counter types.
pub mod events;
/// Target matching and payload extraction.
pub mod matcher;
/// Monitor lifecycle.
pub mod watch;

pub use events::{ChangeEvent, MonitorStats};
pub use matcher::{MatchOutput, TargetMatcher};
pub use watch::{ChangeCallback, Monitor, MonitorState};
