//! Pure transforms from raw artifacts to display structures.
//!
//! Each function re-derives its whole output from the whole artifact.

pub mod events;
pub mod narrative;
pub mod playback;
pub mod summary;

pub use self::events::{parse_event_log, EventRecord};
pub use self::narrative::{reconstruct_timeline, EntryKind, TimelineCache, TimelineEntry};
pub use self::playback::{build_frames, collapse_consecutive, Player, StepDocument};
pub use self::summary::TaskSummary;
