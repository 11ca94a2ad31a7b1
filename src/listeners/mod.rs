//! Per-store modification listeners.
//!
//! Each store owns one [`ListenerRegistry`]. Commits notify it directly;
//! there is no process-wide notification center. Entries are weak, so a
//! listener whose owner has been dropped is skipped and pruned rather than
//! called.

mod registry;

pub use registry::ListenerRegistry;
