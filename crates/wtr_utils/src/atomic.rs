//! Memory ordering shared by every atomic in the harness.

use std::sync::atomic::Ordering;

/// Flags and counters in the harness are read across manager threads and must observe each
/// other's writes; there are no hot atomics where relaxed ordering would matter.
pub const ORDERING: Ordering = Ordering::SeqCst;
