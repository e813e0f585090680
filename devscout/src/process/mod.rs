//! Managed processes: the long-lived tasks behind feeders and stage workers.
//!
//! Each process runs as its own tokio task and cooperates with the
//! controller through a shared [`ProcessControl`]: a logical activity flag
//! (stop/resume), a heartbeat countdown used for hang detection, a
//! best-effort interrupt, and a termination token.

mod control;
mod handle;
mod ids;

pub use control::{ProcessContext, ProcessControl, ProcessState};
pub use handle::ProcessHandle;
pub use ids::IdAllocator;
