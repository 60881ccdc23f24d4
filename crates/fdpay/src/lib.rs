//! Zero-copy media buffer passing between processes.
//!
//! Content stays in descriptor-backed shared memory; producers send small
//! type-tagged control messages with the descriptors attached, and consumers
//! send release packets back when they are done with a region.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix socket transport carrying descriptors (SCM_RIGHTS)
//! - [`wire`]: Control packet codec and stream envelopes
//! - [`lend`]: Lend registry, payload producer and control dispatcher (behind `lend` feature)

/// Re-export transport types.
pub mod transport {
    pub use fdpay_transport::*;
}

/// Re-export wire types.
pub mod wire {
    pub use fdpay_wire::*;
}

/// Re-export lending types (requires `lend` feature).
#[cfg(feature = "lend")]
pub mod lend {
    pub use fdpay_lend::*;
}
