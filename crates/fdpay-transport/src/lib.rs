//! Unix domain socket transport with a descriptor side-channel.
//!
//! Every send carries a byte payload plus an optional list of file
//! descriptors delivered as `SCM_RIGHTS` ancillary data. The receiving end
//! gets its own duplicates of those descriptors, so the memory behind them
//! can be mapped without copying the bytes through the socket.
//!
//! This is the lowest layer of fdpay. The wire codec and the lend manager
//! build on the [`FdStream`] type and the [`FdRead`]/[`FdWrite`] traits
//! provided here.

pub mod ancillary;
pub mod error;
pub mod traits;
pub mod uds;

#[cfg(feature = "async")]
pub mod nonblocking;

pub use ancillary::MAX_FDS_PER_MESSAGE;
pub use error::{Result, TransportError};
pub use traits::{FdRead, FdStream, FdWrite};
pub use uds::FdListener;

#[cfg(feature = "async")]
pub use nonblocking::AsyncFdStream;
