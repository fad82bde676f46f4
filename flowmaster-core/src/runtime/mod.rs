//! Runtime primitives shared by the master
//!
//! Concurrency quota, error center, shutdown signalling and the injectable
//! clock.

pub mod clock;
pub mod err_center;
pub mod quota;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use err_center::{ErrCenter, ErrCtx};
pub use quota::{ConcurrencyQuota, QuotaGuard};
pub use shutdown::ShutdownSignal;
