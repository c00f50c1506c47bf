#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The per-core worker loops: `NormalCore` (Recv/Admit/Process/EpochClose)
//! and `ReservedCore` (demand-activated drain), plus the shared plumbing
//! (`SharedRuntime`, `ActivityCell`, `TimeSource`, `DropCounters`,
//! `NfCallback`) both lean on.

pub mod activity;
pub mod clock;
pub mod drop_counters;
pub mod nf;
pub mod normal_core;
pub mod reserved_core;
pub mod runtime;

pub use activity::{ActivityCell, CoreActivity};
pub use clock::{EpochTicker, ManualClock, SystemClock, TimeSource};
pub use drop_counters::{DropClass, DropCounters, DropCountersSnapshot};
pub use nf::{CountingNf, NfCallback, NfContext, NoopNf};
pub use normal_core::NormalCore;
pub use reserved_core::ReservedCore;
pub use runtime::SharedRuntime;
