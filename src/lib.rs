//! Partita - adaptive work partitioning for heterogeneous devices
//!
//! Splits one data-parallel kernel launch across several compute devices,
//! keeps every buffer coherent between the host and device copies, and tunes
//! the split from measured per-device times until all devices finish together.
//!
//! # Quick Start
//!
//! ```no_run
//! use partita::prelude::*;
//!
//! let mut rt = Runtime::new(Config::default()).unwrap();
//! rt.register_buffer(BufferId(0), 4096).unwrap();
//! rt.register_buffer(BufferId(1), 4096).unwrap();
//!
//! // out[i] = f(in[i]) over 1024 four-byte elements
//! let oracle = AffineOracle::new()
//!     .access(0, AccessMode::Read, AccessPattern::row_major(4, 0, 0))
//!     .access(1, AccessMode::Write, AccessPattern::row_major(4, 0, 0));
//! let kernel = rt.create_kernel("scale", oracle);
//! rt.set_kernel_args(kernel, vec![KernelArg::Buffer(BufferId(0)), KernelArg::Buffer(BufferId(1))])
//!     .unwrap();
//!
//! let full = WorkPartition::new(&[1024], &[64]).unwrap();
//! for _ in 0..10 {
//!     let plan = rt.get_partition(kernel, &full).unwrap();
//!     // issue plan.transfers, then launch plan.active() sub-kernels ...
//!     let timers = IterationTimers::from_secs(&[0.004, 0.001], &[0.0, 0.0], &[0.0, 0.0]);
//!     rt.report_iteration_timers(kernel, timers).unwrap();
//! }
//! ```
//!
//! # Features
//!
//! - **Region algebra**: canonical byte-interval sets with an undefined element
//! - **Coherence**: per-buffer valid regions on host and every device, with
//!   a whole-buffer (`Simple`) and an exact-region (`Optim`) policy
//! - **Adaptive split**: split, merge or single-device fallback per kernel
//! - **Strategies**: full search, good and bad Broyden, damped fixed point,
//!   and a joint LP over cycles of kernels
//! - **Telemetry**: dispatch counters and makespan histogram (optional)

#![warn(missing_docs, missing_debug_implementations)]

pub mod coherence;
pub mod config;
pub mod device;
pub mod error;
pub mod oracle;
pub mod partition;
pub mod prelude;
pub mod region;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;

// Re-export key types at crate root
pub use coherence::{BufferId, BufferManager, TransferPlan};
pub use config::{BufferPolicy, Config, ConfigBuilder, StrategyKind};
pub use error::{Error, Fault, Result};
pub use region::{Interval, RegionSet};
pub use runtime::{DispatchPlan, Runtime};
