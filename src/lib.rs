//! # Autopilot
//!
//! Period arbitration engine for a simulated plane link. Commands arrive as
//! short hex frames, get timestamped against the go command, and are handed
//! to a stack of periodic agents that decide, period by period, who owns the
//! command and whether the plane kept its side of the contract.
//!
//! ## Features
//!
//! - **Wire protocol**: `$` + 3-byte id + fixed-width hex payload + `#`
//! - **Command queue**: timestamped FIFO with a bounded blocking read
//! - **Alarm scheduling**: one timer thread, or a stepped clock for tests
//! - **Period arbitration**: top-of-stack-first claims with override notices
//! - **Agents**: distance control, altitude control windows, LED tasks
//!
//! ## Quick Start
//!
//! ```rust
//! use autopilot::protocol::{decode, encode, Command};
//!
//! let frame = encode(&Command::Distance(10000));
//! assert_eq!(&frame[..], b"$DST2710#");
//! assert_eq!(decode(&frame).unwrap(), Command::Distance(10000));
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - framing, parsing and the incremental frame buffer
//! - [`queue`] - timestamped command queue
//! - [`scheduler`] - alarm services
//! - [`periodicity`] - period clock and agent stack
//! - [`agents`] - concrete periodic behaviors
//! - [`dispatcher`] - queue draining thread
//! - [`session`] - wiring for one flight

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod agents;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod periodicity;
pub mod presentation;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod time;

// Re-export main public types for convenience
pub use agents::{PeriodStatus, PeriodicAgent};
pub use config::TestCase;
pub use error::{CoordinatorError, SessionError};
pub use periodicity::PeriodicityCoordinator;
pub use protocol::{Command, ProtocolError};
pub use queue::{CommandQueue, TimestampedCommand};
pub use scheduler::{AlarmScheduler, AlarmService, SteppedAlarms};
pub use session::AutopilotSession;
