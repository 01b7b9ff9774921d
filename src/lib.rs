//! Supervisor for locally-running developer tool servers.
//!
//! A [`Supervisor`] starts a server on a free (or fixed) port, waits for it to
//! answer its readiness endpoint, tracks its pid and stops it with a graceful
//! then forceful signal.

pub mod configs;
pub mod environment;
pub mod error;
pub mod port;
pub mod probe;
pub mod process;
pub mod provision;
pub mod supervisor;

pub use crate::configs::{ManagedProcessConfig, VigilConfig};
pub use crate::error::{ProbeTimeout, StartFailure, SupervisorError};
pub use crate::supervisor::{LifecycleState, Subscription, Supervisor};
