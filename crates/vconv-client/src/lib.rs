//! Control-plane HTTP client and runner identity.
//!
//! This crate provides:
//! - The authenticated request layer with one retry classifier for all
//!   call sites (progress / state / other)
//! - Typed operations for every control-plane endpoint the runner uses
//! - Persisted runner identity (`config.json` next to the binary)

pub mod client;
pub mod error;
pub mod identity;

pub use client::{CallClass, ControlPlane, MachineRegistration, RemoteTask, StoreCredentials};
pub use error::{ClientError, ClientResult};
pub use identity::RunnerIdentity;
