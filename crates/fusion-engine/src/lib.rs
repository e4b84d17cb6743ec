//! Client and task runtime for the FusionBrain image generation API.
//!
//! [`client`] speaks the wire protocol, [`poller`] drives one job to a
//! terminal state, [`materialize`] turns returned payloads into files and
//! [`service`] runs many tasks side by side.

pub mod client;
pub mod materialize;
pub mod poller;
pub mod service;

#[cfg(test)]
mod testing;

pub use client::{FusionBrainClient, JobHandle, RemoteApi, RemoteStatus};
pub use materialize::{ImagePayload, Materializer};
pub use poller::{BackoffPolicy, PollOutcome, Poller};
pub use service::{GenerationService, ServiceSettings};
