//! Uniform publish/consume abstraction over heterogeneous message brokers.
//!
//! Applications describe *what* they publish and consume — event payload
//! shapes, consumer shapes and the transport that carries them — and the bus
//! takes care of the rest: stable wire names, serialization, tracing
//! propagation, per-delivery consumer instantiation, acknowledgement and
//! dead-lettering.
//!
//! Submodules have been introduced to split responsibilities. The low-level
//! pieces ([`naming`], [`serialization`], [`lifecycle`]) are independent of
//! any broker; [`registration`] binds payload and consumer shapes to wire
//! names; [`transport`] defines the contract every broker implementation
//! satisfies together with the shared dispatch pipeline; and [`bus`] ties it
//! all together behind a small façade.

#![deny(missing_docs)]

pub mod bus;
pub mod config;
pub mod constants;
pub mod context;
pub mod helpers;
pub mod lifecycle;
pub mod naming;
pub mod registration;
pub mod serialization;
pub mod transport;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
