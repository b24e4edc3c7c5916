//! A directed graph of compute nodes connected by typed, timestamped
//! streams, with a scheduler that drives each node's lifecycle, enforces
//! backpressure, and resolves deadlocks by growing queue bounds.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`timestamp`], [`packet`], [`side_packet`]: the value model.
//! - [`stream`]: per-edge queues (consumer side) and fan-out (producer side).
//! - [`handlers`]: the policy layer deciding when a node's inputs form a
//!   ready invocation, and how its outputs get committed.
//! - [`contract`]: the validated, immutable description of one graph.
//! - [`calculator`]: the user-supplied compute kernel interface.
//! - [`node`]: the per-node lifecycle state machine.
//! - [`scheduler`]: executors, priority queues, throttling, termination.
//! - [`graph`]: the driver-facing [`graph::CalculatorGraph`] API.

pub mod calculator;
pub mod contract;
pub mod counter;
pub mod error;
pub mod graph;
pub mod handlers;
pub mod logging;
pub mod node;
pub mod packet;
pub mod scheduler;
pub mod side_packet;
pub mod stream;
pub mod timestamp;

pub use calculator::{Calculator, CalculatorContext};
pub use contract::{Edge, GraphConfig, NodeContract};
pub use error::Error;
pub use graph::{CalculatorGraph, GraphDescription, NodeSpec, OutputPoller, PortEdge};
pub use packet::Packet;
pub use scheduler::{Executor, GraphInputStreamMode};
pub use timestamp::Timestamp;
