//! Stream managers: the per-edge queues and fan-out that connect nodes.

pub mod input;
pub mod output;

pub use input::InputStreamManager;
pub use output::{OutputShard, OutputStreamManager};
