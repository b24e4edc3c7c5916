//! The user-supplied compute kernel interface (out of scope to implement;
//! named here by interface only, per §6).

use crate::error::Error;
use crate::packet::Packet;
use crate::side_packet::SidePacketSet;
use crate::stream::output::OutputShard;
use crate::timestamp::Timestamp;

/// The inputs available to one invocation of `Calculator::process`.
pub struct CalculatorContext<'a> {
    /// The timestamp this invocation runs at.
    pub timestamp: Timestamp,
    /// One slot per declared input; `None` where this invocation's sync set
    /// left that input unfilled.
    pub inputs: Vec<Option<Packet>>,
    /// The side packets collected before `Open`.
    pub side_packets: &'a SidePacketSet,
    /// One shard per declared output, to be filled in during `process` and
    /// committed by the framework afterwards.
    pub outputs: Vec<OutputShard>,
    /// Output side packets produced by a side-packet-generator node (a node
    /// with no streaming I/O at all); collected once after `Open` and made
    /// available to later-run consumers via `GetOutputSidePacket` (§6).
    pub side_packet_outputs: Vec<(String, Packet)>,
}

impl<'a> CalculatorContext<'a> {
    /// The packet at input `index`, if the sync set included it.
    pub fn input(&self, index: usize) -> Option<&Packet> {
        self.inputs.get(index).and_then(|slot| slot.as_ref())
    }

    /// Appends a packet to output `index`'s pending shard.
    pub fn add_output_packet(&mut self, index: usize, packet: Packet) {
        self.outputs[index].add_packet(packet);
    }

    /// Advances output `index`'s next-timestamp-bound.
    pub fn set_output_bound(&mut self, index: usize, bound: Timestamp) {
        self.outputs[index].set_next_timestamp_bound(bound);
    }

    /// Publishes an output side packet by name.
    pub fn emit_side_packet(&mut self, name: impl Into<String>, packet: Packet) {
        self.side_packet_outputs.push((name.into(), packet));
    }
}

/// The lifecycle methods the node runtime invokes on a calculator instance,
/// plus the scheduling hint a source node may override (§6).
pub trait Calculator: Send {
    /// Validates and declares this calculator's stream/side-packet contract.
    /// Out of scope to enforce here; provided for interface completeness.
    fn get_contract(&self) -> Result<(), Error> {
        Ok(())
    }

    /// `SourceProcessOrder`: for a source node, the priority its invocations
    /// are scheduled with relative to other source nodes' (lower runs
    /// first). Meaningless for non-source nodes, whose invocations are
    /// ordered by timestamp instead. Ties fall back to FIFO arrival order.
    fn source_process_order(&self) -> i64 {
        0
    }

    /// Called once, after headers and side packets are ready.
    fn open(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error>;

    /// Called once per invocation. Returning [`Error::stop`] is the sentinel
    /// meaning "this node is done"; the node runtime closes it without
    /// treating the run as errored.
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error>;

    /// Called at most once, and exactly once if `open` was invoked.
    fn close(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error>;
}
