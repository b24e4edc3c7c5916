//! The per-node state machine: prepare/open/process/close, in-flight
//! accounting, and the single-entrant scheduling loop (§4.4).

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::calculator::{Calculator, CalculatorContext};
use crate::contract::NodeContract;
use crate::error::Error;
use crate::handlers::{HeaderReadyTracker, InputStreamHandler, Invocation, OutputStreamHandler};
use crate::side_packet::{SidePacketHandler, SidePacketSet};
use crate::stream::input::InputStreamManager;
use crate::stream::output::{OutputShard, OutputStreamManager};
use crate::timestamp::Timestamp;

/// A node's lifecycle state (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Uninitialized,
    Prepared,
    Opened,
    Active,
    Closed,
}

const IDLE: u8 = 0;
const SCHEDULING: u8 = 1;
const SCHEDULING_PENDING: u8 = 2;

/// The capability object the scheduler hands to every node so it can report
/// back readiness, invocations, and errors without the node holding a
/// reference back into scheduler-owned locks (§9's "single capability
/// object" design note, replacing a pyramid of closures).
pub trait NodeCallbacks: Send + Sync {
    /// Fired the moment both readiness preconditions (headers, side packets)
    /// have completed; the scheduler responds by enqueueing `OpenNode`.
    fn ready_for_open(&self, node: usize);
    /// One invocation is ready to run; the scheduler enqueues it on the
    /// node's executor.
    fn schedule(&self, node: usize, invocation: Invocation);
    /// A source node finished opening; the scheduler marks its layer active
    /// if it is the first in that layer.
    fn source_node_opened(&self, node: usize);
    /// A calculator or framework error occurred on this node.
    fn error(&self, node: usize, err: Error);
    /// This node just finished closing; used to detect source-layer
    /// promotion and overall run termination.
    fn node_closed(&self, node: usize);
    /// Whether this producer is currently throttled by a full descendant
    /// stream (§4.5.3); sources consult this before producing more.
    fn is_throttled(&self, node: usize) -> bool {
        let _ = node;
        false
    }
    /// A side-packet-generator node published its output side packets during
    /// `Open` (or republished them via the constant-outputs fast path).
    fn output_side_packets_emitted(&self, node: usize, packets: Vec<(String, crate::packet::Packet)>) {
        let _ = (node, packets);
    }
}

/// One node in the graph: identity, contract, streams, handlers, and status.
pub struct Node {
    id: usize,
    contract: NodeContract,
    inputs: Vec<Arc<InputStreamManager>>,
    outputs: Vec<Arc<OutputStreamManager>>,
    input_handler: Arc<dyn InputStreamHandler>,
    output_handler: OutputStreamHandler,
    header_tracker: HeaderReadyTracker,
    side_packets: Mutex<SidePacketHandler>,
    calculator: Mutex<Option<Box<dyn Calculator>>>,
    status: Mutex<NodeStatus>,
    current_in_flight: AtomicUsize,
    scheduling_state: AtomicU8,
    source_dummy_pending: AtomicU8,
    open_preconditions_remaining: AtomicU32,
    last_side_packet_outputs: Mutex<Vec<(String, crate::packet::Packet)>>,
}

const HEADERS_BIT: u32 = 1;
const SIDE_PACKETS_BIT: u32 = 2;

impl Node {
    /// Wires a contract to freshly allocated stream managers and handlers
    /// (`Initialize`; does not advance `status`).
    pub fn new(id: usize, contract: NodeContract, inputs: Vec<Arc<InputStreamManager>>, outputs: Vec<Arc<OutputStreamManager>>, input_handler: Arc<dyn InputStreamHandler>) -> Self {
        let header_count = inputs.len();
        let side_packet_names = contract.side_packet_names.clone();
        let output_count = outputs.len();
        let mut output_handler = OutputStreamHandler::new(output_count);
        for (index, offset) in contract.output_offsets.iter().enumerate() {
            if let Some(offset) = offset {
                output_handler.set_offset(index, *offset);
            }
        }
        let mut initial_bits = 0u32;
        if header_count > 0 {
            initial_bits |= HEADERS_BIT;
        }
        if !side_packet_names.is_empty() {
            initial_bits |= SIDE_PACKETS_BIT;
        }

        Node {
            id,
            contract,
            inputs,
            outputs,
            input_handler,
            output_handler,
            header_tracker: HeaderReadyTracker::new(header_count),
            side_packets: Mutex::new(SidePacketHandler::new(side_packet_names)),
            calculator: Mutex::new(None),
            status: Mutex::new(NodeStatus::Uninitialized),
            current_in_flight: AtomicUsize::new(0),
            scheduling_state: AtomicU8::new(IDLE),
            source_dummy_pending: AtomicU8::new(0),
            open_preconditions_remaining: AtomicU32::new(initial_bits),
            last_side_packet_outputs: Mutex::new(Vec::new()),
        }
    }

    /// This node's dense id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Cosmetic name for error messages and logging.
    pub fn debug_name(&self) -> &str {
        &self.contract.debug_name
    }

    /// Whether this node has zero inputs and at least one output.
    pub fn is_source(&self) -> bool {
        self.contract.is_source()
    }

    /// Whether this node has neither inputs nor outputs.
    pub fn is_side_packet_generator(&self) -> bool {
        self.contract.is_side_packet_generator()
    }

    /// This node's declared maximum concurrently in-flight invocations.
    pub fn max_in_flight(&self) -> usize {
        self.contract.max_in_flight.max(1)
    }

    /// The executor name this node is assigned to.
    pub fn executor_name(&self) -> &str {
        &self.contract.executor
    }

    /// The source layer this node belongs to (meaningless for non-sources).
    pub fn source_layer(&self) -> u32 {
        self.contract.source_layer
    }

    /// This node's calculator-declared `SourceProcessOrder`, used to
    /// prioritize this source's invocations against other sources'. `0` if
    /// the calculator hasn't been allocated yet (§4.5.1).
    pub fn source_process_order(&self) -> i64 {
        self.calculator.lock().unwrap().as_ref().map(|c| c.source_process_order()).unwrap_or(0)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap()
    }

    /// This node's input stream managers.
    pub fn inputs(&self) -> &[Arc<InputStreamManager>] {
        &self.inputs
    }

    /// This node's output stream managers.
    pub fn outputs(&self) -> &[Arc<OutputStreamManager>] {
        &self.outputs
    }

    /// Current number of in-flight invocations.
    pub fn current_in_flight(&self) -> usize {
        self.current_in_flight.load(Ordering::Acquire)
    }

    /// `PrepareForRun`: validates side packets, allocates a fresh calculator
    /// instance, clears counters, installs callbacks.
    pub fn prepare_for_run(&self, calculator: Box<dyn Calculator>) {
        *self.calculator.lock().unwrap() = Some(calculator);
        self.side_packets.lock().unwrap().prepare_for_run();
        self.current_in_flight.store(0, Ordering::SeqCst);
        self.scheduling_state.store(IDLE, Ordering::SeqCst);
        let mut initial_bits = 0u32;
        if !self.inputs.is_empty() {
            initial_bits |= HEADERS_BIT;
        }
        if !self.contract.side_packet_names.is_empty() {
            initial_bits |= SIDE_PACKETS_BIT;
        }
        self.open_preconditions_remaining.store(initial_bits, Ordering::SeqCst);
        *self.status.lock().unwrap() = NodeStatus::Prepared;
    }

    /// Records one input header as ready; fires `ready_for_open` if this was
    /// also the last missing side packet.
    pub fn notify_header_ready(&self, callbacks: &dyn NodeCallbacks) {
        if self.header_tracker.mark_one_ready() {
            self.clear_precondition(HEADERS_BIT, callbacks);
        }
    }

    /// Records a side packet arrival; fires `ready_for_open` once this was
    /// the last missing side packet.
    pub fn provide_side_packet(&self, name: &str, packet: crate::packet::Packet, callbacks: &dyn NodeCallbacks) -> Result<(), Error> {
        let ready = self.side_packets.lock().unwrap().provide(name, packet)?;
        if ready {
            self.clear_precondition(SIDE_PACKETS_BIT, callbacks);
        }
        Ok(())
    }

    fn clear_precondition(&self, bit: u32, callbacks: &dyn NodeCallbacks) {
        let prev = self.open_preconditions_remaining.fetch_and(!bit, Ordering::AcqRel);
        if prev & !bit == 0 {
            callbacks.ready_for_open(self.id);
        }
    }

    /// Whether every open precondition (headers + side packets) has fired.
    pub fn open_preconditions_ready(&self) -> bool {
        self.open_preconditions_remaining.load(Ordering::Acquire) == 0
    }

    /// Whether this node qualifies for the constant-outputs fast path: no
    /// streaming I/O and unchanged side packets from the previous run.
    pub fn is_constant_outputs_candidate(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty() && !self.side_packets.lock().unwrap().input_side_packets_changed()
    }

    /// `OpenNode`: calls the calculator's `open`, commits header outputs,
    /// transitions to `Opened`. For source nodes, also arms the dummy
    /// invocation popped only at close.
    pub fn open(&self, callbacks: &dyn NodeCallbacks) -> Result<(), Error> {
        if self.is_constant_outputs_candidate() {
            let republished = self.last_side_packet_outputs.lock().unwrap().clone();
            callbacks.output_side_packets_emitted(self.id, republished);
            *self.status.lock().unwrap() = NodeStatus::Closed;
            return Ok(());
        }
        let side_packets = self.side_packets.lock().unwrap().packets().clone();
        let outputs = self.outputs.iter().map(|_| OutputShard::new()).collect();
        let mut ctx = CalculatorContext { timestamp: Timestamp::Unstarted, inputs: vec![None; self.inputs.len()], side_packets: &side_packets, outputs, side_packet_outputs: Vec::new() };
        let result = self.calculator.lock().unwrap().as_mut().expect("calculator allocated in prepare_for_run").open(&mut ctx);
        if let Err(err) = result {
            callbacks.error(self.id, err.clone().into_calculator_error(self.debug_name()));
            return Err(err);
        }
        self.output_handler.commit(&self.outputs, ctx.outputs, Timestamp::Unstarted)?;
        if !ctx.side_packet_outputs.is_empty() {
            *self.last_side_packet_outputs.lock().unwrap() = ctx.side_packet_outputs.clone();
            callbacks.output_side_packets_emitted(self.id, ctx.side_packet_outputs);
        }
        *self.status.lock().unwrap() = NodeStatus::Opened;
        if self.is_source() {
            self.source_dummy_pending.store(1, Ordering::SeqCst);
            callbacks.source_node_opened(self.id);
        }
        Ok(())
    }

    /// `ActivateNode` (sources only): `Opened -> Active` once this node's
    /// source layer becomes active.
    pub fn activate(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == NodeStatus::Opened {
            *status = NodeStatus::Active;
        }
    }

    fn is_runnable(&self) -> bool {
        matches!(*self.status.lock().unwrap(), NodeStatus::Opened | NodeStatus::Active)
    }

    /// Atomically reserves one in-flight slot if the allowance permits.
    fn try_begin_scheduling(&self) -> bool {
        loop {
            let current = self.current_in_flight.load(Ordering::Acquire);
            if current >= self.max_in_flight() {
                return false;
            }
            if self
                .current_in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Releases one in-flight slot and re-enters the scheduling loop.
    pub fn end_scheduling(&self, callbacks: &dyn NodeCallbacks) {
        self.current_in_flight.fetch_sub(1, Ordering::AcqRel);
        self.drive_scheduling_loop(callbacks);
    }

    /// External entry point: called whenever a new packet/bound arrival or
    /// in-flight release might have made this node ready. Ensures exactly
    /// one thread runs the loop body at a time (§4.4.2's state diagram).
    pub fn drive_scheduling_loop(&self, callbacks: &dyn NodeCallbacks) {
        loop {
            match self.scheduling_state.compare_exchange(IDLE, SCHEDULING, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(SCHEDULING) => {
                    let _ = self.scheduling_state.compare_exchange(SCHEDULING, SCHEDULING_PENDING, Ordering::AcqRel, Ordering::Acquire);
                    return;
                }
                Err(_) => return,
            }
        }

        loop {
            if self.is_source() {
                self.try_schedule_source(callbacks);
            } else if self.is_runnable() {
                let allowance = self.max_in_flight().saturating_sub(self.current_in_flight());
                if allowance > 0 {
                    let mut ready = Vec::new();
                    let bound = self.input_handler.schedule_invocations(&self.inputs, allowance, &mut |inv| ready.push(inv));
                    for invocation in ready {
                        let reserved = self.try_begin_scheduling();
                        debug_assert!(reserved, "allowance accounting should guarantee a free slot");
                        callbacks.schedule(self.id, invocation);
                    }
                    if let Some(bound) = bound {
                        self.advance_output_bounds(bound, callbacks);
                    }
                }
            }

            match self.scheduling_state.compare_exchange(SCHEDULING, IDLE, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(_) => {
                    self.scheduling_state.store(SCHEDULING, Ordering::Release);
                    continue;
                }
            }
        }
    }

    /// No invocation was ready, but `schedule_invocations` reported the
    /// earliest timestamp that might unblock one; this node's own outputs
    /// still advance so downstream consumers aren't starved by a node that
    /// emitted nothing (§4.4.2).
    fn advance_output_bounds(&self, bound: Timestamp, callbacks: &dyn NodeCallbacks) {
        for output in &self.outputs {
            let derived = match output.infer_bound_from_invocation(bound) {
                Ok(derived) => derived.unwrap_or(bound),
                Err(err) => {
                    callbacks.error(self.id, err.into_calculator_error(self.debug_name()));
                    continue;
                }
            };
            if derived <= output.bound() {
                continue;
            }
            if let Err(err) = output.set_next_timestamp_bound(derived) {
                callbacks.error(self.id, err.into_calculator_error(self.debug_name()));
            }
        }
    }

    fn try_schedule_source(&self, callbacks: &dyn NodeCallbacks) {
        if !self.is_runnable() {
            return;
        }
        if self.source_dummy_pending.load(Ordering::Acquire) == 0 {
            return;
        }
        if callbacks.is_throttled(self.id) {
            return;
        }
        if !self.try_begin_scheduling() {
            return;
        }
        callbacks.schedule(self.id, Invocation { timestamp: Timestamp::Finite(0), inputs: Vec::new() });
    }

    /// Runs one invocation's `Calculator::process`, per §4.4.3.
    ///
    /// For non-source nodes, `Error::stop()` (the `StatusStop` sentinel)
    /// triggers `close_node` rather than being treated as a run error. For
    /// source nodes a successful `process` re-arms the dummy invocation so
    /// the scheduler keeps driving production until the calculator stops.
    pub fn process(&self, invocation: Invocation, callbacks: &dyn NodeCallbacks) {
        let ts = invocation.timestamp;
        if ts == Timestamp::Done {
            self.close(false, callbacks);
            self.end_scheduling(callbacks);
            return;
        }
        if !ts.is_allowed_in_stream() {
            callbacks.error(self.id, Error::internal(format!("unexpected invocation timestamp {ts}")));
            self.end_scheduling(callbacks);
            return;
        }

        let side_packets = self.side_packets.lock().unwrap().packets().clone();
        let outputs = self.outputs.iter().map(|_| OutputShard::new()).collect();
        let mut ctx = CalculatorContext { timestamp: ts, inputs: invocation.inputs, side_packets: &side_packets, outputs, side_packet_outputs: Vec::new() };

        let result = {
            let mut guard = self.calculator.lock().unwrap();
            let calculator = guard.as_mut().expect("calculator allocated in prepare_for_run");
            calculator.process(&mut ctx)
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.output_handler.commit(&self.outputs, ctx.outputs, ts) {
                    callbacks.error(self.id, err.into_calculator_error(self.debug_name()));
                }
                if self.is_source() {
                    self.source_dummy_pending.store(1, Ordering::SeqCst);
                }
            }
            Err(err) if err.is_stop() => {
                self.source_dummy_pending.store(0, Ordering::SeqCst);
                self.close(false, callbacks);
            }
            Err(err) => {
                self.source_dummy_pending.store(0, Ordering::SeqCst);
                callbacks.error(self.id, err.into_calculator_error(self.debug_name()));
            }
        }

        self.end_scheduling(callbacks);
    }

    /// `CloseNode`: closes input streams, calls `Calculator::close`, and
    /// (unless the run itself is ending, which closes outputs separately)
    /// propagates `Done` to outputs. Idempotent.
    pub fn close(&self, graph_run_ended: bool, callbacks: &dyn NodeCallbacks) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == NodeStatus::Closed {
                return;
            }
            *status = NodeStatus::Closed;
        }
        for input in &self.inputs {
            input.close();
        }
        let side_packets = self.side_packets.lock().unwrap().packets().clone();
        let outputs = self.outputs.iter().map(|_| OutputShard::new()).collect();
        let mut ctx = CalculatorContext { timestamp: Timestamp::Done, inputs: vec![None; self.inputs.len()], side_packets: &side_packets, outputs, side_packet_outputs: Vec::new() };
        if let Some(calculator) = self.calculator.lock().unwrap().as_mut() {
            if let Err(err) = calculator.close(&mut ctx) {
                callbacks.error(self.id, err.into_calculator_error(self.debug_name()));
            }
        }
        if let Err(err) = self.output_handler.commit(&self.outputs, ctx.outputs, Timestamp::Done) {
            callbacks.error(self.id, err.into_calculator_error(self.debug_name()));
        }
        if !graph_run_ended {
            for output in &self.outputs {
                output.close();
            }
        }
        callbacks.node_closed(self.id);
    }

    /// `CleanupAfterRun`: forces a close if needed, resets to
    /// `Uninitialized`.
    pub fn cleanup_after_run(&self, callbacks: &dyn NodeCallbacks) {
        if self.status() != NodeStatus::Closed && self.status() != NodeStatus::Uninitialized {
            self.close(true, callbacks);
        }
        *self.status.lock().unwrap() = NodeStatus::Uninitialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::DefaultInputStreamHandler;
    use std::sync::Mutex as StdMutex;

    struct NullCallbacks {
        errors: StdMutex<Vec<Error>>,
        scheduled: StdMutex<Vec<(usize, Invocation)>>,
    }

    impl NullCallbacks {
        fn new() -> Self {
            NullCallbacks { errors: StdMutex::new(Vec::new()), scheduled: StdMutex::new(Vec::new()) }
        }
    }

    impl NodeCallbacks for NullCallbacks {
        fn ready_for_open(&self, _node: usize) {}
        fn schedule(&self, node: usize, invocation: Invocation) {
            self.scheduled.lock().unwrap().push((node, invocation));
        }
        fn source_node_opened(&self, _node: usize) {}
        fn error(&self, _node: usize, err: Error) {
            self.errors.lock().unwrap().push(err);
        }
        fn node_closed(&self, _node: usize) {}
    }

    struct Passthrough;
    impl Calculator for Passthrough {
        fn open(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
            Ok(())
        }
        fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
            if let Some(packet) = ctx.input(0).cloned() {
                ctx.add_output_packet(0, packet);
            }
            Ok(())
        }
        fn close(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
            Ok(())
        }
    }

    fn build_node(id: usize) -> Node {
        let contract = NodeContract {
            debug_name: "passthrough".into(),
            input_count: 1,
            output_count: 1,
            side_packet_names: vec![],
            back_edges: vec![false],
            input_handler: "default".into(),
            output_offsets: vec![None],
            max_in_flight: 1,
            executor: String::new(),
            source_layer: 0,
            buffer_size_hint: None,
        };
        let input = Arc::new(InputStreamManager::new(false));
        let output = Arc::new(OutputStreamManager::new());
        Node::new(id, contract, vec![input], vec![output], Arc::new(DefaultInputStreamHandler::new(false)))
    }

    #[test]
    fn open_then_process_then_close_happens_once_each() {
        let node = build_node(0);
        let callbacks = NullCallbacks::new();
        node.prepare_for_run(Box::new(Passthrough));
        node.open(&callbacks).unwrap();
        assert_eq!(node.status(), NodeStatus::Opened);
        node.activate();

        node.inputs()[0].add_packets(vec![crate::packet::Packet::empty(Timestamp::Finite(0))]).unwrap();
        node.drive_scheduling_loop(&callbacks);
        let scheduled = callbacks.scheduled.lock().unwrap().drain(..).collect::<Vec<_>>();
        assert_eq!(scheduled.len(), 1);
        node.process(scheduled.into_iter().next().unwrap().1, &callbacks);

        node.close(false, &callbacks);
        assert_eq!(node.status(), NodeStatus::Closed);
        node.close(false, &callbacks); // idempotent
        assert!(callbacks.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn in_flight_never_exceeds_max() {
        let node = build_node(0);
        assert!(node.try_begin_scheduling());
        assert!(!node.try_begin_scheduling());
        assert_eq!(node.current_in_flight(), 1);
    }

    struct PrioritySource(i64);
    impl Calculator for PrioritySource {
        fn source_process_order(&self) -> i64 {
            self.0
        }
        fn open(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
            Ok(())
        }
        fn process(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
            Err(Error::stop())
        }
        fn close(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn source_process_order_reads_from_the_allocated_calculator() {
        let node = build_node(0);
        assert_eq!(node.source_process_order(), 0, "no calculator allocated yet");
        node.prepare_for_run(Box::new(PrioritySource(42)));
        assert_eq!(node.source_process_order(), 42);
    }
}
