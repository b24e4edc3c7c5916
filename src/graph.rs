//! The driver-facing API: a validated node/edge description goes in,
//! a running graph comes out (§6's driver table).
//!
//! Parsing a config file into a [`GraphDescription`] is explicitly out of
//! scope; a caller builds one directly, the way a test harness or an
//! embedding application would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::calculator::Calculator;
use crate::contract::{Edge, GraphConfig, NodeContract};
use crate::error::Error;
use crate::handlers::StreamHandlerFactory;
use crate::node::{Node, NodeStatus};
use crate::packet::Packet;
use crate::scheduler::{Executor, GraphInputStreamMode, GraphScheduler};
use crate::stream::input::InputStreamManager;
use crate::stream::output::{OutputShard, OutputStreamManager};

/// One node's contract plus the factory that allocates a fresh calculator
/// instance for each `start_run` (a node's calculator is consumed by value,
/// so a graph that runs more than once needs to build a new one each time).
pub struct NodeSpec {
    pub contract: NodeContract,
    pub calculator_factory: Arc<dyn Fn() -> Box<dyn Calculator> + Send + Sync>,
}

/// A directed edge naming both the output and input port at each end, unlike
/// [`crate::contract::Edge`] which only tracks node-level connectivity for
/// `AncestorSources`.
pub struct PortEdge {
    /// Producing node id, or a graph-input id (`>= nodes.len()`).
    pub producer: usize,
    /// Output port index on the producing node; ignored for a graph input.
    pub producer_port: usize,
    /// Consuming node id.
    pub consumer: usize,
    /// Input port index on the consuming node.
    pub consumer_port: usize,
}

/// The fully resolved shape of a graph, ready for [`CalculatorGraph::initialize`].
pub struct GraphDescription {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<PortEdge>,
    /// Named graph input streams, in the order their virtual ids are assigned.
    pub graph_inputs: Vec<String>,
    /// Per-graph-input throttling behavior; streams absent here default to
    /// [`GraphInputStreamMode::WaitTillNotFull`].
    pub graph_input_modes: HashMap<String, GraphInputStreamMode>,
    /// Named graph output bindings, `name -> (producer node, output index)`.
    pub graph_outputs: HashMap<String, (usize, usize)>,
    pub stream_handlers: Arc<StreamHandlerFactory>,
}

/// A queue-backed subscriber on a graph output stream, returned by
/// [`CalculatorGraph::add_output_stream_poller`].
pub struct OutputPoller {
    mirror: Arc<InputStreamManager>,
    wake: Mutex<()>,
    condvar: Condvar,
}

impl OutputPoller {
    /// Blocks until a packet is available or the stream closes, in which
    /// case it returns `None`. Polls on a short timeout rather than a single
    /// precise wakeup, matching the scheduler's own idle-wait discipline.
    pub fn pull(&self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.mirror.pop_queue_head() {
                return Some(packet);
            }
            if self.mirror.is_closed() {
                return None;
            }
            let guard = self.wake.lock().unwrap();
            let _ = self.condvar.wait_timeout(guard, Duration::from_millis(20)).unwrap();
        }
    }
}

/// The running (or not-yet-started) graph: node state, graph input/output
/// bindings, and the scheduler driving it all.
pub struct CalculatorGraph {
    nodes: Vec<Arc<Node>>,
    calculator_factories: Vec<Arc<dyn Fn() -> Box<dyn Calculator> + Send + Sync>>,
    scheduler: GraphScheduler,
    graph_inputs: HashMap<String, Arc<OutputStreamManager>>,
    graph_input_ids: HashMap<String, usize>,
    graph_input_modes: HashMap<String, GraphInputStreamMode>,
    graph_outputs: HashMap<String, (usize, usize)>,
    side_packet_consumers: HashMap<String, Vec<usize>>,
    observers: Mutex<Vec<Arc<InputStreamManager>>>,
}

impl CalculatorGraph {
    /// `Initialize`: resolves a [`GraphDescription`] into live stream
    /// managers, nodes, and a scheduler. Does not start any work.
    pub fn initialize(desc: GraphDescription) -> Result<Self, Error> {
        let GraphDescription { nodes: node_specs, edges, graph_inputs: graph_input_names, graph_input_modes, graph_outputs, stream_handlers } = desc;
        let node_count = node_specs.len();

        let graph_input_ids: HashMap<String, usize> = graph_input_names.iter().enumerate().map(|(i, name)| (name.clone(), node_count + i)).collect();
        let graph_inputs: HashMap<String, Arc<OutputStreamManager>> = graph_input_names.iter().map(|name| (name.clone(), Arc::new(OutputStreamManager::new()))).collect();

        let node_inputs: Vec<Vec<Arc<InputStreamManager>>> = node_specs
            .iter()
            .map(|spec| (0..spec.contract.input_count).map(|port| Arc::new(InputStreamManager::new(spec.contract.back_edges.get(port).copied().unwrap_or(false)))).collect())
            .collect();
        let node_outputs: Vec<Vec<Arc<OutputStreamManager>>> =
            node_specs.iter().map(|spec| (0..spec.contract.output_count).map(|_| Arc::new(OutputStreamManager::new())).collect()).collect();

        let mut producer_of_input: HashMap<(usize, usize), usize> = HashMap::new();
        for edge in &edges {
            let consumer_input = node_inputs
                .get(edge.consumer)
                .and_then(|ports| ports.get(edge.consumer_port))
                .ok_or_else(|| Error::invalid_argument("edge references an unknown consumer port"))?
                .clone();
            if edge.producer < node_count {
                let output = node_outputs
                    .get(edge.producer)
                    .and_then(|ports| ports.get(edge.producer_port))
                    .ok_or_else(|| Error::invalid_argument("edge references an unknown producer port"))?;
                output.add_mirror(consumer_input);
            } else {
                let name = graph_input_names.get(edge.producer - node_count).ok_or_else(|| Error::invalid_argument("edge references an unknown graph input id"))?;
                graph_inputs[name].add_mirror(consumer_input);
            }
            producer_of_input.insert((edge.consumer, edge.consumer_port), edge.producer);
        }

        let simple_edges: Vec<Edge> = edges.iter().map(|e| Edge { producer: e.producer, consumer: e.consumer, consumer_port: e.consumer_port }).collect();
        let node_contracts: Vec<NodeContract> = node_specs.iter().map(|s| s.contract.clone()).collect();
        let config = Arc::new(GraphConfig::new(node_contracts, simple_edges, graph_input_ids.clone(), graph_outputs.clone()));

        let mut side_packet_consumers: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, spec) in node_specs.iter().enumerate() {
            for name in &spec.contract.side_packet_names {
                side_packet_consumers.entry(name.clone()).or_default().push(i);
            }
        }

        let mut nodes = Vec::with_capacity(node_count);
        let mut calculator_factories = Vec::with_capacity(node_count);
        for (i, (spec, inputs, outputs)) in itertools::izip!(node_specs, node_inputs, node_outputs).enumerate() {
            let input_handler = stream_handlers.create(&spec.contract.input_handler)?;
            if let Some(hint) = spec.contract.buffer_size_hint {
                input_handler.set_max_queue_size(&inputs, Some(hint));
            }
            nodes.push(Arc::new(Node::new(i, spec.contract, inputs, outputs, input_handler)));
            calculator_factories.push(spec.calculator_factory);
        }

        let scheduler = GraphScheduler::new(config.clone(), nodes.clone());

        // Every arrival re-drives the node's scheduling loop so a packet that
        // lands on an already-open node gets picked up; the first arrival on
        // each input additionally satisfies that input's header precondition,
        // real header or not (§4.4's header-before-data rule means a true
        // header always wins the race when one is set).
        for node in &nodes {
            for input in node.inputs() {
                let node = node.clone();
                let sched = scheduler.clone();
                let fired = Arc::new(AtomicBool::new(false));
                input.set_arrival_callback(Arc::new(move |_packet| {
                    if !fired.swap(true, Ordering::SeqCst) {
                        node.notify_header_ready(&sched);
                    }
                    node.drive_scheduling_loop(&sched);
                }));
            }
        }

        // Wire each input's becomes-full/becomes-not-full edge into the
        // throttle controller, keyed by the specific `(consumer, port)`
        // stream rather than the consuming node's id: two inputs on the same
        // node fed by different producers must throttle independently
        // (§4.5.3).
        for consumer in 0..node_count {
            for port in 0..nodes[consumer].inputs().len() {
                if !producer_of_input.contains_key(&(consumer, port)) {
                    continue;
                }
                let sched = scheduler.clone();
                let cfg = config.clone();
                let nodes_for_cb = nodes.clone();
                let stream = (consumer, port);
                let cb: Arc<dyn Fn(bool) + Send + Sync> = Arc::new(move |is_full: bool| {
                    let unthrottled = sched.throttle().on_stream_full_edge(&cfg, stream, is_full);
                    for id in unthrottled {
                        if let Some(node) = nodes_for_cb.get(id) {
                            node.drive_scheduling_loop(&sched);
                        }
                    }
                });
                nodes[consumer].inputs()[port].set_queue_size_callbacks(cb.clone(), cb);
            }
        }

        Ok(CalculatorGraph {
            nodes,
            calculator_factories,
            scheduler,
            graph_inputs,
            graph_input_ids,
            graph_input_modes,
            graph_outputs,
            side_packet_consumers,
            observers: Mutex::new(Vec::new()),
        })
    }

    /// `StartRun`: seeds side packets and graph-input headers, allocates a
    /// fresh calculator per node, opens eligible nodes, and activates the
    /// first source layer.
    pub fn start_run(&self, side_packets: HashMap<String, Packet>, headers: HashMap<String, Packet>) -> Result<(), Error> {
        for (name, header) in headers {
            let stream = self.graph_inputs.get(&name).ok_or_else(|| Error::NotFound(format!("no graph input stream named `{name}`")))?;
            stream.set_header(header)?;
        }
        for (name, packet) in side_packets {
            let consumers = self.side_packet_consumers.get(&name).cloned().unwrap_or_default();
            for node_id in consumers {
                self.nodes[node_id].provide_side_packet(&name, packet.clone(), &self.scheduler)?;
            }
        }
        for (node, factory) in self.nodes.iter().zip(&self.calculator_factories) {
            node.prepare_for_run(factory());
        }
        self.scheduler.start();
        Ok(())
    }

    /// `AddPacketToInputStream`: appends one packet to a named graph input,
    /// honoring its configured [`GraphInputStreamMode`].
    pub fn add_packet_to_input_stream(&self, name: &str, packet: Packet) -> Result<(), Error> {
        let stream = self.graph_inputs.get(name).ok_or_else(|| Error::NotFound(format!("no graph input stream named `{name}`")))?;
        let producer_id = self.graph_input_ids[name];
        match self.graph_input_modes.get(name).copied().unwrap_or(GraphInputStreamMode::WaitTillNotFull) {
            GraphInputStreamMode::WaitTillNotFull => self.scheduler.throttle().wait_until_unthrottled(producer_id)?,
            GraphInputStreamMode::AddIfNotFull => {
                if self.scheduler.throttle().is_throttled(producer_id) {
                    return Err(Error::unavailable("graph input stream is throttled"));
                }
            }
        }
        let mut shard = OutputShard::new();
        shard.add_packet(packet);
        stream.propagate_updates_to_mirrors(shard)
    }

    /// `CloseInputStream`: idempotent; propagates `Done` to every consumer.
    pub fn close_input_stream(&self, name: &str) -> Result<(), Error> {
        let stream = self.graph_inputs.get(name).ok_or_else(|| Error::NotFound(format!("no graph input stream named `{name}`")))?;
        stream.close();
        Ok(())
    }

    /// `CloseAllPacketSources`: closes every graph input and forces every
    /// source node closed.
    pub fn close_all_packet_sources(&self) {
        for stream in self.graph_inputs.values() {
            stream.close();
        }
        for node in &self.nodes {
            if node.is_source() {
                node.close(false, &self.scheduler);
            }
        }
    }

    /// `ObserveOutputStream`: registers `cb` to run, on an executor thread,
    /// once per packet published on the named graph output.
    pub fn observe_output_stream(&self, name: &str, cb: Arc<dyn Fn(Packet) + Send + Sync>) -> Result<(), Error> {
        let &(producer, output_index) = self.graph_outputs.get(name).ok_or_else(|| Error::NotFound(format!("no graph output stream named `{name}`")))?;
        let mirror = Arc::new(InputStreamManager::new(false));
        mirror.set_arrival_callback(cb);
        self.nodes[producer].outputs()[output_index].add_mirror(mirror.clone());
        self.register_observer_mirror(mirror);
        Ok(())
    }

    /// `AddOutputStreamPoller`: returns a queue-backed poller over the named
    /// graph output, with a blocking [`OutputPoller::pull`].
    pub fn add_output_stream_poller(&self, name: &str) -> Result<Arc<OutputPoller>, Error> {
        let &(producer, output_index) = self.graph_outputs.get(name).ok_or_else(|| Error::NotFound(format!("no graph output stream named `{name}`")))?;
        let mirror = Arc::new(InputStreamManager::new(false));
        let poller = Arc::new(OutputPoller { mirror: mirror.clone(), wake: Mutex::new(()), condvar: Condvar::new() });
        let weak: Weak<OutputPoller> = Arc::downgrade(&poller);
        mirror.set_arrival_callback(Arc::new(move |_packet| {
            if let Some(poller) = weak.upgrade() {
                poller.condvar.notify_all();
            }
        }));
        self.nodes[producer].outputs()[output_index].add_mirror(mirror.clone());
        self.register_observer_mirror(mirror);
        Ok(poller)
    }

    /// Tracks an observer/poller mirror and excludes it from deadlock
    /// accounting: its queue is drained by an external caller rather than a
    /// calculator, so it must never be treated as a culprit stream even while
    /// full (§4.5.4). Uses a synthetic `(usize::MAX, index)` stream id since
    /// these mirrors have no consuming node of their own.
    fn register_observer_mirror(&self, mirror: Arc<InputStreamManager>) {
        let mut observers = self.observers.lock().unwrap();
        let index = observers.len();
        self.scheduler.throttle().register_observer_stream((usize::MAX, index));
        observers.push(mirror);
    }

    /// `GetOutputSidePacket`: available once the producing node has opened
    /// (pre-run producers) or, for a streaming node, only after termination.
    pub fn get_output_side_packet(&self, name: &str) -> Result<Packet, Error> {
        self.scheduler.output_side_packet(name).ok_or_else(|| Error::unavailable(format!("output side packet `{name}` not yet available")))
    }

    /// Registers a named executor; must be called before [`Self::start_run`].
    pub fn set_executor(&self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Result<(), Error> {
        self.scheduler.set_executor(name, executor)
    }

    /// Blocks until no invocation is in flight; the run may not have
    /// terminated.
    pub fn wait_until_idle(&self) {
        self.scheduler.wait_until_idle();
    }

    /// Blocks until the run has terminated and joins its accumulated errors.
    pub fn wait_until_done(&self) -> Result<(), Error> {
        self.scheduler.wait_until_done()
    }

    /// Cooperative cancellation: no new work is scheduled; in-flight
    /// invocations are allowed to complete, after which every node that
    /// reached `Open` is force-closed (`Calculator::close` runs exactly once
    /// per opened node even on an aborted run).
    pub fn cancel(&self) {
        self.scheduler.cancel();
        self.scheduler.wait_until_idle();
        for node in &self.nodes {
            if matches!(node.status(), NodeStatus::Opened | NodeStatus::Active) {
                node.close(true, &self.scheduler);
            }
        }
    }

    /// Stops handing newly-ready invocations to an executor.
    pub fn pause(&self) {
        self.scheduler.pause();
    }

    /// Reverses [`Self::pause`].
    pub fn resume(&self) {
        self.scheduler.resume();
    }

    /// Runs `UnthrottleSources` once (§4.5.4): if `report_deadlock`, records
    /// a deadlock error and returns it; otherwise grows each culprit input
    /// stream's queue by one slot and returns how many were grown.
    pub fn resolve_deadlock(&self, report_deadlock: bool) -> Result<usize, Error> {
        let nodes = &self.nodes;
        self.scheduler.unthrottle_sources(report_deadlock, |(consumer, port)| {
            if let Some(input) = nodes.get(consumer).and_then(|node| node.inputs().get(port)) {
                let grown = input.max_queue_size().unwrap_or(0) + 1;
                input.set_max_queue_size(Some(grown));
            }
        })
    }
}
