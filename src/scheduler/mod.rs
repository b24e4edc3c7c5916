//! The graph-wide scheduler: executors, per-executor priority queues,
//! throttling, source-layer promotion, and termination detection (§4.5).
//!
//! Lock hierarchy (outermost first, never acquired out of order, and never
//! held while calling into a calculator or a waiter's condition variable):
//! per-stream mutex < input-handler mutex < node status mutex < scheduler
//! throttling mutex < scheduler queue mutex.

pub mod executor;
pub mod queue;
pub mod throttle;

pub use executor::{ApplicationThreadExecutor, Executor, Task, ThreadPoolExecutor};
pub use queue::{QueuedInvocation, SchedulerQueue};
pub use throttle::{GraphInputStreamMode, ThrottleController};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::contract::{GraphConfig, APPLICATION_THREAD_EXECUTOR, DEFAULT_EXECUTOR};
use crate::error::{Error, GraphRunError};
use crate::handlers::Invocation;
use crate::node::{Node, NodeCallbacks, NodeStatus};
use crate::packet::Packet;

struct Inner {
    config: Arc<GraphConfig>,
    nodes: Vec<Arc<Node>>,
    executors: Mutex<HashMap<String, Arc<dyn Executor>>>,
    app_thread: Arc<ApplicationThreadExecutor>,
    queues: Mutex<HashMap<String, Arc<SchedulerQueue>>>,
    throttle: Arc<ThrottleController>,
    errors: GraphRunError,
    in_flight_total: AtomicUsize,
    cancelled: AtomicBool,
    paused: AtomicBool,
    pending_while_paused: Mutex<Vec<(String, QueuedInvocation)>>,
    active_source_layer: Mutex<Option<u32>>,
    idle_mutex: Mutex<()>,
    idle_condvar: Condvar,
    output_side_packets: Mutex<HashMap<String, Packet>>,
}

/// A cheap, cloneable handle onto the scheduler's shared state. Every
/// `Arc<Node>` this scheduler owns is driven exclusively through the
/// [`NodeCallbacks`] implementation below.
#[derive(Clone)]
pub struct GraphScheduler(Arc<Inner>);

impl GraphScheduler {
    /// Builds a scheduler over `nodes`, with a default thread-pool executor
    /// sized per §5 and the reserved application-thread executor installed.
    pub fn new(config: Arc<GraphConfig>, nodes: Vec<Arc<Node>>) -> Self {
        let pool_size = ThreadPoolExecutor::default_pool_size(nodes.len());
        let app_thread = Arc::new(ApplicationThreadExecutor::new());
        let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        executors.insert(DEFAULT_EXECUTOR.to_string(), Arc::new(ThreadPoolExecutor::new(pool_size)));
        executors.insert(APPLICATION_THREAD_EXECUTOR.to_string(), app_thread.clone());
        GraphScheduler(Arc::new(Inner {
            config,
            nodes,
            executors: Mutex::new(executors),
            app_thread,
            queues: Mutex::new(HashMap::new()),
            throttle: Arc::new(ThrottleController::new()),
            errors: GraphRunError::new(),
            in_flight_total: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pending_while_paused: Mutex::new(Vec::new()),
            active_source_layer: Mutex::new(None),
            idle_mutex: Mutex::new(()),
            idle_condvar: Condvar::new(),
            output_side_packets: Mutex::new(HashMap::new()),
        }))
    }

    /// Registers a named executor; must be called before [`Self::start`].
    /// Rejects overwriting a reserved or already-registered name.
    pub fn set_executor(&self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Result<(), Error> {
        let name = name.into();
        if name == APPLICATION_THREAD_EXECUTOR {
            return Err(Error::invalid_argument("cannot replace the reserved application-thread executor"));
        }
        let mut executors = self.0.executors.lock().unwrap();
        if executors.contains_key(&name) && name != DEFAULT_EXECUTOR {
            return Err(Error::AlreadyExists(format!("executor `{name}` already registered")));
        }
        executors.insert(name, executor);
        Ok(())
    }

    /// Shared handle to this run's throttle controller, for the graph driver
    /// to wire input-stream full/not-full edges into.
    pub fn throttle(&self) -> &Arc<ThrottleController> {
        &self.0.throttle
    }

    /// The validated graph description this scheduler was built from.
    pub fn config(&self) -> &Arc<GraphConfig> {
        &self.0.config
    }

    /// This scheduler's nodes, indexed by id.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.0.nodes
    }

    fn executor_for(&self, name: &str) -> Arc<dyn Executor> {
        let executors = self.0.executors.lock().unwrap();
        executors.get(name).or_else(|| executors.get(DEFAULT_EXECUTOR)).expect("default executor always registered").clone()
    }

    fn dispatch(&self, executor_name: &str, queued: QueuedInvocation) {
        let executor = self.executor_for(executor_name);
        let scheduler = self.clone();
        executor.schedule(Box::new(move || scheduler.run_invocation(queued)));
    }

    fn queue_for(&self, name: &str) -> Arc<SchedulerQueue> {
        let mut queues = self.0.queues.lock().unwrap();
        queues.entry(name.to_string()).or_insert_with(|| Arc::new(SchedulerQueue::new())).clone()
    }

    /// Begins the run: activates the lowest populated source layer.
    pub fn start(&self) {
        let min_layer = self.0.nodes.iter().filter(|n| n.is_source()).map(|n| n.source_layer()).min();
        *self.0.active_source_layer.lock().unwrap() = min_layer;
        if let Some(layer) = min_layer {
            self.activate_source_layer(layer);
        }
    }

    fn activate_source_layer(&self, layer: u32) {
        for node in self.0.nodes.iter().filter(|n| n.is_source() && n.source_layer() == layer) {
            self.try_open_node(node);
        }
    }

    fn try_open_node(&self, node: &Arc<Node>) {
        if node.status() != NodeStatus::Prepared || !node.open_preconditions_ready() {
            return;
        }
        if node.open(self).is_ok() {
            if node.is_source() {
                node.activate();
            }
            node.drive_scheduling_loop(self);
        }
    }

    fn promote_source_layer_if_done(&self) {
        let mut active = self.0.active_source_layer.lock().unwrap();
        let Some(current) = *active else { return };
        let still_open = self.0.nodes.iter().any(|n| n.is_source() && n.source_layer() == current && n.status() != NodeStatus::Closed);
        if still_open {
            return;
        }
        let next = self.0.nodes.iter().filter(|n| n.is_source() && n.source_layer() > current).map(|n| n.source_layer()).min();
        *active = next;
        drop(active);
        if let Some(next) = next {
            self.activate_source_layer(next);
        }
    }

    /// Dispatches `queued` on the calling executor thread, driving the
    /// node's own scheduling loop forward afterwards.
    fn run_invocation(&self, queued: QueuedInvocation) {
        let node = self.0.nodes[queued.node].clone();
        node.process(queued.invocation, self);
        self.0.in_flight_total.fetch_sub(1, Ordering::AcqRel);
        self.0.idle_condvar.notify_all();
    }

    /// Cooperative cancellation: in-flight invocations run to completion, but
    /// no further ones are scheduled and no unopened node is opened.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.throttle.cancel();
        self.0.idle_condvar.notify_all();
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Stops handing newly-ready invocations to an executor; invocations
    /// already running continue to completion. Reversed by [`Self::resume`].
    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::SeqCst);
    }

    /// Reverses [`Self::pause`], dispatching everything queued up while
    /// paused.
    pub fn resume(&self) {
        self.0.paused.store(false, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.0.pending_while_paused.lock().unwrap());
        for (executor_name, queued) in pending {
            self.dispatch(&executor_name, queued);
        }
    }

    /// A side packet published by a side-packet-generator node, once `Open`
    /// (or its constant-outputs republish) has run for that node.
    pub fn output_side_packet(&self, name: &str) -> Option<Packet> {
        self.0.output_side_packets.lock().unwrap().get(name).cloned()
    }

    /// Whether any calculator or framework error has been recorded.
    pub fn has_error(&self) -> bool {
        self.0.throttle.has_error()
    }

    /// Runs `UnthrottleSources` once (§4.5.4); `grow` should call
    /// `InputStreamManager::set_max_queue_size` for the given `(consumer,
    /// port)` stream id.
    pub fn unthrottle_sources(&self, report_deadlock: bool, grow: impl FnMut(throttle::StreamId)) -> Result<usize, Error> {
        self.0.throttle.unthrottle_sources(report_deadlock, grow)
    }

    /// Whether the termination condition holds: every source is `Closed` and
    /// no invocation is in flight anywhere.
    pub fn is_terminated(&self) -> bool {
        self.0.in_flight_total.load(Ordering::Acquire) == 0 && self.0.nodes.iter().filter(|n| n.is_source()).all(|n| n.status() == NodeStatus::Closed)
    }

    /// Blocks until no invocation is in flight (the graph may not have
    /// terminated; a source may simply be between bursts).
    pub fn wait_until_idle(&self) {
        let mut guard = self.0.idle_mutex.lock().unwrap();
        while self.0.in_flight_total.load(Ordering::Acquire) > 0 {
            guard = self.0.idle_condvar.wait(guard).unwrap();
        }
    }

    /// Blocks until the run has terminated, then joins the combined error
    /// status in record order. Drains the application-thread executor's
    /// queue on the calling thread as it goes, so a graph entirely on that
    /// executor still makes progress without a worker pool.
    pub fn wait_until_done(&self) -> Result<(), Error> {
        loop {
            self.0.app_thread.drain();
            if self.is_terminated() || self.is_cancelled() {
                break;
            }
            let mut guard = self.0.idle_mutex.lock().unwrap();
            if self.0.in_flight_total.load(Ordering::Acquire) > 0 {
                let (g, _timeout) = self.0.idle_condvar.wait_timeout(guard, std::time::Duration::from_millis(10)).unwrap();
                guard = g;
            }
            drop(guard);
        }
        if self.is_cancelled() {
            return Err(Error::Aborted("run cancelled".into()));
        }
        self.0.errors.to_result()
    }

    /// This run's accumulated errors, in record order.
    pub fn errors(&self) -> &GraphRunError {
        &self.0.errors
    }
}

impl NodeCallbacks for GraphScheduler {
    fn ready_for_open(&self, node: usize) {
        let node = self.0.nodes[node].clone();
        if node.is_source() {
            let active = *self.0.active_source_layer.lock().unwrap();
            if active == Some(node.source_layer()) {
                self.try_open_node(&node);
            }
        } else {
            self.try_open_node(&node);
        }
    }

    fn schedule(&self, node_id: usize, invocation: Invocation) {
        if self.is_cancelled() {
            return;
        }
        let node = &self.0.nodes[node_id];
        let executor_name = node.executor_name().to_string();
        let queue = self.queue_for(&executor_name);
        let dispatched = if node.is_source() {
            queue.push_source_and_dispatch(node_id, invocation, node.source_process_order())
        } else {
            queue.push_non_source_and_dispatch(node_id, invocation)
        };
        self.0.in_flight_total.fetch_add(1, Ordering::AcqRel);
        if self.0.paused.load(Ordering::Acquire) {
            self.0.pending_while_paused.lock().unwrap().push((executor_name, dispatched));
            return;
        }
        self.dispatch(&executor_name, dispatched);
    }

    fn source_node_opened(&self, _node: usize) {}

    fn error(&self, node: usize, err: Error) {
        let _ = node;
        self.0.errors.push(err);
        self.0.throttle.set_has_error();
        self.0.idle_condvar.notify_all();
    }

    fn node_closed(&self, node: usize) {
        let node = &self.0.nodes[node];
        if node.is_source() {
            self.promote_source_layer_if_done();
        }
        self.0.idle_condvar.notify_all();
    }

    fn is_throttled(&self, node: usize) -> bool {
        self.0.throttle.is_throttled(node)
    }

    fn output_side_packets_emitted(&self, _node: usize, packets: Vec<(String, Packet)>) {
        let mut store = self.0.output_side_packets.lock().unwrap();
        for (name, packet) in packets {
            store.insert(name, packet);
        }
    }
}
