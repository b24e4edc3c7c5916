//! Backpressure tracking and deadlock resolution (§4.5.3, §4.5.4).
//!
//! All throttling-state mutation is serialized under one mutex, matching the
//! `full_input_streams_mutex_` rung of the lock hierarchy documented on
//! [`crate::scheduler::GraphScheduler`]; callers must not be holding any
//! stream or node lock when they call in here.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use crate::contract::GraphConfig;
use crate::error::Error;

/// How a graph input stream behaves when throttled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GraphInputStreamMode {
    /// `add_packet` blocks until the stream is unthrottled or the run ends.
    WaitTillNotFull,
    /// `add_packet` returns [`Error::Unavailable`] immediately instead.
    AddIfNotFull,
}

/// Identifies one input stream as `(consumer_node_id, input_port)`. Observer
/// and poller mirrors, which have no consuming node, use a synthetic
/// `(usize::MAX, index)` key from the same space.
pub type StreamId = (usize, usize);

struct State {
    /// producer id -> set of full stream ids currently blocking it.
    full_streams_by_producer: HashMap<usize, HashSet<StreamId>>,
    /// Streams whose capacity is consumer-controlled (observers/pollers);
    /// excluded from deadlock accounting (§4.5.4).
    observer_streams: HashSet<StreamId>,
    cancelled: bool,
    has_error: bool,
}

/// Tracks which producers are throttled and resolves deadlocks among them.
pub struct ThrottleController {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Default for ThrottleController {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleController {
    /// An unthrottled controller with no observer streams registered.
    pub fn new() -> Self {
        ThrottleController {
            state: Mutex::new(State { full_streams_by_producer: HashMap::new(), observer_streams: HashSet::new(), cancelled: false, has_error: false }),
            condvar: Condvar::new(),
        }
    }

    /// Marks `stream` as consumer-controlled, excluding it from deadlock
    /// accounting even while full.
    pub fn register_observer_stream(&self, stream: StreamId) {
        self.state.lock().unwrap().observer_streams.insert(stream);
    }

    /// Called when `stream`'s becomes-full/becomes-not-full edge fires.
    /// Walks `stream`'s ancestor sources and updates each one's full-set,
    /// returning the ancestors that just transitioned throttled -> not.
    pub fn on_stream_full_edge(&self, config: &GraphConfig, stream: StreamId, is_full: bool) -> Vec<usize> {
        let ancestors = config.ancestor_sources_for_stream(stream.0, stream.1);
        let mut newly_unthrottled = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for &ancestor in ancestors {
                let set = state.full_streams_by_producer.entry(ancestor).or_default();
                let was_throttled = !set.is_empty();
                if is_full {
                    set.insert(stream);
                } else {
                    set.remove(&stream);
                }
                if was_throttled && set.is_empty() {
                    newly_unthrottled.push(ancestor);
                }
            }
        }
        self.condvar.notify_all();
        newly_unthrottled
    }

    /// Whether `producer` is currently blocked by at least one full
    /// descendant stream.
    pub fn is_throttled(&self, producer: usize) -> bool {
        self.state.lock().unwrap().full_streams_by_producer.get(&producer).is_some_and(|s| !s.is_empty())
    }

    /// Raises the run-wide error flag and wakes every waiter.
    pub fn set_has_error(&self) {
        self.state.lock().unwrap().has_error = true;
        self.condvar.notify_all();
    }

    /// Whether the run-wide error flag is set.
    pub fn has_error(&self) -> bool {
        self.state.lock().unwrap().has_error
    }

    /// Requests cancellation and wakes every waiter.
    pub fn cancel(&self) {
        self.state.lock().unwrap().cancelled = true;
        self.condvar.notify_all();
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// `WAIT_TILL_NOT_FULL`: blocks the caller until `producer` is no longer
    /// throttled, or the run errors or is cancelled.
    pub fn wait_until_unthrottled(&self, producer: usize) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.cancelled {
                return Err(Error::Aborted("run cancelled".into()));
            }
            if state.has_error {
                return Err(Error::internal("graph run has an error"));
            }
            let throttled = state.full_streams_by_producer.get(&producer).is_some_and(|s| !s.is_empty());
            if !throttled {
                return Ok(());
            }
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// `UnthrottleSources`: gathers every full, non-observer stream and
    /// either records a deadlock error (if `report_deadlock`) or grows each
    /// one's `max_queue_size` by one via `grow` (§4.5.4). Returns the number
    /// of streams grown, or the deadlock error.
    pub fn unthrottle_sources(&self, report_deadlock: bool, mut grow: impl FnMut(StreamId)) -> Result<usize, Error> {
        let culprits: HashSet<StreamId> = {
            let state = self.state.lock().unwrap();
            state
                .full_streams_by_producer
                .values()
                .flatten()
                .copied()
                .filter(|s| !state.observer_streams.contains(s))
                .collect()
        };
        if culprits.is_empty() {
            return Ok(0);
        }
        if report_deadlock {
            let err = Error::internal(format!("deadlock detected across {} stream(s)", culprits.len()));
            self.set_has_error();
            return Err(err);
        }
        for &stream in &culprits {
            grow(stream);
        }
        Ok(culprits.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Edge, GraphConfig, NodeContract};
    use std::collections::HashMap;

    fn contract(inputs: usize, outputs: usize) -> NodeContract {
        NodeContract {
            debug_name: "n".into(),
            input_count: inputs,
            output_count: outputs,
            side_packet_names: vec![],
            back_edges: vec![false; inputs],
            input_handler: "default".into(),
            output_offsets: vec![None; outputs],
            max_in_flight: 1,
            executor: String::new(),
            source_layer: 0,
            buffer_size_hint: None,
        }
    }

    #[test]
    fn full_edge_throttles_and_unthrottles_ancestor_source() {
        let nodes = vec![contract(0, 1), contract(1, 0)];
        let edges = vec![Edge { producer: 0, consumer: 1, consumer_port: 0 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let throttle = ThrottleController::new();
        throttle.on_stream_full_edge(&config, (1, 0), true);
        assert!(throttle.is_throttled(0));
        let unthrottled = throttle.on_stream_full_edge(&config, (1, 0), false);
        assert_eq!(unthrottled, vec![0]);
        assert!(!throttle.is_throttled(0));
    }

    #[test]
    fn distinct_ports_on_the_same_consumer_throttle_independently() {
        // node 2 has port 0 fed by source 0, port 1 fed by source 1.
        let nodes = vec![contract(0, 1), contract(0, 1), contract(2, 0)];
        let edges = vec![Edge { producer: 0, consumer: 2, consumer_port: 0 }, Edge { producer: 1, consumer: 2, consumer_port: 1 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let throttle = ThrottleController::new();
        throttle.on_stream_full_edge(&config, (2, 0), true);
        assert!(throttle.is_throttled(0));
        assert!(!throttle.is_throttled(1), "port 1's own producer must stay unthrottled");
        let unthrottled = throttle.on_stream_full_edge(&config, (2, 1), true);
        assert!(unthrottled.is_empty());
        assert!(throttle.is_throttled(1));
        throttle.on_stream_full_edge(&config, (2, 0), false);
        assert!(!throttle.is_throttled(0));
        assert!(throttle.is_throttled(1), "unthrottling port 0 must not affect port 1's still-full stream");
    }

    #[test]
    fn unthrottle_sources_grows_culprit_streams_when_not_reporting() {
        let nodes = vec![contract(0, 1), contract(1, 0)];
        let edges = vec![Edge { producer: 0, consumer: 1, consumer_port: 0 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let throttle = ThrottleController::new();
        throttle.on_stream_full_edge(&config, (1, 0), true);
        let mut grown = Vec::new();
        let count = throttle.unthrottle_sources(false, |s| grown.push(s)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(grown, vec![(1, 0)]);
    }

    #[test]
    fn unthrottle_sources_reports_deadlock_when_configured() {
        let nodes = vec![contract(0, 1), contract(1, 0)];
        let edges = vec![Edge { producer: 0, consumer: 1, consumer_port: 0 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let throttle = ThrottleController::new();
        throttle.on_stream_full_edge(&config, (1, 0), true);
        assert!(throttle.unthrottle_sources(true, |_| {}).is_err());
        assert!(throttle.has_error());
    }

    #[test]
    fn observer_streams_are_excluded_from_deadlock_accounting() {
        let nodes = vec![contract(0, 1), contract(1, 0)];
        let edges = vec![Edge { producer: 0, consumer: 1, consumer_port: 0 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let throttle = ThrottleController::new();
        throttle.register_observer_stream((1, 0));
        throttle.on_stream_full_edge(&config, (1, 0), true);
        let count = throttle.unthrottle_sources(false, |_| {}).unwrap();
        assert_eq!(count, 0);
    }
}
