//! The validated, immutable graph description this crate consumes.
//!
//! Parsing and validating this description from a config file is explicitly
//! out of scope (§1); a driver is expected to build a [`GraphConfig`]
//! directly, the way a test harness or an embedding application would.

use std::collections::{HashMap, HashSet};

/// The name the application-thread executor is always registered under.
pub const APPLICATION_THREAD_EXECUTOR: &str = "__application__";
/// The name used for an executor when a node does not request one by name.
pub const DEFAULT_EXECUTOR: &str = "";

/// A single edge endpoint, either a named graph boundary stream or a
/// `(node_id, port_index)` pair resolved at `initialize` time.
#[derive(Debug, Clone)]
pub struct EdgeRef {
    /// The producing node's id, once resolved.
    pub node: usize,
    /// The output/input index on that node.
    pub port: usize,
}

/// One node's complete, pre-validated contract.
#[derive(Debug, Clone)]
pub struct NodeContract {
    /// Cosmetic name used in error messages and logging.
    pub debug_name: String,
    /// Number of input streams (0 for a source node).
    pub input_count: usize,
    /// Number of output streams.
    pub output_count: usize,
    /// Names of expected side packets.
    pub side_packet_names: Vec<String>,
    /// `back_edge` flag per input, same length as `input_count`.
    pub back_edges: Vec<bool>,
    /// Type name of the input stream handler to construct, e.g. `"default"`.
    pub input_handler: String,
    /// `TimestampOffset` declared per output, parallel to `output_count`;
    /// `None` where the node sets bounds explicitly instead.
    pub output_offsets: Vec<Option<i64>>,
    /// Maximum number of concurrently in-flight invocations.
    pub max_in_flight: usize,
    /// Executor name this node is assigned to; `""` selects the default pool.
    pub executor: String,
    /// Source layer; irrelevant for non-source nodes.
    pub source_layer: u32,
    /// Per-input buffer size hint, applied as each input's max queue size.
    pub buffer_size_hint: Option<usize>,
}

impl NodeContract {
    /// Whether this contract describes a source node (no inputs, ≥1 output).
    pub fn is_source(&self) -> bool {
        self.input_count == 0 && self.output_count > 0
    }

    /// Whether this contract describes a side-packet generator (no streaming
    /// I/O at all); such nodes are not scheduled on the streaming runtime.
    pub fn is_side_packet_generator(&self) -> bool {
        self.input_count == 0 && self.output_count == 0
    }
}

/// A directed edge from one node's output to another's input, used to
/// precompute the `AncestorSources` relation for throttling.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    /// Producing node id (or a virtual graph-input-stream id).
    pub producer: usize,
    /// Consuming node id.
    pub consumer: usize,
    /// Input port on the consuming node; together with `consumer` this
    /// identifies one input stream (§4.5.3 treats each input stream, not
    /// each node, as an independent throttling unit).
    pub consumer_port: usize,
}

/// The full, immutable description of a graph: every node's contract plus
/// the edges that connect them.
pub struct GraphConfig {
    /// One contract per node, indexed by node id.
    pub nodes: Vec<NodeContract>,
    /// Every producer → consumer edge in the graph, including graph input
    /// streams (whose producer id is `>= nodes.len()`).
    pub edges: Vec<Edge>,
    /// Named graph input streams, each bound to a virtual producer id.
    pub graph_inputs: HashMap<String, usize>,
    /// Named graph output bindings, `name -> (producer node, output index)`.
    pub graph_outputs: HashMap<String, (usize, usize)>,
    /// The immediate producer feeding each `(consumer, port)` input stream.
    producer_of_input: HashMap<(usize, usize), usize>,
    ancestor_cache: std::sync::OnceLock<HashMap<usize, HashSet<usize>>>,
}

impl GraphConfig {
    /// Builds a config from its parts, deferring ancestor-set computation
    /// until first requested.
    pub fn new(nodes: Vec<NodeContract>, edges: Vec<Edge>, graph_inputs: HashMap<String, usize>, graph_outputs: HashMap<String, (usize, usize)>) -> Self {
        let producer_of_input = edges.iter().map(|e| ((e.consumer, e.consumer_port), e.producer)).collect();
        GraphConfig { nodes, edges, graph_inputs, graph_outputs, producer_of_input, ancestor_cache: std::sync::OnceLock::new() }
    }

    /// The set of root producers (calculator source nodes and graph input
    /// streams) that transitively feed the output stream identified by
    /// `producer` — i.e. `AncestorSources`, used to walk from a full input
    /// stream back to the sources throttling must pause (§4.5.3).
    pub fn ancestor_sources(&self, producer: usize) -> &HashSet<usize> {
        let cache = self.ancestor_cache.get_or_init(|| self.compute_all_ancestor_sources());
        cache.get(&producer).unwrap_or_else(|| EMPTY_SET.get_or_init(HashSet::new))
    }

    /// `AncestorSources` scoped to one specific input stream: walks back from
    /// the immediate producer feeding `(consumer, port)`, not from every
    /// input the consumer node happens to have. Two inputs on the same node
    /// fed by different producers therefore never share a root set (§4.5.3).
    pub fn ancestor_sources_for_stream(&self, consumer: usize, port: usize) -> &HashSet<usize> {
        match self.producer_of_input.get(&(consumer, port)) {
            Some(&producer) => self.ancestor_sources(producer),
            None => EMPTY_SET.get_or_init(HashSet::new),
        }
    }

    fn compute_all_ancestor_sources(&self) -> HashMap<usize, HashSet<usize>> {
        let mut incoming: HashMap<usize, Vec<usize>> = HashMap::new();
        for edge in &self.edges {
            incoming.entry(edge.consumer).or_default().push(edge.producer);
        }
        let is_root = |id: usize| -> bool { self.nodes.get(id).map(|n| n.is_source()).unwrap_or(true) };

        let mut result: HashMap<usize, HashSet<usize>> = HashMap::new();
        let all_ids: HashSet<usize> = self.edges.iter().flat_map(|e| [e.producer, e.consumer]).collect();
        for &id in &all_ids {
            let mut visited = HashSet::new();
            let mut roots = HashSet::new();
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if is_root(current) {
                    roots.insert(current);
                }
                if let Some(producers) = incoming.get(&current) {
                    stack.extend(producers.iter().copied());
                }
            }
            result.insert(id, roots);
        }
        result
    }
}

static EMPTY_SET: std::sync::OnceLock<HashSet<usize>> = std::sync::OnceLock::new();

#[cfg(test)]
mod tests {
    use super::*;

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
    fn ancestor_sources_walks_back_to_roots() {
        // 0 (source) -> 1 -> 2
        let nodes = vec![contract(0, 1), contract(1, 1), contract(1, 0)];
        let edges = vec![Edge { producer: 0, consumer: 1, consumer_port: 0 }, Edge { producer: 1, consumer: 2, consumer_port: 0 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let ancestors = config.ancestor_sources(2);
        assert!(ancestors.contains(&0));
    }

    #[test]
    fn ancestor_sources_for_stream_is_scoped_per_port() {
        // node 2 has two inputs: port 0 fed by source 0, port 1 fed by source 1.
        let nodes = vec![contract(0, 1), contract(0, 1), contract(2, 0)];
        let edges = vec![Edge { producer: 0, consumer: 2, consumer_port: 0 }, Edge { producer: 1, consumer: 2, consumer_port: 1 }];
        let config = GraphConfig::new(nodes, edges, HashMap::new(), HashMap::new());
        let port0 = config.ancestor_sources_for_stream(2, 0);
        let port1 = config.ancestor_sources_for_stream(2, 1);
        assert_eq!(port0, &HashSet::from([0]));
        assert_eq!(port1, &HashSet::from([1]));
    }

    #[test]
    fn source_detection() {
        assert!(contract(0, 1).is_source());
        assert!(!contract(1, 1).is_source());
        assert!(contract(0, 0).is_side_packet_generator());
    }
}
