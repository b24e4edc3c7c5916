//! A producer blocked on a full `WaitTillNotFull` input stream is released
//! once `resolve_deadlock` grows the stalled consumer's queue bound, rather
//! than by the consumer ever catching up on its own.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use calcgraph::handlers::StreamHandlerFactory;
use calcgraph::{Calculator, CalculatorContext, CalculatorGraph, Error, GraphDescription, NodeContract, NodeSpec, Packet, PortEdge, Timestamp};

struct BlockingEcho {
    started: mpsc::Sender<()>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl Calculator for BlockingEcho {
    fn open(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        self.started.send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        if let Some(packet) = ctx.input(0) {
            ctx.add_output_packet(0, packet.clone());
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        Ok(())
    }
}

fn echo_contract() -> NodeContract {
    NodeContract {
        debug_name: "blocking_echo".into(),
        input_count: 1,
        output_count: 1,
        side_packet_names: vec![],
        back_edges: vec![false],
        input_handler: "default".into(),
        output_offsets: vec![None],
        max_in_flight: 1,
        executor: String::new(),
        source_layer: 0,
        buffer_size_hint: Some(1),
    }
}

#[test]
fn resolve_deadlock_unblocks_a_waiting_producer() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let release_rx = Arc::new(Mutex::new(release_rx));

    let desc = GraphDescription {
        nodes: vec![NodeSpec {
            contract: echo_contract(),
            calculator_factory: Arc::new(move || Box::new(BlockingEcho { started: started_tx.clone(), release: release_rx.clone() })),
        }],
        edges: vec![PortEdge { producer: 1, producer_port: 0, consumer: 0, consumer_port: 0 }],
        graph_inputs: vec!["in".to_string()],
        graph_input_modes: HashMap::new(),
        graph_outputs: HashMap::from([("out".to_string(), (0, 0))]),
        stream_handlers: Arc::new(StreamHandlerFactory::with_defaults()),
    };

    let graph = Arc::new(CalculatorGraph::initialize(desc).unwrap());
    let (tx, rx) = mpsc::channel();
    graph.observe_output_stream("out", Arc::new(move |p: Packet| tx.send(p.timestamp()).unwrap())).unwrap();
    graph.start_run(HashMap::new(), HashMap::new()).unwrap();

    graph.add_packet_to_input_stream("in", Packet::new(1i32, Timestamp::Finite(0))).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    graph.add_packet_to_input_stream("in", Packet::new(2i32, Timestamp::Finite(1))).unwrap();

    let producer_graph = graph.clone();
    let producer = thread::spawn(move || producer_graph.add_packet_to_input_stream("in", Packet::new(3i32, Timestamp::Finite(2))));

    // Give the producer thread a chance to actually reach the blocking wait
    // before growing the queue out from under it.
    thread::sleep(Duration::from_millis(100));
    let grown = graph.resolve_deadlock(false).unwrap();
    assert_eq!(grown, 1, "exactly the one stalled consumer stream should have been grown");

    producer.join().unwrap().unwrap();

    release_tx.send(()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Timestamp::Finite(0));
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    release_tx.send(()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Timestamp::Finite(1));
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    release_tx.send(()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Timestamp::Finite(2));

    graph.close_input_stream("in").unwrap();
    graph.wait_until_done().unwrap();
}
