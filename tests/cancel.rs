//! Cancelling mid-run still closes every node that reached `Open`, and
//! `wait_until_done` afterwards reports the run as aborted rather than ok.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use calcgraph::handlers::StreamHandlerFactory;
use calcgraph::{Calculator, CalculatorContext, CalculatorGraph, Error, GraphDescription, NodeContract, NodeSpec, Packet, PortEdge, Timestamp};

struct BlockingEcho {
    started: mpsc::Sender<()>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
    closed: Arc<AtomicBool>,
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
        self.closed.store(true, Ordering::SeqCst);
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
        buffer_size_hint: None,
    }
}

#[test]
fn cancel_closes_opened_nodes_and_aborts_wait_until_done() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let release_rx = Arc::new(Mutex::new(release_rx));
    let closed = Arc::new(AtomicBool::new(false));

    let desc = GraphDescription {
        nodes: vec![NodeSpec {
            contract: echo_contract(),
            calculator_factory: {
                let closed = closed.clone();
                Arc::new(move || Box::new(BlockingEcho { started: started_tx.clone(), release: release_rx.clone(), closed: closed.clone() }))
            },
        }],
        edges: vec![PortEdge { producer: 1, producer_port: 0, consumer: 0, consumer_port: 0 }],
        graph_inputs: vec!["in".to_string()],
        graph_input_modes: HashMap::new(),
        graph_outputs: HashMap::from([("out".to_string(), (0, 0))]),
        stream_handlers: Arc::new(StreamHandlerFactory::with_defaults()),
    };

    let graph = Arc::new(CalculatorGraph::initialize(desc).unwrap());
    graph.start_run(HashMap::new(), HashMap::new()).unwrap();

    graph.add_packet_to_input_stream("in", Packet::new(1i32, Timestamp::Finite(0))).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let cancel_graph = graph.clone();
    let canceller = thread::spawn(move || cancel_graph.cancel());

    // cancel() waits for the in-flight invocation to finish before closing
    // nodes, so give it time to actually reach that wait before releasing.
    thread::sleep(Duration::from_millis(100));
    assert!(!closed.load(Ordering::SeqCst), "close must not run while the invocation is still in flight");
    release_tx.send(()).unwrap();

    canceller.join().unwrap();
    assert!(closed.load(Ordering::SeqCst), "cancel must force-close every node that reached Open");

    let result = graph.wait_until_done();
    assert!(matches!(result, Err(Error::Aborted(_))));
}
