//! One graph input stream mirrored to two independent calculators, each
//! observed on its own graph output.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use calcgraph::handlers::StreamHandlerFactory;
use calcgraph::{Calculator, CalculatorContext, CalculatorGraph, Error, GraphDescription, NodeContract, NodeSpec, Packet, PortEdge, Timestamp};

struct Double;

impl Calculator for Double {
    fn open(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        if let Some(packet) = ctx.input(0) {
            let v = *packet.get::<i32>()?;
            let ts = packet.timestamp();
            ctx.add_output_packet(0, Packet::new(v * 2, ts));
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        Ok(())
    }
}

struct Negate;

impl Calculator for Negate {
    fn open(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        if let Some(packet) = ctx.input(0) {
            let v = *packet.get::<i32>()?;
            let ts = packet.timestamp();
            ctx.add_output_packet(0, Packet::new(-v, ts));
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), Error> {
        Ok(())
    }
}

fn passthrough_contract(name: &str) -> NodeContract {
    NodeContract {
        debug_name: name.into(),
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
fn single_input_fans_out_to_two_calculators() {
    let desc = GraphDescription {
        nodes: vec![
            NodeSpec { contract: passthrough_contract("double"), calculator_factory: Arc::new(|| Box::new(Double)) },
            NodeSpec { contract: passthrough_contract("negate"), calculator_factory: Arc::new(|| Box::new(Negate)) },
        ],
        edges: vec![
            PortEdge { producer: 2, producer_port: 0, consumer: 0, consumer_port: 0 },
            PortEdge { producer: 2, producer_port: 0, consumer: 1, consumer_port: 0 },
        ],
        graph_inputs: vec!["in".to_string()],
        graph_input_modes: HashMap::new(),
        graph_outputs: HashMap::from([("doubled".to_string(), (0, 0)), ("negated".to_string(), (1, 0))]),
        stream_handlers: Arc::new(StreamHandlerFactory::with_defaults()),
    };

    let graph = CalculatorGraph::initialize(desc).unwrap();
    let (tx_d, rx_d) = mpsc::channel();
    let (tx_n, rx_n) = mpsc::channel();
    graph.observe_output_stream("doubled", Arc::new(move |p: Packet| tx_d.send(*p.get::<i32>().unwrap()).unwrap())).unwrap();
    graph.observe_output_stream("negated", Arc::new(move |p: Packet| tx_n.send(*p.get::<i32>().unwrap()).unwrap())).unwrap();
    graph.start_run(HashMap::new(), HashMap::new()).unwrap();

    graph.add_packet_to_input_stream("in", Packet::new(5i32, Timestamp::Finite(0))).unwrap();
    graph.add_packet_to_input_stream("in", Packet::new(7i32, Timestamp::Finite(1))).unwrap();
    graph.close_input_stream("in").unwrap();

    assert_eq!(rx_d.recv_timeout(std::time::Duration::from_secs(2)).unwrap(), 10);
    assert_eq!(rx_d.recv_timeout(std::time::Duration::from_secs(2)).unwrap(), 14);
    assert_eq!(rx_n.recv_timeout(std::time::Duration::from_secs(2)).unwrap(), -5);
    assert_eq!(rx_n.recv_timeout(std::time::Duration::from_secs(2)).unwrap(), -7);

    graph.wait_until_done().unwrap();
}
