// packages/engine/src/main.rs
//! Content filter engine demo
//!
//! Runs the engine against the in-memory collaborators: one agent, one
//! stream flow and one datagram flow, printing what the agent sees and
//! what comes back out of the engine.

use anyhow::{Context, Result};
use content_filter_engine::observability::{init_metrics, init_tracing};
use content_filter_engine::ports::memory::{
    ChannelTransport, HashFlowDb, RecordingSocketLayer, StaticPolicy,
};
use content_filter_engine::protocol::sockopt::{OptValue, SockOpt, AF_INET};
use content_filter_engine::{
    Action, ConnDirection, ContentFilterEngine, Direction, EngineConfig, Event, Ports, Socket,
    Span,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const AGENT_UNIT: u32 = 1;
const POLICY_UNIT: u32 = 0x1;

fn main() -> Result<()> {
    let config = EngineConfig::load().context("loading configuration")?;
    init_tracing(&config.logging)?;
    let metrics = init_metrics()?;

    info!(
        "Starting content filter engine v{}",
        content_filter_engine::VERSION
    );

    let transport = Arc::new(ChannelTransport::default());
    let policy = Arc::new(StaticPolicy::new(POLICY_UNIT));
    let layer = Arc::new(RecordingSocketLayer::new());
    let ports = Ports::new(transport.clone(), policy, layer.clone());

    let mut engine = ContentFilterEngine::new(config, ports)?;
    engine.start_reporter()?;

    engine.ctl_connect(AGENT_UNIT)?;
    engine.ctl_setopt(
        AGENT_UNIT,
        SockOpt::NecpControlUnit,
        OptValue::ControlUnit(POLICY_UNIT),
    )?;

    // Stream flow: peek everything, then pass it
    let sock = Arc::new(Socket::stream(1, AF_INET).with_pid(std::process::id()));
    layer.register(&sock);
    let local: SocketAddr = "10.0.0.1:50000".parse()?;
    let remote: SocketAddr = "93.184.216.34:443".parse()?;
    engine.sock_attach(&sock, Some(local), Some(remote), ConnDirection::Out)?;
    let sock_id = sock
        .flow()
        .map(|f| f.sock_id)
        .context("socket was not attached")?;

    let disposition = engine.sock_data_out(&sock, Span::new(&b"GET / HTTP/1.1\r\n\r\n"[..]))?;
    info!("Submitted request, held: {}", disposition.is_held());

    for event in transport.drain_events(AGENT_UNIT) {
        print_event(&event);
    }

    let len = engine
        .flow_snapshot(sock_id)
        .map(|s| s.snd.pending_last)
        .unwrap_or(0);
    engine.ctl_send(
        AGENT_UNIT,
        &Action::update(sock_id, Direction::Out, 0, len).encode(),
    )?;
    engine.ctl_send(
        AGENT_UNIT,
        &Action::update(sock_id, Direction::Out, len, len).encode(),
    )?;
    let out = layer.reinjected_bytes(sock.gencnt, Direction::Out);
    info!("Reinjected {} bytes: {:?}", out.len(), String::from_utf8_lossy(&out));

    // Datagram flow left without a verdict
    let db = Arc::new(HashFlowDb::new());
    let dsock = Arc::new(Socket::datagram(2, AF_INET, db.clone()));
    let resolver: SocketAddr = "198.51.100.53:53".parse()?;
    engine.dgram_data_out(&dsock, None, resolver, Span::new(&b"\x12\x34query"[..]))?;
    info!("Datagram flows tracked: {}", db.len());

    engine.sock_is_closed(&sock);
    engine.sock_close_wait(&sock);
    engine.sock_detach(&sock);
    engine.sock_is_closed(&dsock);
    engine.sock_detach(&dsock);

    for event in transport.drain_events(AGENT_UNIT) {
        print_event(&event);
    }

    engine.ctl_disconnect(AGENT_UNIT)?;
    engine.shutdown();

    println!("{}", serde_json::to_string_pretty(&engine.counters())?);
    println!("{}", metrics.render());
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Data(data) => info!(
            "Agent saw {:?} [{}, {}) on flow {:#x}",
            event.op(),
            data.start_offset,
            data.end_offset,
            data.sock_id
        ),
        other => info!("Agent saw {:?} on flow {:#x}", other.op(), other.sock_id()),
    }
}
