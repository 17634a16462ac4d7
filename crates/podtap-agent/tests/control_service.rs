//! Integration tests driving the control service over real TCP loopback
//! with the protocol client, exactly as the operator side does — minus the
//! orchestrator transport and the NAT table (redirect sessions here stop at
//! request validation so no firewall rule is ever touched).

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use podtap_agent::ControlService;
use podtap_common::types::Direction;
use podtap_proto::{Control, ProtoError};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::span;

async fn start_service() -> (std::net::SocketAddr, CancellationToken) {
    let service = ControlService::bind("127.0.0.1:0").await.unwrap();
    let addr = service.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    drop(tokio::spawn(service.serve(serve_shutdown)));
    (addr, shutdown)
}

#[tokio::test]
async fn list_processes_excludes_self_and_loopback() {
    let (addr, _shutdown) = start_service().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut control = Control::new(stream);
    let processes = control.list_processes().await.unwrap();

    assert!(
        !processes.is_empty(),
        "a Linux host always has visible processes"
    );
    let own = std::process::id();
    assert!(processes.iter().all(|p| p.pid != own));
    assert!(
        processes
            .iter()
            .flat_map(|p| &p.listen_addresses)
            .all(|addr| !addr.ip.is_loopback())
    );
}

#[tokio::test]
async fn redirect_rejects_port_zero() {
    let (addr, _shutdown) = start_service().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut control = Control::new(stream);
    control
        .start_redirect(0, Direction::Inbound)
        .await
        .unwrap();
    let err = control.next_pairing_port().await.unwrap_err();
    assert!(matches!(err, ProtoError::Remote(msg) if msg.contains("nonzero")));
}

#[tokio::test]
async fn sessions_are_independent() {
    let (addr, _shutdown) = start_service().await;

    // A failed session must not affect a concurrent healthy one.
    let mut bad = Control::new(TcpStream::connect(addr).await.unwrap());
    bad.start_redirect(0, Direction::Outbound).await.unwrap();
    assert!(bad.next_pairing_port().await.is_err());

    let mut good = Control::new(TcpStream::connect(addr).await.unwrap());
    let processes = good.list_processes().await.unwrap();
    assert!(!processes.is_empty());
}

/// Counters for the `session` span, shared with the recording subscriber.
#[derive(Default)]
struct SpanStats {
    enters: AtomicU64,
    exits: AtomicU64,
    events_inside: AtomicU64,
}

/// Minimal subscriber tracking which span each event lands in. Built for a
/// current-thread runtime, where one stack covers all tasks.
struct SpanRecorder {
    stats: Arc<SpanStats>,
    next_id: AtomicU64,
    names: Mutex<HashMap<u64, &'static str>>,
    stack: Mutex<Vec<u64>>,
}

impl SpanRecorder {
    fn new(stats: Arc<SpanStats>) -> Self {
        Self {
            stats,
            next_id: AtomicU64::new(0),
            names: Mutex::new(HashMap::new()),
            stack: Mutex::new(Vec::new()),
        }
    }

    fn is_session(&self, id: u64) -> bool {
        self.names.lock().unwrap().get(&id) == Some(&"session")
    }
}

impl tracing::Subscriber for SpanRecorder {
    fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, attrs: &span::Attributes<'_>) -> span::Id {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self
            .names
            .lock()
            .unwrap()
            .insert(id, attrs.metadata().name());
        span::Id::from_u64(id)
    }

    fn record(&self, _: &span::Id, _: &span::Record<'_>) {}

    fn record_follows_from(&self, _: &span::Id, _: &span::Id) {}

    fn event(&self, _: &tracing::Event<'_>) {
        if let Some(top) = self.stack.lock().unwrap().last() {
            if self.is_session(*top) {
                let _ = self.stats.events_inside.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn enter(&self, id: &span::Id) {
        self.stack.lock().unwrap().push(id.into_u64());
        if self.is_session(id.into_u64()) {
            let _ = self.stats.enters.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn exit(&self, id: &span::Id) {
        let mut stack = self.stack.lock().unwrap();
        if let Some(pos) = stack.iter().rposition(|v| *v == id.into_u64()) {
            let _ = stack.remove(pos);
        }
        if self.is_session(id.into_u64()) {
            let _ = self.stats.exits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[tokio::test]
async fn session_span_is_entered_per_poll() {
    let stats = Arc::new(SpanStats::default());
    let _dispatch = tracing::subscriber::set_default(SpanRecorder::new(Arc::clone(&stats)));

    let (addr, _shutdown) = start_service().await;

    // A connection that sends nothing parks the session on its first read,
    // then wakes it by closing. The session span must be re-entered for the
    // second poll rather than held open across the await.
    let stream = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        stats.events_inside.load(Ordering::Relaxed) >= 1,
        "session events must be attributed to the session span"
    );
    let enters = stats.enters.load(Ordering::Relaxed);
    let exits = stats.exits.load(Ordering::Relaxed);
    assert_eq!(enters, exits, "span enters and exits must balance");
    assert!(
        enters >= 2,
        "span must be entered once per poll, got {enters} enters"
    );
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (addr, shutdown) = start_service().await;
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Either the connection is refused outright or the session never gets
    // an answer.
    if let Ok(stream) = TcpStream::connect(addr).await {
        let mut control = Control::new(stream);
        let outcome =
            tokio::time::timeout(Duration::from_millis(300), control.list_processes()).await;
        assert!(!matches!(outcome, Ok(Ok(_))));
    }
}
