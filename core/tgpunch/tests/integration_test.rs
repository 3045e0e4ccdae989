//! Integration test for both role drivers
//!
//! Runs an initiator and a responder over loopback against an in-process
//! binding server and an in-memory long-poll hub.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ring::rand::SystemRandom;

use tgpunch::hub::{Channel, ChannelEntry, ChannelError};
use tgpunch::p2p::discovery::{DiscoveryError, RetryPolicy};
use tgpunch::p2p::hole_punch::PunchPolicy;
use tgpunch::p2p::signaling::HubMessage;
use tgpunch::p2p::stun::{decode_binding_request, encode_binding_response};
use tgpunch::roles::{Initiator, Responder, RoleError, Settings};

const SCOPE: i64 = -1009876543210;

// ============================================================================
// Binding server
// ============================================================================

/// Answers binding requests with the observed source address
struct BindingServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BindingServer {
    fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let addr = socket.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 512];
            while !running.load(Ordering::Relaxed) {
                let Ok((len, from)) = socket.recv_from(&mut buf) else {
                    continue;
                };
                if let Ok(txn) = decode_binding_request(&buf[..len]) {
                    let _ = socket.send_to(&encode_binding_response(&txn, from), from);
                }
            }
        });

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for BindingServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// In-memory hub
// ============================================================================

struct MemoryHub {
    entries: Mutex<Vec<ChannelEntry>>,
    posted: Condvar,
    healthy: bool,
}

impl MemoryHub {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            posted: Condvar::new(),
            healthy: true,
        }
    }

    fn broken() -> Self {
        Self {
            healthy: false,
            ..Self::new()
        }
    }

    fn texts(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.text.clone())
            .collect()
    }
}

impl Channel for MemoryHub {
    fn self_test(&self) -> Result<String, ChannelError> {
        if self.healthy {
            Ok("memory-hub".into())
        } else {
            Err(ChannelError::Api("Unauthorized".into()))
        }
    }

    fn tail(&self) -> Result<i64, ChannelError> {
        Ok(self.entries.lock().unwrap().last().map_or(0, |e| e.id))
    }

    fn publish(&self, scope: i64, text: &str) -> Result<i64, ChannelError> {
        let mut entries = self.entries.lock().unwrap();
        let id = entries.last().map_or(1, |e| e.id + 1);
        entries.push(ChannelEntry::post(id, scope, text));
        self.posted.notify_all();
        Ok(id)
    }

    fn poll(&self, since: i64, long_poll: Duration) -> Result<Vec<ChannelEntry>, ChannelError> {
        let deadline = Instant::now() + long_poll;
        let mut entries = self.entries.lock().unwrap();
        loop {
            let fresh: Vec<_> = entries.iter().filter(|e| e.id > since).cloned().collect();
            if !fresh.is_empty() {
                return Ok(fresh);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            entries = self.posted.wait_timeout(entries, remaining).unwrap().0;
        }
    }
}

fn settings(stun_server: SocketAddr) -> Settings {
    Settings {
        bind: "127.0.0.1:0".parse().unwrap(),
        retry: RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 4,
        },
        punch: PunchPolicy {
            probes: 5,
            spacing: Duration::from_millis(20),
        },
        long_poll: Duration::from_millis(200),
        ..Settings::new(SCOPE, stun_server)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_end_to_end_handshake_and_punch() {
    let server = BindingServer::start();
    let hub = MemoryHub::new();

    // History the responder must not act on
    let stale = HubMessage::request(1, "192.0.2.1:4000".parse().unwrap());
    hub.publish(SCOPE, &stale.encode().unwrap()).unwrap();

    let mut responder = Responder::new(&hub, SystemRandom::new(), settings(server.addr));
    responder.prepare().unwrap();

    let initiator = Initiator::new(&hub, SystemRandom::new(), settings(server.addr))
        .with_wait(Some(Duration::from_secs(10)));

    let (initiator_link, responder_links) = thread::scope(|s| {
        let responder_thread = s.spawn(move || {
            let give_up = Instant::now() + Duration::from_secs(10);
            loop {
                let links = responder.serve_once().unwrap();
                if !links.is_empty() || Instant::now() > give_up {
                    return links;
                }
            }
        });
        let initiator_link = initiator.run().unwrap();
        (initiator_link, responder_thread.join().unwrap())
    });

    assert_eq!(responder_links.len(), 1);
    let responder_link = responder_links[0];

    assert_eq!(responder_link.serial, initiator_link.serial);
    assert_eq!(initiator_link.remote_endpoint, responder_link.local_endpoint);
    assert_eq!(responder_link.remote_endpoint, initiator_link.local_endpoint);
    assert_eq!(initiator_link.local_endpoint.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());

    assert_eq!(initiator_link.punch.probes_sent, 5);
    assert_eq!(responder_link.punch.probes_sent, 5);
    // Responder probes were queued on the initiator socket before it started punching
    assert!(initiator_link.punch.peer_heard());

    let texts = hub.texts();
    assert_eq!(texts.len(), 3);
    assert!(texts[1].contains("start_punching_request"));
    assert!(texts[2].contains("start_punching_response"));
}

#[test]
fn test_initiator_gives_up_without_responder() {
    let server = BindingServer::start();
    let hub = MemoryHub::new();

    let initiator = Initiator::new(&hub, SystemRandom::new(), settings(server.addr))
        .with_wait(Some(Duration::from_millis(300)));

    let result = initiator.run();

    assert!(matches!(result, Err(RoleError::ResponseTimeout { .. })));
    // The request still went out
    assert_eq!(hub.texts().len(), 1);
}

#[test]
fn test_silent_stun_server() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let hub = MemoryHub::new();
    let mut settings = settings(silent.local_addr().unwrap());
    settings.retry = RetryPolicy {
        timeout: Duration::from_millis(50),
        max_retries: 1,
    };

    let result = Initiator::new(&hub, SystemRandom::new(), settings).run();

    match result {
        Err(RoleError::Discovery(DiscoveryError::NoResponse(1))) => {}
        other => panic!("unexpected {:?}", other),
    }
    // Nothing published without an endpoint
    assert!(hub.texts().is_empty());
}

#[test]
fn test_responder_self_test_failure() {
    let hub = MemoryHub::broken();
    let mut responder = Responder::new(&hub, SystemRandom::new(), settings("127.0.0.1:9".parse().unwrap()));

    assert!(matches!(responder.prepare(), Err(RoleError::SelfTest(_))));
}

#[test]
fn test_responder_stops_on_shutdown() {
    let hub = MemoryHub::new();
    let mut responder = Responder::new(&hub, SystemRandom::new(), settings("127.0.0.1:9".parse().unwrap()));
    let shutdown = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            shutdown.store(true, Ordering::Relaxed);
        });
        responder.run(&shutdown).unwrap();
    });
}

#[test]
fn test_responder_run_keeps_prepared_cursor() {
    let server = BindingServer::start();
    let hub = MemoryHub::new();
    let requester = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut responder = Responder::new(&hub, SystemRandom::new(), settings(server.addr));
    responder.prepare().unwrap();

    // Posted after prepare() but before run(); must still be served
    let request = HubMessage::request(77, requester.local_addr().unwrap());
    hub.publish(SCOPE, &request.encode().unwrap()).unwrap();

    let shutdown = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(500));
            shutdown.store(true, Ordering::Relaxed);
        });
        responder.run(&shutdown).unwrap();
    });

    let texts = hub.texts();
    assert_eq!(texts.len(), 2);
    let response = HubMessage::decode(&texts[1]).unwrap();
    assert_eq!(response.serial, 77);
}
