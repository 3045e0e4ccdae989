//! Reflexive endpoint discovery over STUN
//!
//! Drives one Binding request/response exchange with bounded retries.
//!
//! # Concurrency
//!
//! ```text
//!   caller thread                       receive thread
//!   ─────────────                       ──────────────
//!   send request ──────────────┐
//!   spawn ─────────────────────┼──────► recv loop (server only)
//!   wait(result, timeout) ◄────┼─────── decode ─► result slot
//!     timeout? resend, rearm   │
//!   set stop flag ─────────────┴──────► exits, joined
//! ```
//!
//! The receive thread writes at most once into a single-slot channel; the
//! caller acts on the first outcome and discards nothing else. Retries resend
//! the identical request, so a late answer to any attempt is accepted.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use ring::rand::SecureRandom;
use thiserror::Error;

use super::stun::{decode_binding_response, encode_binding_request, StunError, TransactionId};
use super::transport::{is_timeout, DatagramSocket};

// ============================================================================
// Constants
// ============================================================================

/// Public STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "109.71.104.73:3478";

/// Time to wait for a response before resending
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Resends after the initial request
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Receive buffer size; a response filling it is treated as oversized
pub const RECV_BUFFER_SIZE: usize = 4096;

/// How often the receive thread checks whether it should stop
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Types
// ============================================================================

/// Per-attempt timeout and retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("transport error")]
    Transport(#[from] io::Error),

    #[error("outbound datagram truncated ({sent} of {len} bytes sent)")]
    TruncatedSend { sent: usize, len: usize },

    #[error("unusable response from discovery server")]
    Decode(#[from] StunError),

    #[error("response from discovery server does not fit in {0} bytes")]
    OversizedResponse(usize),

    #[error("no response from discovery server after {0} retries")]
    NoResponse(u32),

    #[error("failed to generate transaction ID")]
    Rng,

    #[error("receive task ended without a result")]
    ReceiverGone,
}

type Outcome = Result<SocketAddr, DiscoveryError>;

// ============================================================================
// Session
// ============================================================================

/// State of one discovery exchange
///
/// Holds the socket exclusively until [`Session::run`] returns.
pub struct Session<'a, S: DatagramSocket> {
    socket: &'a S,
    server: SocketAddr,
    transaction_id: TransactionId,
    policy: RetryPolicy,
    /// Resends performed so far
    retries: u32,
}

impl<'a, S: DatagramSocket> Session<'a, S> {
    /// Prepare an exchange with a fresh random transaction ID
    pub fn new(
        socket: &'a S,
        server: SocketAddr,
        rng: &dyn SecureRandom,
        policy: RetryPolicy,
    ) -> Result<Self, DiscoveryError> {
        let transaction_id = TransactionId::random(rng).map_err(|_| DiscoveryError::Rng)?;
        Ok(Self {
            socket,
            server,
            transaction_id,
            policy,
            retries: 0,
        })
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Run the exchange to completion: exactly one endpoint or one error
    pub fn run(mut self) -> Outcome {
        self.socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let outcome = self.exchange();

        // Hand the socket back in blocking mode
        if let Err(e) = self.socket.set_read_timeout(None) {
            log::warn!("Failed to restore blocking mode on discovery socket: {}", e);
        }

        match &outcome {
            Ok(addr) => log::info!("Discovered public endpoint {} via {}", addr, self.server),
            Err(e) => log::debug!("Discovery via {} failed: {}", self.server, e),
        }
        outcome
    }

    fn exchange(&mut self) -> Outcome {
        let request = encode_binding_request(&self.transaction_id);
        self.send(&request)?;

        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::sync_channel::<Outcome>(1);
        let socket = self.socket;
        let server = self.server;
        let transaction_id = self.transaction_id;

        thread::scope(|scope| {
            let stop = &stop;
            scope.spawn(move || receive_response(socket, server, &transaction_id, stop, tx));

            let mut deadline = Instant::now() + self.policy.timeout;
            let outcome = loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(outcome) => break outcome,
                    Err(RecvTimeoutError::Timeout) => {
                        if self.retries >= self.policy.max_retries {
                            break Err(DiscoveryError::NoResponse(self.retries));
                        }
                        self.retries += 1;
                        log::debug!(
                            "No response from {} within {:?}, retry {}/{}",
                            server,
                            self.policy.timeout,
                            self.retries,
                            self.policy.max_retries
                        );
                        if let Err(e) = self.send(&request) {
                            break Err(e);
                        }
                        deadline = Instant::now() + self.policy.timeout;
                    }
                    Err(RecvTimeoutError::Disconnected) => break Err(DiscoveryError::ReceiverGone),
                }
            };

            stop.store(true, Ordering::Relaxed);
            outcome
        })
    }

    fn send(&self, request: &[u8]) -> Result<(), DiscoveryError> {
        let sent = self.socket.send_to(request, self.server)?;
        if sent != request.len() {
            return Err(DiscoveryError::TruncatedSend {
                sent,
                len: request.len(),
            });
        }
        log::trace!("Sent binding request to {} (retry {})", self.server, self.retries);
        Ok(())
    }
}

/// Receive thread body: wait for a datagram from `server` and decode it
fn receive_response<S: DatagramSocket>(
    socket: &S,
    server: SocketAddr,
    transaction_id: &TransactionId,
    stop: &AtomicBool,
    result: SyncSender<Outcome>,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                let _ = result.send(Err(e.into()));
                return;
            }
        };

        if from != server {
            log::debug!("Ignoring {} bytes from unexpected sender {}", len, from);
            continue;
        }

        let outcome = if len >= buf.len() {
            Err(DiscoveryError::OversizedResponse(RECV_BUFFER_SIZE))
        } else {
            decode_binding_response(&buf[..len], transaction_id).map_err(DiscoveryError::from)
        };
        let _ = result.send(outcome);
        return;
    }
}

/// Learn our public endpoint as seen by `server`
pub fn discover<S: DatagramSocket>(
    socket: &S,
    server: SocketAddr,
    rng: &dyn SecureRandom,
    policy: RetryPolicy,
) -> Outcome {
    Session::new(socket, server, rng, policy)?.run()
}

/// Resolve a `host:port` discovery server address once, at startup
pub fn resolve_server(server: &str) -> io::Result<SocketAddr> {
    server.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for discovery server '{}'", server),
        )
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::stun::{decode_binding_request, encode_binding_response};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    type Reply = (Duration, Vec<u8>, SocketAddr);
    type Script = Box<dyn Fn(usize, &[u8]) -> Vec<Reply> + Send + Sync>;

    /// Socket whose inbound traffic is produced by a script reacting to sends
    struct ScriptedSocket {
        sends: AtomicUsize,
        read_timeout: Mutex<Option<Duration>>,
        inbox: Mutex<VecDeque<(Instant, Vec<u8>, SocketAddr)>>,
        script: Script,
    }

    impl ScriptedSocket {
        fn new(script: impl Fn(usize, &[u8]) -> Vec<Reply> + Send + Sync + 'static) -> Self {
            Self {
                sends: AtomicUsize::new(0),
                read_timeout: Mutex::new(None),
                inbox: Mutex::new(VecDeque::new()),
                script: Box::new(script),
            }
        }

        fn silent() -> Self {
            Self::new(|_, _| Vec::new())
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    impl DatagramSocket for ScriptedSocket {
        fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            let now = Instant::now();
            let mut inbox = self.inbox.lock().unwrap();
            for (delay, data, from) in (self.script)(n, buf) {
                inbox.push_back((now + delay, data, from));
            }
            Ok(buf.len())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let timeout = self.read_timeout.lock().unwrap().unwrap_or(Duration::from_millis(10));
            let give_up = Instant::now() + timeout;
            loop {
                {
                    let mut inbox = self.inbox.lock().unwrap();
                    let now = Instant::now();
                    if let Some(pos) = inbox.iter().position(|(at, _, _)| *at <= now) {
                        let (_, data, from) = inbox.remove(pos).unwrap();
                        buf[..data.len()].copy_from_slice(&data);
                        return Ok((data.len(), from));
                    }
                }
                if Instant::now() >= give_up {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                thread::sleep(Duration::from_millis(2));
            }
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            *self.read_timeout.lock().unwrap() = timeout;
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("10.0.0.2:40000".parse().unwrap())
        }
    }

    fn server() -> SocketAddr {
        "198.51.100.1:3478".parse().unwrap()
    }

    fn public() -> SocketAddr {
        "203.0.113.7:61000".parse().unwrap()
    }

    /// Valid answer to the request just sent
    fn answer(request: &[u8]) -> Vec<u8> {
        let txn = decode_binding_request(request).unwrap();
        encode_binding_response(&txn, public())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 4,
        }
    }

    #[test]
    fn test_immediate_response() {
        let socket = ScriptedSocket::new(|_, req| vec![(Duration::ZERO, answer(req), server())]);
        let rng = ring::rand::SystemRandom::new();

        let addr = discover(&socket, server(), &rng, RetryPolicy::default()).unwrap();

        assert_eq!(addr, public());
        assert_eq!(socket.sends(), 1);
        assert_eq!(*socket.read_timeout.lock().unwrap(), None);
    }

    #[test]
    fn test_no_response_after_exact_retry_budget() {
        let socket = ScriptedSocket::silent();
        let rng = ring::rand::SystemRandom::new();
        let policy = RetryPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 4,
        };

        let start = Instant::now();
        let result = discover(&socket, server(), &rng, policy);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(DiscoveryError::NoResponse(4))));
        // 1 initial + 4 retries
        assert_eq!(socket.sends(), 5);
        assert!(elapsed >= Duration::from_millis(4900), "gave up early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "gave up late: {:?}", elapsed);
    }

    #[test]
    fn test_no_response_message() {
        let err = DiscoveryError::NoResponse(4);
        assert_eq!(err.to_string(), "no response from discovery server after 4 retries");
    }

    #[test]
    fn test_response_after_retries() {
        let socket = ScriptedSocket::new(|n, req| {
            if n == 3 {
                vec![(Duration::ZERO, answer(req), server())]
            } else {
                Vec::new()
            }
        });
        let rng = ring::rand::SystemRandom::new();

        let addr = discover(&socket, server(), &rng, fast_policy()).unwrap();

        assert_eq!(addr, public());
        assert_eq!(socket.sends(), 3);
    }

    #[test]
    fn test_retries_reuse_transaction_id() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let socket = ScriptedSocket::new(move |_, req| {
            recorder.lock().unwrap().push(req.to_vec());
            Vec::new()
        });
        let rng = ring::rand::SystemRandom::new();
        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            max_retries: 2,
        };

        assert!(discover(&socket, server(), &rng, policy).is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|req| req == &seen[0]));
    }

    #[test]
    fn test_late_answer_to_first_attempt_accepted() {
        // Answer to attempt 1 shows up after attempt 2 went out
        let socket = ScriptedSocket::new(|n, req| {
            if n == 1 {
                vec![(Duration::from_millis(150), answer(req), server())]
            } else {
                Vec::new()
            }
        });
        let rng = ring::rand::SystemRandom::new();

        let addr = discover(&socket, server(), &rng, fast_policy()).unwrap();

        assert_eq!(addr, public());
        assert_eq!(socket.sends(), 2);
    }

    #[test]
    fn test_foreign_datagrams_ignored() {
        let stranger: SocketAddr = "192.0.2.99:3478".parse().unwrap();
        let socket = ScriptedSocket::new(move |_, req| {
            vec![
                (Duration::ZERO, b"garbage".to_vec(), stranger),
                (Duration::from_millis(5), answer(req), server()),
            ]
        });
        let rng = ring::rand::SystemRandom::new();

        assert_eq!(discover(&socket, server(), &rng, fast_policy()).unwrap(), public());
    }

    #[test]
    fn test_malformed_response_is_fatal() {
        let socket = ScriptedSocket::new(|_, _| vec![(Duration::ZERO, vec![0u8; 8], server())]);
        let rng = ring::rand::SystemRandom::new();

        let result = discover(&socket, server(), &rng, fast_policy());

        assert!(matches!(result, Err(DiscoveryError::Decode(StunError::Truncated(8)))));
        assert_eq!(socket.sends(), 1);
    }

    #[test]
    fn test_wrong_transaction_is_fatal() {
        let socket = ScriptedSocket::new(|_, _| {
            let other = TransactionId::from_bytes([7u8; 12]);
            vec![(Duration::ZERO, encode_binding_response(&other, public()), server())]
        });
        let rng = ring::rand::SystemRandom::new();

        let result = discover(&socket, server(), &rng, fast_policy());

        assert!(matches!(result, Err(DiscoveryError::Decode(StunError::TransactionMismatch))));
    }

    #[test]
    fn test_resolve_server_literal() {
        assert_eq!(resolve_server("109.71.104.73:3478").unwrap(), "109.71.104.73:3478".parse().unwrap());
        assert!(resolve_server("not an address").is_err());
    }
}
