// Transport adapter module
//
// Dialogs talk to the network through a `TransportSession` opened per Call-ID.
// The UDP adapter shares a small pool of sockets between all sessions: sends
// go out round-robin, and one receive loop per socket parses inbound
// datagrams and routes them to the owning session by Call-ID.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SipFlowError;
use crate::sip::message::SipMessage;
use crate::sip::parser::parse_sip_message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport session closed")]
    Closed,
    #[error("Call-ID {0} already has an open session")]
    DuplicateCallId(String),
}

/// Outcome of waiting for an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RecvResult {
    Message(SipMessage),
    TimedOut,
}

/// Factory for per-dialog sessions.
pub trait Transport: Send + Sync {
    fn open(&self, call_id: &str) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Address advertised in templates as `[local_ip]:[local_port]`.
    fn local_addr(&self) -> SocketAddr;
}

/// One dialog's view of the transport.
pub trait TransportSession: Send {
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
        destination: SocketAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>>;

    fn recv(
        &mut self,
        timeout: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RecvResult, TransportError>> + Send + '_>>;

    /// Stop receiving; later sends and receives fail with `Closed`.
    fn close(&mut self);
}

struct UdpInner {
    sockets: Vec<Arc<UdpSocket>>,
    send_idx: AtomicUsize,
    routes: DashMap<String, mpsc::UnboundedSender<SipMessage>>,
    unrouted: AtomicU64,
    parse_errors: AtomicU64,
}

/// UDP adapter. Cloning shares the same sockets and routing table.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

impl UdpTransport {
    /// Bind `count` UDP sockets starting from `base_port`.
    /// If `base_port` is 0, the OS assigns ephemeral ports for each socket.
    /// If `base_port` is non-zero, sockets bind to sequential ports
    /// (base_port, base_port+1, ...).
    pub async fn bind(base_addr: IpAddr, base_port: u16, count: u16) -> Result<Self, SipFlowError> {
        if count == 0 {
            return Err(SipFlowError::ConfigError(
                "socket count must be at least 1".to_string(),
            ));
        }

        let mut sockets = Vec::with_capacity(count as usize);
        for i in 0..count {
            let port = if base_port == 0 { 0 } else { base_port.saturating_add(i) };
            let addr = SocketAddr::new(base_addr, port);
            let socket = UdpSocket::bind(addr).await?;
            sockets.push(Arc::new(socket));
        }

        Ok(Self {
            inner: Arc::new(UdpInner {
                sockets,
                send_idx: AtomicUsize::new(0),
                routes: DashMap::new(),
                unrouted: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
            }),
        })
    }

    /// Send data via round-robin socket selection.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        self.inner.send_to(data, addr).await
    }

    /// Returns the local address of the specified socket.
    pub fn socket_addr(&self, socket_idx: usize) -> Option<SocketAddr> {
        self.inner
            .sockets
            .get(socket_idx)
            .and_then(|s| s.local_addr().ok())
    }

    pub fn socket_count(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Sessions currently registered in the routing table.
    pub fn open_sessions(&self) -> usize {
        self.inner.routes.len()
    }

    /// Inbound messages whose Call-ID matched no open session.
    pub fn unrouted_count(&self) -> u64 {
        self.inner.unrouted.load(Ordering::Relaxed)
    }

    pub fn parse_error_count(&self) -> u64 {
        self.inner.parse_errors.load(Ordering::Relaxed)
    }

    /// Parse one datagram and hand it to the session owning its Call-ID.
    /// Returns whether it was delivered.
    pub fn dispatch(&self, data: &[u8], from: SocketAddr) -> bool {
        self.inner.dispatch(data, from)
    }

    /// Spawn one receive loop per socket; loops exit once `shutdown` is cancelled.
    pub fn spawn_receivers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.inner.sockets.len())
            .map(|idx| {
                let inner = Arc::clone(&self.inner);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            result = inner.recv_from(idx) => {
                                match result {
                                    Ok((data, from)) => {
                                        inner.dispatch(&data, from);
                                    }
                                    Err(e) => {
                                        tracing::warn!(socket = idx, error = %e, "receive loop stopped");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

impl UdpInner {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        let idx = self.send_idx.fetch_add(1, Ordering::Relaxed) % self.sockets.len();
        self.sockets[idx].send_to(data, addr).await?;
        Ok(())
    }

    async fn recv_from(&self, socket_idx: usize) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        // Stack-allocated buffer to avoid heap allocation per recv
        let mut buf = [0u8; 65535];
        let (len, from) = self.sockets[socket_idx].recv_from(&mut buf).await?;
        Ok((buf[..len].to_vec(), from))
    }

    fn dispatch(&self, data: &[u8], from: SocketAddr) -> bool {
        let msg = match parse_sip_message(data) {
            Ok(msg) => msg,
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%from, error = %e, "dropping unparsable datagram");
                return false;
            }
        };
        let Some(call_id) = msg.call_id().map(str::to_owned) else {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%from, "dropping message without Call-ID");
            return false;
        };

        let delivered = match self.routes.get(&call_id) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        };
        if !delivered {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%from, call_id = %call_id, "no session for Call-ID");
        }
        delivered
    }
}

impl Transport for UdpTransport {
    fn open(&self, call_id: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.routes.entry(call_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::DuplicateCallId(call_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
            }
        }
        Ok(Box::new(UdpSession {
            call_id: call_id.to_string(),
            inner: Arc::clone(&self.inner),
            rx,
            closed: false,
        }))
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket_addr(0)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

/// Session handle; dropping it unregisters the Call-ID.
pub struct UdpSession {
    call_id: String,
    inner: Arc<UdpInner>,
    rx: mpsc::UnboundedReceiver<SipMessage>,
    closed: bool,
}

impl TransportSession for UdpSession {
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
        destination: SocketAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.inner.send_to(data, destination).await
        })
    }

    fn recv(
        &mut self,
        timeout: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RecvResult, TransportError>> + Send + '_>>
    {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::Closed);
            }
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Some(msg)) => Ok(RecvResult::Message(msg)),
                Ok(None) => Err(TransportError::Closed),
                Err(_) => Ok(RecvResult::TimedOut),
            }
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.routes.remove(&self.call_id);
            self.rx.close();
        }
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn bind_local(count: u16) -> UdpTransport {
        UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, count)
            .await
            .expect("bind")
    }

    fn ok_for(call_id: &str) -> Vec<u8> {
        format!("SIP/2.0 200 OK\r\nCall-ID: {}\r\nCSeq: 1 INVITE\r\n\r\n", call_id).into_bytes()
    }

    // --- Unit tests: bind ---

    #[tokio::test]
    async fn bind_multiple_sockets() {
        let transport = bind_local(3).await;
        assert_eq!(transport.socket_count(), 3);
    }

    #[tokio::test]
    async fn bind_zero_count_returns_error() {
        let result = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0).await;
        assert!(matches!(result, Err(SipFlowError::ConfigError(_))));
    }

    #[tokio::test]
    async fn bind_with_specific_port() {
        let tmp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = tmp.local_addr().unwrap().port();
        drop(tmp);

        let transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1)
            .await
            .expect("bind to specific port");
        assert_eq!(transport.local_addr().port(), port);
    }

    // --- Unit tests: send ---

    #[tokio::test]
    async fn send_to_round_robin_wraps_around() {
        let transport = bind_local(2).await;
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recv_addr = receiver.local_addr().unwrap();

        let sock0_addr = transport.socket_addr(0).unwrap();
        let sock1_addr = transport.socket_addr(1).unwrap();

        let mut buf = vec![0u8; 1500];
        for i in 0..4u8 {
            transport.send_to(&[i], recv_addr).await.expect("send");
            let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 1);
            let expected_addr = if i % 2 == 0 { sock0_addr } else { sock1_addr };
            assert_eq!(from, expected_addr, "message {} should use socket {}", i, i % 2);
        }
    }

    // --- Unit tests: sessions and routing ---

    #[tokio::test]
    async fn open_registers_and_drop_unregisters() {
        let transport = bind_local(1).await;
        let session = transport.open("call-a").unwrap();
        assert_eq!(transport.open_sessions(), 1);
        drop(session);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn open_duplicate_call_id_is_rejected() {
        let transport = bind_local(1).await;
        let _first = transport.open("dup").unwrap();
        let second = transport.open("dup");
        assert!(matches!(second, Err(TransportError::DuplicateCallId(_))));
    }

    #[tokio::test]
    async fn dispatch_routes_by_call_id() {
        let transport = bind_local(1).await;
        let from: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let mut a = transport.open("call-a").unwrap();
        let mut b = transport.open("call-b").unwrap();

        assert!(transport.dispatch(&ok_for("call-b"), from));
        assert!(transport.dispatch(&ok_for("call-a"), from));

        match a.recv(Duration::from_millis(100)).await.unwrap() {
            RecvResult::Message(msg) => assert_eq!(msg.call_id(), Some("call-a")),
            RecvResult::TimedOut => panic!("call-a should have a message"),
        }
        match b.recv(Duration::from_millis(100)).await.unwrap() {
            RecvResult::Message(msg) => assert_eq!(msg.call_id(), Some("call-b")),
            RecvResult::TimedOut => panic!("call-b should have a message"),
        }
    }

    #[tokio::test]
    async fn dispatch_counts_unrouted_and_garbage() {
        let transport = bind_local(1).await;
        let from: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        assert!(!transport.dispatch(&ok_for("nobody"), from));
        assert!(!transport.dispatch(b"\x00\x01garbage", from));
        assert_eq!(transport.unrouted_count(), 1);
        assert_eq!(transport.parse_error_count(), 1);
    }

    #[tokio::test]
    async fn recv_times_out_without_traffic() {
        let transport = bind_local(1).await;
        let mut session = transport.open("quiet").unwrap();
        let result = session.recv(Duration::from_millis(30)).await.unwrap();
        assert_eq!(result, RecvResult::TimedOut);
    }

    #[tokio::test]
    async fn closed_session_rejects_io() {
        let transport = bind_local(1).await;
        let mut session = transport.open("closing").unwrap();
        session.close();
        assert_eq!(transport.open_sessions(), 0);
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(session.send(b"x", dest).await, Err(TransportError::Closed)));
        assert!(matches!(
            session.recv(Duration::from_millis(10)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn receive_loop_delivers_datagrams_to_sessions() {
        let transport = bind_local(2).await;
        let shutdown = CancellationToken::new();
        let handles = transport.spawn_receivers(shutdown.clone());

        let mut session = transport.open("loop-call").unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&ok_for("loop-call"), transport.socket_addr(1).unwrap())
            .await
            .unwrap();

        match session.recv(Duration::from_secs(1)).await.unwrap() {
            RecvResult::Message(msg) => assert_eq!(msg.summary(), "200 OK"),
            RecvResult::TimedOut => panic!("datagram was not routed"),
        }

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("receive loop should stop on shutdown")
                .unwrap();
        }
    }
}
