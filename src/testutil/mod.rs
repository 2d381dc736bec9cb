use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::sip::message::SipMessage;
use crate::sip::parser::parse_sip_message;
use crate::transport::{RecvResult, Transport, TransportError, TransportSession};

type Responder = dyn Fn(&SipMessage) -> Vec<Vec<u8>> + Send + Sync;

struct Shared {
    responder: Box<Responder>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail_next: AtomicU32,
    fail_all: AtomicBool,
    reply_delay_ms: AtomicU64,
    open: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
}

/// In-memory transport for tests.
/// - records every sent message with its Call-ID
/// - answers each sent request through a responder closure
/// - optional failure injection and reply delay
/// - tracks open and peak session counts
#[derive(Clone)]
pub struct ScriptedTransport {
    local: SocketAddr,
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new(responder: impl Fn(&SipMessage) -> Vec<Vec<u8>> + Send + Sync + 'static) -> Self {
        Self {
            local: SocketAddr::from(([127, 0, 0, 1], 5060)),
            shared: Arc::new(Shared {
                responder: Box::new(responder),
                sent: Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
                fail_all: AtomicBool::new(false),
                reply_delay_ms: AtomicU64::new(0),
                open: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Never answers anything.
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Answers like a minimal UAS: INVITE gets 100/180/200, ACK nothing,
    /// any other request a 200.
    pub fn uas() -> Self {
        Self::new(|msg| match msg {
            SipMessage::Request(req) => match req.method.as_str() {
                "INVITE" => vec![
                    response_for(msg, 100, "Trying"),
                    response_for(msg, 180, "Ringing"),
                    response_for(msg, 200, "OK"),
                ],
                "ACK" => Vec::new(),
                _ => vec![response_for(msg, 200, "OK")],
            },
            SipMessage::Response(_) => Vec::new(),
        })
    }

    /// Fail the next `n` sends across all sessions.
    pub fn fail_next_sends(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.shared.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Deliver every reply `delay` after the request that triggered it.
    pub fn delay_replies(&self, delay: Duration) {
        self.shared
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successfully sent messages.
    pub fn sent_count(&self) -> usize {
        self.sent_lock().len()
    }

    /// Sent messages parsed back, with the Call-ID of the session that sent them.
    pub fn sent_messages(&self) -> Vec<(String, SipMessage)> {
        self.sent_lock()
            .iter()
            .filter_map(|(call_id, data)| {
                parse_sip_message(data).ok().map(|msg| (call_id.clone(), msg))
            })
            .collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn peak_sessions(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    fn sent_lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Vec<u8>)>> {
        self.shared.sent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, call_id: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        let now = self.shared.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak.fetch_max(now, Ordering::SeqCst);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            call_id: call_id.to_string(),
            shared: Arc::clone(&self.shared),
            inbox: VecDeque::new(),
            closed: false,
        }))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

struct ScriptedSession {
    call_id: String,
    shared: Arc<Shared>,
    inbox: VecDeque<(Instant, SipMessage)>,
    closed: bool,
}

impl ScriptedSession {
    fn take_failure(&self) -> bool {
        if self.shared.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TransportSession for ScriptedSession {
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
        _destination: SocketAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::Closed);
            }
            if self.take_failure() {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "scripted failure",
                )));
            }
            self.shared
                .sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((self.call_id.clone(), data.to_vec()));
            let ready_at = Instant::now()
                + Duration::from_millis(self.shared.reply_delay_ms.load(Ordering::SeqCst));
            if let Ok(msg) = parse_sip_message(data) {
                for reply in (self.shared.responder)(&msg) {
                    if let Ok(parsed) = parse_sip_message(&reply) {
                        self.inbox.push_back((ready_at, parsed));
                    }
                }
            }
            Ok(())
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
            let wait = match self.inbox.front() {
                Some((ready_at, _)) => ready_at.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if wait > timeout {
                tokio::time::sleep(timeout).await;
                return Ok(RecvResult::TimedOut);
            }
            tokio::time::sleep(wait).await;
            match self.inbox.pop_front() {
                Some((_, msg)) => Ok(RecvResult::Message(msg)),
                None => Ok(RecvResult::TimedOut),
            }
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build a response to `request` that echoes its dialog headers.
pub fn response_for(request: &SipMessage, code: u16, reason: &str) -> Vec<u8> {
    let headers = request.headers();
    let mut out = format!("SIP/2.0 {} {}\r\n", code, reason);
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        for value in headers.get_all(name) {
            if name == "To" && code > 100 && !value.contains("tag=") {
                out.push_str(&format!("To: {};tag=uas1\r\n", value));
            } else {
                out.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
    }
    out.push_str("Content-Length: 0\r\n\r\n");
    out.into_bytes()
}

/// A request as a remote UAS would send it, e.g. a BYE.
pub fn request_bytes(method: &str, call_id: &str) -> Vec<u8> {
    format!(
        "{m} sip:runner@127.0.0.1 SIP/2.0\r\nCall-ID: {c}\r\nCSeq: 1 {m}\r\nContent-Length: 0\r\n\r\n",
        m = method,
        c = call_id
    )
    .into_bytes()
}
