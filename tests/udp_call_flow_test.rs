use sip_flow_runner::data_source::DataSource;
use sip_flow_runner::dialog::DialogContext;
use sip_flow_runner::scenario;
use sip_flow_runner::scheduler::{CallScheduler, SchedulerOptions};
use sip_flow_runner::sip::message::SipMessage;
use sip_flow_runner::sip::parser::parse_sip_message;
use sip_flow_runner::stats::{EndReason, StatsAggregator};
use sip_flow_runner::testutil::response_for;
use sip_flow_runner::transport::{Transport, UdpTransport};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const UAC_FLOW: &str = r#"{"name": "uac", "steps": [
    {"send": {"template": "INVITE sip:[field0]@[remote_ip]:[remote_port] SIP/2.0\nVia: SIP/2.0/[transport] [local_ip]:[local_port];branch=[branch]\nFrom: <sip:runner@[local_ip]>;tag=[call_number]\nTo: <sip:[field0]@[remote_ip]>\nCall-ID: [call_id]\nCSeq: [cseq] INVITE\nContent-Type: application/sdp\nContent-Length: [len]\n\nv=0\nc=IN IP4 [media_ip]\nm=audio [media_port] RTP/AVP 0\n"}},
    {"expect_recv": {"match": {"response": {"status": [100]}}, "timeout_ms": 2000, "optional": true}},
    {"expect_recv": {"match": {"response": {"status": [180, 183]}}, "timeout_ms": 2000, "optional": true}},
    {"expect_recv": {"match": {"response": {"status": [200]}}, "timeout_ms": 2000}},
    {"send": {"template": "ACK sip:[field0]@[remote_ip]:[remote_port] SIP/2.0\nVia: SIP/2.0/[transport] [local_ip]:[local_port];branch=[branch]\n[last_From:]\n[last_To:]\nCall-ID: [call_id]\nCSeq: [cseq] ACK\nContent-Length: 0\n"}},
    {"pause": {"duration_ms": 20}},
    {"send": {"template": "BYE sip:[field0]@[remote_ip]:[remote_port] SIP/2.0\nVia: SIP/2.0/[transport] [local_ip]:[local_port];branch=[branch]\n[last_From:]\n[last_To:]\nCall-ID: [call_id]\nCSeq: [cseq] BYE\nContent-Length: 0\n"}},
    {"expect_recv": {"match": {"response": {"status": [200]}}, "timeout_ms": 2000}}
]}"#;

/// Minimal UAS on a plain socket. Answers INVITE with 100, 180 and
/// `final_code`; any other request but ACK with 200.
async fn run_uas(socket: UdpSocket, final_code: u16, stop: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 65535];
    while !stop.load(Ordering::Relaxed) {
        let (n, from) = match tokio::time::timeout(Duration::from_millis(50), socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(_)) => break,
            Err(_) => continue,
        };
        let msg = match parse_sip_message(&buf[..n]) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        let replies = match &msg {
            SipMessage::Request(req) => match req.method.as_str() {
                "INVITE" => vec![
                    response_for(&msg, 100, "Trying"),
                    response_for(&msg, 180, "Ringing"),
                    response_for(&msg, final_code, if final_code == 200 { "OK" } else { "Busy Here" }),
                ],
                "ACK" => Vec::new(),
                _ => vec![response_for(&msg, 200, "OK")],
            },
            SipMessage::Response(_) => Vec::new(),
        };
        for reply in replies {
            let _ = socket.send_to(&reply, from).await;
        }
    }
}

struct Harness {
    scheduler: CallScheduler,
    transport: UdpTransport,
    shutdown: CancellationToken,
    uas_stop: Arc<AtomicBool>,
}

async fn harness(final_code: u16) -> Harness {
    let addr: IpAddr = "127.0.0.1".parse().unwrap();

    let uas_socket = UdpSocket::bind(SocketAddr::new(addr, 0)).await.unwrap();
    let uas_addr = uas_socket.local_addr().unwrap();
    let uas_stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(run_uas(uas_socket, final_code, uas_stop.clone()));

    let transport = UdpTransport::bind(addr, 0, 1).await.unwrap();
    let shutdown = CancellationToken::new();
    transport.spawn_receivers(shutdown.clone());
    let local = transport.socket_addr(0).expect("UAC local addr");

    let scheduler = CallScheduler::new(
        Arc::new(transport.clone()) as Arc<dyn Transport>,
        Arc::new(StatsAggregator::new()),
        shutdown.clone(),
        Arc::new(DialogContext::new(uas_addr, local)),
        SchedulerOptions::default(),
    );

    Harness {
        scheduler,
        transport,
        shutdown,
        uas_stop,
    }
}

impl Harness {
    fn stop(&self) {
        self.shutdown.cancel();
        self.uas_stop.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_calls_complete_over_udp_loopback() {
    let h = harness(200).await;
    let model = Arc::new(scenario::parse(UAC_FLOW).unwrap());
    let source = DataSource::from_rows(
        vec![vec!["alice".to_string()], vec!["bob".to_string()], vec!["carol".to_string()]],
        false,
    );

    let summary = h.scheduler.run(model, &source, 20.0, 2, 3).await.unwrap();
    h.stop();

    assert_eq!(summary.end_reason, EndReason::TargetReached);
    assert_eq!(summary.total(), 3);
    assert_eq!(summary.report.completed, 3, "report: {:?}", summary.report);
    assert!(summary.peak_active <= 2);
    assert_eq!(h.transport.open_sessions(), 0);
    assert_eq!(h.transport.parse_error_count(), 0);
}

#[tokio::test]
async fn test_rejected_calls_fail_as_unexpected() {
    let h = harness(486).await;
    let model = Arc::new(scenario::parse(UAC_FLOW).unwrap());
    let source = DataSource::from_rows(vec![vec!["dave".to_string()]], true);

    let summary = h.scheduler.run(model, &source, 20.0, 5, 2).await.unwrap();
    h.stop();

    assert_eq!(summary.total(), 2);
    assert_eq!(summary.report.completed, 0);
    assert_eq!(summary.failures("unexpected"), 2);
}
