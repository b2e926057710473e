mod harness;

use std::sync::{Arc, Mutex};

use harness::{Q0, Q1, started_port};
use mvirt_nicio::config::PortConfig;
use mvirt_nicio::hooks::{Classification, Classifier, Hook, RxIntercept, TxIntercept, TxSpecial};
use mvirt_nicio::ids::PortId;
use mvirt_nicio::packet::{RxFrame, TxPacket, ipv4_tos};
use mvirt_nicio::port::{DropReason, Submit};
use mvirt_nicio::ring::rx::RX_SPECIAL;
use mvirt_nicio::test_util::packets::ipv4_frame;

/// Consumes ToS 0x10 packets and sends ToS 0x20 packets to txq1.
struct TosIntercept;

impl TxIntercept for TosIntercept {
    fn check(&self, _port: PortId, packet: &TxPacket) -> TxSpecial {
        match ipv4_tos(packet.header()) {
            Some(0x10) => TxSpecial::Consume,
            Some(0x20) => TxSpecial::Redirect(Q1),
            _ => TxSpecial::Pass,
        }
    }
}

#[derive(Default)]
struct SpecialSink {
    frames: Mutex<Vec<usize>>,
}

impl RxIntercept for SpecialSink {
    fn receive(&self, _port: PortId, frame: RxFrame) {
        self.frames.lock().unwrap().push(frame.len());
    }
}

/// Drops ToS 0x08, hints everything else to txq1.
struct ToQ1;

impl Classifier for ToQ1 {
    fn classify(&self, header: &[u8]) -> Classification {
        Classification {
            queue_hint: Some(Q1),
            drop: ipv4_tos(header) == Some(0x08),
            ..Default::default()
        }
    }
}

fn two_queues() -> PortConfig {
    PortConfig {
        txq_per_txp: 2,
        ..Default::default()
    }
}

#[test]
fn test_tx_intercept_consumes_and_redirects() {
    let t = started_port(two_queues(), 512);
    t.port.claim_cpu(Q1).unwrap();
    t.port.set_tx_intercept(Hook::Custom(Arc::new(TosIntercept)));
    let pool = t.pool();
    let baseline = pool.outstanding();

    assert_eq!(
        t.port.submit(t.packet(0x10, 100), None),
        Submit::Dropped(DropReason::Intercepted)
    );
    assert_eq!(pool.outstanding(), baseline);

    assert!(t.port.submit(t.packet(0x20, 100), None).is_queued());
    assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    assert_eq!(t.dev.tx_queued(Q1), 1);
    assert_eq!(t.dev.tx_queued(Q0), 1);
    assert_eq!(t.port.stats().counters.tx_intercepted, 1);
}

#[test]
fn test_redirect_to_unowned_queue_dropped() {
    let t = started_port(two_queues(), 512);
    t.port.set_tx_intercept(Hook::Custom(Arc::new(TosIntercept)));

    assert_eq!(
        t.port.submit(t.packet(0x20, 100), None),
        Submit::Dropped(DropReason::QueueNotOwned)
    );
}

#[test]
fn test_classifier_drop_and_hint() {
    let t = started_port(two_queues(), 512);
    t.port.claim_cpu(Q1).unwrap();
    t.port.set_classifier(Hook::Custom(Arc::new(ToQ1)));

    assert_eq!(
        t.port.submit(t.packet(0x08, 100), None),
        Submit::Dropped(DropReason::Classified)
    );
    assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    assert_eq!(t.dev.tx_queued(Q1), 1);
    assert_eq!(t.port.stats().counters.tx_classified_drop, 1);

    t.port.set_classifier(Hook::None);
    assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    assert_eq!(t.dev.tx_queued(Q0), 1);
}

#[test]
fn test_special_frames_go_to_rx_intercept() {
    let t = started_port(PortConfig::default(), 512);

    // Without an intercept special frames reach the stack
    assert!(t.dev.inject_rx_with(0, &ipv4_frame(0, 90), RX_SPECIAL));
    t.port.poll(64);
    assert_eq!(t.stack.frame_count(), 1);

    let sink = Arc::new(SpecialSink::default());
    t.port.set_rx_intercept(Hook::Custom(sink.clone()));
    assert!(t.dev.inject_rx_with(0, &ipv4_frame(0, 90), RX_SPECIAL));
    assert!(t.dev.inject_rx(0, &ipv4_frame(0, 80)));
    t.port.poll(64);

    assert_eq!(*sink.frames.lock().unwrap(), vec![90]);
    assert_eq!(t.stack.frame_count(), 2);
    assert_eq!(t.stack.frames()[1].data.len(), 80);
    assert_eq!(t.port.stats().rxqs[0].special, 1);
}

#[test]
fn test_pause_frames_dropped() {
    use mvirt_nicio::test_util::packets::pause_frame;

    let t = started_port(PortConfig::default(), 512);
    assert!(t.dev.inject_rx(0, &pause_frame()));
    assert!(t.dev.inject_rx(0, &ipv4_frame(0, 100)));
    t.port.poll(64);

    assert_eq!(t.stack.frame_count(), 1);
    let stats = t.port.stats();
    let rxq = &stats.rxqs[0];
    assert_eq!(rxq.pause, 1);
    assert_eq!(rxq.dropped, 1);
    assert_eq!(t.dev.armed(0), 128);
}
