mod harness;

use harness::{Q0, external, small_port, started_port};
use mvirt_nicio::config::PortConfig;
use mvirt_nicio::ids::PayloadToken;
use mvirt_nicio::packet::{Fragment, TxPacket};
use mvirt_nicio::port::{DropReason, Submit};
use mvirt_nicio::ring::tx::TxFlags;
use mvirt_nicio::test_util::packets::ipv4_frame;

fn tokens(ids: &[u64]) -> Vec<PayloadToken> {
    ids.iter().copied().map(PayloadToken).collect()
}

#[test]
fn test_payloads_released_in_submission_order() {
    let t = started_port(small_port(64, 18), 512);

    // 1 + 2 + 3 + 1 + 2 descriptors
    for (token, frags) in [(1, 1), (2, 2), (3, 3), (4, 1), (5, 2)] {
        assert!(t.port.submit(external(token, frags), None).is_queued());
    }
    assert_eq!(t.dev.tx_queued(Q0), 9);

    t.dev.complete_tx(Q0, 2);
    assert_eq!(t.port.poll(64).tx_done, 2);
    assert_eq!(t.stack.released(), tokens(&[1]));

    t.dev.complete_tx(Q0, 3);
    assert_eq!(t.port.poll(64).tx_done, 3);
    assert_eq!(t.stack.released(), tokens(&[1, 2]));

    t.dev.complete_tx(Q0, 4);
    assert_eq!(t.port.poll(64).tx_done, 4);
    assert_eq!(t.stack.released(), tokens(&[1, 2, 3, 4, 5]));
    assert_eq!(t.dev.transmitted(Q0).len(), 9);
    assert_eq!(t.port.stats().txqs[0].live, 0);
}

#[test]
fn test_multi_fragment_packet_released_after_last_descriptor() {
    let t = started_port(small_port(8, 2), 512);

    assert!(t.port.submit(external(7, 3), None).is_queued());
    let written = t.dev.written(Q0);
    assert_eq!(written.len(), 3);
    assert!(written[0].flags.contains(TxFlags::FIRST));
    assert!(!written[1].flags.contains(TxFlags::FIRST));
    assert!(!written[1].flags.contains(TxFlags::LAST));
    assert!(written[2].flags.contains(TxFlags::LAST));

    t.dev.complete_tx(Q0, 2);
    t.port.poll(64);
    assert!(t.stack.released().is_empty());
    assert_eq!(t.port.stats().txqs[0].live, 1);

    t.dev.complete_tx(Q0, 1);
    t.port.poll(64);
    assert_eq!(t.stack.released(), tokens(&[7]));
}

#[test]
fn test_full_queue_stops_once_and_wakes_once() {
    let t = started_port(small_port(8, 2), 512);
    let pool = t.pool();
    let baseline = pool.outstanding();

    for _ in 0..5 {
        assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    }
    assert!(t.stack.stopped().is_empty());

    // Room drops to the margin
    assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    assert_eq!(t.stack.stopped(), vec![Q0]);

    // Still room for one more, without a second stop
    assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    assert_eq!(t.stack.stopped().len(), 1);

    // One slot always stays empty
    assert_eq!(
        t.port.submit(t.packet(0, 100), None),
        Submit::Dropped(DropReason::NoResource)
    );
    assert_eq!(pool.outstanding(), baseline + 7);

    t.dev.complete_tx(Q0, 7);
    t.port.poll(64);
    assert_eq!(t.stack.woken(), vec![Q0]);
    assert_eq!(pool.outstanding(), baseline);

    let stats = t.port.stats();
    assert_eq!(stats.counters.queue_stops, 1);
    assert_eq!(stats.counters.queue_wakes, 1);
    assert_eq!(stats.txqs[0].no_resource, 1);
    assert!(!stats.txqs[0].stopped);
}

#[test]
fn test_partial_reclaim_below_margin_does_not_wake() {
    let t = started_port(small_port(8, 2), 512);
    for _ in 0..6 {
        assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    }
    assert_eq!(t.stack.stopped().len(), 1);

    // Nothing sent yet, still stopped
    t.dev.complete_tx(Q0, 0);
    t.port.poll_fallback(64);
    assert!(t.stack.woken().is_empty());

    // Room 3 > margin
    t.dev.complete_tx(Q0, 1);
    t.port.poll(64);
    assert_eq!(t.stack.woken(), vec![Q0]);
}

#[test]
fn test_invalid_fragment_drops_whole_packet() {
    let t = started_port(small_port(8, 2), 512);

    let fragments = vec![
        Fragment {
            addr: 0x10_0000,
            len: 256,
        },
        Fragment {
            addr: 0x11_0000,
            len: 0,
        },
    ];
    let packet = TxPacket::external(PayloadToken(3), fragments, ipv4_frame(0, 64));
    assert_eq!(
        t.port.submit(packet, None),
        Submit::Dropped(DropReason::InvalidFragment)
    );

    assert_eq!(t.stack.released(), tokens(&[3]));
    assert!(t.dev.written(Q0).is_empty());
    let stats = t.port.stats();
    assert_eq!(stats.txqs[0].live, 0);
    assert_eq!(stats.txqs[0].invalid, 1);

    // The ring is intact
    assert!(t.port.submit(external(4, 2), None).is_queued());
    assert_eq!(t.dev.written(Q0).len(), 2);
}

#[test]
fn test_too_many_fragments_rejected() {
    let t = started_port(small_port(64, 18), 512);

    assert_eq!(
        t.port.submit(external(9, 19), None),
        Submit::Dropped(DropReason::InvalidPacket)
    );
    assert_eq!(t.stack.released(), tokens(&[9]));
    assert!(t.port.submit(external(10, 18), None).is_queued());
}

#[test]
fn test_inline_reclaim_at_threshold() {
    let config = PortConfig {
        txq_size: 64,
        txdone_threshold: 4,
        ..Default::default()
    };
    let t = started_port(config, 512);
    t.dev.set_auto_complete(true);
    let pool = t.pool();
    let baseline = pool.outstanding();

    for _ in 0..3 {
        assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    }
    assert_eq!(t.port.stats().txqs[0].live, 3);

    assert!(t.port.submit(t.packet(0, 100), None).is_queued());
    let stats = t.port.stats();
    assert_eq!(stats.txqs[0].live, 0);
    assert_eq!(stats.counters.tx_done_inline, 4);
    assert_eq!(pool.outstanding(), baseline);
}

#[test]
fn test_short_frames_padded_unless_disabled() {
    let t = started_port(PortConfig::default(), 512);
    assert!(t.port.submit(t.packet(0, 60), None).is_queued());
    assert!(t.dev.written(Q0)[0].flags.contains(TxFlags::PAD));

    let config = PortConfig {
        no_pad: true,
        ..Default::default()
    };
    let t = started_port(config, 512);
    assert!(t.port.submit(t.packet(0, 60), None).is_queued());
    assert!(!t.dev.written(Q0)[0].flags.contains(TxFlags::PAD));
}
