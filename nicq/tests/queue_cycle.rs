//! Full start -> traffic -> stop cycles against the software device model.

use std::sync::Arc;
use std::time::Duration;

use nicq::pool::PacketPool as _;
use nicq::{
    DeviceRegistry, FramePool, QueueConfig, QueueId, QueueState, RxQueue, TxPacket, TxQueue,
};
use nictest::{SimNic, SimRxMeta, udp_frame};

fn pool(frames: u16) -> Arc<FramePool> {
    Arc::new(FramePool::new(frames, 2048, Some(false)).unwrap())
}

fn cfg(depth: u32) -> QueueConfig {
    QueueConfig {
        depth,
        drain_timeout: Duration::from_millis(30),
        ..QueueConfig::default()
    }
}

fn start_rx(sim: &Arc<SimNic>, pool: &Arc<FramePool>, id: u16, cfg: &QueueConfig) -> RxQueue {
    RxQueue::start(
        QueueId(id),
        cfg,
        pool.clone() as Arc<dyn nicq::PacketPool>,
        sim.clone() as Arc<dyn nicq::Doorbell>,
        sim.as_ref(),
    )
    .unwrap()
}

fn start_tx(sim: &Arc<SimNic>, pool: &Arc<FramePool>, id: u16, cfg: &QueueConfig) -> TxQueue {
    TxQueue::start(
        QueueId(id),
        cfg,
        pool.clone() as Arc<dyn nicq::PacketPool>,
        sim.clone() as Arc<dyn nicq::Doorbell>,
        sim.as_ref(),
    )
    .unwrap()
}

#[test]
fn full_cycle_tx_and_rx() {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = Arc::new(SimNic::new());
    sim.set_auto_ack_tx(true);
    let pool = pool(128);

    let mut txq = start_tx(&sim, &pool, 0, &cfg(64));
    let mut rxq = start_rx(&sim, &pool, 0, &cfg(64));

    // Send a real frame out.
    let wire = udp_frame(b"ring engine says hello").unwrap();
    let mut frame = pool.alloc().unwrap();
    frame.bytes_mut()[..wire.len()].copy_from_slice(&wire);
    txq.submit(TxPacket::single(frame, wire.len() as u32)).unwrap();
    assert_eq!(txq.reclaim(), 1);
    assert_eq!(txq.distance_used(), 0);

    // Loop the same bytes back in.
    sim.deliver_frame(QueueId(0), &wire).unwrap();
    let pkts = rxq.poll(8);
    assert_eq!(pkts.len(), 1);
    let pkt = &pkts[0];
    assert_eq!(pkt.pkt_len() as usize, wire.len());
    assert_eq!(&pkt.segs[0].frame.bytes()[..wire.len()], &wire[..]);

    for pkt in pkts {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }

    txq.stop(sim.as_ref()).unwrap();
    rxq.stop(sim.as_ref()).unwrap();
    assert_eq!(txq.state(), QueueState::Stopped);
    assert_eq!(rxq.state(), QueueState::Stopped);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn rx_budget_is_respected_without_double_delivery() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(100);
    let mut rxq = start_rx(&sim, &pool, 1, &cfg(64));

    for i in 0..8u8 {
        sim.deliver_frame(QueueId(1), &[i; 60]).unwrap();
    }

    let db_before = sim.rx_doorbells(QueueId(1));
    let first = rxq.poll(5);
    assert_eq!(first.len(), 5);
    // At most one replenish doorbell per poll call.
    assert!(sim.rx_doorbells(QueueId(1)) <= db_before + 1);

    let second = rxq.poll(5);
    assert_eq!(second.len(), 3);

    for (i, pkt) in first.iter().chain(second.iter()).enumerate() {
        assert_eq!(pkt.segs[0].frame.bytes()[0] as usize, i);
    }
    assert_eq!(rxq.stats().packets, 8);

    for pkt in first.into_iter().chain(second) {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
}

#[test]
fn idle_poll_changes_nothing() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(100);
    let mut rxq = start_rx(&sim, &pool, 2, &cfg(64));

    let posted = sim.rx_available(QueueId(2));
    let doorbells = sim.rx_doorbells(QueueId(2));
    assert!(rxq.poll(16).is_empty());
    assert!(rxq.poll(16).is_empty());
    assert_eq!(sim.rx_available(QueueId(2)), posted);
    assert_eq!(sim.rx_doorbells(QueueId(2)), doorbells);
    assert_eq!(rxq.distance_used(), 63);
    assert_eq!(rxq.stats().empty_polls, 2);
    assert_eq!(rxq.stats().packets, 0);
}

#[test]
fn jumbo_delivery_chains_across_slots() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(100);
    let mut rxq = start_rx(&sim, &pool, 3, &cfg(64));

    // 5000 bytes over 2048-byte buffers: three slots. The model only sets
    // the head entry's done bit; the chained entries stay untouched, which
    // is exactly the contract the consumer trusts.
    let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    sim.deliver_frame(QueueId(3), &payload).unwrap();

    let pkts = rxq.poll(4);
    assert_eq!(pkts.len(), 1);
    let pkt = &pkts[0];
    assert_eq!(pkt.segs.len(), 3);
    assert_eq!(pkt.segs[0].len, 2048);
    assert_eq!(pkt.segs[1].len, 2048);
    assert_eq!(pkt.segs[2].len, 904);
    assert_eq!(pkt.pkt_len(), 5000);

    // Reassemble and compare.
    let mut got = Vec::new();
    for seg in &pkt.segs {
        got.extend_from_slice(&seg.frame.bytes()[..seg.len as usize]);
    }
    assert_eq!(got, payload);

    // The consumed entries were cleared: the ring keeps working.
    for pkt in pkts {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
    sim.deliver_frame(QueueId(3), &[7u8; 100]).unwrap();
    let pkts = rxq.poll(4);
    assert_eq!(pkts.len(), 1);
    assert_eq!(rxq.stats().packets, 2);
    for pkt in pkts {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
}

#[test]
fn completion_metadata_reaches_the_caller() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(100);
    let mut rxq = start_rx(&sim, &pool, 4, &cfg(64));

    sim.deliver(
        QueueId(4),
        &[1u8; 60],
        SimRxMeta {
            vlan: Some(0x0064),
            rss: Some(0xABCD_1234),
            ..SimRxMeta::default()
        },
    )
    .unwrap();

    let pkts = rxq.poll(1);
    let meta = pkts[0].meta;
    assert_eq!(meta.vlan_tci, Some(0x0064));
    assert_eq!(meta.rss_hash, Some(0xABCD_1234));
    assert_eq!(meta.lro_segs, 0);
    for pkt in pkts {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
}

#[test]
fn pool_exhaustion_defers_replenish_and_counts_it() {
    let sim = Arc::new(SimNic::new());
    // Exactly enough frames to prime the ring, nothing spare.
    let pool = pool(63);
    let mut config = cfg(64);
    config.free_thresh = 1;
    let mut rxq = start_rx(&sim, &pool, 5, &config);
    assert_eq!(pool.available(), 0);

    sim.deliver_frame(QueueId(5), &[9u8; 60]).unwrap();
    let pkts = rxq.poll(1);
    assert_eq!(pkts.len(), 1, "harvest must succeed even with nothing to refill");
    assert_eq!(rxq.stats().alloc_failures, 1);
    let posted = sim.rx_available(QueueId(5));

    // Handing the frame back lets the next poll refill the slot.
    for pkt in pkts {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
    assert!(rxq.poll(1).is_empty());
    assert_eq!(sim.rx_available(QueueId(5)), posted + 1);
}

#[test]
fn rx_stop_with_undelivered_buffers_drains_cleanly() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(100);
    let mut rxq = start_rx(&sim, &pool, 6, &cfg(64));

    // Two packets completed but never polled, the rest still empty: the
    // flush marks the empty ones, the drain walk frees both kinds.
    sim.deliver_frame(QueueId(6), &[1u8; 60]).unwrap();
    sim.deliver_frame(QueueId(6), &[2u8; 60]).unwrap();

    rxq.stop(sim.as_ref()).unwrap();
    assert_eq!(rxq.state(), QueueState::Stopped);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(rxq.stats().force_released, 0);
}

#[test]
fn unresponsive_device_times_out_but_teardown_proceeds() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(100);
    let mut rxq = start_rx(&sim, &pool, 7, &cfg(64));
    sim.set_mute(true);

    let err = rxq.stop(sim.as_ref()).unwrap_err();
    assert_eq!(err.outstanding, 63);
    assert_eq!(rxq.state(), QueueState::Stopped);
    // Buffers are reclaimed exactly once despite the timeout.
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(rxq.stats().force_released, 63);
}

#[test]
fn tx_in_flight_packets_survive_timeout_exactly_once() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(16);
    let mut txq = start_tx(&sim, &pool, 8, &cfg(64));
    sim.set_mute(true);

    for _ in 0..3 {
        let frame = pool.alloc().unwrap();
        txq.submit(TxPacket::single(frame, 128)).unwrap();
    }
    let err = txq.stop(sim.as_ref()).unwrap_err();
    assert_eq!(err.outstanding, 3);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(txq.stats().force_released, 3);
}

#[test]
fn one_pool_backs_several_queues() {
    let sim = Arc::new(SimNic::new());
    let pool = pool(150);
    let mut rx_a = start_rx(&sim, &pool, 10, &cfg(64));
    let mut rx_b = start_rx(&sim, &pool, 11, &cfg(64));
    assert_eq!(pool.outstanding(), 126);

    sim.deliver_frame(QueueId(10), &[1u8; 60]).unwrap();
    sim.deliver_frame(QueueId(11), &[2u8; 60]).unwrap();
    let a = rx_a.poll(4);
    let b = rx_b.poll(4);
    assert_eq!((a.len(), b.len()), (1, 1));
    assert_eq!(a[0].segs[0].frame.bytes()[0], 1);
    assert_eq!(b[0].segs[0].frame.bytes()[0], 2);

    for pkt in a.into_iter().chain(b) {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
    rx_a.stop(sim.as_ref()).unwrap();
    rx_b.stop(sim.as_ref()).unwrap();
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn registry_tracks_independent_devices() {
    let registry: DeviceRegistry<SimNic> = DeviceRegistry::new();
    registry.register("0000:5e:00.0", Arc::new(SimNic::new())).unwrap();
    registry.register("0000:5e:00.1", Arc::new(SimNic::new())).unwrap();

    let dev = registry.lookup("0000:5e:00.0").unwrap();
    let pool = pool(100);
    let mut rxq = start_rx(&dev, &pool, 0, &cfg(64));
    dev.deliver_frame(QueueId(0), &[3u8; 60]).unwrap();
    let pkts = rxq.poll(1);
    assert_eq!(pkts.len(), 1);
    for pkt in pkts {
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
    }
    rxq.stop(dev.as_ref()).unwrap();

    assert!(registry.unregister("0000:5e:00.0").is_some());
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup("0000:5e:00.0").is_none());
}
