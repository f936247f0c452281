//! Drives one TX/RX queue pair against the software device model and
//! loops a few frames through it.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example loopback
//! ```

use std::sync::Arc;

use anyhow::Result;
use nicq::{
    DeviceRegistry, Doorbell, FramePool, PacketPool, QueueConfig, QueueId, RxQueue, TxPacket,
    TxQueue,
};
use nictest::{SimNic, udp_frame};

fn main() -> Result<()> {
    env_logger::init();

    let registry: DeviceRegistry<SimNic> = DeviceRegistry::new();
    registry.register("0000:5e:00.0", Arc::new(SimNic::new()))?;
    let dev = registry.lookup("0000:5e:00.0").expect("just registered");
    dev.set_auto_ack_tx(true);

    let pool = Arc::new(FramePool::new(256, 2048, None)?);
    let cfg = QueueConfig::default();
    let mut txq = TxQueue::start(
        QueueId(0),
        &cfg,
        pool.clone() as Arc<dyn PacketPool>,
        dev.clone() as Arc<dyn Doorbell>,
        dev.as_ref(),
    )?;
    let mut rxq = RxQueue::start(
        QueueId(0),
        &cfg,
        pool.clone() as Arc<dyn PacketPool>,
        dev.clone() as Arc<dyn Doorbell>,
        dev.as_ref(),
    )?;

    for i in 0..4u32 {
        let wire = udp_frame(format!("loopback frame {i}").as_bytes())?;
        let mut frame = pool.alloc().expect("pool sized for this");
        frame.bytes_mut()[..wire.len()].copy_from_slice(&wire);
        txq.submit(TxPacket::single(frame, wire.len() as u32))
            .map_err(|e| anyhow::anyhow!("submit failed: {e}"))?;
        txq.reclaim();

        // The wire is a loop: what went out comes back in.
        dev.deliver_frame(QueueId(0), &wire)?;
        for pkt in rxq.poll(8) {
            println!(
                "received {} bytes in {} segment(s), csum {:?}",
                pkt.pkt_len(),
                pkt.segs.len(),
                pkt.meta.csum
            );
            for seg in pkt.segs {
                pool.free(seg.frame);
            }
        }
    }

    txq.stop(dev.as_ref())?;
    rxq.stop(dev.as_ref())?;
    println!("tx: {:?}", txq.stats());
    println!("rx: {:?}", rxq.stats());

    registry.unregister("0000:5e:00.0");
    Ok(())
}
