//! Generated traffic for `--simulate`
//!
//! Pushes a small cyclic message set onto every configured channel of a
//! `SimulatedBus`, with a rolling counter in the first payload byte.

use anyhow::{Context, Result};
use can_live_ingest::{
    ChannelDescriptor, ClassicFrame, FdFrame, Frame, HwTimestamp, MessageType, SimulatedBus,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default period between generated bursts
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

/// Background thread feeding a simulated bus
pub struct TrafficGenerator {
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TrafficGenerator {
    pub fn spawn(
        bus: Arc<SimulatedBus>,
        channels: Vec<ChannelDescriptor>,
        period: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let worker = thread::Builder::new()
            .name("can-sim-traffic".to_string())
            .spawn(move || generate(bus, channels, period, shutdown_rx))
            .context("Failed to spawn traffic generator")?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.shutdown.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Traffic generator panicked");
            }
        }
    }
}

impl Drop for TrafficGenerator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn generate(
    bus: Arc<SimulatedBus>,
    channels: Vec<ChannelDescriptor>,
    period: Duration,
    shutdown: Receiver<()>,
) {
    log::info!("Generating traffic on {} simulated channel(s)", channels.len());
    let started = Instant::now();
    let mut cycle: u64 = 0;

    loop {
        let elapsed = started.elapsed();
        for channel in &channels {
            for frame in cycle_frames(channel, cycle) {
                let timestamp = simulated_timestamp(channel, elapsed);
                bus.push_frame(channel.handle, frame, Some(timestamp));
            }
        }
        cycle += 1;

        match shutdown.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("Traffic generator stopped after {} cycle(s)", cycle);
}

/// Frames sent on `channel` in the given cycle
///
/// FD channels are read with the FD call only, so their standard messages
/// are carried in FD buffers without the FD flag, as the driver delivers them.
pub fn cycle_frames(channel: &ChannelDescriptor, cycle: u64) -> Vec<Frame> {
    let counter = (cycle & 0xFF) as u8;
    let mut frames = Vec::with_capacity(4);

    if channel.is_fd {
        frames.push(Frame::from(FdFrame::new(
            0x100,
            MessageType::STANDARD,
            8,
            &[counter, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77],
        )));
        frames.push(Frame::from(FdFrame::new(
            0x200,
            MessageType::FD | MessageType::BRS,
            15,
            &[counter; 64],
        )));
        if cycle % 5 == 0 {
            frames.push(Frame::from(FdFrame::new(
                0x1F00_0001,
                MessageType::EXTENDED | MessageType::FD,
                9,
                &[counter, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF],
            )));
        }
    } else {
        frames.push(Frame::from(ClassicFrame::new(
            0x100,
            MessageType::STANDARD,
            &[counter, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77],
        )));
        frames.push(Frame::from(ClassicFrame::new(
            0x18FE_F100,
            MessageType::EXTENDED,
            &[counter, 0xFF, 0x00, 0x80],
        )));
        if cycle % 10 == 0 {
            frames.push(Frame::from(ClassicFrame::new(0x7DF, MessageType::RTR, &[])));
        }
    }

    frames
}

fn simulated_timestamp(channel: &ChannelDescriptor, elapsed: Duration) -> HwTimestamp {
    let micros = elapsed.as_micros() as u64;
    if channel.is_fd {
        HwTimestamp::Fd(micros)
    } else {
        HwTimestamp::Classic {
            millis: (micros / 1000) as u32,
            millis_overflow: 0,
            micros: (micros % 1000) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_live_ingest::ChannelHandle;

    #[test]
    fn test_cycle_frames_match_channel_kind() {
        let classic = ChannelDescriptor::classic(ChannelHandle(0x51));
        let fd = ChannelDescriptor::fd(ChannelHandle(0x52));

        assert!(cycle_frames(&classic, 0).iter().all(|f| !f.is_fd()));
        assert!(cycle_frames(&fd, 0).iter().all(|f| f.is_fd()));
        assert_eq!(cycle_frames(&classic, 0).len(), 3);
        assert_eq!(cycle_frames(&classic, 1).len(), 2);
        assert_eq!(cycle_frames(&classic, 7)[0].payload()[0], 7);
    }

    #[test]
    fn test_generator_feeds_bus_until_stopped() {
        let bus = Arc::new(SimulatedBus::new());
        let channel = ChannelDescriptor::classic(ChannelHandle(0x51));
        let generator =
            TrafficGenerator::spawn(bus.clone(), vec![channel], Duration::from_millis(1)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while bus.pending(channel.handle) < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        generator.stop();

        let pending = bus.pending(channel.handle);
        assert!(pending >= 6);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(bus.pending(channel.handle), pending);
    }
}
