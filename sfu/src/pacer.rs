//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Outbound packet pacing. `PassThrough` writes immediately; `LeakyBucket`
//! smooths to a configured bitrate with a bounded queue and a drain thread.
//! Both share probe-cluster accounting so the congestion controller can
//! measure what actually left during a probe.

use std::{collections::VecDeque, sync::Arc, thread};

use relay_common::{DataRate, DataSize, Duration, Instant};
use log::*;
use parking_lot::{Condvar, Mutex};

use crate::{config::Config, rtp::Header};

pub type ProbeClusterId = u32;

/// Where paced packets are written. Implementations must not block for long;
/// the pacer calls this from its drain thread.
pub trait PacketSink: Send + Sync {
    fn write_rtp(&self, header: &Header, payload: &[u8]) -> anyhow::Result<()>;
}

pub struct Packet {
    pub header: Header,
    pub header_size: usize,
    pub payload: Vec<u8>,
    pub is_rtx: bool,
    pub is_probe: bool,
    pub probe_cluster_id: Option<ProbeClusterId>,
    pub sink: Arc<dyn PacketSink>,
}

impl Packet {
    fn size(&self) -> DataSize {
        DataSize::from_bytes((self.header_size + self.payload.len()) as u64)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeClusterInfo {
    pub id: ProbeClusterId,
    pub desired_bytes: u64,
    pub start_time: Instant,
    pub end_time: Instant,
    pub bytes_probe: u64,
    pub bytes_non_probe_primary: u64,
    pub bytes_non_probe_rtx: u64,
}

pub trait ProbeClusterObserver: Send + Sync {
    fn on_probe_cluster_complete(&self, info: ProbeClusterInfo);
}

/// The pacer surface shared by both implementations. `enqueue` never blocks
/// the producer.
pub trait Pacer: Send + Sync {
    fn enqueue(&self, packet: Packet);
    fn stop(&self);
    fn set_interval(&self, interval: Duration);
    fn set_bitrate(&self, bitrate: DataRate);
    fn set_probe_observer(&self, observer: Arc<dyn ProbeClusterObserver>);
    fn start_probe_cluster(&self, id: ProbeClusterId, desired_bytes: u64);
    fn end_probe_cluster(&self, id: ProbeClusterId);
    fn abort_probe_cluster(&self, id: ProbeClusterId);
}

struct ActiveProbeCluster {
    id: ProbeClusterId,
    desired_bytes: u64,
    start_time: Instant,
    bytes_probe: u64,
    bytes_non_probe_primary: u64,
    bytes_non_probe_rtx: u64,
}

impl ActiveProbeCluster {
    fn info(&self, end_time: Instant) -> ProbeClusterInfo {
        ProbeClusterInfo {
            id: self.id,
            desired_bytes: self.desired_bytes,
            start_time: self.start_time,
            end_time,
            bytes_probe: self.bytes_probe,
            bytes_non_probe_primary: self.bytes_non_probe_primary,
            bytes_non_probe_rtx: self.bytes_non_probe_rtx,
        }
    }

    fn total_bytes(&self) -> u64 {
        self.bytes_probe + self.bytes_non_probe_primary + self.bytes_non_probe_rtx
    }
}

/// Probe accounting shared by both pacers.
#[derive(Default)]
struct ProbeState {
    observer: Option<Arc<dyn ProbeClusterObserver>>,
    active: Option<ActiveProbeCluster>,
}

type ProbeCompletion = (Arc<dyn ProbeClusterObserver>, ProbeClusterInfo);

impl ProbeState {
    fn start(&mut self, id: ProbeClusterId, desired_bytes: u64, now: Instant) {
        if let Some(active) = &self.active {
            debug!(
                "starting probe cluster {} while {} is active; replacing",
                id, active.id
            );
        }
        self.active = Some(ActiveProbeCluster {
            id,
            desired_bytes,
            start_time: now,
            bytes_probe: 0,
            bytes_non_probe_primary: 0,
            bytes_non_probe_rtx: 0,
        });
    }

    fn end(&mut self, id: ProbeClusterId, now: Instant) -> Option<ProbeCompletion> {
        match &self.active {
            Some(active) if active.id == id => {
                let active = self.active.take().expect("checked above");
                let observer = self.observer.clone()?;
                Some((observer, active.info(now)))
            }
            _ => None,
        }
    }

    fn abort(&mut self, id: ProbeClusterId) {
        if matches!(&self.active, Some(active) if active.id == id) {
            self.active = None;
        }
    }

    /// Accounts one sent packet; returns a completion when the cluster
    /// reached its desired bytes.
    fn record_sent(&mut self, packet: &Packet, now: Instant) -> Option<ProbeCompletion> {
        let active = self.active.as_mut()?;
        let bytes = packet.size().as_bytes();
        if packet.is_probe {
            active.bytes_probe += bytes;
        } else if packet.is_rtx {
            active.bytes_non_probe_rtx += bytes;
        } else {
            active.bytes_non_probe_primary += bytes;
        }
        if active.total_bytes() >= active.desired_bytes {
            let active = self.active.take().expect("checked above");
            let observer = self.observer.clone()?;
            return Some((observer, active.info(now)));
        }
        None
    }
}

fn write_packet(packet: &Packet) {
    if let Err(err) = packet.sink.write_rtp(&packet.header, &packet.payload) {
        debug!("pacer write failed: ssrc: {}, error: {}", packet.header.ssrc, err);
    }
}

/// Writes every packet the moment it is enqueued.
pub struct PassThrough {
    probe: Mutex<ProbeState>,
}

impl PassThrough {
    pub fn new() -> Self {
        Self {
            probe: Mutex::new(ProbeState::default()),
        }
    }
}

impl Default for PassThrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacer for PassThrough {
    fn enqueue(&self, packet: Packet) {
        write_packet(&packet);
        let completion = self.probe.lock().record_sent(&packet, Instant::now());
        if let Some((observer, info)) = completion {
            observer.on_probe_cluster_complete(info);
        }
    }

    fn stop(&self) {}

    fn set_interval(&self, _interval: Duration) {}

    fn set_bitrate(&self, _bitrate: DataRate) {}

    fn set_probe_observer(&self, observer: Arc<dyn ProbeClusterObserver>) {
        self.probe.lock().observer = Some(observer);
    }

    fn start_probe_cluster(&self, id: ProbeClusterId, desired_bytes: u64) {
        self.probe.lock().start(id, desired_bytes, Instant::now());
    }

    fn end_probe_cluster(&self, id: ProbeClusterId) {
        let completion = self.probe.lock().end(id, Instant::now());
        if let Some((observer, info)) = completion {
            observer.on_probe_cluster_complete(info);
        }
    }

    fn abort_probe_cluster(&self, id: ProbeClusterId) {
        self.probe.lock().abort(id);
    }
}

struct LeakyBucketState {
    queue: VecDeque<Packet>,
    queued_size: DataSize,
    interval: Duration,
    bitrate: DataRate,
    max_queue_packets: usize,
    budget: DataSize,
    last_drain: Option<Instant>,
    stopped: bool,
    probe: ProbeState,
}

impl LeakyBucketState {
    fn new(config: &Config) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_size: DataSize::ZERO,
            interval: Duration::from_millis(config.pacer_interval_ms),
            bitrate: DataRate::from_kbps(config.pacer_bitrate_kbps),
            max_queue_packets: config.pacer_max_queue_packets,
            budget: DataSize::ZERO,
            last_drain: None,
            stopped: false,
            probe: ProbeState::default(),
        }
    }

    /// Pops everything the current budget pays for. Budget accrues with wall
    /// time and is capped at two intervals' worth so a stall cannot burst the
    /// whole queue at once.
    fn drain(&mut self, now: Instant) -> (Vec<Packet>, Vec<ProbeCompletion>) {
        let elapsed = match self.last_drain {
            Some(last) => now.saturating_duration_since(last),
            None => self.interval,
        };
        self.last_drain = Some(now);

        let cap = self.bitrate * (self.interval * 2);
        self.budget += self.bitrate * elapsed;
        if self.budget > cap {
            self.budget = cap;
        }

        let mut packets = Vec::new();
        let mut completions = Vec::new();
        while let Some(front) = self.queue.front() {
            let size = front.size();
            if size > self.budget {
                break;
            }
            self.budget -= size;
            self.queued_size = self.queued_size.saturating_sub(size);
            let packet = self.queue.pop_front().expect("front exists");
            if let Some(completion) = self.probe.record_sent(&packet, now) {
                completions.push(completion);
            }
            packets.push(packet);
        }
        (packets, completions)
    }
}

/// Smooths sending to the configured bitrate. Overflow drops the newest probe
/// packet first, then the oldest RTX packet, and the oldest packet only as a
/// last resort; per-SSRC ordering of what remains is preserved.
pub struct LeakyBucket {
    state: Arc<(Mutex<LeakyBucketState>, Condvar)>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LeakyBucket {
    pub fn new(config: &Config) -> Self {
        let state = Arc::new((Mutex::new(LeakyBucketState::new(config)), Condvar::new()));
        let worker_state = Arc::clone(&state);
        let worker = thread::spawn(move || Self::drain_loop(worker_state));
        Self {
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn drain_loop(shared: Arc<(Mutex<LeakyBucketState>, Condvar)>) {
        let (lock, wakeup) = &*shared;
        loop {
            let (packets, completions, interval) = {
                let mut state = lock.lock();
                if state.stopped {
                    return;
                }
                if state.queue.is_empty() {
                    wakeup.wait(&mut state);
                    if state.stopped {
                        return;
                    }
                }
                let now = Instant::now();
                let (packets, completions) = state.drain(now);
                (packets, completions, state.interval)
            };

            for packet in &packets {
                write_packet(packet);
            }
            for (observer, info) in completions {
                observer.on_probe_cluster_complete(info);
            }

            let mut state = lock.lock();
            if state.stopped {
                return;
            }
            let _ = wakeup.wait_for(&mut state, interval.into());
        }
    }
}

impl Pacer for LeakyBucket {
    fn enqueue(&self, packet: Packet) {
        let (lock, wakeup) = &*self.state;
        let mut state = lock.lock();
        if state.stopped {
            return;
        }
        if state.queue.len() >= state.max_queue_packets {
            if packet.is_probe {
                // Probing is best-effort; shed the newest probe first.
                trace!("pacer queue full; dropping probe packet");
                return;
            }
            if let Some(pos) = state.queue.iter().position(|queued| queued.is_rtx) {
                let removed = state.queue.remove(pos).expect("position exists");
                state.queued_size = state.queued_size.saturating_sub(removed.size());
                debug!("pacer queue full; dropped oldest rtx packet");
            } else if let Some(removed) = state.queue.pop_front() {
                state.queued_size = state.queued_size.saturating_sub(removed.size());
                debug!("pacer queue full; dropped oldest packet");
            }
        }
        state.queued_size += packet.size();
        state.queue.push_back(packet);
        wakeup.notify_one();
    }

    fn stop(&self) {
        {
            let (lock, wakeup) = &*self.state;
            let mut state = lock.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            wakeup.notify_all();
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn set_interval(&self, interval: Duration) {
        self.state.0.lock().interval = interval;
    }

    fn set_bitrate(&self, bitrate: DataRate) {
        self.state.0.lock().bitrate = bitrate;
    }

    fn set_probe_observer(&self, observer: Arc<dyn ProbeClusterObserver>) {
        self.state.0.lock().probe.observer = Some(observer);
    }

    fn start_probe_cluster(&self, id: ProbeClusterId, desired_bytes: u64) {
        self.state.0.lock().probe.start(id, desired_bytes, Instant::now());
    }

    fn end_probe_cluster(&self, id: ProbeClusterId) {
        let completion = self.state.0.lock().probe.end(id, Instant::now());
        if let Some((observer, info)) = completion {
            observer.on_probe_cluster_complete(info);
        }
    }

    fn abort_probe_cluster(&self, id: ProbeClusterId) {
        self.state.0.lock().probe.abort(id);
    }
}

impl Drop for LeakyBucket {
    fn drop(&mut self) {
        let (lock, wakeup) = &*self.state;
        lock.lock().stopped = true;
        wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_test_config;

    #[derive(Default)]
    struct VecSink {
        written: Mutex<Vec<u16>>,
    }

    impl VecSink {
        fn seqnums(&self) -> Vec<u16> {
            self.written.lock().clone()
        }
    }

    impl PacketSink for VecSink {
        fn write_rtp(&self, header: &Header, _payload: &[u8]) -> anyhow::Result<()> {
            self.written.lock().push(header.seqnum);
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecObserver {
        completed: Mutex<Vec<ProbeClusterInfo>>,
    }

    impl ProbeClusterObserver for VecObserver {
        fn on_probe_cluster_complete(&self, info: ProbeClusterInfo) {
            self.completed.lock().push(info);
        }
    }

    fn packet(sink: &Arc<VecSink>, seqnum: u16, payload_bytes: usize) -> Packet {
        Packet {
            header: Header {
                payload_type: 96,
                seqnum,
                timestamp: 0,
                ssrc: 1,
                marker: false,
            },
            header_size: 12,
            payload: vec![0u8; payload_bytes],
            is_rtx: false,
            is_probe: false,
            probe_cluster_id: None,
            sink: Arc::clone(sink) as Arc<dyn PacketSink>,
        }
    }

    fn probe_packet(sink: &Arc<VecSink>, seqnum: u16, payload_bytes: usize) -> Packet {
        Packet {
            is_probe: true,
            probe_cluster_id: Some(1),
            ..packet(sink, seqnum, payload_bytes)
        }
    }

    fn rtx_packet(sink: &Arc<VecSink>, seqnum: u16, payload_bytes: usize) -> Packet {
        Packet {
            is_rtx: true,
            ..packet(sink, seqnum, payload_bytes)
        }
    }

    #[test]
    fn pass_through_writes_immediately() {
        let sink = Arc::new(VecSink::default());
        let pacer = PassThrough::new();
        pacer.enqueue(packet(&sink, 1, 100));
        pacer.enqueue(packet(&sink, 2, 100));
        assert_eq!(vec![1, 2], sink.seqnums());
        pacer.stop();
    }

    #[test]
    fn probe_cluster_completes_at_desired_bytes() {
        let sink = Arc::new(VecSink::default());
        let observer = Arc::new(VecObserver::default());
        let pacer = PassThrough::new();
        pacer.set_probe_observer(Arc::clone(&observer) as Arc<dyn ProbeClusterObserver>);

        pacer.start_probe_cluster(7, 300);
        // 12 header + 88 payload = 100 bytes each.
        pacer.enqueue(probe_packet(&sink, 1, 88));
        pacer.enqueue(packet(&sink, 2, 88));
        pacer.enqueue(rtx_packet(&sink, 3, 88));
        assert!(!observer.completed.lock().is_empty());

        let info = observer.completed.lock()[0].clone();
        assert_eq!(7, info.id);
        assert_eq!(300, info.desired_bytes);
        assert_eq!(100, info.bytes_probe);
        assert_eq!(100, info.bytes_non_probe_primary);
        assert_eq!(100, info.bytes_non_probe_rtx);
    }

    #[test]
    fn probe_cluster_end_and_abort() {
        let sink = Arc::new(VecSink::default());
        let observer = Arc::new(VecObserver::default());
        let pacer = PassThrough::new();
        pacer.set_probe_observer(Arc::clone(&observer) as Arc<dyn ProbeClusterObserver>);

        pacer.start_probe_cluster(1, 1_000_000);
        pacer.enqueue(probe_packet(&sink, 1, 88));
        pacer.end_probe_cluster(1);
        assert_eq!(1, observer.completed.lock().len());
        assert_eq!(100, observer.completed.lock()[0].bytes_probe);

        // An aborted cluster never reports.
        pacer.start_probe_cluster(2, 1_000_000);
        pacer.enqueue(probe_packet(&sink, 2, 88));
        pacer.abort_probe_cluster(2);
        assert_eq!(1, observer.completed.lock().len());
        // Ending an aborted cluster is a no-op too.
        pacer.end_probe_cluster(2);
        assert_eq!(1, observer.completed.lock().len());
    }

    #[test]
    fn leaky_bucket_drain_respects_budget() {
        let sink = Arc::new(VecSink::default());
        let mut state = LeakyBucketState::new(&default_test_config());
        // 100 bytes per 100ms.
        state.bitrate = DataRate::from_bps(8_000);
        state.interval = Duration::from_millis(100);

        for seqnum in 1..=3 {
            let p = packet(&sink, seqnum, 88);
            state.queued_size += p.size();
            state.queue.push_back(p);
        }

        let epoch = Instant::now();
        state.last_drain = Some(epoch);
        let (packets, _) = state.drain(epoch + Duration::from_millis(100));
        assert_eq!(1, packets.len());
        assert_eq!(1, packets[0].header.seqnum);

        let (packets, _) = state.drain(epoch + Duration::from_millis(200));
        assert_eq!(1, packets.len());
        assert_eq!(2, packets[0].header.seqnum);

        // No elapsed time, no budget.
        let (packets, _) = state.drain(epoch + Duration::from_millis(200));
        assert_eq!(0, packets.len());
    }

    #[test]
    fn leaky_bucket_budget_burst_is_capped() {
        let sink = Arc::new(VecSink::default());
        let mut state = LeakyBucketState::new(&default_test_config());
        state.bitrate = DataRate::from_bps(8_000);
        state.interval = Duration::from_millis(100);

        for seqnum in 1..=10 {
            let p = packet(&sink, seqnum, 88);
            state.queued_size += p.size();
            state.queue.push_back(p);
        }

        // A long stall accrues at most two intervals' worth of budget.
        let epoch = Instant::now();
        state.last_drain = Some(epoch);
        let (packets, _) = state.drain(epoch + Duration::from_secs(10));
        assert_eq!(2, packets.len());
    }

    #[test]
    fn leaky_bucket_overflow_policy() {
        let sink = Arc::new(VecSink::default());
        let mut config = default_test_config();
        config.pacer_max_queue_packets = 2;
        let pacer = LeakyBucket::new(&config);
        // Freeze the drain so the queue actually fills.
        pacer.set_bitrate(DataRate::ZERO);

        pacer.enqueue(packet(&sink, 1, 88));
        pacer.enqueue(rtx_packet(&sink, 2, 88));

        // A probe packet arriving at a full queue is shed.
        pacer.enqueue(probe_packet(&sink, 3, 88));
        {
            let state = pacer.state.0.lock();
            assert_eq!(2, state.queue.len());
        }

        // A media packet evicts the oldest rtx.
        pacer.enqueue(packet(&sink, 4, 88));
        {
            let state = pacer.state.0.lock();
            let seqnums: Vec<u16> = state.queue.iter().map(|p| p.header.seqnum).collect();
            assert_eq!(vec![1, 4], seqnums);
        }

        // With no rtx left, the oldest packet goes.
        pacer.enqueue(packet(&sink, 5, 88));
        {
            let state = pacer.state.0.lock();
            let seqnums: Vec<u16> = state.queue.iter().map(|p| p.header.seqnum).collect();
            assert_eq!(vec![4, 5], seqnums);
        }

        pacer.stop();
    }

    #[test]
    fn leaky_bucket_sends_enqueued_packets() {
        let sink = Arc::new(VecSink::default());
        let pacer = LeakyBucket::new(&default_test_config());
        pacer.set_bitrate(DataRate::from_kbps(10_000));

        for seqnum in 1..=3 {
            pacer.enqueue(packet(&sink, seqnum, 88));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.seqnums().len() < 3 {
            assert!(Instant::now() < deadline, "packets were not drained");
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(vec![1, 2, 3], sink.seqnums());
        pacer.stop();
    }
}
