// src/receive/worker.rs
//
// Receive worker: drains a channel's hardware receive queue into the frame table.
//
// Two delivery paths lead to the same drain:
// - a poll loop (tokio task) that ticks every `poll_interval`
// - a receive-event callback the driver may invoke from its own thread
//
// Both take the channel lock for the whole drain, so they never interleave
// and a close/reassign never lands mid-drain. The drain itself never
// suspends; it reads until the driver reports an empty queue.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::io::{ChannelId, DriverAdapter, IoError, RcvEventCallback, Status};
use crate::receive::channel::SharedChannel;
use crate::receive::table::{FrameRecord, FrameTable, FrameTableView};
use crate::tlog;

/// Default pause between poll ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exit code used by `FaultPolicy::ExitProcess`
pub const FATAL_EXIT_CODE: i32 = 1;

// ============================================================================
// Options
// ============================================================================

/// Which path delivers frames for a channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Poll loop only
    #[default]
    Timer,
    /// Driver receive events only
    Event,
    /// Both paths, serialized by the channel lock
    Both,
}

impl DeliveryMode {
    fn uses_timer(self) -> bool {
        matches!(self, DeliveryMode::Timer | DeliveryMode::Both)
    }

    fn uses_events(self) -> bool {
        matches!(self, DeliveryMode::Event | DeliveryMode::Both)
    }
}

/// What happens when a frame cannot be turned into a record or stored
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log and terminate the whole process
    ExitProcess,
    /// Stop this channel's worker and report the error to the consumer
    #[default]
    IsolateChannel,
}

/// Receive worker options
#[derive(Clone, Debug)]
pub struct ReceiveOptions {
    pub poll_interval: Duration,
    /// Capture hardware timestamps (can be changed while running)
    pub read_timestamp: bool,
    pub delivery_mode: DeliveryMode,
    pub fault_policy: FaultPolicy,
    /// Capacity of the consumer message channel
    pub message_capacity: usize,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timestamp: false,
            delivery_mode: DeliveryMode::Timer,
            fault_policy: FaultPolicy::IsolateChannel,
            message_capacity: 256,
        }
    }
}

// ============================================================================
// State and Messages
// ============================================================================

/// Current state of a receive worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    /// Stopped by `FaultPolicy::IsolateChannel`
    Faulted(String),
}

/// Messages from the worker to its consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerMessage {
    /// A driver fault emptied the table
    TableCleared { channel: ChannelId, status: Status, removed: usize },
    /// A fatal receive error stopped the worker
    Fault { channel: ChannelId, error: IoError },
    /// The poll loop exited
    Ended { channel: ChannelId, reason: String },
}

/// Result of one drain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records written to the table
    pub stored: usize,
    /// A driver fault cleared the table
    pub cleared: bool,
    /// Status of the read that ended the drain
    pub last_status: Status,
}

// ============================================================================
// Shared Core
// ============================================================================

/// State shared by the poll task, the event callback and the worker handle
struct ReceiveCore {
    driver: Arc<dyn DriverAdapter>,
    channel: SharedChannel,
    table: FrameTable,
    read_timestamp: AtomicBool,
    fault_policy: FaultPolicy,
    stop_flag: AtomicBool,
    wake: Notify,
    fault: Mutex<Option<IoError>>,
    messages: mpsc::Sender<WorkerMessage>,
}

impl ReceiveCore {
    fn device(&self, channel: ChannelId) -> String {
        format!("{}({})", self.driver.name(), channel)
    }

    fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn send(&self, message: WorkerMessage) {
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.messages.try_send(message) {
            tlog!("[rx] Consumer channel full, dropping {:?}", dropped);
        }
    }

    /// Read until the driver reports an empty queue. Caller holds the channel lock.
    fn drain(&self, channel: ChannelId) -> Result<DrainSummary, IoError> {
        // One snapshot per drain so every record in it agrees on timestamps
        let with_timestamp = self.read_timestamp.load(Ordering::Acquire);
        let device = self.device(channel);
        let mut summary = DrainSummary {
            stored: 0,
            cleared: false,
            last_status: Status::OK,
        };

        loop {
            let outcome = self.driver.read(channel, with_timestamp);
            summary.last_status = outcome.status;

            if !outcome.status.without_queue_empty().is_ok() {
                let removed = self.table.clear()?;
                summary.cleared = true;
                tlog!(
                    "[rx] {} read returned {}, cleared {} records",
                    device,
                    outcome.status,
                    removed
                );
                self.send(WorkerMessage::TableCleared {
                    channel,
                    status: outcome.status,
                    removed,
                });
                break;
            }

            // A frame that arrives with the queue-empty bit is stored before stopping
            match outcome.frame {
                Some(frame) => {
                    let timestamp = if with_timestamp { outcome.timestamp } else { None };
                    let record = FrameRecord::from_raw(&device, frame, timestamp)?;
                    self.table.insert(record)?;
                    summary.stored += 1;
                }
                None if !outcome.status.is_queue_empty() => {
                    return Err(IoError::fatal(&device, "driver reported OK without a frame"));
                }
                None => {}
            }

            if outcome.status.is_queue_empty() {
                break;
            }
        }

        Ok(summary)
    }

    /// One poll tick: drain if the channel has a handle and is working
    fn poll_once(&self) -> Option<Result<DrainSummary, IoError>> {
        if self.is_stopped() {
            return None;
        }
        self.channel.with_active(|id| self.drain(id))
    }

    /// Receive-event entry: drain if `id` is this channel's handle
    fn process_rcv_event(&self, id: ChannelId) -> Option<DrainSummary> {
        if self.is_stopped() {
            return None;
        }
        match self.channel.with_matching(id, |id| self.drain(id))? {
            Ok(summary) => Some(summary),
            Err(e) => {
                self.on_fatal(id, e);
                None
            }
        }
    }

    fn on_fatal(&self, channel: ChannelId, error: IoError) {
        match self.fault_policy {
            FaultPolicy::ExitProcess => {
                tlog!("[rx] {} - terminating process", error);
                std::process::exit(FATAL_EXIT_CODE);
            }
            FaultPolicy::IsolateChannel => {
                tlog!("[rx] {} - stopping receive worker", error);
                *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
                self.request_stop();
                self.send(WorkerMessage::Fault { channel, error });
            }
        }
    }

    fn fault(&self) -> Option<IoError> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

async fn run_poll_loop(core: Arc<ReceiveCore>, interval: Duration) {
    let label = core
        .channel
        .handle()
        .map(|id| core.device(id))
        .unwrap_or_else(|| core.driver.name().to_string());
    tlog!("[rx] Poll loop started for {} ({:?} interval)", label, interval);

    let reason = loop {
        if core.is_stopped() {
            break "stopped";
        }
        if let Some(Err(e)) = core.poll_once() {
            let id = core.channel.handle().unwrap_or(ChannelId(0));
            core.on_fatal(id, e);
            break "fault";
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = core.wake.notified() => {}
        }
    };

    tlog!("[rx] Poll loop for {} ended: {}", label, reason);
    if let Some(channel) = core.channel.handle() {
        core.send(WorkerMessage::Ended {
            channel,
            reason: reason.to_string(),
        });
    }
}

// ============================================================================
// ReceiveWorker
// ============================================================================

/// Background receive worker for one channel.
///
/// Owns the table writer; consumers read through the `FrameTableView` taken
/// from the table before it was handed over, and get `WorkerMessage`s from
/// the receiver returned by `new`.
pub struct ReceiveWorker {
    core: Arc<ReceiveCore>,
    options: ReceiveOptions,
    running: bool,
    task_handle: Option<JoinHandle<()>>,
    event_channel: Option<ChannelId>,
}

impl ReceiveWorker {
    pub fn new(
        driver: Arc<dyn DriverAdapter>,
        channel: SharedChannel,
        table: FrameTable,
        options: ReceiveOptions,
    ) -> (Self, mpsc::Receiver<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(options.message_capacity.max(1));
        let core = Arc::new(ReceiveCore {
            driver,
            channel,
            table,
            read_timestamp: AtomicBool::new(options.read_timestamp),
            fault_policy: options.fault_policy,
            stop_flag: AtomicBool::new(true),
            wake: Notify::new(),
            fault: Mutex::new(None),
            messages: tx,
        });
        let worker = Self {
            core,
            options,
            running: false,
            task_handle: None,
            event_channel: None,
        };
        (worker, rx)
    }

    pub fn state(&self) -> WorkerState {
        if let Some(e) = self.core.fault() {
            return WorkerState::Faulted(e.to_string());
        }
        if self.running && !self.core.is_stopped() {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.core.channel
    }

    /// Another read-only view of the table this worker fills
    pub fn table_view(&self) -> FrameTableView {
        self.core.table.view()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.options.delivery_mode
    }

    pub fn read_timestamp(&self) -> bool {
        self.core.read_timestamp.load(Ordering::Acquire)
    }

    /// Toggle timestamp capture; takes effect from the next drain
    pub fn set_read_timestamp(&self, enabled: bool) {
        self.core.read_timestamp.store(enabled, Ordering::Release);
    }

    /// Start the configured delivery paths. The poll loop needs a tokio runtime.
    pub fn start(&mut self) -> Result<(), IoError> {
        let label = self.core.driver.name().to_string();
        if self.running {
            if self.core.fault().is_none() {
                return Err(IoError::configuration(&label, "receive worker is already running"));
            }
            // Faulted run: unregister its callback and drop its task before restarting
            self.abort();
        }
        let mode = self.options.delivery_mode;
        let runtime = if mode.uses_timer() {
            Some(tokio::runtime::Handle::try_current().map_err(|_| {
                IoError::configuration(&label, "poll loop needs a tokio runtime")
            })?)
        } else {
            None
        };

        *self.core.fault.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.core.stop_flag.store(false, Ordering::Release);

        if mode.uses_events() {
            if let Err(e) = self.register_event_callback() {
                self.core.stop_flag.store(true, Ordering::Release);
                return Err(e);
            }
        }

        if let Some(runtime) = runtime {
            let core = self.core.clone();
            let interval = self.options.poll_interval;
            self.task_handle = Some(runtime.spawn(run_poll_loop(core, interval)));
        }

        self.running = true;
        tlog!("[rx] Receive worker started on {} ({:?} delivery)", label, mode);
        Ok(())
    }

    fn register_event_callback(&mut self) -> Result<(), IoError> {
        let driver = &self.core.driver;
        let id = self
            .core
            .channel
            .handle()
            .ok_or_else(|| IoError::configuration(driver.name(), "channel has no handle"))?;
        if !driver.supports_events() {
            return Err(IoError::unsupported(&self.core.device(id), "receive events"));
        }

        // Weak: the driver holds the callback, the core holds the driver
        let weak: Weak<ReceiveCore> = Arc::downgrade(&self.core);
        let callback: RcvEventCallback = Arc::new(move |event_id| {
            if let Some(core) = weak.upgrade() {
                core.process_rcv_event(event_id);
            }
        });
        driver.set_receive_event(id, Some(callback))?;
        self.event_channel = Some(id);
        Ok(())
    }

    /// Receive-event entry point for drivers that notify without a registered
    /// callback. No-op unless the delivery mode takes events, `id` is this
    /// worker's channel and the worker is running.
    pub fn process_rcv_event(&self, id: ChannelId) -> Option<DrainSummary> {
        if !self.options.delivery_mode.uses_events() {
            return None;
        }
        self.core.process_rcv_event(id)
    }

    /// Stop both delivery paths and wait for the poll loop to exit.
    pub async fn stop(&mut self) {
        self.core.request_stop();

        if let Some(id) = self.event_channel.take() {
            if let Err(e) = self.core.driver.set_receive_event(id, None) {
                tlog!("[rx] Failed to remove receive event for {}: {}", self.core.device(id), e);
            }
        }

        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }

        if self.running {
            tlog!("[rx] Receive worker stopped on {}", self.core.driver.name());
        }
        self.running = false;
    }

    /// Cancel the poll task at its next suspension point without waiting for it.
    pub fn abort(&mut self) {
        self.core.request_stop();
        if let Some(id) = self.event_channel.take() {
            let _ = self.core.driver.set_receive_event(id, None);
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        self.running = false;
    }

    /// Stop the worker, close the channel through the driver and empty the table.
    pub async fn close_channel(&mut self) -> Result<(), IoError> {
        self.stop().await;
        let closed = self.core.channel.close();
        let removed = self.core.table.clear()?;
        tlog!(
            "[rx] Channel {} closed, {} records dropped",
            closed.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            removed
        );
        match closed {
            Some(id) => self.core.driver.close(id),
            None => Ok(()),
        }
    }
}

impl Drop for ReceiveWorker {
    fn drop(&mut self) {
        if self.running {
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BitrateConfig, HwTimestamp, RawFrame, ReadOutcome, ScriptedDriver};
    use crate::receive::table::{KeyPolicy, MessageKey};
    use std::collections::VecDeque;
    use std::time::Instant;

    const CH: ChannelId = ChannelId(0x51);

    struct Rig {
        driver: Arc<ScriptedDriver>,
        worker: ReceiveWorker,
        view: FrameTableView,
        messages: mpsc::Receiver<WorkerMessage>,
    }

    fn rig_with(driver: ScriptedDriver, policy: KeyPolicy, options: ReceiveOptions) -> Rig {
        let driver = Arc::new(driver);
        let channel = SharedChannel::open(driver.as_ref(), CH, &BitrateConfig::new("f_clock_mhz=20")).unwrap();
        let table = FrameTable::new(policy);
        let view = table.view();
        let (worker, messages) = ReceiveWorker::new(driver.clone(), channel, table, options);
        Rig {
            driver,
            worker,
            view,
            messages,
        }
    }

    fn rig(options: ReceiveOptions) -> Rig {
        rig_with(ScriptedDriver::new(), KeyPolicy::Sequence, options)
    }

    /// Run one poll tick directly, as the loop would
    fn tick(rig: &Rig) -> Option<Result<DrainSummary, IoError>> {
        rig.worker.core.stop_flag.store(false, Ordering::Release);
        rig.worker.core.poll_once()
    }

    fn ids(view: &FrameTableView) -> Vec<u32> {
        view.snapshot().into_iter().map(|(_, r)| r.frame.id).collect()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[test]
    fn test_ok_ok_empty_stores_in_order() {
        let rig = rig(ReceiveOptions::default());
        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[1]), RawFrame::standard(0xB, &[2])]);
        rig.driver.push_status(CH, Status::QRCVEMPTY);

        let summary = tick(&rig).unwrap().unwrap();
        assert_eq!(summary.stored, 2);
        assert!(!summary.cleared);
        assert_eq!(summary.last_status, Status::QRCVEMPTY);
        assert_eq!(ids(&rig.view), vec![0xA, 0xB]);
        assert_eq!(rig.view.keys(), vec![MessageKey(0), MessageKey(1)]);
        assert!(rig.view.snapshot().iter().all(|(_, r)| r.receipt_count == 1));
    }

    #[test]
    fn test_frame_with_queue_empty_bit_is_kept() {
        let rig = rig(ReceiveOptions::default());
        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[])]);
        rig.driver.push(CH, ReadOutcome::last_frame(RawFrame::standard(0xB, &[]), None));
        rig.driver.push_frames(CH, [RawFrame::standard(0xC, &[])]);

        let summary = tick(&rig).unwrap().unwrap();
        assert_eq!(summary.stored, 2);
        assert_eq!(ids(&rig.view), vec![0xA, 0xB]);
        // The drain stopped on the combined status; 0xC waits for the next tick
        assert_eq!(rig.driver.pending(CH), 1);
    }

    #[test]
    fn test_fault_clears_table() {
        let mut rig = rig(ReceiveOptions::default());
        rig.driver.push_frames(CH, [RawFrame::standard(0x1, &[]), RawFrame::standard(0x2, &[])]);
        tick(&rig).unwrap().unwrap();
        assert_eq!(rig.view.len(), 2);

        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[])]);
        rig.driver.push_status(CH, Status::BUSOFF);
        rig.driver.push_frames(CH, [RawFrame::standard(0xB, &[])]);

        let summary = tick(&rig).unwrap().unwrap();
        assert!(summary.cleared);
        assert_eq!(summary.last_status, Status::BUSOFF);
        assert!(rig.view.is_empty());
        assert_eq!(rig.view.clear_count(), 1);
        assert_eq!(
            rig.messages.try_recv().unwrap(),
            WorkerMessage::TableCleared {
                channel: CH,
                status: Status::BUSOFF,
                removed: 3
            }
        );

        // Next tick repopulates; keys keep counting
        tick(&rig).unwrap().unwrap();
        assert_eq!(ids(&rig.view), vec![0xB]);
        assert_eq!(rig.view.keys(), vec![MessageKey(3)]);
    }

    #[test]
    fn test_fault_bits_with_queue_empty_still_clear() {
        let rig = rig(ReceiveOptions::default());
        rig.driver.push_frames(CH, [RawFrame::standard(0x1, &[])]);
        rig.driver.push_status(CH, Status::QRCVEMPTY.union(Status::BUSLIGHT));

        let summary = tick(&rig).unwrap().unwrap();
        assert!(summary.cleared);
        assert!(rig.view.is_empty());
    }

    #[test]
    fn test_timestamps_follow_capture_flag() {
        let rig = rig(ReceiveOptions::default());
        let ts = HwTimestamp { millis: 42, millis_overflow: 0, micros: 7 };
        rig.driver.push(CH, ReadOutcome::frame(RawFrame::standard(0x1, &[]), Some(ts)));
        tick(&rig).unwrap().unwrap();
        assert_eq!(rig.view.get(MessageKey(0)).unwrap().timestamp, None);

        rig.worker.set_read_timestamp(true);
        rig.driver.push(CH, ReadOutcome::frame(RawFrame::standard(0x2, &[]), Some(ts)));
        tick(&rig).unwrap().unwrap();
        assert_eq!(rig.view.get(MessageKey(1)).unwrap().timestamp, Some(ts));
    }

    /// Adapter that attaches a timestamp whether or not one was asked for
    struct StampingDriver {
        frames: Mutex<VecDeque<RawFrame>>,
    }

    impl DriverAdapter for StampingDriver {
        fn name(&self) -> &str {
            "stamping"
        }

        fn open(&self, _channel: ChannelId, _bitrate: &BitrateConfig) -> Result<(), IoError> {
            Ok(())
        }

        fn close(&self, _channel: ChannelId) -> Result<(), IoError> {
            Ok(())
        }

        fn read(&self, _channel: ChannelId, _with_timestamp: bool) -> ReadOutcome {
            match self.frames.lock().unwrap().pop_front() {
                Some(frame) => ReadOutcome::frame(frame, Some(HwTimestamp::from_micros(1_234))),
                None => ReadOutcome::empty(),
            }
        }
    }

    #[test]
    fn test_drain_drops_unrequested_timestamps() {
        let driver = Arc::new(StampingDriver {
            frames: Mutex::new(VecDeque::from([
                RawFrame::standard(0x1, &[]),
                RawFrame::standard(0x2, &[]),
            ])),
        });
        let channel = SharedChannel::open(driver.as_ref(), CH, &BitrateConfig::new("")).unwrap();
        let table = FrameTable::new(KeyPolicy::Sequence);
        let view = table.view();
        let (worker, _messages) =
            ReceiveWorker::new(driver.clone(), channel, table, ReceiveOptions::default());
        worker.core.stop_flag.store(false, Ordering::Release);

        worker.core.drain(CH).unwrap();
        assert_eq!(view.len(), 2);
        assert!(view.snapshot().iter().all(|(_, r)| r.timestamp.is_none()));

        worker.set_read_timestamp(true);
        driver.frames.lock().unwrap().push_back(RawFrame::standard(0x3, &[]));
        worker.core.drain(CH).unwrap();
        assert_eq!(
            view.get(MessageKey(2)).unwrap().timestamp,
            Some(HwTimestamp::from_micros(1_234))
        );
    }

    #[test]
    fn test_by_can_id_policy_counts_receipts() {
        let rig = rig_with(ScriptedDriver::new(), KeyPolicy::ByCanId, ReceiveOptions::default());
        rig.driver.push_frames(
            CH,
            [
                RawFrame::standard(0x100, &[1]),
                RawFrame::standard(0x200, &[1]),
                RawFrame::standard(0x100, &[2]),
            ],
        );
        tick(&rig).unwrap().unwrap();
        let snapshot = rig.view.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].1.frame.data, vec![2]);
        assert_eq!(snapshot[0].1.receipt_count, 2);
        assert_eq!(snapshot[1].1.receipt_count, 1);
    }

    #[test]
    fn test_not_working_skips_drain() {
        let rig = rig(ReceiveOptions::default());
        rig.driver.push_frames(CH, [RawFrame::standard(0x1, &[])]);
        rig.worker.channel().set_working(false);
        assert!(tick(&rig).is_none());
        assert_eq!(rig.driver.read_count(CH), 0);

        rig.worker.channel().set_working(true);
        assert_eq!(tick(&rig).unwrap().unwrap().stored, 1);
    }

    #[test]
    fn test_corrupt_frame_is_fatal_error() {
        let rig = rig(ReceiveOptions::default());
        let mut bad = RawFrame::standard(0x1, &[1, 2]);
        bad.dlc = 8;
        rig.driver.push_frames(CH, [bad]);
        let err = tick(&rig).unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("scripted(0x51)"));
    }

    #[test]
    fn test_ok_without_frame_is_fatal_error() {
        let rig = rig(ReceiveOptions::default());
        rig.driver.push_status(CH, Status::OK);
        assert!(tick(&rig).unwrap().unwrap_err().is_fatal());
    }

    #[test]
    fn test_event_for_other_channel_is_noop() {
        let mut rig = rig(ReceiveOptions {
            delivery_mode: DeliveryMode::Event,
            ..Default::default()
        });
        rig.worker.start().unwrap();
        rig.driver.push_frames(CH, [RawFrame::standard(0x1, &[])]);

        assert!(rig.worker.process_rcv_event(ChannelId(0x52)).is_none());
        assert_eq!(rig.driver.read_count(CH), 0);

        assert!(rig.driver.fire_event(CH));
        assert_eq!(ids(&rig.view), vec![0x1]);
        rig.worker.abort();
    }

    #[test]
    fn test_timer_mode_ignores_event_entry() {
        let rig = rig(ReceiveOptions::default());
        rig.worker.core.stop_flag.store(false, Ordering::Release);
        rig.driver.push_frames(CH, [RawFrame::standard(0x1, &[])]);

        assert!(rig.worker.process_rcv_event(CH).is_none());
        assert_eq!(rig.driver.read_count(CH), 0);
        assert!(rig.view.is_empty());

        // The poll path still picks the frame up
        assert_eq!(tick(&rig).unwrap().unwrap().stored, 1);
    }

    #[test]
    fn test_table_view_from_worker() {
        let rig = rig(ReceiveOptions::default());
        let view = rig.worker.table_view();
        rig.driver.push_frames(CH, [RawFrame::standard(0x1, &[]), RawFrame::standard(0x2, &[])]);
        tick(&rig).unwrap().unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.keys(), rig.view.keys());
    }

    #[test]
    fn test_event_mode_needs_driver_support() {
        let mut rig = rig_with(
            ScriptedDriver::without_events(),
            KeyPolicy::Sequence,
            ReceiveOptions {
                delivery_mode: DeliveryMode::Event,
                ..Default::default()
            },
        );
        let err = rig.worker.start().unwrap_err();
        assert!(matches!(err, IoError::Unsupported { .. }));
        assert_eq!(rig.worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_timer_mode_needs_runtime() {
        let mut rig = rig(ReceiveOptions::default());
        assert!(rig.worker.start().is_err());
        assert!(!rig.driver.has_event_callback(CH));
    }

    #[test]
    fn test_exit_process_is_opt_in() {
        assert_eq!(ReceiveOptions::default().fault_policy, FaultPolicy::IsolateChannel);
        assert_eq!(FaultPolicy::default(), FaultPolicy::IsolateChannel);
    }

    /// Set in the child run of `test_exit_process_policy_exits_with_fatal_code`
    const EXIT_CHILD_ENV: &str = "WIRETAP_RX_EXIT_PROCESS_CHILD";

    #[test]
    fn test_exit_process_policy_exits_with_fatal_code() {
        if std::env::var_os(EXIT_CHILD_ENV).is_some() {
            let mut rig = rig(ReceiveOptions {
                delivery_mode: DeliveryMode::Event,
                fault_policy: FaultPolicy::ExitProcess,
                ..Default::default()
            });
            rig.worker.start().unwrap();
            let mut bad = RawFrame::standard(0x1, &[1]);
            bad.dlc = 5;
            rig.driver.push_frames(CH, [bad]);
            rig.driver.fire_event(CH);
            // Only reached if the corrupt frame did not end the process
            std::process::exit(0);
        }

        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "receive::worker::tests::test_exit_process_policy_exits_with_fatal_code",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(EXIT_CHILD_ENV, "1")
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(output.status.code(), Some(FATAL_EXIT_CODE), "child stderr: {}", stderr);
        assert!(stderr.contains("terminating process"));
    }

    #[tokio::test]
    async fn test_timer_loop_drains_and_stops() {
        let mut rig = rig(ReceiveOptions {
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        });
        rig.worker.start().unwrap();
        assert_eq!(rig.worker.state(), WorkerState::Running);
        assert!(rig.worker.start().is_err());
        assert!(!rig.driver.has_event_callback(CH));

        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[]), RawFrame::standard(0xB, &[])]);
        let view = rig.view.clone();
        wait_until(|| view.len() == 2).await;
        assert_eq!(ids(&rig.view), vec![0xA, 0xB]);

        rig.worker.stop().await;
        assert_eq!(rig.worker.state(), WorkerState::Stopped);
        assert_eq!(
            rig.messages.recv().await.unwrap(),
            WorkerMessage::Ended {
                channel: CH,
                reason: "stopped".to_string()
            }
        );

        // No drains after stop
        let reads = rig.driver.read_count(CH);
        rig.driver.push_frames(CH, [RawFrame::standard(0xC, &[])]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rig.driver.read_count(CH), reads);
        assert_eq!(rig.view.len(), 2);
    }

    #[tokio::test]
    async fn test_working_toggle_pauses_and_resumes() {
        let mut rig = rig(ReceiveOptions {
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        });
        rig.worker.start().unwrap();
        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[])]);
        let view = rig.view.clone();
        wait_until(|| view.len() == 1).await;

        rig.worker.channel().set_working(false);
        rig.driver.push_frames(CH, [RawFrame::standard(0xB, &[])]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.view.len(), 1);
        assert_eq!(rig.driver.pending(CH), 1);
        assert_eq!(rig.worker.state(), WorkerState::Running);

        rig.worker.channel().set_working(true);
        wait_until(|| view.len() == 2).await;
        rig.worker.stop().await;
    }

    #[tokio::test]
    async fn test_isolate_channel_stops_worker_and_reports() {
        let mut rig = rig(ReceiveOptions {
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        });
        let mut bad = RawFrame::standard(0x1, &[]);
        bad.dlc = 3;
        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[]), bad]);
        rig.worker.start().unwrap();

        match rig.messages.recv().await.unwrap() {
            WorkerMessage::Fault { channel, error } => {
                assert_eq!(channel, CH);
                assert!(error.is_fatal());
            }
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(matches!(rig.worker.state(), WorkerState::Faulted(_)));
        // The record stored before the corrupt frame stays visible
        assert_eq!(ids(&rig.view), vec![0xA]);

        rig.driver.push_frames(CH, [RawFrame::standard(0xB, &[])]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rig.view.len(), 1);

        // A faulted worker can be started again without an explicit stop
        rig.worker.start().unwrap();
        assert_eq!(rig.worker.state(), WorkerState::Running);
        let view = rig.view.clone();
        wait_until(|| view.len() == 2).await;
        assert_eq!(ids(&rig.view), vec![0xA, 0xB]);
        rig.worker.stop().await;
        assert_eq!(rig.worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_close_channel_releases_everything() {
        let mut rig = rig(ReceiveOptions {
            poll_interval: Duration::from_millis(2),
            delivery_mode: DeliveryMode::Both,
            ..Default::default()
        });
        rig.worker.start().unwrap();
        assert!(rig.driver.has_event_callback(CH));
        rig.driver.push_frames(CH, [RawFrame::standard(0xA, &[])]);
        let view = rig.view.clone();
        wait_until(|| view.len() == 1).await;

        rig.worker.close_channel().await.unwrap();
        assert!(rig.view.is_empty());
        assert!(!rig.driver.is_open(CH));
        assert!(!rig.driver.has_event_callback(CH));
        assert_eq!(rig.worker.channel().handle(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_event_and_poll_never_interleave() {
        const FRAMES: u32 = 5_000;
        let mut rig = rig(ReceiveOptions {
            poll_interval: Duration::from_millis(1),
            delivery_mode: DeliveryMode::Both,
            ..Default::default()
        });
        rig.worker.start().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let firers: Vec<_> = (0..3)
            .map(|_| {
                let driver = rig.driver.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        driver.fire_event(CH);
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        // Feed in bursts so both paths find work while the others are draining
        for chunk in (0..FRAMES).collect::<Vec<_>>().chunks(250) {
            let frames: Vec<RawFrame> = chunk
                .iter()
                .map(|i| RawFrame::extended(*i, &i.to_le_bytes()))
                .collect();
            rig.driver.push_frames(CH, frames);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let view = rig.view.clone();
        wait_until(|| view.len() == FRAMES as usize).await;
        stop.store(true, Ordering::Relaxed);
        for f in firers {
            f.join().unwrap();
        }
        rig.worker.stop().await;

        let snapshot = rig.view.snapshot();
        assert_eq!(snapshot.len(), FRAMES as usize);
        for (i, (key, record)) in snapshot.iter().enumerate() {
            assert_eq!(key.0, i as u64);
            assert_eq!(record.frame.id, i as u32);
        }
        assert_eq!(rig.driver.pending(CH), 0);
    }
}
