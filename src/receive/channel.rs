// src/receive/channel.rs
//
// Channel handle shared between the owner (open/close/reassign), the poll
// loop and the receive-event path.
//
// All three go through one mutex. The receive paths hold it for the whole
// drain, so a close or reassign waits for the drain in progress and no drain
// ever sees a channel half way through being reconfigured.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::io::{BitrateConfig, ChannelId, DriverAdapter, IoError};

/// Snapshot of a channel's handle and working flag
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelHandle {
    /// Hardware handle; `None` once the channel is closed
    pub id: Option<ChannelId>,
    /// Receive paths only drain while this is set
    pub working: bool,
}

/// Lock-guarded channel handle. Cloning shares the same state.
#[derive(Clone, Debug, Default)]
pub struct SharedChannel {
    inner: Arc<Mutex<ChannelHandle>>,
}

impl SharedChannel {
    /// Channel with a handle but not yet working
    pub fn new(id: ChannelId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelHandle {
                id: Some(id),
                working: false,
            })),
        }
    }

    /// Open `id` through the driver and return a working channel
    pub fn open(
        driver: &dyn DriverAdapter,
        id: ChannelId,
        bitrate: &BitrateConfig,
    ) -> Result<Self, IoError> {
        driver.open(id, bitrate)?;
        let channel = Self::new(id);
        channel.set_working(true);
        Ok(channel)
    }

    // The handle is plain data, so a panic in a drain leaves nothing half-written
    fn lock(&self) -> MutexGuard<'_, ChannelHandle> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ChannelHandle {
        *self.lock()
    }

    pub fn handle(&self) -> Option<ChannelId> {
        self.lock().id
    }

    pub fn is_working(&self) -> bool {
        self.lock().working
    }

    pub fn set_working(&self, working: bool) {
        self.lock().working = working;
    }

    /// Point the channel at a different hardware handle. Waits for any drain in progress.
    pub fn reassign(&self, id: ChannelId) {
        self.lock().id = Some(id);
    }

    /// Invalidate the handle and stop work. Returns the handle that was held.
    pub fn close(&self) -> Option<ChannelId> {
        let mut guard = self.lock();
        guard.working = false;
        guard.id.take()
    }

    /// Poll path: run `f` under the lock if the channel has a handle and is working.
    pub(crate) fn with_active<R>(&self, f: impl FnOnce(ChannelId) -> R) -> Option<R> {
        let guard = self.lock();
        match *guard {
            ChannelHandle {
                id: Some(id),
                working: true,
            } => Some(f(id)),
            _ => None,
        }
    }

    /// Event path: run `f` under the lock if `id` is the channel's current handle.
    pub(crate) fn with_matching<R>(&self, id: ChannelId, f: impl FnOnce(ChannelId) -> R) -> Option<R> {
        let guard = self.lock();
        if guard.id == Some(id) {
            Some(f(id))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ScriptedDriver;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const CH: ChannelId = ChannelId(0x51);

    #[test]
    fn test_active_requires_handle_and_working() {
        let channel = SharedChannel::new(CH);
        assert_eq!(channel.with_active(|id| id), None);

        channel.set_working(true);
        assert_eq!(channel.with_active(|id| id), Some(CH));

        assert_eq!(channel.close(), Some(CH));
        assert_eq!(channel.with_active(|id| id), None);
        assert_eq!(channel.snapshot(), ChannelHandle::default());
    }

    #[test]
    fn test_matching_ignores_other_handles() {
        let channel = SharedChannel::new(CH);
        assert_eq!(channel.with_matching(ChannelId(0x52), |id| id), None);
        assert_eq!(channel.with_matching(CH, |id| id), Some(CH));

        channel.reassign(ChannelId(0x52));
        assert_eq!(channel.with_matching(CH, |id| id), None);
        assert_eq!(channel.handle(), Some(ChannelId(0x52)));
    }

    #[test]
    fn test_open_goes_through_driver() {
        let driver = ScriptedDriver::new();
        let channel = SharedChannel::open(&driver, CH, &BitrateConfig::new("x")).unwrap();
        assert!(channel.is_working());
        assert!(driver.is_open(CH));
        assert!(SharedChannel::open(&driver, CH, &BitrateConfig::new("x")).is_err());
    }

    #[test]
    fn test_close_waits_for_drain_in_progress() {
        let channel = SharedChannel::new(CH);
        channel.set_working(true);
        let in_drain = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let drain_channel = channel.clone();
        let in_drain_t = in_drain.clone();
        let finished_t = finished.clone();
        let drainer = std::thread::spawn(move || {
            drain_channel.with_active(|_| {
                in_drain_t.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                finished_t.store(true, Ordering::SeqCst);
            });
        });

        while !in_drain.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        channel.close();
        // close() could only take the lock after the drain released it
        assert!(finished.load(Ordering::SeqCst));
        drainer.join().unwrap();
    }
}
