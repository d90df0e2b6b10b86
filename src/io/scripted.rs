// src/io/scripted.rs
//
// Scripted driver adapter.
//
// Plays back a queue of read outcomes per channel, then reports an empty
// receive queue. Used by the test suite as the fake hardware and by the
// monitor CLI's --simulate mode. Supports receive events: `fire_event`
// invokes the callback registered for a channel on the caller's thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::io::bitrate::BitrateConfig;
use crate::io::driver::{DriverAdapter, RcvEventCallback};
use crate::io::error::IoError;
use crate::io::types::{ChannelId, HwTimestamp, RawFrame, ReadOutcome, Status};

#[derive(Default)]
struct ScriptedChannel {
    open: bool,
    bitrate: Option<BitrateConfig>,
    queue: VecDeque<ReadOutcome>,
    reads: u64,
}

/// In-memory driver that replays scripted read outcomes.
pub struct ScriptedDriver {
    channels: Mutex<HashMap<ChannelId, ScriptedChannel>>,
    callbacks: Mutex<HashMap<ChannelId, RcvEventCallback>>,
    events: bool,
    started: Instant,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    /// Driver with receive-event support
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            events: true,
            started: Instant::now(),
        }
    }

    /// Driver that only supports polling
    pub fn without_events() -> Self {
        Self {
            events: false,
            ..Self::new()
        }
    }

    /// Queue one outcome for the next read on `channel`
    pub fn push(&self, channel: ChannelId, outcome: ReadOutcome) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.entry(channel).or_default().queue.push_back(outcome);
    }

    /// Queue a run of frames, each delivered with status OK
    pub fn push_frames<I>(&self, channel: ChannelId, frames: I)
    where
        I: IntoIterator<Item = RawFrame>,
    {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = channels.entry(channel).or_default();
        for frame in frames {
            entry.queue.push_back(ReadOutcome::frame(frame, None));
        }
    }

    /// Queue a bare status (fault or explicit queue-empty)
    pub fn push_status(&self, channel: ChannelId, status: Status) {
        self.push(channel, ReadOutcome::status(status));
    }

    /// Outcomes still waiting to be read
    pub fn pending(&self, channel: ChannelId) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(&channel).map(|c| c.queue.len()).unwrap_or(0)
    }

    /// Number of read calls made on `channel`
    pub fn read_count(&self, channel: ChannelId) -> u64 {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(&channel).map(|c| c.reads).unwrap_or(0)
    }

    pub fn is_open(&self, channel: ChannelId) -> bool {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(&channel).map(|c| c.open).unwrap_or(false)
    }

    /// Bitrate string the channel was last opened with
    pub fn bitrate(&self, channel: ChannelId) -> Option<BitrateConfig> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(&channel).and_then(|c| c.bitrate.clone())
    }

    pub fn has_event_callback(&self, channel: ChannelId) -> bool {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.contains_key(&channel)
    }

    /// Raise a receive event for `channel`. Returns false if no callback is registered.
    pub fn fire_event(&self, channel: ChannelId) -> bool {
        // Clone out of the lock: the callback reads back through this driver
        let callback = {
            let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
            callbacks.get(&channel).cloned()
        };
        match callback {
            Some(cb) => {
                cb(channel);
                true
            }
            None => false,
        }
    }
}

impl DriverAdapter for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, channel: ChannelId, bitrate: &BitrateConfig) -> Result<(), IoError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = channels.entry(channel).or_default();
        if entry.open {
            return Err(IoError::connection(
                &format!("scripted({})", channel),
                "channel is already initialized",
            ));
        }
        entry.open = true;
        entry.bitrate = Some(bitrate.clone());
        Ok(())
    }

    fn close(&self, channel: ChannelId) -> Result<(), IoError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        match channels.get_mut(&channel) {
            Some(entry) if entry.open => {
                entry.open = false;
                Ok(())
            }
            _ => Err(IoError::connection(
                &format!("scripted({})", channel),
                "channel is not initialized",
            )),
        }
    }

    fn read(&self, channel: ChannelId, with_timestamp: bool) -> ReadOutcome {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = channels.get_mut(&channel) else {
            return ReadOutcome::status(Status::INITIALIZE);
        };
        entry.reads += 1;
        if !entry.open {
            return ReadOutcome::status(Status::INITIALIZE);
        }

        let mut outcome = entry.queue.pop_front().unwrap_or_else(ReadOutcome::empty);
        if !with_timestamp {
            outcome.timestamp = None;
        } else if outcome.frame.is_some() && outcome.timestamp.is_none() {
            let elapsed = self.started.elapsed().as_micros() as u64;
            outcome.timestamp = Some(HwTimestamp::from_micros(elapsed));
        }
        outcome
    }

    fn supports_events(&self) -> bool {
        self.events
    }

    fn set_receive_event(
        &self,
        channel: ChannelId,
        callback: Option<RcvEventCallback>,
    ) -> Result<(), IoError> {
        if !self.events {
            return Err(IoError::unsupported(
                &format!("scripted({})", channel),
                "receive events",
            ));
        }
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        match callback {
            Some(cb) => {
                callbacks.insert(channel, cb);
            }
            None => {
                callbacks.remove(&channel);
            }
        }
        Ok(())
    }
}
