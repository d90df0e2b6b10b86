// src/lib.rs
//
// WireTAP receive pipeline.
//
// A background worker per CAN / CAN FD channel drains the hardware receive
// queue through a `DriverAdapter` and publishes each frame into a
// `FrameTable` that display and logging layers read through a
// `FrameTableView`.
//
//   let table = FrameTable::new(KeyPolicy::Sequence);
//   let view = table.view();
//   let channel = SharedChannel::open(driver.as_ref(), id, &bitrate)?;
//   let (mut worker, messages) = ReceiveWorker::new(driver, channel, table, options);
//   worker.start()?;

pub mod logging;

pub mod io;
pub mod receive;
pub mod settings;

pub use io::{BitrateConfig, ChannelId, DriverAdapter, IoError, RawFrame, ReadOutcome, Status};
pub use receive::{
    DeliveryMode, FaultPolicy, FrameRecord, FrameTable, FrameTableView, KeyPolicy, MessageKey,
    ReceiveOptions, ReceiveWorker, SharedChannel, WorkerMessage, WorkerState,
};
pub use settings::{load_settings, ReceiverSettings};
