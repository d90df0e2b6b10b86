// src/receive/mod.rs
//
// Receive pipeline: channel handle, frame table and the worker that fills it.

mod channel;
mod table;
mod worker;

pub use channel::{ChannelHandle, SharedChannel};
pub use table::{FrameRecord, FrameTable, FrameTableView, KeyPolicy, MessageKey};
pub use worker::{
    DeliveryMode, DrainSummary, FaultPolicy, ReceiveOptions, ReceiveWorker, WorkerMessage,
    WorkerState, DEFAULT_POLL_INTERVAL, FATAL_EXIT_CODE,
};
