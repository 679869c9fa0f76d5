//! fpmgrd - Flexible Parser configuration worker for the PFE driver.
//!
//! Owns the rule/table database, the DMEM window, and the bridge
//! instance, and processes FCI command frames strictly sequentially in
//! one worker task.

mod worker;

pub use worker::{submit, FciReply, FciRequest, FciWorker, FpCommandKind, WorkerConfig};
