//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: pulls orchestration work items and replays them
//! - `worker`: pulls activity work items and runs the registered handlers

mod orchestration;
mod worker;
