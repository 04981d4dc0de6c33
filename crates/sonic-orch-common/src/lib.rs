//! Common orchestration abstractions for SONiC.
//!
//! This crate provides the core traits and types used by orchestration
//! daemons in the SONiC control plane:
//!
//! - [`Orch`]: Base trait for orchestration agents
//! - [`Consumer`]: Per-table queue of change-feed entries with SET/DEL
//!   de-duplication
//! - [`TaskStatus`]: Result type for task processing
//!
//! # Architecture
//!
//! 1. A change-detection layer writes `[key, op, field, value, ...]`
//!    entries into a per-table change feed
//! 2. The daemon pops entries and hands them to the owning Orch's Consumers
//! 3. The daemon loop calls [`Orch::do_task`], which drains the Consumers
//!    and applies the changes
//! 4. Entries that failed with a retryable error are put back with
//!    [`Consumer::retry`]
//!
//! # Example
//!
//! ```ignore
//! use sonic_orch_common::{Consumer, Orch, TaskStatus};
//!
//! struct MyOrch {
//!     consumer: Consumer,
//! }
//!
//! #[async_trait]
//! impl Orch for MyOrch {
//!     fn name(&self) -> &str { "MyOrch" }
//!
//!     async fn do_task(&mut self) {
//!         for entry in self.consumer.drain() {
//!             let status = match self.process_entry(&entry).await {
//!                 Ok(()) => TaskStatus::Success,
//!                 Err(e) => e.to_status(),
//!             };
//!             if status.is_retryable() {
//!                 self.consumer.retry(entry);
//!             }
//!         }
//!     }
//! }
//! ```

mod consumer;
mod orch;
mod task;

pub use consumer::{Consumer, ConsumerConfig, FieldValue, KeyOpFieldsValues, Operation};
pub use orch::Orch;
pub use task::{TaskError, TaskResult, TaskStatus};
