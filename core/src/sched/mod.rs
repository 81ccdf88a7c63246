//! # Scheduling Module
//!
//! Everything between "a transaction exists" and "a worker is driving it":
//! the crawler that activates eligible work, the dispatcher that owns the
//! per-contract queues and worker leases, and the worker pool itself.
//!
//! ## Architecture
//!
//! ```text
//! crawler.rs    — periodic PENDING → ACTIVATED scan, per-contract FIFO
//! dispatcher.rs — per-contract queues, round-robin fairness, leases,
//!                 heartbeats, WorkerLost reclaim
//! worker.rs     — the fixed fleet of consensus workers
//! ```
//!
//! ## The one invariant that matters
//!
//! At most one transaction per contract is ever in flight. The dispatcher
//! enforces it with an in-flight slot per contract, checked under the same
//! lock that pops the queue, and backed by the store's CAS so a worker
//! that lost its lease cannot sneak a stale transition in afterwards.

pub mod crawler;
pub mod dispatcher;
pub mod worker;

pub use crawler::Crawler;
pub use dispatcher::{DispatchError, Dispatcher, Lease};
pub use worker::WorkerPool;
