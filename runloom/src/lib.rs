//! ```text
//! Coordinator::submit ──► StateStore (run: pending) ──► WorkQueue
//!                                                          │
//!            Worker ◄── claim ────────────────────────────┘
//!              │
//!              ├─► AttemptLedger (one in-flight attempt per run)
//!              ├─► AgentLoop ─► Provider / Tools
//!              ├─► GraphEngine ─► Checkpoints ─► resume
//!              └─► EventSink (generate / tool / retry / checkpoint / …)
//!
//!            Sweeper closes attempts of lost workers; over-delivered
//!            tasks park in the DLQ and their runs go dead-letter.
//! ```
//!
//! Runloom is a distributed run coordinator for agent workloads: a durable
//! submit/claim/complete/retry lifecycle over a work queue, a state store,
//! an attempt ledger, a checkpoint-driven graph resume engine, and an
//! ordered cognitive event stream.

pub mod agent;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod graph;
pub mod intervention;
pub mod ledger;
pub mod observe;
pub mod queue;
pub mod registry;
pub mod store;
