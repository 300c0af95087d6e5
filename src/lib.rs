//! CPU thread coordination for the Ember emulator.
//!
//! This crate owns the machinery that lets many vCPU threads and arbitrary
//! host threads cooperate on shared machine state:
//!
//! - A registry of live vCPUs with stable index assignment ([`CpuRegistry`])
//! - Per-vCPU work queues and the `run_on_cpu` dispatch family
//! - The exclusive execution barrier, which briefly halts every vCPU so one
//!   thread can mutate shared state with nothing else in flight
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  CpuRegistry                                               │
//! │  - ordered list of Arc<Vcpu>, index assignment             │
//! │  - pending_cpus + exclusive/resume condvars (barrier)      │
//! └────────────────────────────────────────────────────────────┘
//!        │ run_on_cpu / async_run_on_cpu / async_safe_run_on_cpu
//!        ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  Vcpu                                                      │
//! │  - work queue (mutex + condvar), host kick callback        │
//! │  - running / has_waiter flags published around exec        │
//! │    windows (exec_start / exec_end)                         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! vCPU threads bracket guest execution with [`CpuRegistry::exec_start`] and
//! [`CpuRegistry::exec_end`] and drain their queue at safe points with
//! [`CpuRegistry::drain_work`]. The barrier piggybacks on the same
//! `running` flags: `start_exclusive` counts the vCPUs it must wait for, kicks
//! them, and sleeps until each one leaves its window or parks itself.
//!
//! The big emulator lock (BQL) is owned by the host main loop; this crate
//! acquires and releases it only at the dispatch boundaries (see [`bql`]) and
//! never holds it across a sleep.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod bql;
mod exclusive;
mod registry;
mod stats;
mod vcpu;
mod work;

pub use exclusive::ExclusiveGuard;
pub use registry::{CpuRegistry, RegistryGuard};
pub use stats::CoordStats;
pub use vcpu::{current_cpu, set_current_cpu, Vcpu};
