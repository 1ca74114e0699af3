//! # remux-supervisor — process supervision core for a media-remuxing
//! control plane
//!
//! Manages a fleet of long-running child processes (media remuxers) on
//! behalf of tenants and administrators: launches them, restarts them on
//! failure with cooldown, enforces per-tenant concurrency quotas across two
//! lifecycle phases, tears them down on deletion, and exposes aggregated
//! per-process log buffers.
//!
//! ## Architecture
//!
//! Six components, leaf-first, with the supervisor owning all mutable
//! state:
//! ```text
//!                    ┌───────────────────────────────────────┐
//!  Add/Remove/     → │          Supervisor (C6)               │
//!  UpdateLimits      │  ┌──────────┐ ┌───────────┐ ┌────────┐ │
//!                    │  │Scheduler │ │ Slot Pools│ │  Live  │ │
//!                    │  │   (C2)   │ │    (C3)   │ │ table  │ │
//!                    │  └──────────┘ └───────────┘ └────────┘ │
//!                    └───────────────────┬─────────────────────┘
//!                                         │ owns
//!                              ┌──────────▼──────────┐
//!                              │  Managed Process (C5) │
//!                              │  pipes, readiness,    │
//!                              │  supervise/reap loop  │
//!                              └──────────┬────────────┘
//!                                         │ writes
//!                              ┌──────────▼──────────┐
//!                              │ Ring log buffer (C4)  │
//!                              └───────────────────────┘
//! ```
//! [`supervisor::SimpleSupervisor`] and [`supervisor::DualPhaseSupervisor`]
//! share this machinery; the dual-phase variant additionally gates launches
//! on preflight/onflight capacity (C3) before admitting them.

#![warn(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod supervisor;
pub mod types;

pub mod observability;

pub use types::{Error, Result, SupervisorConfig};
