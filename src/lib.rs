//! # rktpod
//!
//! **Single-host multi-container pod supervisor**
//!
//! rktpod reads a declarative pod description (docker-compose YAML dialect
//! or native JSON), resolves it into an effective model, fetches or builds
//! the required images, launches the pod on the external `rkt` runtime,
//! aggregates in-pod health checks and optionally registers the pod as a
//! Consul service fed by those aggregated health reports.
//!
//! # Architecture Overview
//!
//! ```text
//! descriptor file ──▶ descriptor::Descriptors ──▶ loader::Loader ──▶ pod::Pod
//!                        (normalize, extends)        │    ▲
//!                                                    │    └── image::Images (rkt fetch/build)
//!                                                    ▼
//!                                         launcher::PodLauncher
//!                                   prepare → run → await-ready → listener
//!                                                    │
//!                       consul::ConsulLifecycle ◀────┘
//!                            │          ▲
//!                            ▼          │ aggregated reports
//!                    consul::ConsulClient ◀── health::HealthChecks
//! ```
//!
//! # Lifecycle Guarantees
//!
//! - The launcher terminates its lifecycle listener exactly once per
//!   start/stop cycle, from whichever of pod-exit or `stop` happens first.
//! - The health aggregator's status is always the worst currently-known
//!   per-check status; stopping it emits exactly one final critical report.
//! - All child processes run in fresh process groups so teardown can kill
//!   stragglers without touching the supervisor itself.

mod constants;
mod error;
mod substitution;

pub mod consul;
pub mod descriptor;
pub mod health;
pub mod image;
pub mod launcher;
pub mod loader;
pub mod pod;

pub use error::{Error, Location, Result};
pub use substitution::Substitutes;
