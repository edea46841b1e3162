//! Reconcilers bridging cluster state into the decision engine.
//!
//! The template controller installs constraint kinds and their watches; the
//! constraint controller mirrors policy instances with finalizer discipline;
//! the sync controller mirrors configured data kinds; the config controller
//! maintains the shared exclusion/trace state and the sync roster.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod constraint;
mod metrics;
mod sync;
mod template;

#[cfg(test)]
mod testing;

pub use self::{
    config::{ConfigController, ConfigState, SharedConfigState, PROCESS_STAR, PROCESS_WEBHOOK},
    constraint::{ConstraintController, CONSTRAINT_FINALIZER},
    metrics::{MetricsCache, SharedMetricsCache, SyncMetrics, SyncStatus},
    sync::SyncController,
    template::TemplateController,
};
