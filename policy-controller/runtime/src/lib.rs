#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gatekeeper_policy_controller_core as core;
pub use gatekeeper_policy_controller_k8s_api as k8s;
pub use gatekeeper_policy_controller_k8s_controllers as controllers;
pub use gatekeeper_policy_controller_k8s_watch as watch;

mod admission;
mod args;
mod certs;
mod metrics;
mod validation;

pub use self::args::Args;
