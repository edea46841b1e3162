//! Dynamic watch management.
//!
//! Controllers declare the kinds they want watched through [`Registrar`]
//! handles; a single control loop reconciles that intent against the
//! running informer fabric, filtering through API discovery and restarting
//! the fabric only when the watched set actually changes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod discovery;
mod fabric;
mod manager;
mod registrar;

#[cfg(test)]
mod tests;

pub use self::{
    discovery::{ApiServerDiscovery, Discovery, DiscoveryError},
    fabric::{
        FabricFactory, FabricHandle, FabricPlan, KubeFabricFactory, RegisterFn, ResourceEvent,
    },
    manager::{Manager, PauseError},
    registrar::Registrar,
};
