//! Core decision-engine interface.
//!
//! The policy evaluator itself is an external collaborator. Everything in
//! this system depends on it only through the [`Engine`] trait and the
//! review types defined here.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod engine;
mod review;

pub use self::{
    engine::{Engine, EngineError, Target, Template},
    review::{
        ConstraintRef, EnforcementAction, ResponseClass, Responses, ReviewOptions, ReviewRequest,
        ReviewResult, UnsupportedEnforcementAction,
    },
};
