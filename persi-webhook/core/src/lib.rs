#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Mounts persistent volumes declared by service bindings into application
//! pods.
//!
//! A pod declares its bindings through the `VCAP_SERVICES` environment
//! variable. The [`Engine`] decodes the payload ([`binding`]), appends volumes
//! and mounts to a copy of the pod ([`plan`]) and describes the result as a
//! JSON patch relative to the original pod ([`patch`]).

pub mod binding;
mod engine;
pub mod patch;
pub mod plan;

pub use self::{
    binding::{BindingSet, DecodeError, IdentitySchema, MountSpec, ServiceBinding},
    engine::{Engine, Error},
    patch::{DiffError, Response, Status},
    plan::{Planned, Planner, Policy},
};
pub use json_patch::Patch;

/// The environment variable carrying service bindings.
pub const VCAP_SERVICES: &str = "VCAP_SERVICES";

/// The binding type handled by this webhook.
pub const BINDING_TYPE: &str = "eirini-persi";
