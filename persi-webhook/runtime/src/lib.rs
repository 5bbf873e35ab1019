#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use persi_webhook_core as core;
pub use persi_webhook_k8s_api as k8s;

mod admission;
mod args;
mod metrics;

pub use self::{admission::Admission, args::Args, metrics::AdmissionMetrics};
