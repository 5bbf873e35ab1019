#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::api::{
    self,
    core::v1::{
        Container, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec,
        SecurityContext, Volume, VolumeMount,
    },
};
pub use kube::core::{admission, DynamicObject, ObjectMeta, Resource, ResourceExt};
