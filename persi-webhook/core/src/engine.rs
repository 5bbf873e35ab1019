use crate::{
    binding::{self, DecodeError, IdentitySchema},
    patch::{self, DiffError, Response},
    plan::{Planned, Planner},
};
use json_patch::Patch;
use persi_webhook_k8s_api::Pod;
use tracing::{debug, error, info};

/// Mutates application pods so that they mount their bound volumes.
///
/// An engine holds only its configuration, so it may be cloned and shared
/// freely between requests.
#[derive(Clone, Debug, Default)]
pub struct Engine {
    schema: IdentitySchema,
    planner: Planner,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Diff(#[from] DiffError),
}

impl Engine {
    pub fn new(schema: IdentitySchema, planner: Planner) -> Self {
        Self { schema, planner }
    }

    pub fn schema(&self) -> IdentitySchema {
        self.schema
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Builds the admission response for `pod`.
    ///
    /// Invalid binding payloads are rejected as bad requests; a patch that
    /// cannot be computed is an internal error. Otherwise the request is
    /// allowed with the (possibly empty) patch.
    pub fn mutate(&self, uid: &str, pod: &Pod) -> Response {
        match self.patch(pod) {
            Ok(patch) => Response::patch(uid, patch),
            Err(Error::Decode(error)) => {
                info!(%uid, %error, "Rejecting pod with invalid bindings");
                Response::bad_request(uid, error)
            }
            Err(Error::Diff(error)) => {
                error!(%uid, %error, "Failed to compute pod patch");
                Response::internal_error(uid, error)
            }
        }
    }

    /// Computes the patch that mounts `pod`'s bound volumes, leaving `pod`
    /// untouched.
    pub fn patch(&self, pod: &Pod) -> Result<Patch, Error> {
        let mut mutated = pod.clone();
        let planned = self.apply(&mut mutated)?;
        if planned.added == 0 {
            return Ok(Patch(Vec::new()));
        }
        Ok(patch::diff(pod, &mutated)?)
    }

    /// Mounts the volumes bound to the first container that declares
    /// bindings.
    pub fn apply(&self, pod: &mut Pod) -> Result<Planned, DecodeError> {
        let (container, bindings) = match binding::find(pod) {
            Some((idx, payload)) => (idx, binding::decode(payload, self.schema)?),
            None => {
                debug!("No service bindings");
                return Ok(Planned::default());
            }
        };
        debug!(container, bindings = bindings.len(), "Decoded service bindings");

        let planned = self.planner.apply(&bindings, pod, container);
        debug!(added = planned.added, skipped = planned.skipped, "Planned mounts");
        Ok(planned)
    }
}
