use json_patch::{Patch, PatchOperation};
use persi_webhook_k8s_api::Pod;

/// The engine's answer to an admission request.
#[derive(Clone, Debug)]
pub struct Response {
    /// The request's correlation token, passed through unchanged.
    pub uid: String,
    pub allowed: bool,
    pub status: Option<Status>,
    pub patch: Patch,
}

/// Explains why a request was denied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("failed to serialize pod: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("patch operation modifies {0}, which volume mounting may not change")]
    OutOfScope(String),
}

/// Computes the JSON patch that turns `original` into `mutated`.
///
/// Only the pod's volumes, init containers, security context and container
/// volume mounts may differ.
pub fn diff(original: &Pod, mutated: &Pod) -> Result<Patch, DiffError> {
    let original = serde_json::to_value(original)?;
    let mutated = serde_json::to_value(mutated)?;
    let patch = json_patch::diff(&original, &mutated);

    if let Some(path) = patch.0.iter().map(path).find(|p| !in_scope(p)) {
        return Err(DiffError::OutOfScope(path.to_string()));
    }

    Ok(patch)
}

fn path(op: &PatchOperation) -> &str {
    match op {
        PatchOperation::Add(op) => op.path.as_str(),
        PatchOperation::Remove(op) => op.path.as_str(),
        PatchOperation::Replace(op) => op.path.as_str(),
        PatchOperation::Move(op) => op.path.as_str(),
        PatchOperation::Copy(op) => op.path.as_str(),
        PatchOperation::Test(op) => op.path.as_str(),
    }
}

fn in_scope(path: &str) -> bool {
    let mut tokens = path.split('/').skip(1);
    match (tokens.next(), tokens.next()) {
        (Some("spec"), Some("volumes" | "initContainers" | "securityContext")) => true,
        (Some("spec"), Some("containers")) => matches!(
            (tokens.next(), tokens.next()),
            (Some(idx), Some("volumeMounts")) if idx.parse::<usize>().is_ok()
        ),
        _ => false,
    }
}

// === impl Response ===

impl Response {
    /// Allows the request, applying `patch` (which may be empty).
    pub fn patch(uid: impl Into<String>, patch: Patch) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            status: None,
            patch,
        }
    }

    pub fn bad_request(uid: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::deny(uid, 400, error)
    }

    pub fn internal_error(uid: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::deny(uid, 500, error)
    }

    fn deny(uid: impl Into<String>, code: u16, error: impl std::fmt::Display) -> Self {
        Self {
            uid: uid.into(),
            allowed: false,
            status: Some(Status {
                code,
                message: error.to_string(),
            }),
            patch: Patch(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patch.0.is_empty()
    }
}
