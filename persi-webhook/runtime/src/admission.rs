use crate::{
    core::{self, Engine},
    k8s::{Labels, Pod, Selector},
    metrics::{AdmissionMetrics, Outcome},
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{core::DynamicObject, Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Serves the mutating admission webhook for pods.
#[derive(Clone)]
pub struct Admission {
    engine: Engine,
    selector: Selector,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    admission.metrics.record(Outcome::Invalid);
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(&req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    admission.metrics.record(Outcome::Invalid);
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(engine: Engine, selector: Selector, metrics: AdmissionMetrics) -> Self {
        Self {
            engine,
            selector,
            metrics,
        }
    }

    fn admit(&self, req: &AdmissionRequest) -> AdmissionResponse {
        if !is_kind::<Pod>(req) {
            self.metrics.record(Outcome::Invalid);
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        let pod = match parse_pod(req) {
            Ok(pod) => pod,
            Err(error) => {
                info!(uid = %req.uid, %error, "Failed to decode pod");
                self.metrics.record(Outcome::Rejected);
                return deny(
                    req,
                    400,
                    format_args!("no pod could be decoded from the request: {error}"),
                );
            }
        };

        let ns = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        if !self
            .selector
            .matches(&Labels::from(pod.metadata.labels.clone()))
        {
            debug!(%ns, %name, "Not an application pod");
            self.metrics.record(Outcome::Ineligible);
            return AdmissionResponse::from(req);
        }

        let rsp = self.engine.mutate(&req.uid, &pod);
        if let Some(core::Status { code, message }) = rsp.status {
            info!(%ns, %name, code, %message, "Denied");
            self.metrics.record(Outcome::Rejected);
            return deny(req, code, message);
        }

        if rsp.is_empty() {
            debug!(%ns, %name, "No volumes to mount");
            self.metrics.record(Outcome::Unchanged);
            return AdmissionResponse::from(req);
        }

        let ops = rsp.patch.0.len();
        match AdmissionResponse::from(req).with_patch(rsp.patch) {
            Ok(patched) => {
                info!(%ns, %name, ops, "Mounting bound volumes");
                self.metrics.patched(ops);
                patched
            }
            Err(error) => {
                warn!(%ns, %name, %error, "Failed to encode patch");
                self.metrics.record(Outcome::Rejected);
                deny(req, 500, error)
            }
        }
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

/// Denies the request with an HTTP-style status code.
fn deny(req: &AdmissionRequest, code: u16, message: impl ToString) -> AdmissionResponse {
    let mut rsp = AdmissionResponse::from(req).deny(message);
    rsp.result.code = code;
    rsp.result.reason = match code {
        400 => "BadRequest",
        _ => "InternalError",
    }
    .to_string();
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_pod(req: &AdmissionRequest) -> Result<Pod> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let pod = serde_json::to_value(obj).and_then(serde_json::from_value)?;
    Ok(pod)
}
