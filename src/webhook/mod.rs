//! Validating admission webhook for PavProvisioner objects
//!
//! Gates every create and update of a provisioner: the declarative schema
//! in template-permissive mode, the cross-field rules, and the syntax of
//! every embedded template. Rejections carry a human-readable reason back
//! to the user.
//!
//! A bootstrap ValidatingWebhookConfiguration that rejects everything is
//! installed with the CRD; the controller agent overwrites it with the real
//! rules and CA bundle once this server is listening, so there is no window
//! in which unvalidated objects slip through.

use std::net::SocketAddr;

use axum::{routing::post, Json, Router};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{info, warn};

use crate::crd::PavProvisioner;
use crate::error::Error;
use crate::pki::WebhookCertificate;
use crate::schema::{self, Mode};

/// Create the webhook router.
pub fn webhook_router() -> Router {
    Router::new().route("/validate", post(validate_handler))
}

/// Serve the webhook over TLS until the process exits.
pub async fn serve(addr: SocketAddr, certificate: &WebhookCertificate) -> Result<(), Error> {
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem(
        certificate.cert_pem.clone().into_bytes(),
        certificate.key_pem.clone().into_bytes(),
    )
    .await
    .map_err(|e| Error::internal(format!("webhook TLS configuration: {e}")))?;

    info!(%addr, "admission webhook listening");

    axum_server::bind_rustls(addr, tls)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| Error::internal(format!("webhook server: {e}")))
}

/// Handle a validating admission review for pavprovisioners.
async fn validate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = AdmissionResponse::from(&request);

    let response = match &request.object {
        // deletions and connect verbs carry no object to validate
        None => response,
        Some(object) => match validate_provisioner_object(object) {
            Ok(()) => response,
            Err(reason) => response.deny(reason.to_string()),
        },
    };

    Json(response.into_review())
}

/// Validate an incoming provisioner object.
fn validate_provisioner_object(object: &DynamicObject) -> Result<(), Error> {
    let provisioner: PavProvisioner = serde_json::from_value(serde_json::to_value(object)?)
        .map_err(|e| Error::schema(e.to_string()))?;

    schema::validate_provisioner(&provisioner.spec, Mode::Templated)
}
