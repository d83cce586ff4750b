//! HTTP clients for the systems the pipeline talks to.
//!
//! Each client sits behind a trait so the engine can be driven by fakes in tests.

pub mod elastic;
pub mod generator;
pub mod kube;

use std::path::Path;
use std::time::Duration;

use crate::error::AppError;

/// Build a `reqwest::Client` with a request timeout and the given TLS policy.
pub(crate) fn http_client(
    timeout: Duration,
    verify_certs: bool,
    ca_cert: Option<&Path>,
) -> Result<reqwest::Client, AppError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)));

    if let Some(path) = ca_cert {
        let pem = std::fs::read(path)
            .map_err(|e| AppError::Config(format!("cannot read CA bundle {}: {e}", path.display())))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| AppError::Config(format!("invalid CA bundle {}: {e}", path.display())))?;
        builder = builder.add_root_certificate(cert);
    }
    if !verify_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Transport failures are connectivity problems; anything else is reported
/// against the named service.
pub(crate) fn http_err(service: &str, e: reqwest::Error) -> AppError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        AppError::Connectivity(format!("{service}: {e}"))
    } else {
        AppError::Execution(format!("{service}: {e}"))
    }
}
