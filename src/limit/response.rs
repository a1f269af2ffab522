//! Response composition: informational headers and rejection bodies.

use serde::Serialize;

use super::policy::BypassReason;
use crate::config::HeaderConfig;
use crate::store::Admission;

/// Structured body returned with a rejection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    /// Seconds until the caller may retry. Absent for policy-based
    /// rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// A short-circuit rejection of the request.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: RejectionBody,
}

/// The engine's verdict for one request.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Proceed to the protected handler, adding any informational
    /// headers to the response.
    Admit { headers: Vec<(String, String)> },
    /// Proceed without counting.
    Skip { reason: BypassReason },
    /// Return the rejection instead of running the handler.
    Reject(Rejection),
}

/// Compose limit/remaining/reset headers for an admission outcome.
///
/// `remaining` saturates at zero once the limit is exceeded. Disabling
/// headers affects only the response, never the decision.
pub fn limit_headers(
    config: &HeaderConfig,
    max: u32,
    admission: &Admission,
    retry_after_secs: Option<u64>,
) -> Vec<(String, String)> {
    if !config.enabled {
        return Vec::new();
    }

    let remaining = max.saturating_sub(admission.current);
    let mut headers = vec![
        (config.names.limit.clone(), max.to_string()),
        (config.names.remaining.clone(), remaining.to_string()),
        (
            config.names.reset.clone(),
            (admission.reset_at_ms / 1000).to_string(),
        ),
    ];
    if let Some(secs) = retry_after_secs {
        headers.push((config.names.retry_after.clone(), secs.to_string()));
    }
    headers
}

/// Whole seconds until `reset_at_ms`, rounded up, floored at zero.
pub fn retry_after_secs(reset_at_ms: u64, now_ms: u64) -> u64 {
    reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
}
