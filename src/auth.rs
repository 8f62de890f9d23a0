use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{HosterError, HosterResult};

/// Per-plan resource quotas, injected by the upstream gateway as a
/// JSON header. Absent header means the process defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanLimits {
    pub max_deployments: u32,
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
    pub max_disk_mb: u64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_deployments: 1,
            max_cpu_cores: 1.0,
            max_memory_mb: 1024,
            max_disk_mb: 5120,
        }
    }
}

/// Caller identity, extracted from the trusted gateway headers.
///
/// The service is network-isolated behind the gateway; headers are
/// trusted as-is. Anonymous callers get read access to published
/// templates only.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
    pub key_id: Option<String>,
    pub limits: PlanLimits,
}

impl AuthContext {
    /// Extract the auth context from request headers.
    pub fn from_headers(headers: &HeaderMap) -> HosterResult<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };

        let limits = match header("x-plan-limits") {
            None => PlanLimits::default(),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|_| HosterError::BadRequest("X-Plan-Limits is not valid JSON".into()))?,
        };

        Ok(Self {
            user_id: header("x-user-id"),
            plan_id: header("x-plan-id"),
            key_id: header("x-key-id"),
            limits,
        })
    }

    /// The authenticated user id, or unauthorized for anonymous
    /// callers.
    pub fn require_user(&self) -> HosterResult<&str> {
        self.user_id.as_deref().ok_or(HosterError::Unauthorized)
    }

    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn defaults_when_headers_absent() {
        let ctx = AuthContext::from_headers(&HeaderMap::new()).unwrap();
        assert!(ctx.is_anonymous());
        assert_eq!(ctx.limits, PlanLimits::default());
        assert!(ctx.require_user().is_err());
    }

    #[test]
    fn parses_identity_and_limits() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("usr-7"));
        headers.insert("x-plan-id", HeaderValue::from_static("pro"));
        headers.insert(
            "x-plan-limits",
            HeaderValue::from_static(
                r#"{"max_deployments":10,"max_cpu_cores":8.0,"max_memory_mb":16384,"max_disk_mb":102400}"#,
            ),
        );

        let ctx = AuthContext::from_headers(&headers).unwrap();
        assert_eq!(ctx.require_user().unwrap(), "usr-7");
        assert_eq!(ctx.plan_id.as_deref(), Some("pro"));
        assert_eq!(ctx.limits.max_deployments, 10);
        assert!((ctx.limits.max_cpu_cores - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_limits_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-plan-limits", HeaderValue::from_static("{not json"));
        assert!(AuthContext::from_headers(&headers).is_err());
    }
}
