//! Input validation for identifiers and the upstream platform URL.
//!
//! Validates:
//! - Workflow and agent identifiers (safe to embed in URL paths and cache keys)
//! - The upstream base URL (scheme requirements and SSRF protection)

use std::net::IpAddr;

use crate::error::WebhookError;

/// Maximum identifier length accepted from the platform.
pub const MAX_IDENTIFIER_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

/// Validate a workflow or agent identifier.
///
/// Allowed characters: ASCII alphanumerics, `-`, `_`, `.` and `:`.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), WebhookError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(WebhookError::SchemaInvalid(format!(
            "{field} must be between 1 and {MAX_IDENTIFIER_LEN} characters"
        )));
    }

    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(WebhookError::SchemaInvalid(format!(
            "{field} contains invalid character {c:?}"
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// URL validation
// ---------------------------------------------------------------------------

/// Validate the upstream platform base URL.
///
/// Checks:
/// 1. URL is parseable
/// 2. Scheme is HTTPS (or HTTP if `allow_http` is true for dev/test)
/// 3. Host is not a private/internal address (SSRF protection), unless
///    `allow_http` is set
pub fn validate_upstream_url(url: &str, allow_http: bool) -> Result<(), WebhookError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| WebhookError::SchemaInvalid(format!("Invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => {
            return Err(WebhookError::SchemaInvalid(
                "Upstream URLs must use HTTPS".to_string(),
            ));
        }
        scheme => {
            return Err(WebhookError::SchemaInvalid(format!(
                "Unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| WebhookError::SchemaInvalid("URL must have a host".to_string()))?;

    if !allow_http {
        validate_host_not_internal(host)?;
    }

    Ok(())
}

/// Validate that a host is not a private/internal address.
///
/// Blocks loopback, private ranges, link-local (cloud metadata), CGNAT,
/// IPv6 loopback/unspecified, and internal hostnames.
pub fn validate_host_not_internal(host: &str) -> Result<(), WebhookError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_internal_ip(&ip) {
            return Err(WebhookError::SchemaInvalid(format!(
                "Destination host {host} is a private/internal address"
            )));
        }
    }

    let lower = host.to_ascii_lowercase();
    if lower == "localhost" || lower.ends_with(".internal") || lower.ends_with(".local") {
        return Err(WebhookError::SchemaInvalid(format!(
            "Destination host {host} is a restricted internal hostname"
        )));
    }

    Ok(())
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_accepts_platform_ids() {
        assert!(validate_identifier("workflow_id", "wf-1").is_ok());
        assert!(validate_identifier("agent_id", "agent_42.tool:search").is_ok());
    }

    #[test]
    fn test_identifier_rejects_path_characters() {
        assert!(validate_identifier("workflow_id", "wf/../admin").is_err());
        assert!(validate_identifier("workflow_id", "wf 1").is_err());
        assert!(validate_identifier("workflow_id", "").is_err());
    }

    #[test]
    fn test_identifier_rejects_overlong() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier("agent_id", &long).is_err());
    }

    #[test]
    fn test_https_upstream_allowed() {
        assert!(validate_upstream_url("https://api.agents.example.com", false).is_ok());
    }

    #[test]
    fn test_http_upstream_rejected_in_production() {
        assert!(validate_upstream_url("http://api.agents.example.com", false).is_err());
        assert!(validate_upstream_url("http://api.agents.example.com", true).is_ok());
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(validate_upstream_url("ftp://api.agents.example.com", false).is_err());
    }

    #[test]
    fn test_ssrf_blocks_internal_targets() {
        assert!(validate_upstream_url("https://10.0.0.1/api", false).is_err());
        assert!(validate_upstream_url("https://169.254.169.254/", false).is_err());
        assert!(validate_upstream_url("https://localhost/api", false).is_err());
        assert!(validate_upstream_url("https://[::1]/api", false).is_err());
        assert!(validate_host_not_internal("100.64.0.1").is_err());
        assert!(validate_host_not_internal("metadata.google.internal").is_err());
    }

    #[test]
    fn test_ssrf_allows_public_hosts() {
        assert!(validate_host_not_internal("8.8.8.8").is_ok());
        assert!(validate_host_not_internal("hooks.example.io").is_ok());
    }
}
