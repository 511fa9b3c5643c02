//! Tenant id resolution.
//!
//! Resolution order: `X-Tenant-ID` header, subdomain (excluding `www` and
//! `api`), first path segment after `/tenants/`, `tenantId` query
//! parameter. First non-empty source wins.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

use crate::error::GatewayError;

const TENANT_HEADER: &str = "x-tenant-id";
const EXCLUDED_SUBDOMAINS: &[&str] = &["www", "api"];

fn from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn from_subdomain(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
    let host = host.split(':').next()?;
    let labels: Vec<&str> = host.split('.').collect();
    // A tenant subdomain needs something to be a subdomain *of*.
    if labels.len() < 3 {
        return None;
    }
    let candidate = labels[0];
    if candidate.is_empty() || EXCLUDED_SUBDOMAINS.contains(&candidate) {
        return None;
    }
    Some(candidate.to_owned())
}

fn from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/tenants/")?;
    let segment = rest.split('/').next()?;
    if segment.is_empty() {
        return None;
    }
    Some(segment.to_owned())
}

fn from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "tenantId" && !value.is_empty() {
            Some(value.to_owned())
        } else {
            None
        }
    })
}

/// Resolve the tenant id from request parts.
#[must_use]
pub fn resolve(headers: &HeaderMap, path: &str, query: Option<&str>) -> Option<String> {
    from_header(headers)
        .or_else(|| from_subdomain(headers))
        .or_else(|| from_path(path))
        .or_else(|| from_query(query))
}

/// Axum extractor wrapping the resolution chain; rejects with 400 when no
/// source yields a tenant id.
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for TenantId {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        resolve(&parts.headers, parts.uri.path(), parts.uri.query())
            .map(TenantId)
            .ok_or(GatewayError::MissingTenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn header_wins_over_everything() {
        let h = headers(&[("x-tenant-id", "t-header"), ("host", "t-sub.example.com")]);
        assert_eq!(
            resolve(&h, "/tenants/t-path/users", Some("tenantId=t-query")),
            Some("t-header".to_owned())
        );
    }

    #[test]
    fn subdomain_is_second() {
        let h = headers(&[("host", "acme.example.com")]);
        assert_eq!(
            resolve(&h, "/tenants/t-path/users", None),
            Some("acme".to_owned())
        );
    }

    #[test]
    fn www_and_api_subdomains_are_excluded() {
        let h = headers(&[("host", "www.example.com")]);
        assert_eq!(resolve(&h, "/tenants/t1/users", None), Some("t1".to_owned()));

        let h = headers(&[("host", "api.example.com")]);
        assert_eq!(resolve(&h, "/other", Some("tenantId=t2")), Some("t2".to_owned()));
    }

    #[test]
    fn bare_host_has_no_subdomain() {
        let h = headers(&[("host", "localhost:8080")]);
        assert_eq!(resolve(&h, "/tenants/t1/users", None), Some("t1".to_owned()));

        let h = headers(&[("host", "example.com")]);
        assert_eq!(resolve(&h, "/nope", None), None);
    }

    #[test]
    fn path_and_query_fallbacks() {
        let h = HeaderMap::new();
        assert_eq!(resolve(&h, "/tenants/t9", None), Some("t9".to_owned()));
        assert_eq!(
            resolve(&h, "/evaluate", Some("a=b&tenantId=t10")),
            Some("t10".to_owned())
        );
        assert_eq!(resolve(&h, "/evaluate", Some("tenantId=")), None);
    }
}
