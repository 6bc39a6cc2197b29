use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use cyder_tools::log::{debug, warn};
use reqwest::header::AUTHORIZATION;

use crate::error::GatewayError;
use crate::service::app_state::AppState;
use crate::service::cache::types::CacheApiKey;
use crate::utils::limit::RouteFamily;

const FORWARDED_FOR: &str = "x-forwarded-for";

// Extracts the raw key from `Authorization: Bearer <key>`.
pub(super) fn parse_bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let value = headers.get(AUTHORIZATION).ok_or_else(|| {
        GatewayError::Authentication(
            "You didn't provide an API key. You need to provide your API key in an Authorization header using Bearer auth (i.e. Authorization: Bearer YOUR_KEY).".to_string(),
        )
    })?;
    let value = value
        .to_str()
        .map_err(|_| GatewayError::Authentication("Invalid characters in Authorization header.".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            GatewayError::Authentication("Expected an Authorization header of the form 'Bearer <key>'.".to_string())
        })?;
    Ok(token)
}

/// Caller address used for IP limiting and usage records.
pub(super) fn resolve_client_ip(headers: &HeaderMap, addr: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }
    addr.ip().to_string()
}

pub(super) async fn admit_ip(app_state: &Arc<AppState>, family: RouteFamily, ip: &str) -> Result<(), GatewayError> {
    if app_state.limiter.check_ip(family, ip).await {
        return Ok(());
    }
    warn!("{} rate limit exceeded for {}", family.as_str(), ip);
    Err(GatewayError::RateLimit(
        "Too many requests from this address. Please slow down.".to_string(),
    ))
}

// Bearer parse, key lookup, then the key-level limiter when `limit_key` is set.
pub(super) async fn authenticate_request(
    app_state: &Arc<AppState>,
    headers: &HeaderMap,
    limit_key: bool,
) -> Result<Arc<CacheApiKey>, GatewayError> {
    let token = parse_bearer_token(headers).inspect_err(|e| warn!("auth failed: {}", e))?;
    let api_key = app_state
        .authenticate(token)
        .await
        .inspect_err(|e| warn!("auth failed: {}", e))?;
    debug!("authenticated key {} (..{})", api_key.id, api_key.log_tag());

    if limit_key && !app_state.limiter.check_key(&api_key).await {
        warn!("key {} exceeded its request rate", api_key.id);
        return Err(GatewayError::RateLimit(format!(
            "Rate limit reached for this API key: {} requests per window.",
            app_state.limiter.key_ceiling(&api_key)
        )));
    }
    Ok(api_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token(&headers(&[("authorization", "Bearer sk-abc")])).unwrap(), "sk-abc");
        assert!(parse_bearer_token(&HeaderMap::new()).is_err());
        assert!(parse_bearer_token(&headers(&[("authorization", "Basic Zm9vOmJhcg==")])).is_err());
        assert!(parse_bearer_token(&headers(&[("authorization", "Bearer   ")])).is_err());
    }

    #[test]
    fn test_resolve_client_ip() {
        let addr: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let forwarded = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);

        assert_eq!(resolve_client_ip(&forwarded, addr, true), "203.0.113.7");
        assert_eq!(resolve_client_ip(&forwarded, addr, false), "10.0.0.9");
        assert_eq!(resolve_client_ip(&HeaderMap::new(), addr, true), "10.0.0.9");
    }
}
