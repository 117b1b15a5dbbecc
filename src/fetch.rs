//! In-render fetch for application data loading.
//!
//! The synthetic window resolves relative URLs against the serving origin,
//! so a bundle that calls `fetch("/api/products")` during the render reaches
//! the same backend it would reach in a real browser. Cross-origin requests
//! are allowed only for origins listed in the render configuration, and
//! redirects must stay on the origin they started from.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use url::Url;

/// Per-render fetch policy, stored in the runtime's op state.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Serving origin; relative request URLs resolve against this, and it is
    /// always an allowed destination.
    pub base: Url,
    /// Additional allowed origins (scheme + host + port, exact match).
    pub allowed_origins: Vec<String>,
    /// When false, every fetch is rejected (external resource loading off).
    pub enabled: bool,
}

impl FetchPolicy {
    pub fn resolve(&self, input: &str) -> Result<Url, url::ParseError> {
        match Url::parse(input) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self.base.join(input),
            Err(e) => Err(e),
        }
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        if origin == self.base.origin().ascii_serialization() {
            return true;
        }
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

/// Request info passed from JS.
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response info returned to JS.
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let policy = {
        let state_ref = state.borrow();
        state_ref.borrow::<FetchPolicy>().clone()
    };
    do_fetch(request, policy).await
}

async fn do_fetch(
    request: FetchRequest,
    policy: FetchPolicy,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    if !policy.enabled {
        return Err(anyhow!("fetch disabled: external resource loading is off").into());
    }

    let url = policy
        .resolve(&request.url)
        .map_err(|e| anyhow!("bad fetch URL '{}': {e}", request.url))?;

    if !policy.is_origin_allowed(&url) {
        return Err(anyhow!(
            "fetch blocked: origin '{}' is not allowed during renders",
            url.origin().ascii_serialization(),
        )
        .into());
    }

    let client = Client::builder()
        // Redirects are followed manually so each hop can be checked.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("http client setup failed: {e}"))?;

    let method = Method::from_bytes(
        request
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_uppercase()
            .as_bytes(),
    )
    .map_err(|e| anyhow!("bad HTTP method: {e}"))?;

    let mut builder = client.request(method, url.clone());
    for (key, value) in request.headers.iter().flatten() {
        builder = builder.header(key, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| anyhow!("fetch to '{url}' failed: {e}"))?;

    let status = response.status();
    let final_url = response.url().clone();

    if status.is_redirection() {
        if let Some(next) = redirect_target(&response, &final_url)? {
            if next.origin() != url.origin() {
                return Err(anyhow!(
                    "fetch blocked: redirect left origin '{}'",
                    url.origin().ascii_serialization(),
                )
                .into());
            }
            let follow_up = FetchRequest {
                url: next.to_string(),
                method: Some("GET".to_string()),
                headers: request.headers.clone(),
                body: None,
            };
            return Box::pin(do_fetch(follow_up, policy)).await;
        }
    }

    let headers = response
        .headers()
        .iter()
        .filter_map(|(key, value)| Some((key.to_string(), value.to_str().ok()?.to_string())))
        .collect();

    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("reading response body failed: {e}"))?;

    Ok(FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        url: final_url.to_string(),
        body,
    })
}

fn redirect_target(
    response: &reqwest::Response,
    from: &Url,
) -> Result<Option<Url>, deno_core::error::AnyError> {
    let Some(location) = response.headers().get("location") else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|_| anyhow!("redirect location is not valid text"))?;
    let target = from
        .join(location)
        .map_err(|e| anyhow!("redirect location does not parse: {e}"))?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FetchPolicy {
        FetchPolicy {
            base: Url::parse("http://localhost:8080").unwrap(),
            allowed_origins: vec!["https://api.example.com".to_string()],
            enabled: true,
        }
    }

    #[test]
    fn test_relative_urls_resolve_against_serving_origin() {
        let p = policy();
        let url = p.resolve("/api/products?page=2").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/products?page=2");
    }

    #[test]
    fn test_serving_origin_always_allowed() {
        let p = policy();
        assert!(p.is_origin_allowed(&Url::parse("http://localhost:8080/x").unwrap()));
    }

    #[test]
    fn test_allowlisted_origin() {
        let p = policy();
        assert!(p.is_origin_allowed(&Url::parse("https://api.example.com/users").unwrap()));
        assert!(!p.is_origin_allowed(&Url::parse("https://evil.com/api").unwrap()));
        // Scheme and port are part of the origin.
        assert!(!p.is_origin_allowed(&Url::parse("http://api.example.com/users").unwrap()));
        assert!(!p.is_origin_allowed(&Url::parse("https://api.example.com:8443/").unwrap()));
    }

    #[tokio::test]
    async fn test_disabled_policy_rejects() {
        let mut p = policy();
        p.enabled = false;
        let err = do_fetch(
            FetchRequest {
                url: "/api".to_string(),
                method: None,
                headers: None,
                body: None,
            },
            p,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("fetch disabled"));
    }
}
