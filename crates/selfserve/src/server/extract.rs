//! Request extractors: merged form fields, caller identity, client address.

use super::error::ApiError;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::Form;
use selfserve_engine::{Actor, Fields};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub const HEADER_UID: &str = "x-selfserve-uid";
pub const HEADER_NAME: &str = "x-selfserve-name";
pub const HEADER_PROJECTS: &str = "x-selfserve-projects";
pub const HEADER_PMCS: &str = "x-selfserve-pmcs";
pub const HEADER_ROOT: &str = "x-selfserve-root";
pub const HEADER_MEMBER: &str = "x-selfserve-member";
pub const HEADER_CHAIR: &str = "x-selfserve-chair";
pub const HEADER_ROLE: &str = "x-selfserve-role";

// ============================================================================
// Fields
// ============================================================================

/// Query string, urlencoded form and JSON body merged into one map.
/// Later sources override earlier ones; repeated keys become arrays.
#[derive(Debug, Default)]
pub struct FormFields {
    pub fields: Fields,
    /// Raw query string, for links of the form `?<token>`
    pub raw_query: Option<String>,
}

impl FormFields {
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// `token=<t>`, or a bare `?<t>` query.
    pub fn token(&self) -> Option<String> {
        if let Some(token) = self.get_str("token").filter(|t| !t.is_empty()) {
            return Some(token.to_string());
        }
        self.raw_query
            .as_deref()
            .filter(|q| !q.is_empty() && !q.contains('=') && !q.contains('&'))
            .map(str::to_string)
    }
}

#[async_trait]
impl<S> FromRequest<S> for FormFields
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let raw_query = req.uri().query().map(str::to_string);
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let mut fields = Fields::new();
        let query = Query::<Vec<(String, String)>>::try_from_uri(req.uri())
            .map_err(|e| rejected(StatusCode::BAD_REQUEST, e.body_text()))?;
        merge_pairs(&mut fields, query.0);

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| rejected(e.status(), e.body_text()))?;
        if body.is_empty() {
            return Ok(Self { fields, raw_query });
        }

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let form_req = Request::builder()
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .map_err(|e| rejected(StatusCode::BAD_REQUEST, e.to_string()))?;
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(form_req, &())
                .await
                .map_err(|e| rejected(StatusCode::BAD_REQUEST, e.body_text()))?;
            merge_pairs(&mut fields, pairs);
        } else if content_type.starts_with("application/json") {
            let json: Value = serde_json::from_slice(&body)
                .map_err(|e| rejected(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e)))?;
            match json {
                Value::Object(map) => fields.extend(map),
                _ => {
                    return Err(rejected(
                        StatusCode::BAD_REQUEST,
                        "JSON body must be an object".to_string(),
                    ))
                }
            }
        }

        Ok(Self { fields, raw_query })
    }
}

fn merge_pairs(fields: &mut Fields, pairs: Vec<(String, String)>) {
    for (key, value) in pairs {
        match fields.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                fields.insert(key, Value::String(value));
            }
        }
    }
}

fn rejected(status: StatusCode, message: String) -> ApiError {
    ApiError::Rejected { status, message }
}

// ============================================================================
// Caller
// ============================================================================

/// Identity forwarded by the authenticating front end, if any.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<Actor>);

impl Caller {
    pub fn require(self) -> Result<Actor, ApiError> {
        self.0.ok_or(ApiError::Unauthenticated)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(actor_from_headers(&parts.headers)))
    }
}

pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let uid = header_str(headers, HEADER_UID)?.trim();
    if uid.is_empty() {
        return None;
    }
    let mut actor = Actor::new(uid);
    actor.name = header_str(headers, HEADER_NAME).unwrap_or_default().trim().to_string();
    actor.projects = header_list(headers, HEADER_PROJECTS);
    actor.pmcs = header_list(headers, HEADER_PMCS);
    actor.is_root = header_flag(headers, HEADER_ROOT);
    actor.is_member = header_flag(headers, HEADER_MEMBER);
    actor.is_chair = header_flag(headers, HEADER_CHAIR);
    actor.is_role_account = header_flag(headers, HEADER_ROLE);
    Some(actor)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    header_str(headers, name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(
        header_str(headers, name).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

// ============================================================================
// Client address
// ============================================================================

/// Proxies whose `X-Forwarded-For` entries are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies(Arc<Vec<IpAddr>>);

impl TrustedProxies {
    pub fn new(proxies: Vec<IpAddr>) -> Self {
        Self(Arc::new(proxies))
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }
}

/// Address the rate limiter keys on.
///
/// The socket peer, unless the peer is a trusted proxy. Then
/// `X-Forwarded-For` is read right to left and the first hop that is not
/// itself a trusted proxy wins. Entries left of that hop are supplied by
/// the client and never consulted.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let trusted = parts
            .extensions
            .get::<TrustedProxies>()
            .cloned()
            .unwrap_or_default();
        Ok(ClientIp(client_address(peer, &parts.headers, &trusted)))
    }
}

fn client_address(peer: Option<IpAddr>, headers: &HeaderMap, trusted: &TrustedProxies) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();

    let mut client = peer.to_string();
    for hop in hops.iter().rev() {
        match hop.parse::<IpAddr>() {
            Ok(ip) if trusted.contains(&ip) => client = ip.to_string(),
            Ok(ip) => return ip.to_string(),
            // Garbage from the far side of the last trusted proxy
            Err(_) => break,
        }
    }
    client
}
