mod middleware;

use actix_web::http::header::HeaderValue;
use actix_web::http::header::ORIGIN;
use actix_web::HttpRequest;
pub use middleware::reject_forbidden_origins;

/// Origin prefixes permitted to call the subscription endpoint.
///
/// Must be instantiated with `AllowedOrigins::new`, which guarantees at least
/// one entry, and that the first entry can be sent back as a header value.
#[derive(Debug, Clone)]
pub struct AllowedOrigins {
    prefixes: Vec<String>,
    fallback: HeaderValue,
}

impl AllowedOrigins {
    pub fn new(prefixes: Vec<String>) -> Result<Self, String> {
        let first = prefixes
            .first()
            .ok_or("At least one allowed origin must be configured")?;
        let fallback = HeaderValue::from_str(first)
            .map_err(|_| format!("Invalid allowed origin: {first:?}"))?;
        Ok(Self { prefixes, fallback })
    }

    /// Decide which `Access-Control-Allow-Origin` to answer with.
    ///
    /// A missing (or empty) `Origin` falls back to the first allowed entry. A
    /// present `Origin` is echoed back if it starts with any allowed prefix,
    /// and rejected (`None`) otherwise.
    pub fn resolve(
        &self,
        origin: Option<&HeaderValue>,
    ) -> Option<HeaderValue> {
        let origin = match origin.filter(|o| !o.is_empty()) {
            None => return Some(self.fallback.clone()),
            Some(o) => o,
        };
        // non-ASCII origins cannot match any configured prefix
        let raw = origin.to_str().ok()?;
        self.prefixes
            .iter()
            .any(|p| raw.starts_with(p.as_str()))
            .then(|| origin.clone())
    }
}

/// The `Origin` header of a request, if any
pub fn request_origin(req: &HttpRequest) -> Option<&HeaderValue> { req.headers().get(ORIGIN) }
