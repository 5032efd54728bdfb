use actix_web::body::MessageBody;
use actix_web::dev::ServiceRequest;
use actix_web::dev::ServiceResponse;
use actix_web::http::header::HeaderValue;
use actix_web::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use actix_web::http::header::ORIGIN;
use actix_web::http::header::VARY;
use actix_web::http::Method;
use actix_web::web;
use actix_web_lab::middleware::Next;

use super::AllowedOrigins;
use crate::routes::SubscribeError;
use crate::utils::error_500;

/// Gate `POST` requests on the `Origin` allow-list.
///
/// Requests from a forbidden origin never reach the handler and get a 403.
/// Every other `POST` response (200, 400, 500) carries
/// `Access-Control-Allow-Origin` and `Vary: Origin`. Other methods pass
/// through untouched, so preflight and the 405 fallback keep their own
/// headers.
///
/// For more details, refer to the documentation for
/// `actix_web_lab::middleware::from_fn`
pub async fn reject_forbidden_origins(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    if req.method() != Method::POST {
        return next.call(req).await;
    }

    let allowed = req
        .app_data::<web::Data<AllowedOrigins>>()
        .ok_or_else(|| error_500("AllowedOrigins missing from app data"))?;

    let allow_origin = match allowed.resolve(req.headers().get(ORIGIN)) {
        Some(o) => o,
        None => {
            tracing::warn!(
                origin = ?req.headers().get(ORIGIN),
                "Rejected subscription from forbidden origin"
            );
            return Err(SubscribeError::ForbiddenOrigin.into());
        }
    };

    let mut resp = next.call(req).await?;
    let headers = resp.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    headers.insert(VARY, HeaderValue::from_static("Origin"));
    Ok(resp)
}
