use actix_web::http::header::HeaderValue;
use actix_web::http::header::ACCESS_CONTROL_ALLOW_HEADERS;
use actix_web::http::header::ACCESS_CONTROL_ALLOW_METHODS;
use actix_web::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use actix_web::HttpRequest;
use actix_web::HttpResponse;

use crate::cors::request_origin;

/// `OPTIONS /api/newsletter`
///
/// CORS preflight. Always 200 with an empty body; the allow-list is only
/// enforced on the actual `POST`, so the origin is echoed back as-is (or `*`
/// when the browser did not send one).
pub async fn preflight(req: HttpRequest) -> HttpResponse {
    let allow_origin = request_origin(&req)
        .filter(|o| !o.is_empty())
        .cloned()
        .unwrap_or(HeaderValue::from_static("*"));

    HttpResponse::Ok()
        .insert_header((ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin))
        .insert_header((ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"))
        .insert_header((ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"))
        .finish()
}
