use actix_web::HttpResponse;

/// `GET /health_check`
///
/// Liveness probe for the hosting platform; never touches Square.
pub async fn health_check() -> HttpResponse { HttpResponse::Ok().finish() }
