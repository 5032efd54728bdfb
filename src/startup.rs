use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::http::Method;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use actix_web_lab::middleware::from_fn;
use anyhow::Context;
use tracing_actix_web::TracingLogger;

use crate::configuration::Settings;
use crate::cors::reject_forbidden_origins;
use crate::cors::AllowedOrigins;
use crate::routes::health_check;
use crate::routes::method_not_allowed;
use crate::routes::preflight;
use crate::routes::subscribe;
use crate::square_client::SquareClient;

/// Wrapper for actix's `Server` with access to the bound port. Not to be
/// confused with actix's `App`!
pub struct Application {
    /// Left private; use `port` to access
    port: u16,
    server: Server,
}

impl Application {
    /// Bind the listener and build everything the handlers share. Fails on a
    /// bad allow-list, so misconfiguration is caught before serving traffic.
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(&addr).with_context(|| format!("could not bind {addr}"))?;

        // port 0 means the OS picked one; tests need to know which
        let port = listener.local_addr()?.port();

        let square_client = cfg
            .square
            .client()
            .context("could not build Square HTTP client")?;
        if cfg.square.access_token().is_none() {
            tracing::warn!("No Square access token configured; subscriptions will fail");
        }

        let allowed_origins = cfg
            .cors
            .allowed_origins()
            .map_err(anyhow::Error::msg)?;

        let server = run(
            listener,
            square_client,
            allowed_origins,
            cfg.square.newsletter_group(),
        )?;

        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 { self.port }

    /// Because this consumes `self`, this should be the final function call (or
    /// passed to `tokio::spawn`)
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

/// Wrapper for the optional Square customer group id (a bare
/// `Option<String>` in `Data` could collide with other app data)
pub struct NewsletterGroup(pub Option<String>);

/// The server is not responsible for binding to an address, it only listens to
/// an already bound address.
///
/// Declares all API endpoints.
pub fn run(
    listener: TcpListener,
    square_client: SquareClient,
    allowed_origins: AllowedOrigins,
    newsletter_group: Option<String>,
) -> Result<Server, std::io::Error> {
    // `Data` is an `Arc`; every worker gets a clone of the same client, so the
    // connection pool is shared
    let square_client = Data::new(square_client);
    let allowed_origins = Data::new(allowed_origins);
    let newsletter_group = Data::new(NewsletterGroup(newsletter_group));

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .service(
                web::resource("/api/newsletter")
                    .wrap(from_fn(reject_forbidden_origins))
                    .route(web::method(Method::OPTIONS).to(preflight))
                    .route(web::post().to(subscribe))
                    .default_service(web::to(method_not_allowed)),
            )
            .app_data(square_client.clone())
            .app_data(allowed_origins.clone())
            .app_data(newsletter_group.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
