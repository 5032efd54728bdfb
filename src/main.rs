use newsletter_signup::configuration::get_configuration;
use newsletter_signup::startup::Application;
use newsletter_signup::telemetry::get_subscriber;
use newsletter_signup::telemetry::init_subscriber;

/// Initialise telemetry, load config, and start the server
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("newsletter-signup", "info", std::io::stdout);
    init_subscriber(subscriber)?;

    let cfg = get_configuration()?;
    let app = Application::build(cfg).await?;
    tracing::info!(port = app.port(), "Listening");
    app.run_until_stopped().await?;

    Ok(())
}
