//! Binary entrypoint (A4): parses CLI/env options, loads layered
//! configuration, installs tracing and the signal handler, then blocks on
//! the scheduler loop until shutdown.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ceramic_anchor_service::app::App;
use ceramic_anchor_service::config::{load_config, Options};
use ceramic_anchor_service::shutdown::Shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let options = Options::parse();
    init_tracing(&options);

    let config = load_config(options.config.as_deref())?;
    let shutdown = Shutdown::new();
    shutdown.watch_signals();

    let app = App::new(config, shutdown).await?;
    app.run().await
}

fn init_tracing(options: &Options) {
    let filter = EnvFilter::try_new(&options.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if options.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
