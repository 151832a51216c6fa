//! Consume the find-providers service's own lookup logs and store the providers they found.
//!
//! Shares the worker's configuration; point `KAFKA_CONSUMER_TOPIC` at the providers log topic.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::info;

use provider_common::health::HealthRegistry;
use provider_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use provider_worker::clients::{build_http_client, HttpParser};
use provider_worker::config::Config;
use provider_worker::loader::LogLoader;
use provider_worker::sinks::build_gateway;
use provider_worker::source::KafkaSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    config.validate().wrap_err("invalid configuration")?;

    let client =
        build_http_client(config.request_timeout.0).wrap_err("failed to build http client")?;
    let parser = Arc::new(HttpParser::new(client.clone(), &config.parser_url));
    let gateway = build_gateway(&config, client).await?;
    let source = KafkaSource::new(&config.kafka).wrap_err("failed to create kafka consumer")?;

    // One line costs at most a parser call and a write.
    let deadline = time::Duration::try_from(config.request_timeout.0 * 2)
        .unwrap_or(time::Duration::MAX)
        .saturating_add(time::Duration::seconds(60));
    let liveness = HealthRegistry::new("liveness");
    let loader = LogLoader::new(parser, gateway).with_liveness(liveness.register("loader", deadline));

    let recorder_handle =
        setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let router = setup_metrics_router(recorder_handle, liveness);
    let bind = config.bind();
    info!("serving metrics on {}", bind);

    tokio::select! {
        served = serve(router, &bind) => {
            served.wrap_err("failed to serve metrics")?;
            eyre::bail!("metrics server stopped");
        }
        _ = loader.run(source) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("failed to listen for shutdown signal")?;
            info!("shutting down");
        }
    }

    Ok(())
}
