use cravio_notify::config::AsyncRuntime;
use cravio_notify::{transport, BrokerClient, Config, DeliveryGateway, IngestionPipeline, NotifyError, Result};
use tokio::net::TcpListener;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    build_runtime(config.runtime)?.block_on(run(config))
}

fn build_runtime(flavour: AsyncRuntime) -> Result<Runtime> {
    let mut builder = match flavour {
        AsyncRuntime::CurrentThread => Builder::new_current_thread(),
        AsyncRuntime::MultiThread => Builder::new_multi_thread(),
    };
    Ok(builder.enable_all().build()?)
}

async fn run(config: Config) -> Result<()> {
    let gateway = DeliveryGateway::new(&config.gateway);

    info!(uri = %config.broker.uri, "connecting to broker");
    let broker = BrokerClient::connect(&config.broker).await.map_err(|e| {
        error!(error = %e, "failed to connect to broker");
        e
    })?;
    let pipeline = IngestionPipeline::new(gateway.clone());
    let mut consumer = tokio::spawn(broker.run(pipeline));

    let listener = TcpListener::bind(config.gateway.bind_address).await?;
    info!(address = %config.gateway.bind_address, "server running");
    let mut server = tokio::spawn(transport::serve(listener, gateway, transport::shutdown_signal()));

    tokio::select! {
        joined = &mut server => {
            consumer.abort();
            info!("server shutting down");
            flatten(joined)
        }
        joined = &mut consumer => {
            server.abort();
            let result = flatten(joined);
            if let Err(e) = &result {
                error!(error = %e, "notification consumer stopped");
            }
            result
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| NotifyError::Processing(format!("task failed: {e}")))?
}
