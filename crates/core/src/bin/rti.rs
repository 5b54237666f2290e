use anyhow::Context;
use clap::Parser;
use federation_rti::{config::ConfigArgs, connection::tcp, Config, Rti};
use tokio::net::TcpListener;

async fn run(config: Config) -> anyhow::Result<()> {
    let model = config.load_object_model()?;
    tracing::info!(
        classes = model.classes().count(),
        grace_period = ?config.rti.sync_grace_period,
        divestiture_timeout = ?config.rti.divestiture_timeout,
        "Starting RTI"
    );
    let rti = Rti::new(config.rti, model);

    let socket = config.listen_socket();
    let listener = TcpListener::bind(socket)
        .await
        .with_context(|| format!("binding {socket}"))?;

    tokio::select! {
        served = tcp::serve(rti, listener, config.max_frame_size) => served?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = ConfigArgs::parse().build()?;
    federation_rti::config::set_logger(Some(config.log_level));
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}
