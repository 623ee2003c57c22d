//! fastcgi-shim - brokers on-demand FastCGI workers for one child
//!
//! Usage: fastcgi-shim <shim-socket> <config-file> <fastcgi-command>

#[cfg(unix)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use fastcgi_fpm::shim::ShimServer;
    use std::path::PathBuf;
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::watch;
    use tracing::{error, info};

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastcgi_fpm=debug".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [socket, config_file, command] = args.as_slice() else {
        anyhow::bail!("usage: fastcgi-shim <shim-socket> <config-file> <fastcgi-command>");
    };

    let server = ShimServer::new(PathBuf::from(socket), PathBuf::from(config_file), command);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut run = tokio::spawn(server.run(shutdown_rx));

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
            let _ = shutdown_tx.send(true);
            run.await
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Shim failed");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("fastcgi-shim requires Unix domain sockets")
}
