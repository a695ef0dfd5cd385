use std::{io::Error, process::exit};

use clap::Parser;
use pathlink::{
    args::{self, Cli, Command},
    config::TunnelConfig,
    runtime,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    task::LocalSet,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    if let Some(Command::EncodeSession { session }) = &cli.command {
        let code = session
            .to_params()
            .map_err(|err| err.to_string())
            .and_then(|params| params.serialize_to_string().map_err(|err| err.to_string()));

        match code {
            Ok(code) => println!("{code}"),
            Err(err) => {
                eprintln!("{err}\n\nType 'pathlink --help' for a help menu");
                exit(1);
            }
        }
        return;
    }

    let default_level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(cli)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!(%error, "program finished with error");
        exit(1);
    }
}

async fn async_main(cli: Cli) -> Result<(), Error> {
    info!(version = %args::get_version_string(), "starting");

    let params = cli.session.to_params().map_err(|err| Error::other(err.to_string()))?;
    let config = match &cli.config {
        Some(path) => TunnelConfig::load(path).map_err(Error::other)?,
        None => TunnelConfig::default(),
    };

    let listener = TcpListener::bind(cli.listen).await?;
    info!(listen = %listener.local_addr()?, "proxy listening");

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    info!(local_addr = %socket.local_addr()?, "udp tunnel socket bound");

    tokio::select! {
        result = runtime::run_session(&params, &config, listener, socket) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
