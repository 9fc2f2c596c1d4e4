// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

mod host;

use crate::host::WebHost;
use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use clap_derive::Parser;
use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use rpc_async_client::{LinkConfig, UpstreamLink};
use rpc_common::client_args::HostLinkArgs;
use serde_derive::{Deserialize, Serialize};
use stateplex_hub::{DEFAULT_STATUS_METHOD, Hub, HubConfig};
use std::net::SocketAddr;
use tokio::{
    net::TcpListener,
    select,
    signal::unix::{SignalKind, signal},
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Parser, Debug, Serialize, Deserialize)]
struct Args {
    #[command(flatten)]
    host_link: HostLinkArgs,

    #[arg(
        long,
        value_name = "listen-address",
        help = "HTTP listen address",
        default_value = "0.0.0.0:7125"
    )]
    listen_address: String,

    #[arg(
        long,
        help = "Events queued per client before the oldest are discarded",
        default_value = "256"
    )]
    mailbox_capacity: usize,

    #[arg(
        long,
        help = "Control host notification that carries status deltas",
        default_value = DEFAULT_STATUS_METHOD
    )]
    status_method: String,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,

    #[arg(long, help = "Yaml config file to use, overrides values in CLI args")]
    config_file: Option<String>,
}

async fn serve(listener: TcpListener, main_router: Router) -> eyre::Result<()> {
    let addr = listener.local_addr()?;
    info!("Listening on {:?}", addr);
    axum::serve(
        listener,
        main_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    info!("Done listening on {:?}", addr);
    Ok(())
}

fn mk_routes(web_host: WebHost) -> Router {
    Router::new()
        .route("/websocket", get(host::ws_handler))
        .route("/server/info", get(host::server_info_handler))
        .route("/server/jsonrpc", post(host::jsonrpc_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(web_host)
}

/// Layer the YAML config file, if any, over the command line.
fn load_args(cli_args: Args) -> Result<Args, figment::Error> {
    let config_file = cli_args.config_file.clone();
    let mut args_figment = Figment::new().merge(Serialized::defaults(cli_args));
    if let Some(config_file) = config_file {
        args_figment = args_figment.merge(Yaml::file(config_file));
    }
    args_figment.extract::<Args>()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args = load_args(Args::parse())?;

    stateplex_common::tracing::init_tracing(args.debug).unwrap_or_else(|e| {
        eprintln!("Unable to configure logging: {e}");
        std::process::exit(1);
    });

    let mut hup_signal = match signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register HUP signal handler: {}", e);
            std::process::exit(1);
        }
    };
    let mut stop_signal = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register STOP signal handler: {}", e);
            std::process::exit(1);
        }
    };

    let listen_address: SocketAddr = match args.listen_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(
                "Unable to parse listen address {}: {}",
                args.listen_address, e
            );
            std::process::exit(1);
        }
    };

    let link = UpstreamLink::new(LinkConfig::from(&args.host_link));
    let hub = Hub::new(
        HubConfig {
            mailbox_capacity: args.mailbox_capacity,
            status_method: args.status_method.clone(),
        },
        link.clone(),
    );

    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { link.run_supervisor(shutdown).await }
    });

    let listener = match TcpListener::bind(listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(?listen_address, "Unable to bind listener: {}", e);
            std::process::exit(1);
        }
    };
    let main_router = mk_routes(WebHost::new(hub));

    select! {
        result = serve(listener, main_router) => {
            if let Err(e) = result {
                error!("Listener failed: {}", e);
            }
        }
        _ = hup_signal.recv() => {
            info!("HUP received, stopping...");
        },
        _ = stop_signal.recv() => {
            info!("STOP received, stopping...");
        }
    }

    shutdown.cancel();
    let _ = supervisor.await;
    info!("Done.");

    Ok(())
}
