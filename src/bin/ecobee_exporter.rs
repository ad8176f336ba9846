// Ecobee Exporter - Ecobee thermostat metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::{crate_version, Parser};
use ecobee_exporter::client::EcobeeClient;
use ecobee_exporter::http::{http_route, RequestContext};
use ecobee_exporter::metrics::{EcobeeMetrics, MetricsExposition};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tokio::task;
use tracing::{event, span, Instrument, Level};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9098);
const DEFAULT_METRIC_PREFIX: &str = "ecobee";
const DEFAULT_TOKEN_FILE: &str = "/tmp/ecobee-tokens.json";

/// Expose ecobee thermostat and remote sensor readings as Prometheus metrics
///
/// Fetch the state of every thermostat registered to an ecobee account on
/// each scrape and expose it as Prometheus metrics. Talking to the ecobee
/// API requires an application key (created under the Developer panel of the
/// ecobee consumer portal) and a one-time PIN authorization, performed by
/// running the exporter with the --authorize flag.
#[derive(Debug, Parser)]
#[clap(name = "ecobee_exporter", version = crate_version!())]
struct EcobeeExporterApplication {
    /// ecobee application key used to authenticate against the ecobee API
    #[clap(long)]
    app_key: String,

    /// Path of the file OAuth tokens are persisted to between runs
    #[clap(long, default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,

    /// Prefix applied to the name of every exported metric
    #[clap(long, default_value = DEFAULT_METRIC_PREFIX)]
    metric_prefix: String,

    /// Request a new ecobee PIN, wait for it to be registered, then exit
    #[clap(long)]
    authorize: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error' (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, ecobee_exporter will bind to a public
    /// address since the purpose is to expose metrics to an external system
    /// (Prometheus or another agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = EcobeeExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let startup = Instant::now();

    // The client uses blocking I/O (it is only ever driven from the blocking
    // thread pool once the server is running), so build and use it off the
    // async runtime threads.
    let app_key = opts.app_key.clone();
    let token_file = opts.token_file.clone();
    let client = task::spawn_blocking(move || EcobeeClient::new(&app_key, &token_file))
        .await?
        .unwrap_or_else(|e| {
            event!(
                Level::ERROR,
                message = "failed to initialize ecobee API client",
                error = %e,
            );

            process::exit(1)
        });

    if opts.authorize {
        let res = task::spawn_blocking(move || client.authorize()).await?;
        return match res {
            Ok(()) => Ok(()),
            Err(e) => {
                event!(
                    Level::ERROR,
                    message = "PIN authorization failed",
                    error = %e,
                );

                process::exit(1)
            }
        };
    }

    let reg = prometheus::default_registry().clone();
    reg.register(Box::new(EcobeeMetrics::new(Box::new(client), &opts.metric_prefix)))
        .unwrap_or_else(|e| {
            event!(
                Level::ERROR,
                message = "failed to register ecobee metric collector",
                error = %e,
            );

            process::exit(1)
        });

    let metrics = MetricsExposition::new(reg);
    let context = Arc::new(RequestContext::new(metrics));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(span!(Level::DEBUG, "ecobee_request"))
            }))
        }
    });
    let server = Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        event!(
            Level::ERROR,
            message = "server failed to start",
            address = %opts.bind,
            error = %e,
        );

        process::exit(1);
    });

    event!(
        Level::INFO,
        message = "server started",
        address = %opts.bind,
        metric_prefix = %opts.metric_prefix,
    );

    server
        .serve(service)
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    event!(
        Level::INFO,
        message = "server shutdown",
        runtime_secs = %startup.elapsed().as_secs(),
    );

    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
