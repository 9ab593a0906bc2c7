//! Starting and stopping the daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::oneshot;

use crate::client::TokenAccessClient;
use crate::config::Config;
use crate::constants::{TOKENKEEPER_SERVER_APP, TOKENKEEPER_VERSION};

use super::DaemonError;
use super::http::server::HttpServer;

/// Runs the daemon until it is interrupted or the listener fails.
///
/// If `signal_running` is given, the bound address is sent through it once
/// the daemon accepts connections. On Ctrl-C the token access cache is
/// invalidated, which waits for running operations and closes every
/// library.
pub async fn start_tokenkeeper_daemon(
    config: Arc<Config>,
    access: TokenAccessClient,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
) -> Result<(), DaemonError> {
    let server = Arc::new(HttpServer::new(access, &config));

    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| DaemonError::Bind(addr, err))?;
    let local_addr = listener.local_addr().unwrap_or(addr);

    info!(
        "{TOKENKEEPER_SERVER_APP} {TOKENKEEPER_VERSION} listening on {local_addr}"
    );
    if let Some(tx) = signal_running {
        let _ = tx.send(local_addr);
    }

    let res = select!(
        res = single_http_listener(server.clone(), listener, local_addr) => {
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            Ok(())
        }
    );

    if let TokenAccessClient::Local(access) = server.access() {
        let access = access.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || {
            access.cache().invalidate_all()
        })
        .await
        {
            error!("Could not close token libraries: {err}");
        }
    }

    res
}

/// Serves HTTP connections on an already bound listener.
async fn single_http_listener(
    server: Arc<HttpServer>,
    listener: TcpListener,
    addr: SocketAddr,
) -> Result<(), DaemonError> {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                error!("Fatal error in HTTP server {addr}: {err}");
                return Err(DaemonError::Accept(addr, err));
            }
        };
        let server = server.clone();
        tokio::task::spawn(async move {
            let _ = hyper_util::server::conn::auto::Builder::new(
                TokioExecutor::new(),
            )
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.process_request(req).await }
                }),
            )
            .await;
        });
    }
}
