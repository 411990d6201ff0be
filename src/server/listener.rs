use crate::auth::Authenticator;
use crate::config::Config;
use crate::resolver::Resolver;
use crate::server::handler::{handle_client, ServerContext};
use crate::utils::error::Result;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Accepts SOCKS5 connections and admits them against a fixed capacity.
///
/// Capacity is enforced the same way the reference implementation's bounded
/// semaphore does: a connection that arrives once the server is already at
/// `max_connections` is rejected immediately rather than queued.
pub struct SocksServer {
    config: Config,
    ctx: Arc<ServerContext>,
    admission: Arc<Semaphore>,
}

impl SocksServer {
    pub fn new(mut config: Config) -> Self {
        config.apply_env_overrides();

        let authenticator = Arc::new(Authenticator::new(config.auth_config()));
        let resolver = Arc::new(Resolver::default());
        let ctx = Arc::new(ServerContext {
            authenticator,
            resolver,
        });
        let admission = Arc::new(Semaphore::new(config.server.max_connections));

        Self {
            config,
            ctx,
            admission,
        }
    }

    /// Bind the listening socket, applying `SO_REUSEADDR` the way the
    /// teacher's listener tunes its socket before handing it to Tokio.
    fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        TcpListener::from_std(socket.into())
    }

    /// Run the accept loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let bind_addr: SocketAddr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.bind_port
        )
        .parse()
        .map_err(|e| crate::utils::error::ProxyError::Config(format!("invalid bind address: {e}")))?;

        let listener = Self::bind_listener(bind_addr)?;
        info!(address = %bind_addr, max_connections = self.config.server.max_connections, "listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, client_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    let permit = match self.admission.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%client_addr, "connection rejected: at max_connections capacity");
                            drop(stream);
                            continue;
                        }
                    };

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        info!(%client_addr, "connection accepted");
                        if let Err(e) = handle_client(stream, ctx, client_addr).await {
                            warn!(%client_addr, error = %e, "connection ended with error");
                        } else {
                            info!(%client_addr, "connection closed");
                        }
                    });
                }
            }
        }
    }
}
