use crate::auth::Authenticator;
use crate::protocol::*;
use crate::relay::{relay_tcp, relay_udp};
use crate::resolver::Resolver;
use crate::utils::error::{ProxyError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

/// Per-connection dependencies shared across the whole server.
pub struct ServerContext {
    pub authenticator: Arc<Authenticator>,
    pub resolver: Arc<Resolver>,
}

fn optimize_tcp_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on client socket");
    }
}

/// Drive one client connection through the full state machine: greeting,
/// authentication, request, dispatch, relay. Any error that occurs before a
/// reply has been sent is surfaced to the caller for logging; errors after
/// that point have already produced the appropriate SOCKS5 reply.
pub async fn handle_client(
    mut client_stream: TcpStream,
    ctx: Arc<ServerContext>,
    client_addr: SocketAddr,
) -> Result<()> {
    optimize_tcp_socket(&client_stream);

    let greeting = read_greeting(&mut client_stream).await?;
    debug!(?greeting.methods, %client_addr, "client offered auth methods");

    let method = ctx.authenticator.negotiate(&greeting.methods);
    write_method_selection(&mut client_stream, method).await?;

    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::NoAcceptableMethods);
    }

    ctx.authenticator.authenticate(&mut client_stream, method).await?;

    let request = match read_request(&mut client_stream).await {
        Ok(request) => request,
        Err(e) => return reject_request(&mut client_stream, e).await,
    };

    let logged_address = match &request.address {
        Address::IPv4(octets) => {
            ctx.resolver
                .reverse_for_logging(IpAddr::V4(std::net::Ipv4Addr::from(*octets)))
                .await
        }
        Address::IPv6(octets) => {
            ctx.resolver
                .reverse_for_logging(IpAddr::V6(std::net::Ipv6Addr::from(*octets)))
                .await
        }
        Address::Domain(domain) => domain.to_string(),
    };
    info!(%client_addr, command = ?request.command, address = %logged_address, port = request.port, "request received");

    match request.command {
        Command::Connect => handle_connect(client_stream, &ctx, request).await,
        Command::Bind => handle_bind(client_stream).await,
        Command::UdpAssociate => handle_udp_associate(client_stream, client_addr, &ctx).await,
    }
}

/// Writes the reply a malformed request deserves before closing. A short
/// read leaves the stream desynchronized on a record boundary, so nothing is
/// written in that case; every other parse failure was decoded far enough to
/// know the request's shape, so the connection gets a proper SOCKS5 reply
/// before it closes, per RFC 1928.
async fn reject_request(client_stream: &mut TcpStream, err: ProxyError) -> Result<()> {
    if err.is_short_read() {
        return Err(err);
    }

    let reply_code = match &err {
        ProxyError::UnsupportedAddressType(_) => ReplyCode::AddressTypeNotSupported,
        ProxyError::UnsupportedCommand(_) => ReplyCode::CommandNotSupported,
        ProxyError::BadVersion(_) | ProxyError::ReservedNonZero => ReplyCode::GeneralFailure,
        _ => ReplyCode::GeneralFailure,
    };

    write_reply(client_stream, reply_code, &Address::IPv4([0, 0, 0, 0]), 0).await?;
    Err(err)
}

async fn resolve_target(address: &Address, port: u16, resolver: &Resolver) -> Result<SocketAddr> {
    match address {
        Address::IPv4(octets) => Ok(SocketAddr::from((std::net::Ipv4Addr::from(*octets), port))),
        Address::IPv6(octets) => Ok(SocketAddr::from((std::net::Ipv6Addr::from(*octets), port))),
        Address::Domain(domain) => resolver.resolve(domain, port).await,
    }
}

/// Maps a connect/resolve failure to the closest RFC 1928 reply code.
/// `io::Error::kind()` doesn't distinguish "network unreachable" from
/// "host unreachable" on stable Rust, so a generic failure is used for
/// anything that isn't a clean connection refusal or a resolution error.
fn reply_for_error(err: &ProxyError) -> ReplyCode {
    match err {
        ProxyError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            ReplyCode::ConnectionRefused
        }
        ProxyError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        ProxyError::Protocol(_) => ReplyCode::HostUnreachable,
        _ => ReplyCode::GeneralFailure,
    }
}

async fn handle_connect(
    mut client_stream: TcpStream,
    ctx: &ServerContext,
    request: Socks5Request,
) -> Result<()> {
    let target = match resolve_target(&request.address, request.port, &ctx.resolver).await {
        Ok(addr) => addr,
        Err(e) => {
            write_reply(&mut client_stream, reply_for_error(&e), &Address::IPv4([0, 0, 0, 0]), 0)
                .await?;
            return Err(e);
        }
    };

    let upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            let err = ProxyError::Io(e);
            write_reply(&mut client_stream, reply_for_error(&err), &Address::IPv4([0, 0, 0, 0]), 0)
                .await?;
            return Err(err);
        }
    };

    optimize_tcp_socket(&upstream);

    let bound = upstream.local_addr()?;
    write_reply(
        &mut client_stream,
        ReplyCode::Succeeded,
        &Address::from_ip(bound.ip()),
        bound.port(),
    )
    .await?;

    relay_tcp(client_stream, upstream).await
}

/// `BIND` is out of scope; every request for it is answered with
/// `CommandNotSupported` and the connection is then closed.
async fn handle_bind(mut client_stream: TcpStream) -> Result<()> {
    write_reply(
        &mut client_stream,
        ReplyCode::CommandNotSupported,
        &Address::IPv4([0, 0, 0, 0]),
        0,
    )
    .await?;
    Err(ProxyError::UnsupportedCommand(Command::Bind as u8))
}

async fn handle_udp_associate(
    mut client_stream: TcpStream,
    client_addr: SocketAddr,
    ctx: &ServerContext,
) -> Result<()> {
    let bind_ip = client_stream.local_addr()?.ip();
    let udp_bind_addr: SocketAddr = match bind_ip {
        IpAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        IpAddr::V6(_) => "[::]:0".parse().unwrap(),
    };

    let udp_socket = match UdpSocket::bind(udp_bind_addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            write_reply(
                &mut client_stream,
                ReplyCode::GeneralFailure,
                &Address::IPv4([0, 0, 0, 0]),
                0,
            )
            .await?;
            return Err(e.into());
        }
    };

    let bound = udp_socket.local_addr()?;
    write_reply(
        &mut client_stream,
        ReplyCode::Succeeded,
        &Address::from_ip(bound.ip()),
        bound.port(),
    )
    .await?;

    info!(%client_addr, relay_addr = %bound, "UDP association established");

    let relay_socket = udp_socket.clone();
    let resolver = ctx.resolver.clone();
    let relay_task = tokio::spawn(async move { relay_udp(relay_socket, resolver).await });

    // The association lives as long as the TCP control connection stays
    // open; any byte (or EOF) on it ends the UDP relay.
    let mut probe = [0u8; 1];
    let _ = client_stream.read(&mut probe).await;

    relay_task.abort();
    info!(%client_addr, "UDP association closed");
    Ok(())
}
