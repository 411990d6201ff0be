use crate::protocol::{decode_udp_datagram, encode_udp_datagram, Address, UdpHeader};
use crate::resolver::Resolver;
use crate::utils::error::{ProxyError, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// How long the association waits for the next datagram from the client
/// before the `UDP ASSOCIATE` session is torn down.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a single forwarded datagram waits for a response from the
/// destination before that particular exchange is abandoned.
pub const UDP_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Per-datagram SOCKS-UDP relay: each client datagram is unwrapped, forwarded
/// to its destination on a freshly opened socket, and the response (if any
/// arrives within the forward timeout) is wrapped back into a SOCKS-UDP
/// reply and sent to the client. There is no persistent NAT table; every
/// datagram is handled independently, matching how a stateless relay would
/// treat unrelated packets.
pub async fn relay_udp(client_socket: Arc<UdpSocket>, resolver: Arc<Resolver>) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, client_addr) = match timeout(UDP_IDLE_TIMEOUT, client_socket.recv_from(&mut buf)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e.into()),
            Err(_timeout) => {
                debug!("UDP association idle timeout reached; closing");
                return Ok(());
            }
        };

        let datagram = match decode_udp_datagram(Bytes::copy_from_slice(&buf[..len])) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "dropping malformed UDP datagram");
                continue;
            }
        };

        if datagram.header.frag != 0 {
            warn!("dropping fragmented UDP datagram (fragmentation is not supported)");
            continue;
        }

        let dest_addr = match resolve_destination(&datagram.header, &resolver).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "failed to resolve UDP destination");
                continue;
            }
        };

        if let Err(e) =
            forward_datagram(&client_socket, client_addr, &datagram.header, dest_addr, &datagram.data)
                .await
        {
            warn!(error = %e, "UDP forward exchange failed");
        }
    }
}

async fn resolve_destination(header: &UdpHeader, resolver: &Resolver) -> Result<SocketAddr> {
    match &header.address {
        Address::IPv4(octets) => Ok(SocketAddr::from((
            std::net::Ipv4Addr::from(*octets),
            header.port,
        ))),
        Address::IPv6(octets) => Ok(SocketAddr::from((
            std::net::Ipv6Addr::from(*octets),
            header.port,
        ))),
        Address::Domain(domain) => resolver.resolve(domain, header.port).await,
    }
}

async fn forward_datagram(
    client_socket: &UdpSocket,
    client_addr: SocketAddr,
    header: &UdpHeader,
    dest_addr: SocketAddr,
    payload: &[u8],
) -> Result<()> {
    let forward_bind = if dest_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let forward_socket = UdpSocket::bind(forward_bind).await?;

    forward_socket.send_to(payload, dest_addr).await?;

    let mut response_buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (response_len, from) = match timeout(
        UDP_FORWARD_TIMEOUT,
        forward_socket.recv_from(&mut response_buf),
    )
    .await
    {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(e.into()),
        Err(_timeout) => {
            return Err(ProxyError::Protocol(format!(
                "no response from {dest_addr} within forward timeout"
            )))
        }
    };

    // No source-address validation against `dest_addr`: a destination
    // replying from a different local address (e.g. a multi-homed host)
    // is still relayed back, matching the reference relay's behavior.
    let _ = from;

    let reply_header = UdpHeader {
        frag: 0,
        address: Address::from_ip(dest_addr.ip()),
        port: dest_addr.port(),
    };
    let reply = encode_udp_datagram(&reply_header, &response_buf[..response_len]);

    client_socket.send_to(&reply, client_addr).await?;
    let _ = header;
    Ok(())
}
