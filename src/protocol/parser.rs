use super::types::*;
use crate::utils::error::{ProxyError, Result};
use bytes::Bytes;
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Read the client greeting: `VER | NMETHODS | METHODS`.
pub async fn read_greeting<S>(stream: &mut S) -> Result<ClientGreeting>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(ProxyError::BadVersion(version));
    }

    let nmethods = stream.read_u8().await?;

    // SmallVec avoids a heap allocation for the common 1-3 method case.
    let mut methods_buf = SmallVec::<[u8; 8]>::from_elem(0, nmethods as usize);
    stream.read_exact(&mut methods_buf).await?;

    let methods: Vec<AuthMethod> = methods_buf.into_iter().map(AuthMethod::from).collect();

    trace!("parsed client greeting: {} methods", methods.len());

    Ok(ClientGreeting { methods })
}

/// Write the method-selection reply: `VER | METHOD`.
pub async fn write_method_selection<S>(stream: &mut S, method: AuthMethod) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let buf = [SOCKS_VERSION, method as u8];
    stream.write_all(&buf).await?;
    stream.flush().await?;
    trace!("sent method selection: {:?}", method);
    Ok(())
}

/// Read an RFC 1929 username/password sub-negotiation record.
pub async fn read_userpass<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let version = stream.read_u8().await?;
    if version != 0x01 {
        return Err(ProxyError::Protocol(format!(
            "unsupported userpass sub-negotiation version: 0x{:02x}",
            version
        )));
    }

    let username_len = stream.read_u8().await? as usize;
    let mut username_buf = SmallVec::<[u8; 64]>::from_elem(0, username_len);
    stream.read_exact(&mut username_buf).await?;
    let username = String::from_utf8(username_buf.to_vec())
        .map_err(|_| ProxyError::Protocol("invalid username encoding".to_string()))?;

    let password_len = stream.read_u8().await? as usize;
    let mut password_buf = SmallVec::<[u8; 64]>::from_elem(0, password_len);
    stream.read_exact(&mut password_buf).await?;
    let password = String::from_utf8(password_buf.to_vec())
        .map_err(|_| ProxyError::Protocol("invalid password encoding".to_string()))?;

    Ok((username, password))
}

/// Write the RFC 1929 sub-negotiation result: `VER | STATUS`.
pub async fn write_userpass_result<S>(stream: &mut S, success: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let status = if success { 0x00 } else { 0x01 };
    stream.write_all(&[0x01, status]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a SOCKS5 request: `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`.
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut header = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut header).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProxyError::IncompleteHeader
        } else {
            ProxyError::Io(e)
        });
    }

    let version = header[0];
    let command = header[1];
    let reserved = header[2];
    let address_type = header[3];

    if version != SOCKS_VERSION {
        return Err(ProxyError::BadVersion(version));
    }
    if reserved != 0x00 {
        return Err(ProxyError::ReservedNonZero);
    }

    let command = Command::try_from(command)?;
    let address = read_address(stream, address_type).await?;
    let port = stream.read_u16().await?;

    Ok(Socks5Request {
        command,
        address,
        port,
    })
}

/// Read an address body for the given ATYP, not including the trailing port.
pub async fn read_address<S>(stream: &mut S, address_type: u8) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match address_type {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ok(Address::IPv4(addr))
        }
        0x03 => {
            let domain_len = stream.read_u8().await? as usize;
            let mut domain_buf = SmallVec::<[u8; 128]>::from_elem(0, domain_len);
            stream.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf.to_vec())
                .map_err(|_| ProxyError::Protocol("invalid domain encoding".to_string()))?;
            Ok(Address::Domain(domain))
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ok(Address::IPv6(addr))
        }
        other => Err(ProxyError::UnsupportedAddressType(other)),
    }
}

/// Write a SOCKS5 reply: `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`.
pub async fn write_reply<S>(
    stream: &mut S,
    reply: ReplyCode,
    bind_addr: &Address,
    bind_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = SmallVec::<[u8; 256]>::new();
    buf.push(SOCKS_VERSION);
    buf.push(reply as u8);
    buf.push(0x00);

    match bind_addr {
        Address::IPv4(octets) => {
            buf.push(0x01);
            buf.extend_from_slice(octets);
        }
        Address::IPv6(octets) => {
            buf.push(0x04);
            buf.extend_from_slice(octets);
        }
        Address::Domain(domain) => {
            if domain.len() > 255 {
                return Err(ProxyError::Protocol(format!(
                    "domain name too long: {} octets (max 255)",
                    domain.len()
                )));
            }
            buf.push(0x03);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }

    buf.extend_from_slice(&bind_port.to_be_bytes());

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Decode a SOCKS-UDP datagram: `RSV(2) | FRAG | ATYP | DST.ADDR | DST.PORT | DATA`.
pub fn decode_udp_datagram(buf: Bytes) -> Result<UdpDatagram> {
    if buf.len() < 4 {
        return Err(ProxyError::Protocol("UDP datagram too short".to_string()));
    }

    let mut pos = 0;
    // RSV must be 0x0000 per RFC 1928 §7; malformed values are tolerated
    // rather than rejected since no reply is ever sent for UDP traffic.
    pos += 2;

    let frag = buf[pos];
    pos += 1;
    let address_type = buf[pos];
    pos += 1;

    let (address, consumed) = decode_udp_address(&buf[pos..], address_type)?;
    pos += consumed;

    if buf.len() < pos + 2 {
        return Err(ProxyError::Protocol(
            "UDP datagram missing port".to_string(),
        ));
    }
    let port = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;

    let data = buf.slice(pos..);

    Ok(UdpDatagram {
        header: UdpHeader {
            frag,
            address,
            port,
        },
        data,
    })
}

fn decode_udp_address(buf: &[u8], address_type: u8) -> Result<(Address, usize)> {
    match address_type {
        0x01 => {
            if buf.len() < 4 {
                return Err(ProxyError::Protocol("truncated IPv4 in UDP datagram".to_string()));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[..4]);
            Ok((Address::IPv4(octets), 4))
        }
        0x03 => {
            if buf.is_empty() {
                return Err(ProxyError::Protocol(
                    "truncated domain length in UDP datagram".to_string(),
                ));
            }
            let len = buf[0] as usize;
            if buf.len() < 1 + len {
                return Err(ProxyError::Protocol(
                    "truncated domain name in UDP datagram".to_string(),
                ));
            }
            let domain = String::from_utf8(buf[1..1 + len].to_vec()).map_err(|_| {
                ProxyError::Protocol("invalid domain encoding in UDP datagram".to_string())
            })?;
            Ok((Address::Domain(domain), 1 + len))
        }
        0x04 => {
            if buf.len() < 16 {
                return Err(ProxyError::Protocol("truncated IPv6 in UDP datagram".to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            Ok((Address::IPv6(octets), 16))
        }
        other => Err(ProxyError::UnsupportedAddressType(other)),
    }
}

/// Encode a SOCKS-UDP datagram header followed by `data`.
pub fn encode_udp_datagram(header: &UdpHeader, data: &[u8]) -> Vec<u8> {
    let addr_len = match &header.address {
        Address::IPv4(_) => 4,
        Address::IPv6(_) => 16,
        Address::Domain(d) => 1 + d.len().min(255),
    };
    let mut buf = Vec::with_capacity(4 + addr_len + 2 + data.len());

    buf.extend_from_slice(&[0x00, 0x00]); // RSV
    buf.push(header.frag);

    match &header.address {
        Address::IPv4(octets) => {
            buf.push(0x01);
            buf.extend_from_slice(octets);
        }
        Address::IPv6(octets) => {
            buf.push(0x04);
            buf.extend_from_slice(octets);
        }
        Address::Domain(domain) => {
            let len = domain.len().min(255);
            buf.push(0x03);
            buf.push(len as u8);
            buf.extend_from_slice(&domain.as_bytes()[..len]);
        }
    }

    buf.extend_from_slice(&header.port.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}
