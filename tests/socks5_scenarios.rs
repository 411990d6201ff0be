//! End-to-end scenarios exercising the connection handler over real TCP
//! sockets, one per outcome named in the component design: successful
//! CONNECT, domain resolution, userpass auth (both outcomes), BIND
//! rejection, and UDP fragment dropping.

use rustsocks_core::auth::{AuthConfig, Authenticator};
use rustsocks_core::resolver::Resolver;
use rustsocks_core::server::{handle_client, ServerContext};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn context(auth: AuthConfig) -> Arc<ServerContext> {
    Arc::new(ServerContext {
        authenticator: Arc::new(Authenticator::new(auth)),
        resolver: Arc::new(Resolver::default()),
    })
}

async fn spawn_client_pair(ctx: Arc<ServerContext>) -> (TcpStream, tokio::task::JoinHandle<rustsocks_core::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        handle_client(stream, ctx, peer).await
    });

    let client = TcpStream::connect(addr).await.unwrap();
    (client, handle)
}

/// S1: IPv4 CONNECT with no auth required succeeds and relays bytes.
#[tokio::test]
async fn s1_ipv4_connect_no_auth_success() {
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = echo_listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    let (mut client, handle) = spawn_client_pair(context(AuthConfig::default())).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&echo_addr.ip().to_string().split('.').map(|o| o.parse::<u8>().unwrap()).collect::<Vec<_>>());
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00); // REP = succeeded
    assert_eq!(reply[3], 0x01); // ATYP = IPv4

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    drop(client);
    let _ = handle.await;
}

/// S2: a domain-name CONNECT resolves through the address resolver and the
/// success reply carries the proxy's own bound address, not the domain.
#[tokio::test]
async fn s2_domain_connect_resolves() {
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = echo_listener.accept().await.unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    let (mut client, handle) = spawn_client_pair(context(AuthConfig::default())).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let domain = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    request.extend_from_slice(domain);
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "domain should resolve and connect successfully");
    // The bound address is the proxy's own outbound socket, never the domain.
    assert_eq!(reply[3], 0x01);

    drop(client);
    let _ = handle.await;
}

/// S3: username/password authentication with matching credentials succeeds
/// and the request phase proceeds.
#[tokio::test]
async fn s3_userpass_auth_success() {
    let auth = AuthConfig {
        require_auth: true,
        credentials: Some(("myusername".to_string(), "mypassword".to_string())),
    };

    let (mut client, handle) = spawn_client_pair(context(auth)).await;

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x02]);

    let userpass: &[u8] = &[
        0x01, 0x0a, b'm', b'y', b'u', b's', b'e', b'r', b'n', b'a', b'm', b'e', 0x0a, b'm', b'y',
        b'p', b'a', b's', b's', b'w', b'o', b'r', b'd',
    ];
    client.write_all(userpass).await.unwrap();

    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x00]);

    // Request phase is reachable: BIND is used here purely to observe a
    // well-formed reply without needing an upstream target.
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07); // CMD_NOT_SUPPORTED, proving the request phase ran

    let _ = handle.await;
}

/// S4: username/password authentication with the wrong password fails; the
/// server replies with status 0x01 and the connection is closed before the
/// request phase is reached.
#[tokio::test]
async fn s4_userpass_auth_failure() {
    let auth = AuthConfig {
        require_auth: true,
        credentials: Some(("myusername".to_string(), "mypassword".to_string())),
    };

    let (mut client, handle) = spawn_client_pair(context(auth)).await;

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x02]);

    let userpass: &[u8] = &[
        0x01, 0x0a, b'm', b'y', b'u', b's', b'e', b'r', b'n', b'a', b'm', b'e', 0x05, b'w', b'r',
        b'o', b'n', b'g',
    ];
    client.write_all(userpass).await.unwrap();

    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x01]);

    // No request phase: the connection is closed, so any further read hits EOF.
    let mut probe = [0u8; 1];
    let n = client.read(&mut probe).await.unwrap();
    assert_eq!(n, 0);

    let result = handle.await.unwrap();
    assert!(result.is_err());
}

/// S5: BIND is answered with CMD_NOT_SUPPORTED and the connection closes.
#[tokio::test]
async fn s5_bind_not_supported() {
    let (mut client, handle) = spawn_client_pair(context(AuthConfig::default())).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0],
        "BIND must be rejected with CMD_NOT_SUPPORTED"
    );

    let result = handle.await.unwrap();
    assert!(result.is_err());
}

/// S6: a fragmented UDP datagram (FRAG != 0) is silently dropped; a
/// subsequent FRAG=0 datagram is forwarded normally.
#[tokio::test]
async fn s6_udp_fragment_drop() {
    use rustsocks_core::resolver::Resolver;

    let echo_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let (n, from) = match echo_socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let _ = echo_socket.send_to(&buf[..n], from).await;
        }
    });

    let client_facing = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client_facing_addr = client_facing.local_addr().unwrap();
    let resolver = Arc::new(Resolver::default());
    let relay_socket = client_facing.clone();
    let relay = tokio::spawn(async move {
        rustsocks_core::relay::relay_udp(relay_socket, resolver).await
    });

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // FRAG = 1: must be dropped, no reply should ever arrive.
    let mut fragmented = vec![0x00, 0x00, 0x01, 0x01];
    fragmented.extend_from_slice(&echo_addr.ip().to_string().split('.').map(|o| o.parse::<u8>().unwrap()).collect::<Vec<_>>());
    fragmented.extend_from_slice(&echo_addr.port().to_be_bytes());
    fragmented.extend_from_slice(b"dropped");
    client.send_to(&fragmented, client_facing_addr).await.unwrap();

    let mut probe = [0u8; 1024];
    let dropped_result = tokio::time::timeout(
        std::time::Duration::from_millis(300),
        client.recv_from(&mut probe),
    )
    .await;
    assert!(dropped_result.is_err(), "fragmented datagram must not produce a reply");

    // FRAG = 0: forwarded normally.
    let mut normal = vec![0x00, 0x00, 0x00, 0x01];
    normal.extend_from_slice(&echo_addr.ip().to_string().split('.').map(|o| o.parse::<u8>().unwrap()).collect::<Vec<_>>());
    normal.extend_from_slice(&echo_addr.port().to_be_bytes());
    normal.extend_from_slice(b"forwarded");
    client.send_to(&normal, client_facing_addr).await.unwrap();

    let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut probe))
        .await
        .unwrap()
        .unwrap();
    assert!(probe[..n].ends_with(b"forwarded"));

    relay.abort();
}

/// A request whose reserved byte is non-zero is decoded (the header is a
/// fixed 4 bytes) but rejected with GENERAL_FAILURE rather than a silent
/// close, since the stream is still aligned on a record boundary.
#[tokio::test]
async fn reserved_nonzero_replies_general_failure() {
    let (mut client, handle) = spawn_client_pair(context(AuthConfig::default())).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    // RSV = 0x01 instead of 0x00.
    client
        .write_all(&[0x05, 0x01, 0x01, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x01, "non-zero RSV must reply GENERAL_FAILURE");

    let result = handle.await.unwrap();
    assert!(result.is_err());
}

/// An unrecognized ATYP byte is rejected with ADDRESS_TYPE_NOT_SUPPORTED.
#[tokio::test]
async fn unknown_address_type_replies_atyp_not_supported() {
    let (mut client, handle) = spawn_client_pair(context(AuthConfig::default())).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    // ATYP = 0x7f, not one of IPv4/domain/IPv6.
    client
        .write_all(&[0x05, 0x01, 0x00, 0x7f, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(
        reply[1], 0x08,
        "unsupported ATYP must reply ADDRESS_TYPE_NOT_SUPPORTED"
    );

    let result = handle.await.unwrap();
    assert!(result.is_err());
}

/// A connection that closes before a full 4-byte request header arrives
/// gets no reply at all: the stream was never aligned on a record boundary.
#[tokio::test]
async fn truncated_header_closes_without_a_reply() {
    let (mut client, handle) = spawn_client_pair(context(AuthConfig::default())).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    // Only 2 of the 4 header bytes, then drop the connection.
    client.write_all(&[0x05, 0x01]).await.unwrap();
    drop(client);

    let result = handle.await.unwrap();
    assert!(result.is_err());
}
