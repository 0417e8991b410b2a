//! End-to-end sessions through the front door: SOCKS5, SOCKS4a and HTTP
//! clients against a local echo server, with fragmentation enabled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use slipgate::address::Address;
use slipgate::config::{Config, Session};
use slipgate::dialer::hello::ClientHelloSpec;
use slipgate::dialer::tls::TlsPolicy;
use slipgate::dialer::Dialer;
use slipgate::handler::Handler;
use slipgate::pool::BufferPool;
use slipgate::resolve::Resolver;
use slipgate::socks::statute::{self, Socks5Request};
use slipgate::socks::ProxyFrontend;
use slipgate::transport::tunnel::WsTunnel;
use slipgate::transport::Transport;

/// Echo server: every chunk read is written straight back.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Assemble the full stack from a config snippet and serve it on an
/// ephemeral port.
async fn start_frontend(config_json: &str) -> (SocketAddr, CancellationToken) {
    let config = Config::from_json(config_json).unwrap();
    let session = Session::generate();
    let worker = config.worker_policy();

    let dialer = Arc::new(Dialer::new(
        TlsPolicy::from_config(&config.tls),
        config.fragment_policy(),
        false,
    ));
    let resolver = Arc::new(Resolver::new(
        &config.dns,
        worker.clone(),
        Arc::clone(&dialer),
    ));
    let pool = Arc::new(BufferPool::default());
    let frame_timeout = Duration::from_secs(config.udp.timeout);
    let ws_tunnel = Arc::new(WsTunnel::new(
        Arc::clone(&dialer),
        worker.clone(),
        frame_timeout,
        frame_timeout,
        session.client_id.clone(),
    ));
    let transport = Arc::new(Transport::new(
        Arc::clone(&pool),
        ws_tunnel,
        "127.0.0.1".to_string(),
        session.session_id.clone(),
        worker.sni.clone(),
    ));
    let handler = Arc::new(Handler::new(
        resolver,
        dialer,
        transport,
        worker,
        pool,
        config.udp.enable,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let frontend = ProxyFrontend::new(addr.to_string(), handler, cancel.clone());
    tokio::spawn(async move {
        let _ = frontend.serve(listener).await;
    });

    (addr, cancel)
}

fn fragment_config(echo_domain: &str) -> String {
    format!(
        r#"{{
            "server": {{"bind": "127.0.0.1:0"}},
            "fragment": {{
                "enable": true,
                "mode": "advanced",
                "delay": [0, 0],
                "advanced": {{"bsl": [5, 5], "sl": [2, 2], "asl": [5, 5]}}
            }},
            "dns": {{"hosts": [{{"domain": "{echo_domain}", "ip": "127.0.0.1"}}]}}
        }}"#
    )
}

async fn socks5_handshake(proxy: SocketAddr, dst: Address) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(&[statute::VERSION_SOCKS5, 1, statute::METHOD_NO_AUTH])
        .await
        .unwrap();
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(
        method_reply,
        [statute::VERSION_SOCKS5, statute::METHOD_NO_AUTH]
    );

    let request = Socks5Request {
        version: statute::VERSION_SOCKS5,
        command: statute::CMD_CONNECT,
        dst,
    };
    stream.write_all(&request.bytes()).await.unwrap();
    stream
}

async fn read_reply(stream: &mut TcpStream) -> u8 {
    // VER REP RSV ATYP + IPv4 + port
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], statute::VERSION_SOCKS5);
    reply[1]
}

#[tokio::test]
async fn socks5_connect_fragments_client_hello() {
    let echo = start_echo_server().await;
    let (proxy, _cancel) = start_frontend(&fragment_config("echo.test")).await;

    let mut stream =
        socks5_handshake(proxy, Address::Domain("echo.test".to_string(), echo.port())).await;
    assert_eq!(read_reply(&mut stream).await, statute::REP_SUCCESS);

    let hello = ClientHelloSpec::padded("echo.test", 40).encode();
    stream.write_all(&hello).await.unwrap();

    let mut echoed = vec![0u8; hello.len()];
    stream.read_exact(&mut echoed).await.unwrap();

    // Byte-for-byte except the SNI case mangling
    assert_eq!(echoed.to_ascii_lowercase(), hello.to_ascii_lowercase());
}

#[tokio::test]
async fn socks4a_connect_gets_fixed_reply() {
    let echo = start_echo_server().await;
    let (proxy, _cancel) = start_frontend(&fragment_config("echo.test")).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]); // SOCKS4a marker IP
    request.extend_from_slice(b"user\0");
    request.extend_from_slice(b"echo.test\0");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    stream.write_all(b"ping-4a").await.unwrap();
    let mut echoed = [0u8; 7];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping-4a");
}

#[tokio::test]
async fn http_request_is_redirected_and_host_mangled() {
    let echo = start_echo_server().await;
    let (proxy, _cancel) = start_frontend(&fragment_config("echo.test")).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://echo.test:{port}/ HTTP/1.1\r\nHost: echo.test:{port}\r\n\r\n",
        port = echo.port()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    let text = String::from_utf8(echoed).unwrap();
    assert!(text.contains("hOSt: echo.test"), "got: {text}");
    assert!(!text.contains("Host:"));
}

#[tokio::test]
async fn dpi_sinkhole_recovers_via_first_packet() {
    // The client arrives with a poisoned literal IP out of the sinkhole
    // range; the SNI in its first packet names the real destination.
    let echo = start_echo_server().await;
    let (proxy, _cancel) = start_frontend(&fragment_config("echo.test")).await;

    let mut stream =
        socks5_handshake(proxy, Address::IPv4([10, 10, 3, 7], echo.port())).await;
    assert_eq!(read_reply(&mut stream).await, statute::REP_SUCCESS);

    let hello = ClientHelloSpec::padded("echo.test", 24).encode();
    stream.write_all(&hello).await.unwrap();

    let mut echoed = vec![0u8; hello.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed.to_ascii_lowercase(), hello.to_ascii_lowercase());
}

#[tokio::test]
async fn socks5_bind_is_rejected() {
    let (proxy, _cancel) = start_frontend(&fragment_config("echo.test")).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(&[statute::VERSION_SOCKS5, 1, statute::METHOD_NO_AUTH])
        .await
        .unwrap();
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await.unwrap();

    let request = Socks5Request {
        version: statute::VERSION_SOCKS5,
        command: statute::CMD_BIND,
        dst: Address::IPv4([127, 0, 0, 1], 80),
    };
    stream.write_all(&request.bytes()).await.unwrap();
    assert_eq!(
        read_reply(&mut stream).await,
        statute::REP_COMMAND_NOT_SUPPORTED
    );
}

#[tokio::test]
async fn socks5_rejects_auth_only_clients() {
    let (proxy, _cancel) = start_frontend(&fragment_config("echo.test")).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    // Offer only username/password auth
    stream
        .write_all(&[statute::VERSION_SOCKS5, 1, 0x02])
        .await
        .unwrap();
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(
        method_reply,
        [statute::VERSION_SOCKS5, statute::METHOD_NO_ACCEPTABLE]
    );
}

#[tokio::test]
async fn resolution_failure_reports_host_unreachable() {
    // DoH server that refuses connections: resolution must fail fast and
    // surface as HOST_UNREACHABLE after the success reply.
    let config = r#"{
        "server": {"bind": "127.0.0.1:0"},
        "dns": {"type": "doh", "address": "https://127.0.0.1:1/dns-query"}
    }"#;
    let (proxy, _cancel) = start_frontend(config).await;

    let mut stream =
        socks5_handshake(proxy, Address::Domain("blocked.test".to_string(), 443)).await;
    assert_eq!(read_reply(&mut stream).await, statute::REP_SUCCESS);

    // The engine reads the first packet before resolving
    stream.write_all(b"x").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, statute::REP_HOST_UNREACHABLE);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (proxy, cancel) = start_frontend(&fragment_config("echo.test")).await;

    // Frontend is alive
    let probe = TcpStream::connect(proxy).await;
    assert!(probe.is_ok());
    drop(probe);

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(TcpStream::connect(proxy).await.is_err());
}
