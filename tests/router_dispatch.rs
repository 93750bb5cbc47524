//! End-to-end dispatch through real sockets: config → EdgeRouter → backends.

mod common;

use std::net::SocketAddr;

use edge_router::config::parse_config;
use edge_router::lifecycle::{EdgeRouter, Shutdown};
use edge_router::net::starttls::POSTGRES_SSL_REQUEST;
use edge_router::net::UpgraderRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{client_hello, connect_tls, read_until_closed, start_echo_backend, start_http_backend};

/// Start a router for `toml`, keeping its accept loops running for the test.
async fn start(toml: &str) -> (EdgeRouter, Shutdown) {
    let config = parse_config(toml).unwrap();
    let mut edge = EdgeRouter::start(config, UpgraderRegistry::with_defaults())
        .await
        .unwrap();
    let shutdown = Shutdown::new();
    edge.serve(&shutdown);
    (edge, shutdown)
}

fn tcp_config(echo: SocketAddr) -> String {
    format!(
        r#"
        [entry_points.edge]
        address = "127.0.0.1:0"

        [entry_points.pg]
        address = "127.0.0.1:0"
        starttls = "postgres"

        [[tcp.routers]]
        name = "db"
        rule = "HostSNI(`db.test`)"
        service = "echo"

        [tcp.routers.tls]
        passthrough = true

        [[tcp.routers]]
        name = "plain"
        entry_points = ["edge"]
        rule = "HostSNI(`*`)"
        service = "echo"

        [[tcp.services]]
        name = "echo"
        address = "{echo}"
        "#
    )
}

#[tokio::test]
async fn passthrough_replays_the_client_hello_byte_exact() {
    let echo = start_echo_backend().await;
    let (edge, _shutdown) = start(&tcp_config(echo)).await;
    let addr = edge.local_addr("edge").unwrap();

    let mut sent = client_hello("db.test");
    sent.extend_from_slice(b"application bytes after the hello");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&sent).await.unwrap();
    let mut received = vec![0u8; sent.len()];
    client.read_exact(&mut received).await.unwrap();

    assert_eq!(received, sent);
}

#[tokio::test]
async fn unmatched_tls_is_closed() {
    let echo = start_echo_backend().await;
    let (edge, _shutdown) = start(&tcp_config(echo)).await;
    let addr = edge.local_addr("edge").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&client_hello("other.test")).await.unwrap();
    assert_eq!(read_until_closed(&mut client).await, "");
}

#[tokio::test]
async fn plain_tcp_falls_to_the_catch_all() {
    let echo = start_echo_backend().await;
    let (edge, _shutdown) = start(&tcp_config(echo)).await;
    let addr = edge.local_addr("edge").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello over plain tcp").await.unwrap();
    let mut buf = [0u8; 20];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello over plain tcp");
}

#[tokio::test]
async fn postgres_starttls_then_passthrough() {
    let echo = start_echo_backend().await;
    let (edge, _shutdown) = start(&tcp_config(echo)).await;
    let addr = edge.local_addr("pg").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&POSTGRES_SSL_REQUEST).await.unwrap();
    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"S");

    let hello = client_hello("db.test");
    client.write_all(&hello).await.unwrap();
    let mut received = vec![0u8; hello.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, hello);
}

#[tokio::test]
async fn tls_route_terminates_with_the_matching_certificate() {
    let echo = start_echo_backend().await;
    let generated = rcgen::generate_simple_self_signed(vec!["secure.test".to_string()]).unwrap();
    let toml = format!(
        r#"
        [entry_points.edge]
        address = "127.0.0.1:0"

        [[tcp.routers]]
        name = "secure"
        rule = "HostSNI(`secure.test`)"
        service = "echo"

        [tcp.routers.tls]

        [[tcp.services]]
        name = "echo"
        address = "{echo}"

        [[tls.certificates]]
        cert_file = '''{cert}'''
        key_file = '''{key}'''
        "#,
        cert = generated.cert.pem(),
        key = generated.key_pair.serialize_pem(),
    );
    let (edge, _shutdown) = start(&toml).await;
    let addr = edge.local_addr("edge").unwrap();

    let mut tls = connect_tls(addr, "secure.test").await;
    let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
    assert_eq!(presented.as_ref(), generated.cert.der().as_ref());

    tls.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

async fn https_get(addr: SocketAddr, sni: &str, host: &str) -> String {
    let mut tls = connect_tls(addr, sni).await;
    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    read_until_closed(&mut tls).await
}

#[tokio::test]
async fn domain_fronting_across_tls_options_is_misdirected() {
    let backend = start_http_backend("backend-ok").await;
    let toml = format!(
        r#"
        [entry_points.web]
        address = "127.0.0.1:0"

        [[http.routers]]
        name = "host1"
        rule = "Host(`host1.local`)"
        service = "app"

        [http.routers.tls]
        options = "host1"

        [[http.routers]]
        name = "host2"
        rule = "Host(`host2.local`)"
        service = "app"

        [http.routers.tls]

        [[http.routers]]
        name = "host3"
        rule = "Host(`host3.local`)"
        service = "app"

        [http.routers.tls]

        [[http.services]]
        name = "app"
        url = "http://{backend}"

        [tls.options.host1]
        sni_strict = false
        "#
    );
    let (edge, _shutdown) = start(&toml).await;
    let addr = edge.local_addr("web").unwrap();

    let fronted = https_get(addr, "host2.local", "host1.local").await;
    assert!(fronted.starts_with("HTTP/1.1 421"), "{fronted}");

    let same_options = https_get(addr, "host2.local", "host3.local").await;
    assert!(same_options.starts_with("HTTP/1.1 200"), "{same_options}");
    assert!(same_options.contains("backend-ok"));

    let direct = https_get(addr, "host1.local", "host1.local:443").await;
    assert!(direct.starts_with("HTTP/1.1 200"), "{direct}");
}
