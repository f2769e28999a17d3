//! End-to-end routing through a proxy in unlimited mode.
//!
//! Real TLS clients and backends on loopback. The proxy never terminates TLS,
//! so a handshake only succeeds when the connection reached the backend that
//! owns the certificate.

mod harness;

use std::time::Duration;

use harness::{eventually, protocol_group, tls_roundtrip, ProxyHandle, TcpEchoBackend, TlsBackend};
use passthru::{Action, ServerMode, ServerOptions};
use passthru_config::CATCHALL;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn unlimited() -> ServerOptions {
    let mut options = ServerOptions::new(ServerMode::Unlimited);
    options.sniff_timeout = Duration::from_secs(2);
    options.dial_timeout = Duration::from_secs(2);
    options
}

async fn plaintext_roundtrip(proxy: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(payload).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn test_sni_selects_backend() {
    timeout(TEST_TIMEOUT, async {
        let alpha = TlsBackend::spawn("alpha.passthru.test", "ALPHA", &[])
            .await
            .unwrap();
        let beta = TlsBackend::spawn("beta.passthru.test", "BETA", &[])
            .await
            .unwrap();

        let group = protocol_group(&[
            ("TLS", "SNI alpha.passthru.test", alpha.forward()),
            ("TLS", "SNI beta.passthru.test", beta.forward()),
            (CATCHALL, CATCHALL, Action::Reject),
        ]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let reply = tls_roundtrip(
            proxy.addr(),
            "alpha.passthru.test",
            &alpha.cert_der,
            &[],
            b"who are you",
        )
        .await
        .unwrap();
        assert_eq!(reply, "ALPHA");

        let reply = tls_roundtrip(
            proxy.addr(),
            "beta.passthru.test",
            &beta.cert_der,
            &[],
            b"who are you",
        )
        .await
        .unwrap();
        assert_eq!(reply, "BETA");

        assert_eq!(alpha.connection_count(), 1);
        assert_eq!(beta.connection_count(), 1);

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().forwarded == 2).await);
        assert_eq!(stats.snapshot().catch_all, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_alpn_selects_backend() {
    timeout(TEST_TIMEOUT, async {
        let h2 = TlsBackend::spawn("app.passthru.test", "H2", &["h2"])
            .await
            .unwrap();
        let other = TlsBackend::spawn("app.passthru.test", "OTHER", &[])
            .await
            .unwrap();

        let group = protocol_group(&[
            ("TLS", "ALPN h2", h2.forward()),
            ("TLS", CATCHALL, other.forward()),
            (CATCHALL, CATCHALL, Action::Reject),
        ]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let reply = tls_roundtrip(
            proxy.addr(),
            "app.passthru.test",
            &h2.cert_der,
            &["h2", "http/1.1"],
            b"GET /",
        )
        .await
        .unwrap();
        assert_eq!(reply, "H2");

        // TLS without a matching ALPN lands on the TLS catch-all rule,
        // which is still an identification.
        let reply = tls_roundtrip(
            proxy.addr(),
            "app.passthru.test",
            &other.cert_der,
            &[],
            b"GET /",
        )
        .await
        .unwrap();
        assert_eq!(reply, "OTHER");

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().forwarded == 2).await);
        assert_eq!(stats.snapshot().catch_all, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_tls_without_matching_rule_uses_catch_all() {
    timeout(TEST_TIMEOUT, async {
        let alpha = TlsBackend::spawn("alpha.passthru.test", "ALPHA", &[])
            .await
            .unwrap();
        let fallback = TlsBackend::spawn("unknown.passthru.test", "FALLBACK", &[])
            .await
            .unwrap();

        let group = protocol_group(&[
            ("TLS", "SNI alpha.passthru.test", alpha.forward()),
            (CATCHALL, CATCHALL, fallback.forward()),
        ]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let reply = tls_roundtrip(
            proxy.addr(),
            "unknown.passthru.test",
            &fallback.cert_der,
            &[],
            b"hello",
        )
        .await
        .unwrap();
        assert_eq!(reply, "FALLBACK");
        assert_eq!(alpha.connection_count(), 0);

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().catch_all == 1).await);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_plaintext_falls_through_to_catch_all() {
    timeout(TEST_TIMEOUT, async {
        let echo = TcpEchoBackend::spawn().await.unwrap();

        let group = protocol_group(&[
            ("TLS", "SNI alpha.passthru.test", Action::Reject),
            (CATCHALL, CATCHALL, echo.forward()),
        ]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let reply = plaintext_roundtrip(proxy.addr(), b"SSH-2.0-OpenSSH_9.6\r\n").await;
        assert_eq!(reply, b"SSH-2.0-OpenSSH_9.6\r\n");
        assert_eq!(echo.connection_count(), 1);

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().forwarded == 1).await);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.catch_all, 1);
        assert_eq!(snapshot.bytes_to_destination, 21);
        assert_eq!(snapshot.bytes_from_destination, 21);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_silent_client_is_forwarded_after_sniff_timeout() {
    timeout(TEST_TIMEOUT, async {
        let echo = TcpEchoBackend::spawn().await.unwrap();

        let group = protocol_group(&[
            ("TLS", CATCHALL, Action::Reject),
            (CATCHALL, CATCHALL, echo.forward()),
        ]);
        let mut options = unlimited();
        options.sniff_timeout = Duration::from_millis(200);
        let proxy = ProxyHandle::spawn(group, options).await.unwrap();

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        assert!(eventually(|| echo.connection_count() == 1).await);

        // Bytes sent after the handoff still reach the destination.
        client.write_all(b"late hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late hello");

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().catch_all == 1).await);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_reject_closes_without_dialing() {
    timeout(TEST_TIMEOUT, async {
        let echo = TcpEchoBackend::spawn().await.unwrap();

        let group = protocol_group(&[
            ("TLS", "SNI alpha.passthru.test", echo.forward()),
            (CATCHALL, CATCHALL, Action::Reject),
        ]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut reply = Vec::new();
        let n = client.read_to_end(&mut reply).await.unwrap_or(0);
        assert_eq!(n, 0);

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().rejected == 1).await);
        assert_eq!(echo.connection_count(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unreachable_destination_counts_as_failure() {
    timeout(TEST_TIMEOUT, async {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let group = protocol_group(&[(CATCHALL, CATCHALL, Action::forward(dead_addr))]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        client.write_all(b"anything").await.unwrap();

        let mut reply = Vec::new();
        assert_eq!(client.read_to_end(&mut reply).await.unwrap_or(0), 0);

        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().failed == 1).await);
        assert_eq!(stats.snapshot().forwarded, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_stop_tears_down_open_pipes() {
    timeout(TEST_TIMEOUT, async {
        let echo = TcpEchoBackend::spawn().await.unwrap();
        let group = protocol_group(&[(CATCHALL, CATCHALL, echo.forward())]);
        let proxy = ProxyHandle::spawn(group, unlimited()).await.unwrap();

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        proxy.server.stop().await;
        assert!(proxy.server.is_stopped());

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap_or(0), 0);
        assert_eq!(proxy.server.stats().snapshot().connections_active, 0);

        // The listener is gone.
        assert!(TcpStream::connect(proxy.addr()).await.is_err());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_stop_interrupts_sniffing_without_dialing() {
    timeout(TEST_TIMEOUT, async {
        let echo = TcpEchoBackend::spawn().await.unwrap();
        let group = protocol_group(&[(CATCHALL, CATCHALL, echo.forward())]);
        let mut options = unlimited();
        options.sniff_timeout = Duration::from_secs(30);
        let proxy = ProxyHandle::spawn(group, options).await.unwrap();

        // Silent client: the proxy is still waiting for a ClientHello.
        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        let stats = proxy.server.stats();
        assert!(eventually(|| stats.snapshot().connections_active == 1).await);

        let started = tokio::time::Instant::now();
        proxy.server.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap_or(0), 0);
        assert_eq!(echo.connection_count(), 0);
        assert_eq!(stats.snapshot().catch_all, 0);
    })
    .await
    .expect("test timed out");
}
