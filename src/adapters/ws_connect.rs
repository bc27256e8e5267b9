//! WebSocket connect shared by both feeds, tunnelling through an HTTP CONNECT
//! proxy when one is set in the environment.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, UpDownError};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Get proxy URL from environment variables
fn get_proxy_url() -> Option<String> {
    std::env::var("HTTPS_PROXY")
        .or_else(|_| std::env::var("https_proxy"))
        .or_else(|_| std::env::var("ALL_PROXY"))
        .or_else(|_| std::env::var("all_proxy"))
        .ok()
}

/// Parse proxy URL into host and port
fn parse_proxy_url(proxy_url: &str) -> Option<(String, u16)> {
    let url = if proxy_url.contains("://") {
        Url::parse(proxy_url).ok()?
    } else {
        Url::parse(&format!("http://{}", proxy_url)).ok()?
    };

    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(8080);
    Some((host, port))
}

/// Open a TCP tunnel to `target_host:target_port` through an HTTP CONNECT proxy
async fn connect_via_proxy(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    let proxy_addr = format!("{}:{}", proxy_host, proxy_port);
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&proxy_addr))
        .await
        .map_err(|_| UpDownError::Internal(format!("Proxy connection timeout: {}", proxy_addr)))??;

    let connect_request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: keep-alive\r\n\r\n",
        host = target_host,
        port = target_port
    );

    let (reader, mut writer) = stream.into_split();
    writer.write_all(connect_request.as_bytes()).await?;

    let mut buf_reader = BufReader::new(reader);
    let mut response_line = String::new();
    buf_reader.read_line(&mut response_line).await?;

    if !response_line.contains("200") {
        return Err(UpDownError::Internal(format!(
            "Proxy CONNECT failed: {}",
            response_line.trim()
        )));
    }

    // Consume remaining headers
    loop {
        let mut line = String::new();
        buf_reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
    }

    let stream = buf_reader
        .into_inner()
        .reunite(writer)
        .map_err(|e| UpDownError::Internal(format!("Failed to reunite stream: {}", e)))?;

    debug!("Proxy tunnel established to {}:{}", target_host, target_port);
    Ok(stream)
}

/// Connect a WebSocket, using the environment proxy if one is set
pub(crate) async fn connect_websocket(url: &Url) -> Result<WsStream> {
    let host = url
        .host_str()
        .ok_or_else(|| UpDownError::Internal(format!("WebSocket URL has no host: {}", url)))?;
    let port = url.port_or_known_default().unwrap_or(443);

    if let Some((proxy_host, proxy_port)) = get_proxy_url().as_deref().and_then(parse_proxy_url) {
        info!("Using proxy {}:{} for {}", proxy_host, proxy_port, host);

        let tcp_stream = connect_via_proxy(&proxy_host, proxy_port, host, port).await?;

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| UpDownError::Internal(format!("TLS connector error: {}", e)))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls_stream = connector
            .connect(host, tcp_stream)
            .await
            .map_err(|e| UpDownError::Internal(format!("TLS handshake failed: {}", e)))?;

        let (ws_stream, _response) =
            tokio_tungstenite::client_async(url.as_str(), MaybeTlsStream::NativeTls(tls_stream))
                .await?;

        return Ok(ws_stream);
    }

    let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| UpDownError::Internal(format!("WebSocket connection timeout: {}", url)))??;

    Ok(ws_stream)
}

/// Liveness timers for one streaming session
pub(crate) struct FeedHealth {
    last_data: Instant,
    stale_timeout: Duration,
}

impl FeedHealth {
    pub(crate) fn new(stale_timeout: Duration) -> Self {
        Self {
            last_data: Instant::now(),
            stale_timeout,
        }
    }

    pub(crate) fn record_data(&mut self) {
        self.last_data = Instant::now();
    }

    /// Error out once nothing usable has arrived within the stale timeout
    pub(crate) fn check(&self, feed: &str) -> Result<()> {
        if self.is_stale_at(Instant::now()) {
            return Err(UpDownError::StaleData(format!(
                "no {} data for {:?}; forcing reconnect",
                feed, self.stale_timeout
            )));
        }
        Ok(())
    }

    fn is_stale_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_data) > self.stale_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_url() {
        assert_eq!(
            parse_proxy_url("http://127.0.0.1:7890"),
            Some(("127.0.0.1".to_string(), 7890))
        );
        assert_eq!(
            parse_proxy_url("proxy.local:3128"),
            Some(("proxy.local".to_string(), 3128))
        );
        assert_eq!(
            parse_proxy_url("http://proxy.local"),
            Some(("proxy.local".to_string(), 8080))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_feed_goes_stale() {
        let mut health = FeedHealth::new(Duration::from_secs(90));
        assert!(health.check("odds").is_ok());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(health.check("odds").is_ok());

        health.record_data();
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(health.check("odds").is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(health.check("odds"), Err(UpDownError::StaleData(_))));
    }
}
