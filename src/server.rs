//! WebSocket 入口
//!
//! 握手阶段从 `Sec-WebSocket-Protocol` 取 early data 并原样回显，
//! 从请求路径取 fallback 地址；之后每个连接交给一个 [`Session`]。

use crate::client::{self, ClientHandle};
use crate::config::Config;
use crate::early_data;
use crate::fallback::{parse_proxy_path, FallbackAddress};
use crate::outbound::{Dialer, DirectDialer};
use crate::session::{Session, SessionSettings};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// 客户端发送队列长度
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// 运行 WebSocket 隧道服务器
pub async fn run(config: Config) -> Result<()> {
    let listen_addr = config.server.listen_addr;

    info!("Starting WebSocket tunnel server on {}", listen_addr);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("WebSocket tunnel server listening on {}", listen_addr);

    let target = config.outbound.fallback_target();
    if target.is_none() {
        if let Some(raw) = &config.outbound.fallback {
            warn!("Ignoring invalid fallback address: {:?}", raw);
        }
    }
    let fallback = FallbackAddress::new(target);

    serve(
        listener,
        Arc::new(DirectDialer::new()),
        fallback,
        config.outbound.session_settings(),
    )
    .await
}

/// 在已绑定的监听器上接受连接
pub async fn serve<D: Dialer>(
    listener: TcpListener,
    dialer: Arc<D>,
    fallback: FallbackAddress,
    settings: SessionSettings,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((client_stream, client_addr)) => {
                info!("Accepted connection from {}", client_addr);

                let dialer = dialer.clone();
                let fallback = fallback.clone();
                let settings = settings.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_client(client_stream, client_addr, dialer, fallback, settings).await
                    {
                        error!("Error handling client {}: {:#}", client_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

/// 处理单个客户端连接
async fn handle_client<D: Dialer>(
    client_stream: TcpStream,
    client_addr: SocketAddr,
    dialer: Arc<D>,
    fallback: FallbackAddress,
    settings: SessionSettings,
) -> Result<()> {
    client_stream.set_nodelay(true)?;

    let mut path = String::new();
    let mut protocol_header: Option<String> = None;
    let callback = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        if let Some(value) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            protocol_header = value.to_str().ok().map(str::to_string);
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
        }
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(client_stream, callback)
        .await
        .context("WebSocket handshake failed")?;
    debug!("WebSocket handshake with {} completed, path {}", client_addr, path);

    if let Some(target) = parse_proxy_path(&path) {
        info!("Fallback address from request path: {}", target);
        fallback.store(Some(target));
    }

    let early_data = match early_data::decode(protocol_header.as_deref()) {
        Ok(data) => data,
        Err(e) => {
            warn!("Ignoring early data from {}: {}", client_addr, e);
            None
        }
    };

    let (sink, source) = ws.split();
    let (client, frames) = ClientHandle::channel(CLIENT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(client::pump(frames, sink));

    let span = info_span!("session", peer = %client_addr, target = tracing::field::Empty);
    Session::new(dialer, client, fallback, settings)
        .run(early_data, inbound_stream(source))
        .instrument(span)
        .await;

    let _ = writer.await;
    info!("Connection from {} closed", client_addr);

    Ok(())
}

/// 把 WebSocket 消息转成数据块流
///
/// 文本帧按原始字节处理；ping / pong 由 tungstenite 处理，这里跳过；
/// 收到 close 帧或读错误时流结束。
fn inbound_stream<S>(source: S) -> impl Stream<Item = Bytes> + Unpin
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    Box::pin(stream::unfold(source, |mut source| async move {
        loop {
            match source.next().await {
                Some(Ok(Message::Binary(data))) => return Some((Bytes::from(data), source)),
                Some(Ok(Message::Text(text))) => return Some((Bytes::from(text.into_bytes()), source)),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("WebSocket read failed: {}", e);
                    return None;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    async fn start_server(fallback: FallbackAddress) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            listener,
            Arc::new(DirectDialer::new()),
            fallback,
            SessionSettings::default(),
        ));
        addr
    }

    async fn start_echo() -> u16 {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        port
    }

    #[tokio::test]
    async fn test_tunnel_with_early_data() {
        let echo_port = start_echo().await;
        let addr = start_server(FallbackAddress::default()).await;

        let mut header = vec![0x01, 127, 0, 0, 1];
        header.extend_from_slice(&echo_port.to_be_bytes());
        header.extend_from_slice(b"ping");
        let encoded = URL_SAFE_NO_PAD.encode(&header);

        let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, encoded.parse().unwrap());

        let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        let echoed = response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap();
        assert_eq!(echoed.to_str().unwrap(), encoded);

        // Shadowsocks 响应前缀 + 回显的负载
        let mut expected = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
        expected.extend_from_slice(&echo_port.to_be_bytes());
        expected.extend_from_slice(b"ping");
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data(), expected);

        ws.send(Message::binary(b"more".to_vec())).await.unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data(), b"more".to_vec());
    }

    #[tokio::test]
    async fn test_malformed_header_closes_websocket() {
        let addr = start_server(FallbackAddress::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
            .await
            .unwrap();

        ws.send(Message::binary(vec![0x09, 0x00])).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None));
    }

    #[tokio::test]
    async fn test_request_path_sets_fallback() {
        let fallback = FallbackAddress::default();
        let addr = start_server(fallback.clone()).await;

        let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/198.51.100.1:8443", addr))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fallback.current().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let current = fallback.current().unwrap();
        assert_eq!(current.host, "198.51.100.1");
        assert_eq!(current.port, Some(8443));
    }
}
