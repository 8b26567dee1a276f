//! UDP 出站连接
//!
//! 每个会话一个 socket，打开后不再重新解析目标；
//! 没有重试，发送失败即结束会话。

use crate::client::ClientHandle;
use crate::outbound::{Datagram, Dialer, OutboundError, RelayEnd, ResponsePrefix, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const MAX_DATAGRAM_SIZE: usize = 65535;

/// 打开 UDP socket
pub async fn open<D: Dialer>(
    dialer: &D,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<D::Datagram> {
    debug!("Opening UDP socket to {}:{}", host, port);

    match tokio::time::timeout(timeout, dialer.open_udp(host, port)).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(e)) => Err(OutboundError::Connect {
            target: format!("{}:{}", host, port),
            source: e,
        }),
        Err(_) => Err(OutboundError::Timeout(format!("{}:{}", host, port))),
    }
}

/// 活动中的 UDP 出站连接
pub struct UdpOutbound<U> {
    socket: Arc<U>,
    relay: JoinHandle<RelayEnd>,
}

impl<U: Datagram> UdpOutbound<U> {
    pub fn start(
        socket: U,
        client: ClientHandle,
        prefix: ResponsePrefix,
        received: Arc<AtomicBool>,
    ) -> Self {
        let socket = Arc::new(socket);
        let relay = tokio::spawn(relay_to_client(socket.clone(), client, prefix, received));
        Self { socket, relay }
    }

    /// 每个数据块作为一个数据报发出
    pub async fn send(&self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let sent = self.socket.send(chunk).await?;
        trace!("Sent {} of {} bytes over UDP", sent, chunk.len());
        Ok(())
    }

    pub async fn finished(&mut self) -> RelayEnd {
        match (&mut self.relay).await {
            Ok(end) => end,
            Err(e) => RelayEnd::Error(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }
}

impl<U> Drop for UdpOutbound<U> {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn relay_to_client<U: Datagram>(
    socket: Arc<U>,
    client: ClientHandle,
    prefix: ResponsePrefix,
    received: Arc<AtomicBool>,
) -> RelayEnd {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => return RelayEnd::Error(e),
        };

        received.store(true, Ordering::Release);

        if !client.is_open() {
            return RelayEnd::ClientClosed;
        }

        if client.send(prefix.apply(&buf[..n])).await.is_err() {
            return RelayEnd::ClientClosed;
        }
    }
}
