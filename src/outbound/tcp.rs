//! TCP 出站连接
//!
//! 写方向由会话直接调用 [`TcpOutbound::write`]；读方向在独立任务中
//! 把远端数据转发给客户端，第一个数据块前拼接响应前缀。

use crate::client::ClientHandle;
use crate::outbound::{Dialer, OutboundError, RelayEnd, ResponsePrefix, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// 建立 TCP 连接，超时或失败都视为连接错误，不在这里重试
pub async fn connect<D: Dialer>(
    dialer: &D,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<D::Stream> {
    debug!("Connecting to {}:{}", host, port);

    match tokio::time::timeout(timeout, dialer.connect_tcp(host, port)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(OutboundError::Connect {
            target: format!("{}:{}", host, port),
            source: e,
        }),
        Err(_) => Err(OutboundError::Timeout(format!("{}:{}", host, port))),
    }
}

/// 活动中的 TCP 出站连接
///
/// 丢弃时会终止读方向的转发任务。
pub struct TcpOutbound<S> {
    writer: WriteHalf<S>,
    relay: JoinHandle<RelayEnd>,
}

impl<S> TcpOutbound<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// 拆分连接并启动 远端 -> 客户端 的转发
    ///
    /// `received` 在收到远端第一个字节时置位。
    pub fn start(
        stream: S,
        client: ClientHandle,
        prefix: ResponsePrefix,
        received: Arc<AtomicBool>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let relay = tokio::spawn(relay_to_client(reader, client, prefix, received));
        Self { writer, relay }
    }

    /// 写入客户端数据
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.writer.write_all(chunk).await?;
        self.writer.flush().await?;
        trace!("Wrote {} bytes to remote", chunk.len());
        Ok(())
    }

    /// 等待读方向结束
    pub async fn finished(&mut self) -> RelayEnd {
        match (&mut self.relay).await {
            Ok(end) => end,
            Err(e) => RelayEnd::Error(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }

    /// 关闭写方向并终止转发任务
    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
        self.relay.abort();
    }
}

impl<S> Drop for TcpOutbound<S> {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn relay_to_client<S>(
    mut reader: ReadHalf<S>,
    client: ClientHandle,
    prefix: ResponsePrefix,
    received: Arc<AtomicBool>,
) -> RelayEnd
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return RelayEnd::Eof,
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
