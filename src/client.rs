//! 面向客户端 (WebSocket) 的发送句柄
//!
//! 会话和转发任务只持有 [`ClientHandle`]，真正写 WebSocket 的是
//! [`pump`] 任务，二者之间用有界 channel 连接。

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::outbound::OutboundError;

/// 发往客户端的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Data(Bytes),
    Close,
}

/// 客户端发送句柄，可 clone，close 幂等
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientFrame>,
    open: Arc<AtomicBool>,
}

/// [`ClientHandle`] 的接收端
pub struct ClientFrames {
    rx: mpsc::Receiver<ClientFrame>,
    open: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn channel(capacity: usize) -> (ClientHandle, ClientFrames) {
        let (tx, rx) = mpsc::channel(capacity);
        let open = Arc::new(AtomicBool::new(true));
        (
            ClientHandle {
                tx,
                open: open.clone(),
            },
            ClientFrames { rx, open },
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 发送一个数据块，客户端已关闭时返回 [`OutboundError::ClientClosed`]
    pub async fn send(&self, data: Bytes) -> Result<(), OutboundError> {
        if !self.is_open() {
            return Err(OutboundError::ClientClosed);
        }
        self.tx
            .send(ClientFrame::Data(data))
            .await
            .map_err(|_| OutboundError::ClientClosed)
    }

    /// 关闭客户端，重复调用无副作用
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(ClientFrame::Close).await;
        }
    }
}

impl ClientFrames {
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.rx.recv().await
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// 把 channel 中的帧写入 WebSocket，直到收到 Close、写失败或所有句柄被丢弃
pub async fn pump<S>(mut frames: ClientFrames, mut sink: S)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(frame) = frames.recv().await {
        match frame {
            ClientFrame::Data(data) => {
                if let Err(e) = sink.send(Message::binary(data)).await {
                    debug!("WebSocket send failed: {}", e);
                    frames.mark_closed();
                    return;
                }
            }
            ClientFrame::Close => break,
        }
    }

    frames.mark_closed();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
