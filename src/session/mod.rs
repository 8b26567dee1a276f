//! 会话状态机
//!
//! 每个 WebSocket 连接对应一个 [`Session`]。状态转换：
//!
//! ```text
//! AwaitingHeader --(TCP)--> TcpDialing --> TcpActive --+
//!        |                      ^              |        |
//!        |                      +-- 重试一次 --+        |
//!        +--(UDP)--> UdpOpening --> UdpActive ----------+--> Closed
//! ```
//!
//! 出站连接建立期间到达的数据块进入 `pending` 队列，连接可用后按到达顺序写出，
//! 不会被当成新的协议头重新解析。

use crate::client::ClientHandle;
use crate::fallback::FallbackAddress;
use crate::outbound::{self, Dialer, OutboundError, RelayEnd, ResponsePrefix, TcpOutbound, UdpOutbound};
use crate::protocol::{self, Command};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};


/// 重放缓冲区上限，超过后放弃重试
const MAX_REPLAY_BYTES: usize = 256 * 1024;

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// TCP 建连 / UDP 打开的超时
    pub connect_timeout: Duration,
    /// UDP 目标端口为 0 时使用的端口
    pub dns_port: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            dns_port: 53,
        }
    }
}

enum State<D: Dialer> {
    AwaitingHeader,
    TcpDialing(JoinHandle<outbound::Result<D::Stream>>),
    TcpActive(TcpOutbound<D::Stream>),
    UdpOpening(JoinHandle<outbound::Result<D::Datagram>>),
    UdpActive(UdpOutbound<D::Datagram>),
    Closed,
}

enum Event<D: Dialer> {
    TcpDialed(outbound::Result<D::Stream>),
    UdpOpened(outbound::Result<D::Datagram>),
    TcpDone(RelayEnd),
    UdpDone(RelayEnd),
}

/// 单个隧道会话
pub struct Session<D: Dialer> {
    dialer: Arc<D>,
    client: ClientHandle,
    fallback: FallbackAddress,
    settings: SessionSettings,
    state: State<D>,
    /// 出站连接建立前到达的数据
    pending: VecDeque<Bytes>,
    /// 收到远端数据前已写入第一个 TCP 连接的数据，重试时重放
    replay: Vec<Bytes>,
    replay_bytes: usize,
    prefix: ResponsePrefix,
    received: Arc<AtomicBool>,
    retry_attempted: bool,
    /// 原始 TCP 目标
    target: Option<(String, u16)>,
}

impl<D: Dialer> Session<D> {
    pub fn new(
        dialer: Arc<D>,
        client: ClientHandle,
        fallback: FallbackAddress,
        settings: SessionSettings,
    ) -> Self {
        Self {
            dialer,
            client,
            fallback,
            settings,
            state: State::AwaitingHeader,
            pending: VecDeque::new(),
            replay: Vec::new(),
            replay_bytes: 0,
            prefix: ResponsePrefix::default(),
            received: Arc::new(AtomicBool::new(false)),
            retry_attempted: false,
            target: None,
        }
    }

    /// 驱动会话直到任意一侧结束
    ///
    /// `early_data` 视为第一个数据块；`inbound` 结束表示客户端已关闭。
    pub async fn run<S>(mut self, early_data: Option<Bytes>, mut inbound: S)
    where
        S: Stream<Item = Bytes> + Unpin,
    {
        if let Some(data) = early_data {
            debug!("Using {} bytes of early data", data.len());
            self.on_inbound(data).await;
        }

        while !matches!(self.state, State::Closed) {
            tokio::select! {
                chunk = inbound.next() => match chunk {
                    Some(chunk) => self.on_inbound(chunk).await,
                    None => {
                        debug!("Client closed connection");
                        self.close().await;
                    }
                },
                event = next_event(&mut self.state) => self.on_event(event).await,
            }
        }

        debug!("Session closed");
    }

    async fn on_inbound(&mut self, chunk: Bytes) {
        if matches!(self.state, State::TcpActive(_)) {
            self.record_replay(&chunk);
        }

        match &mut self.state {
            State::AwaitingHeader => self.on_header(chunk).await,
            State::TcpDialing(_) | State::UdpOpening(_) => self.pending.push_back(chunk),
            State::TcpActive(tcp) => {
                let result = tcp.write(&chunk).await;
                if let Err(e) = result {
                    warn!("Failed to write to remote: {}", e);
                    self.retry_or_close().await;
                }
            }
            State::UdpActive(udp) => {
                let result = udp.send(&chunk).await;
                if let Err(e) = result {
                    warn!("Failed to send UDP datagram: {}", e);
                    self.close().await;
                }
            }
            State::Closed => {}
        }
    }

    async fn on_header(&mut self, chunk: Bytes) {
        let header = match protocol::decode(&chunk) {
            Ok(header) => header,
            Err(e) => {
                // 不向客户端暴露任何协议细节，直接断开
                warn!("Failed to parse tunnel header: {}", e);
                self.close().await;
                return;
            }
        };

        let host = header.address.to_string();
        let mut port = header.port;
        if header.command == Command::UdpRelay && port == 0 {
            port = self.settings.dns_port;
        }

        Span::current().record("target", tracing::field::display(format_args!("{}:{}", host, port)));
        info!(
            "{} {:?} request to {}:{}",
            header.protocol, header.command, host, port
        );

        self.prefix = ResponsePrefix::new(header.response_prefix.clone());

        let payload = chunk.slice(header.payload_offset.min(chunk.len())..);
        if !payload.is_empty() {
            self.pending.push_back(payload);
        }

        self.state = match header.command {
            Command::Connect => {
                self.target = Some((host.clone(), port));
                State::TcpDialing(self.spawn_dial(host, port))
            }
            Command::UdpRelay => State::UdpOpening(self.spawn_open(host, port)),
        };
    }

    async fn on_event(&mut self, event: Event<D>) {
        match event {
            Event::TcpDialed(Ok(stream)) => self.on_tcp_connected(stream).await,
            Event::TcpDialed(Err(e)) => {
                warn!("{}", e);
                self.state = State::Closed;
                self.retry_or_close().await;
            }
            Event::UdpOpened(Ok(socket)) => self.on_udp_opened(socket).await,
            Event::UdpOpened(Err(e)) => {
                warn!("{}", e);
                self.close().await;
            }
            Event::TcpDone(end) => {
                match end {
                    RelayEnd::Eof => debug!("Remote closed connection"),
                    RelayEnd::Error(e) => warn!("Remote read failed: {}", e),
                    RelayEnd::ClientClosed => {
                        self.close().await;
                        return;
                    }
                }
                self.retry_or_close().await;
            }
            Event::UdpDone(end) => {
                if let RelayEnd::Error(e) = end {
                    warn!("UDP receive failed: {}", e);
                }
                self.close().await;
            }
        }
    }

    async fn on_tcp_connected(&mut self, stream: D::Stream) {
        let mut tcp = TcpOutbound::start(
            stream,
            self.client.clone(),
            self.prefix.clone(),
            self.received.clone(),
        );

        while let Some(chunk) = self.pending.pop_front() {
            self.record_replay(&chunk);
            if let Err(e) = tcp.write(&chunk).await {
                warn!("Failed to write to remote: {}", e);
                drop(tcp);
                self.state = State::Closed;
                self.retry_or_close().await;
                return;
            }
        }

        self.state = State::TcpActive(tcp);
    }

    async fn on_udp_opened(&mut self, socket: D::Datagram) {
        let udp = UdpOutbound::start(
            socket,
            self.client.clone(),
            self.prefix.clone(),
            self.received.clone(),
        );

        while let Some(chunk) = self.pending.pop_front() {
            if let Err(e) = udp.send(&chunk).await {
                warn!("Failed to send UDP datagram: {}", e);
                drop(udp);
                self.close().await;
                return;
            }
        }

        self.state = State::UdpActive(udp);
    }

    /// 远端没有返回任何数据就结束时，换 fallback 地址重试一次
    async fn retry_or_close(&mut self) {
        self.release_outbound().await;

        if self.retry_attempted || self.received.load(Ordering::Acquire) || !self.client.is_open() {
            self.close().await;
            return;
        }

        let Some((host, port)) = self.target.clone() else {
            self.close().await;
            return;
        };

        self.retry_attempted = true;
        let (host, port) = self.fallback.resolve(&host, port);
        info!("No data from remote, retrying via {}:{}", host, port);

        self.replay_bytes = 0;
        let mut queue = std::mem::take(&mut self.replay);
        queue.extend(self.pending.drain(..));
        self.pending = queue.into();

        self.state = State::TcpDialing(self.spawn_dial(host, port));
    }

    /// 记录写入第一个 TCP 连接的数据，超过上限后清空并不再重试
    fn record_replay(&mut self, chunk: &Bytes) {
        if self.retry_attempted || self.received.load(Ordering::Acquire) {
            return;
        }

        if self.replay_bytes + chunk.len() > MAX_REPLAY_BYTES {
            debug!(
                "Replay buffer exceeds {} bytes, retry disabled",
                MAX_REPLAY_BYTES
            );
            self.replay.clear();
            self.replay_bytes = 0;
            self.retry_attempted = true;
            return;
        }

        self.replay_bytes += chunk.len();
        self.replay.push(chunk.clone());
    }

    /// 关闭两侧，重复调用无副作用
    async fn close(&mut self) {
        self.release_outbound().await;
        self.pending.clear();
        self.replay.clear();
        self.replay_bytes = 0;
        self.client.close().await;
    }

    async fn release_outbound(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::TcpDialing(dial) => dial.abort(),
            State::UdpOpening(open) => open.abort(),
            State::TcpActive(tcp) => tcp.shutdown().await,
            State::UdpActive(udp) => drop(udp),
            State::AwaitingHeader | State::Closed => {}
        }
    }

    fn spawn_dial(&self, host: String, port: u16) -> JoinHandle<outbound::Result<D::Stream>> {
        let dialer = self.dialer.clone();
        let timeout = self.settings.connect_timeout;
        tokio::spawn(
            async move { outbound::tcp::connect(dialer.as_ref(), &host, port, timeout).await }
                .in_current_span(),
        )
    }

    fn spawn_open(&self, host: String, port: u16) -> JoinHandle<outbound::Result<D::Datagram>> {
        let dialer = self.dialer.clone();
        let timeout = self.settings.connect_timeout;
        tokio::spawn(
            async move { outbound::udp::open(dialer.as_ref(), &host, port, timeout).await }
                .in_current_span(),
        )
    }
}

async fn next_event<D: Dialer>(state: &mut State<D>) -> Event<D> {
    match state {
        State::TcpDialing(dial) => Event::TcpDialed(join(dial).await),
        State::UdpOpening(open) => Event::UdpOpened(join(open).await),
        State::TcpActive(tcp) => Event::TcpDone(tcp.finished().await),
        State::UdpActive(udp) => Event::UdpDone(udp.finished().await),
        State::AwaitingHeader | State::Closed => std::future::pending().await,
    }
}

async fn join<T>(handle: &mut JoinHandle<outbound::Result<T>>) -> outbound::Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(OutboundError::Io(io::Error::new(io::ErrorKind::Other, e))),
    }
}
