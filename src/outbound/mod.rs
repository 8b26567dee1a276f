//! 出站连接
//!
//! [`Dialer`] 是会话与真实网络之间的接缝：生产环境用 [`DirectDialer`]
//! 直连目标，测试中可以换成内存实现。

use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

pub mod error;
pub mod tcp;
pub mod udp;

pub use error::{OutboundError, Result};
pub use tcp::TcpOutbound;
pub use udp::UdpOutbound;

/// 出站连接的建立方式
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Datagram: Datagram;

    /// 建立到 `host:port` 的 TCP 连接
    fn connect_tcp(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// 打开一个已 connect 到 `host:port` 的 UDP socket
    fn open_udp(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Datagram>> + Send;
}

/// 已绑定目标地址的数据报通道
pub trait Datagram: Send + Sync + 'static {
    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

impl Datagram for UdpSocket {
    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send(self, buf)
    }

    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::recv(self, buf)
    }
}

/// 直连目标的 [`Dialer`]
#[derive(Debug, Clone, Default)]
pub struct DirectDialer;

impl DirectDialer {
    pub fn new() -> Self {
        Self
    }
}

impl Dialer for DirectDialer {
    type Stream = TcpStream;
    type Datagram = UdpSocket;

    fn connect_tcp(&self, host: &str, port: u16) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let host = host.to_string();
        async move {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            socket2::SockRef::from(&stream).set_keepalive(true)?;
            Ok(stream)
        }
    }

    fn open_udp(&self, host: &str, port: u16) -> impl Future<Output = io::Result<UdpSocket>> + Send {
        let host = host.to_string();
        async move {
            // 协议族跟随解析出的第一个地址，IP 字面量解析为自身
            let target = tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no usable address for {}:{}", host, port),
                    )
                })?;

            let socket = bind_udp(target.is_ipv6())?;
            socket.connect(target).await?;
            debug!("UDP socket {:?} connected to {}", socket.local_addr(), target);
            Ok(socket)
        }
    }
}

/// 创建一个绑定到任意端口的非阻塞 UDP socket
fn bind_udp(ipv6: bool) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let (domain, bind): (Domain, SocketAddr) = if ipv6 {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into())
    } else {
        (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into())
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

/// 回给客户端的一次性响应前缀
///
/// 同一会话内的所有转发任务共享一份，只会拼接到第一个数据块前面。
#[derive(Clone, Default)]
pub struct ResponsePrefix {
    inner: Arc<Mutex<Option<Bytes>>>,
}

impl ResponsePrefix {
    pub fn new(prefix: Bytes) -> Self {
        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        Self {
            inner: Arc::new(Mutex::new(prefix)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// 第一次调用时返回 `前缀 + chunk`，之后原样返回 chunk
    pub fn apply(&self, chunk: &[u8]) -> Bytes {
        let prefix = self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        match prefix {
            Some(prefix) => {
                let mut buf = BytesMut::with_capacity(prefix.len() + chunk.len());
                buf.put(prefix);
                buf.put_slice(chunk);
                buf.freeze()
            }
            None => Bytes::copy_from_slice(chunk),
        }
    }
}

/// 远端到客户端的转发为何结束
#[derive(Debug)]
pub enum RelayEnd {
    /// 远端正常关闭
    Eof,
    /// 远端读错误
    Error(io::Error),
    /// 客户端已关闭
    ClientClosed,
}
