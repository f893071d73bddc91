use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use log::debug;
#[cfg(test)]
use mockall::automock;
use russh::{ChannelStream, server::Msg};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::sessions::BindInfo;

// Origin placeholders advertised in the forwarded-tcpip channel-open payload.
// The protocol expects the address of the remote peer initiating the forward,
// but clients treat these fields as opaque.
pub(crate) const FORWARD_ORIGIN_ADDRESS: &str = "localhost";
pub(crate) const FORWARD_ORIGIN_PORT: u32 = 8080;

// Source of tunneling channels for the HTTP front door.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait TunnelHandler<T: Sync> {
    async fn tunneling_channel(&self) -> anyhow::Result<TokioIo<T>>;
}

// Live handle tying a bound domain to the SSH connection that owns it.
// Immutable once installed in the routing table; one new forwarded-tcpip
// channel is opened per outbound HTTP connection.
pub(crate) struct Tunnel {
    // Handle to the SSH connection, used to open new channels.
    handle: russh::server::Handle,
    // The forward request the channel-open payload must advertise.
    bind: BindInfo,
}

impl Tunnel {
    pub(crate) fn new(handle: russh::server::Handle, bind: BindInfo) -> Self {
        Tunnel { handle, bind }
    }
}

#[async_trait]
impl TunnelHandler<TunnelStream<ChannelStream<Msg>>> for Tunnel {
    async fn tunneling_channel(
        &self,
    ) -> anyhow::Result<TokioIo<TunnelStream<ChannelStream<Msg>>>> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                self.bind.address.clone(),
                self.bind.port,
                FORWARD_ORIGIN_ADDRESS.to_string(),
                FORWARD_ORIGIN_PORT,
            )
            .await?;
        let stream = TunnelStream::new(channel.into_stream(), self.bind.address.clone());
        debug!(
            "Opened forwarded-tcpip channel toward {:?}:{}",
            stream.peer_address(),
            self.bind.port
        );
        Ok(TokioIo::new(stream))
    }
}

// Presents an SSH channel as a plain bidirectional byte stream. The peer
// address carries the tunnel's bind address, for diagnostics only.
pub(crate) struct TunnelStream<S> {
    inner: S,
    peer_address: String,
}

impl<S> TunnelStream<S> {
    pub(crate) fn new(inner: S, peer_address: String) -> Self {
        TunnelStream {
            inner,
            peer_address,
        }
    }

    pub(crate) fn peer_address(&self) -> &str {
        &self.peer_address
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
