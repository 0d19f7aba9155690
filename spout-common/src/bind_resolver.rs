// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use anyhow::anyhow;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, UdpSocket, lookup_host};

//
// BoundTcpSocket
//

pub struct BoundTcpSocket {
  socket: TcpSocket,
}

impl BoundTcpSocket {
  #[must_use]
  pub const fn new(socket: TcpSocket) -> Self {
    Self { socket }
  }

  #[must_use]
  pub fn listen(self) -> TcpListener {
    // Socket is bound. listen() cannot reasonably fail.
    self
      .socket
      .listen(1024)
      .expect("socket is bound and ready to listen")
  }

  #[must_use]
  pub fn local_addr(&self) -> SocketAddr {
    self.socket.local_addr().expect("socket is bound")
  }
}

//
// BindResolver
//

// Trait for resolving a name to a bound socket. Stages resolve their listen
// addresses through this so tests can hand out sockets bound to port 0.
#[mockall::automock]
#[async_trait::async_trait]
pub trait BindResolver: Send + Sync {
  // Resolve the name and return a bound TCP socket, ready to listen().
  async fn resolve_tcp(&self, name: &str) -> anyhow::Result<BoundTcpSocket>;

  // Resolve the name and return a bound UDP socket. When `recv_buffer_bytes`
  // is set the kernel receive buffer is sized accordingly before binding.
  async fn resolve_udp(
    &self,
    name: &str,
    recv_buffer_bytes: Option<usize>,
  ) -> anyhow::Result<UdpSocket>;
}

//
// RealBindResolver
//

pub struct RealBindResolver {}

#[async_trait::async_trait]
impl BindResolver for RealBindResolver {
  async fn resolve_tcp(&self, name: &str) -> anyhow::Result<BoundTcpSocket> {
    let mut last_err = None;
    for addr in lookup_host(name).await? {
      let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
      };
      socket.set_reuseport(true)?;
      match socket.bind(addr) {
        Ok(()) => return Ok(BoundTcpSocket::new(socket)),
        Err(e) => last_err = Some(e.into()),
      }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("could not resolve to any address")))
  }

  async fn resolve_udp(
    &self,
    name: &str,
    recv_buffer_bytes: Option<usize>,
  ) -> anyhow::Result<UdpSocket> {
    let mut last_err = None;
    for addr in lookup_host(name).await? {
      let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
      };
      let socket = Socket::new(domain, Type::DGRAM, None)?;
      socket.set_reuse_port(true)?;
      socket.set_nonblocking(true)?;
      if let Some(bytes) = recv_buffer_bytes {
        socket.set_recv_buffer_size(bytes)?;
      }
      match socket.bind(&addr.into()) {
        Ok(()) => return Ok(UdpSocket::from_std(socket.into())?),
        Err(e) => last_err = Some(e.into()),
      }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("could not resolve to any address")))
  }
}
