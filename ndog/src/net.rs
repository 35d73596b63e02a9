// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Listener socket construction
use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::scheme::NetConfig;

const LISTEN_BACKLOG: i32 = 1024;

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
  tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
    io::Error::new(
      io::ErrorKind::AddrNotAvailable,
      format!("{} did not resolve to any address", addr),
    )
  })
}

#[cfg(unix)]
fn shared_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
  let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
  socket.set_reuse_address(true)?;
  socket.set_reuse_port(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  Ok(socket)
}

#[cfg(not(unix))]
fn shared_socket(_addr: SocketAddr, _ty: Type, _protocol: Protocol) -> io::Result<Socket> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    "SO_REUSEPORT is only available on unix",
  ))
}

pub async fn bind_tcp(addr: &str, net: &NetConfig) -> io::Result<TcpListener> {
  if !net.reuse_port {
    return TcpListener::bind(addr).await;
  }
  let socket = shared_socket(resolve(addr).await?, Type::STREAM, Protocol::TCP)?;
  socket.listen(LISTEN_BACKLOG)?;
  TcpListener::from_std(socket.into())
}

pub async fn bind_udp(addr: &str, net: &NetConfig) -> io::Result<UdpSocket> {
  if !net.reuse_port {
    return UdpSocket::bind(addr).await;
  }
  let socket = shared_socket(resolve(addr).await?, Type::DGRAM, Protocol::UDP)?;
  UdpSocket::from_std(socket.into())
}

/// An unbound-port socket of the same address family as `remote`, connected to it
pub async fn connect_udp(addr: &str) -> io::Result<UdpSocket> {
  let remote = resolve(addr).await?;
  let local: SocketAddr = if remote.is_ipv4() {
    ([0, 0, 0, 0], 0).into()
  } else {
    ([0u16; 8], 0).into()
  };
  let socket = UdpSocket::bind(local).await?;
  socket.connect(remote).await?;
  Ok(socket)
}
