// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! UDP, with one stream per remote address
use std::{
  collections::{hash_map::Entry, HashMap},
  io,
  net::SocketAddr,
  sync::Arc,
  time::Duration,
};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
  net::UdpSocket,
  task::JoinHandle,
  time::{Instant, MissedTickBehavior},
};
use tracing_futures::Instrument;

use super::{
  ConnectConfig, Connector, ListenConfig, Listener, Options, OptionsError, OptionsHelp, Scheme,
};
use crate::{
  manager::{StreamError, StreamManager},
  net,
  stream::{is_closed_error, write_json, ReadHalf, WriteHalf},
  util::cancellation::ShutdownListener,
};

/// Largest datagram the listener can receive whole
const MAX_DATAGRAM: usize = 65535;
/// Largest payload sent in one datagram
const MAX_PAYLOAD: usize = 65507;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

pub struct UdpScheme;

impl Scheme for UdpScheme {
  fn names(&self) -> &'static [&'static str] {
    &["udp"]
  }

  fn description(&self) -> &'static str {
    "Connect sends datagrams to the host and port in the URL.\n\
     Listen receives datagrams on the host and port in the URL,\n\
     giving each remote address its own stream.\n\
     \n\
     Examples:\n  \
       Echo server: ndog -l udp://localhost:8080 -x cat"
  }

  fn listener(&self) -> Option<&dyn Listener> {
    Some(self)
  }

  fn connector(&self) -> Option<&dyn Connector> {
    Some(self)
  }

  fn listen_options(&self) -> OptionsHelp {
    OptionsHelp::new()
      .add("lines", "", "delimit individual packets with line breaks")
      .add("json", "", "output JSON representation of incoming packets")
      .add(
        "idle_timeout",
        "SECS",
        "close streams of peers silent this long (default 300, 0 never)",
      )
  }
}

impl Listener for UdpScheme {
  fn listen(&self, config: ListenConfig) -> BoxFuture<'static, anyhow::Result<()>> {
    listen(config).boxed()
  }
}

impl Connector for UdpScheme {
  fn connect(&self, config: ConnectConfig) -> BoxFuture<'static, anyhow::Result<()>> {
    connect(config).boxed()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
  pub lines: bool,
  pub json: bool,
  pub idle_timeout: Option<Duration>,
}

impl Default for ListenOptions {
  fn default() -> Self {
    Self {
      lines: false,
      json: false,
      idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
    }
  }
}

impl ListenOptions {
  pub fn extract(mut options: Options) -> Result<Self, OptionsError> {
    let json = options.pop_flag("json");
    let lines = options.pop_flag("lines");
    let idle_secs = options
      .pop_parsed::<u64>("idle_timeout")?
      .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
    options.done()?;
    Ok(Self {
      lines,
      json,
      idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
    })
  }
}

#[derive(Serialize)]
struct PacketRecord<'a> {
  #[serde(rename = "RemoteAddr")]
  remote_addr: String,
  #[serde(rename = "Data")]
  data: &'a str,
}

struct Peer {
  writer: WriteHalf,
  outbound: JoinHandle<()>,
  last_seen: Instant,
}

impl Peer {
  async fn close(mut self) {
    if let Err(e) = self.writer.close().await {
      tracing::debug!(error = %e, "peer stream writer close failed");
    }
    // Dropping the outbound task releases the stream's read half
    self.outbound.abort();
  }
}

pub async fn listen(config: ListenConfig) -> anyhow::Result<()> {
  let ListenConfig {
    config,
    streams,
    shutdown,
  } = config;
  let options = ListenOptions::extract(config.options)?;
  let addr = config.endpoint.host_port()?;
  let socket = net::bind_udp(&addr, &config.net)
    .await
    .with_context(|| format!("failed to listen on {}", addr))?;
  tracing::info!(addr = %socket.local_addr()?, "listening");
  serve(Arc::new(socket), streams, options, shutdown).await
}

/// Serves datagrams from an already-bound socket until shutdown
///
/// Socket receive errors end the listener; failures of one peer's stream
/// only affect that peer.
pub async fn serve(
  socket: Arc<UdpSocket>,
  streams: Arc<dyn StreamManager>,
  options: ListenOptions,
  shutdown: ShutdownListener,
) -> anyhow::Result<()> {
  let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
  let mut buffer = vec![0u8; MAX_DATAGRAM];
  let sweep_period = options
    .idle_timeout
    .map(|idle| (idle / 4).max(Duration::from_millis(10)))
    .unwrap_or(Duration::from_secs(3600));
  let mut sweep = tokio::time::interval(sweep_period);
  sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

  let result = loop {
    tokio::select! {
      _ = shutdown.shutting_down() => break Ok(()),
      _ = sweep.tick(), if options.idle_timeout.is_some() => {
        if let Some(idle) = options.idle_timeout {
          evict_idle(&mut peers, idle).await;
        }
      }
      received = socket.recv_from(&mut buffer) => {
        let (size, remote) = match received {
          Ok(received) => received,
          Err(e) => break Err(e).context("receive failed"),
        };
        tracing::trace!(bytes = size, %remote, "received datagram");
        deliver(&socket, &mut peers, &*streams, &options, remote, &buffer[..size]).await;
      }
    }
  };

  for (_, peer) in peers.drain() {
    peer.close().await;
  }
  result
}

async fn deliver(
  socket: &Arc<UdpSocket>,
  peers: &mut HashMap<SocketAddr, Peer>,
  streams: &dyn StreamManager,
  options: &ListenOptions,
  remote: SocketAddr,
  data: &[u8],
) {
  let peer = match peers.entry(remote) {
    Entry::Occupied(entry) => entry.into_mut(),
    Entry::Vacant(entry) => match open_peer(socket, streams, options, remote) {
      Ok(peer) => entry.insert(peer),
      Err(e) => {
        tracing::error!(%remote, error = ?e, "failed to create stream");
        return;
      }
    },
  };
  peer.last_seen = Instant::now();
  if let Err(e) = write_packet(&mut peer.writer, options, remote, data).await {
    if is_closed_error(&e) {
      tracing::debug!(%remote, error = %e, "peer stream closed");
    } else {
      tracing::error!(%remote, error = %e, "peer stream write failed");
    }
    if let Some(peer) = peers.remove(&remote) {
      peer.close().await;
    }
  }
}

fn open_peer(
  socket: &Arc<UdpSocket>,
  streams: &dyn StreamManager,
  options: &ListenOptions,
  remote: SocketAddr,
) -> Result<Peer, StreamError> {
  tracing::debug!(%remote, "creating new stream");
  let (reader, writer) = streams.new_stream(&remote.to_string())?.into_split();
  let outbound = tokio::task::spawn(
    send_to_peer(Arc::clone(socket), remote, reader, options.lines)
      .instrument(tracing::debug_span!("udp_peer", %remote)),
  );
  Ok(Peer {
    writer,
    outbound,
    last_seen: Instant::now(),
  })
}

async fn write_packet(
  writer: &mut WriteHalf,
  options: &ListenOptions,
  remote: SocketAddr,
  data: &[u8],
) -> io::Result<()> {
  if options.json {
    let encoded = BASE64.encode(data);
    return write_json(
      writer,
      &PacketRecord {
        remote_addr: remote.to_string(),
        data: &encoded,
      },
    )
    .await;
  }
  writer.write_all(data).await?;
  if options.lines {
    writer.write_all(b"\n").await?;
  }
  writer.flush().await
}

async fn send_to_peer(socket: Arc<UdpSocket>, remote: SocketAddr, reader: ReadHalf, lines: bool) {
  let result = if lines {
    send_lines(&socket, remote, reader).await
  } else {
    send_chunks(&socket, remote, reader).await
  };
  report_send(result);
}

fn report_send(result: io::Result<()>) {
  match result {
    Ok(()) => tracing::debug!("stream output finished"),
    Err(e) if is_closed_error(&e) => tracing::debug!(error = %e, "stream output closed"),
    Err(e) => tracing::error!(error = %e, "send failed"),
  }
}

/// Sends each chunk read from `reader` as one datagram to the connected peer
async fn send_connected(socket: Arc<UdpSocket>, mut reader: ReadHalf) {
  let mut buffer = vec![0u8; MAX_PAYLOAD];
  let result = async {
    loop {
      let read = reader.read(&mut buffer).await?;
      if read == 0 {
        return Ok(());
      }
      socket.send(&buffer[..read]).await?;
    }
  }
  .await;
  reader.close();
  report_send(result);
}

/// One datagram per line, without its terminator
async fn send_lines(socket: &UdpSocket, remote: SocketAddr, reader: ReadHalf) -> io::Result<()> {
  let mut lines = BufReader::new(reader).split(b'\n');
  while let Some(mut line) = lines.next_segment().await? {
    if line.last() == Some(&b'\r') {
      line.pop();
    }
    socket.send_to(&line, remote).await?;
  }
  Ok(())
}

async fn send_chunks(socket: &UdpSocket, remote: SocketAddr, mut reader: ReadHalf) -> io::Result<()> {
  let mut buffer = vec![0u8; MAX_PAYLOAD];
  loop {
    let read = reader.read(&mut buffer).await?;
    if read == 0 {
      return Ok(());
    }
    socket.send_to(&buffer[..read], remote).await?;
  }
}

async fn evict_idle(peers: &mut HashMap<SocketAddr, Peer>, idle: Duration) {
  let now = Instant::now();
  let expired = peers
    .iter()
    .filter(|(_, peer)| now.duration_since(peer.last_seen) >= idle)
    .map(|(remote, _)| *remote)
    .collect::<Vec<_>>();
  for remote in expired {
    if let Some(peer) = peers.remove(&remote) {
      tracing::debug!(%remote, "evicting idle peer");
      peer.close().await;
    }
  }
}

pub async fn connect(config: ConnectConfig) -> anyhow::Result<()> {
  let ConnectConfig { config, stream } = config;
  config.options.done()?;
  let addr = config.endpoint.host_port()?;
  let socket = Arc::new(
    net::connect_udp(&addr)
      .await
      .with_context(|| format!("failed to connect to {}", addr))?,
  );
  let remote = socket.peer_addr()?;
  tracing::info!(%remote, "connected");

  let (reader, mut writer) = stream.into_split();
  let outbound = tokio::task::spawn(send_connected(Arc::clone(&socket), reader).in_current_span());

  // Datagrams have no end; receive until the socket or the stream fails
  let mut buffer = vec![0u8; MAX_DATAGRAM];
  let result: io::Result<()> = async {
    loop {
      let size = socket.recv(&mut buffer).await?;
      writer.write_all(&buffer[..size]).await?;
      writer.flush().await?;
    }
  }
  .await;
  outbound.abort();
  if let Err(e) = writer.close().await {
    tracing::debug!(error = %e, "stream writer close failed");
  }
  tracing::info!(%remote, "closed");
  match result {
    Err(e) if is_closed_error(&e) => Ok(()),
    other => Ok(other?),
  }
}

#[cfg(test)]
mod tests {
  use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
  };

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UdpSocket,
    sync::mpsc,
  };
  use tokio_util::sync::CancellationToken;

  use super::{send_connected, serve, ListenOptions};
  use crate::{
    manager::{
      stdio::StdIoStreamManager, testing::captured_output, StreamError, StreamManager,
    },
    net::connect_udp,
    scheme::options::Options,
    stream::{pipe, BoxWriter, ReadHalf, Stream},
  };

  const TIMEOUT: Duration = Duration::from_secs(10);

  /// Log output collected by a thread-local subscriber
  #[derive(Clone, Default)]
  struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

  impl CapturedLogs {
    fn contents(&self) -> String {
      String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
  }

  impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  /// Reports the name of every stream its delegate creates
  struct Announcing<M> {
    delegate: M,
    created: mpsc::UnboundedSender<String>,
  }

  impl<M: StreamManager> StreamManager for Announcing<M> {
    fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
      let stream = self.delegate.new_stream(name)?;
      let _ = self.created.send(name.to_string());
      Ok(stream)
    }
  }

  async fn start(
    streams: impl StreamManager + 'static,
    options: ListenOptions,
  ) -> (SocketAddr, CancellationToken) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::task::spawn(serve(
      Arc::new(socket),
      Arc::new(streams),
      options,
      shutdown.clone().into(),
    ));
    (addr, shutdown)
  }

  async fn recv_text(socket: &UdpSocket) -> String {
    let mut buffer = [0u8; 1024];
    let size = tokio::time::timeout(TIMEOUT, socket.recv(&mut buffer))
      .await
      .expect("datagram must arrive")
      .unwrap();
    String::from_utf8_lossy(&buffer[..size]).into_owned()
  }

  #[test]
  fn listen_options_are_extracted() {
    let mut options = Options::new();
    options.insert("lines", "");
    options.insert("idle_timeout", "0");
    let extracted = ListenOptions::extract(options).unwrap();
    assert!(extracted.lines);
    assert!(!extracted.json);
    assert_eq!(extracted.idle_timeout, None);

    let mut options = Options::new();
    options.insert("linez", "");
    assert_eq!(
      ListenOptions::extract(options).unwrap_err().to_string(),
      "unknown options: linez"
    );
  }

  #[tokio::test]
  async fn shared_input_reaches_every_peer() {
    let (input, mut feed) = pipe();
    let (created, mut announced) = mpsc::unbounded_channel();
    let streams = Announcing {
      delegate: StdIoStreamManager::from_reader(input)
        .with_output(Arc::new(|| Box::new(tokio::io::sink()) as BoxWriter)),
      created,
    };
    let (addr, shutdown) = start(
      streams,
      ListenOptions {
        lines: true,
        ..ListenOptions::default()
      },
    )
    .await;

    let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for peer in [&peer_a, &peer_b] {
      peer.send_to(b"", addr).await.unwrap();
    }
    for _ in 0..2 {
      tokio::time::timeout(TIMEOUT, announced.recv())
        .await
        .expect("each peer must get a stream")
        .unwrap();
    }

    feed.write_all(b"hello\n").await.unwrap();
    assert_eq!(recv_text(&peer_a).await, "hello");
    assert_eq!(recv_text(&peer_b).await, "hello");
    shutdown.cancel();
  }

  #[tokio::test]
  async fn packets_are_written_as_json() {
    let (output, mut sink) = captured_output();
    let (addr, shutdown) = start(
      StdIoStreamManager::with_data(&b""[..]).with_output(output),
      ListenOptions {
        json: true,
        ..ListenOptions::default()
      },
    )
    .await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    peer.send_to(b"hi", addr).await.unwrap();

    let expected = format!("{{\"RemoteAddr\":\"{}\",\"Data\":\"aGk=\"}}\n", peer_addr);
    let mut line = vec![0u8; expected.len()];
    tokio::time::timeout(TIMEOUT, sink.read_exact(&mut line))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(String::from_utf8(line).unwrap(), expected);
    shutdown.cancel();
  }

  #[tokio::test]
  async fn idle_peers_are_evicted() {
    let (output, mut sink) = captured_output();
    let (addr, shutdown) = start(
      StdIoStreamManager::with_data(&b""[..]).with_output(output),
      ListenOptions {
        idle_timeout: Some(Duration::from_millis(100)),
        ..ListenOptions::default()
      },
    )
    .await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"once", addr).await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(TIMEOUT, sink.read_to_end(&mut received))
      .await
      .expect("eviction must close the peer's stream")
      .unwrap();
    assert_eq!(received, b"once");
    shutdown.cancel();
  }

  #[tokio::test]
  async fn connect_exchanges_datagrams() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let (stream_input, mut feed) = pipe();
    let (mut collected, stream_output) = pipe();
    let client = tokio::task::spawn(super::connect(crate::scheme::ConnectConfig {
      config: crate::scheme::Config::new(
        crate::scheme::Endpoint::parse(&format!("udp://{}", addr)).unwrap(),
      ),
      stream: Stream::from_parts(stream_input, stream_output),
    }));

    feed.write_all(b"knock").await.unwrap();
    let mut buffer = [0u8; 64];
    let (size, client_addr) = tokio::time::timeout(TIMEOUT, server.recv_from(&mut buffer))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buffer[..size], b"knock");

    server.send_to(b"who's there", client_addr).await.unwrap();
    let mut reply = vec![0u8; 11];
    tokio::time::timeout(TIMEOUT, collected.read_exact(&mut reply))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reply, b"who's there");

    // Dropping the consumer ends the relay on the next datagram
    drop(collected);
    server.send_to(b"anyone?", client_addr).await.unwrap();
    tokio::time::timeout(TIMEOUT, client)
      .await
      .expect("connect must end once its stream is gone")
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn connected_send_failures_are_logged() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let _guard = tracing::subscriber::set_default(
      tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish(),
    );

    // Nothing listens here, so the kernel refuses after the first datagram
    let vacant = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = vacant.local_addr().unwrap();
    drop(vacant);
    let socket = Arc::new(connect_udp(&addr.to_string()).await.unwrap());

    let (reader, mut feed) = pipe();
    let sender = tokio::task::spawn(send_connected(socket, ReadHalf::new(reader)));
    feed.write_all(b"first").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    feed.write_all(b"second").await.unwrap();
    tokio::time::timeout(TIMEOUT, sender)
      .await
      .expect("sender must stop once sending fails")
      .unwrap();
    assert!(logs.contents().contains("send failed"), "{}", logs.contents());
  }
}
