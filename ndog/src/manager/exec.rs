// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! One subprocess per stream
//!
//! The peer's bytes go to the child's stdin, and the child's stdout goes back
//! to the peer. The child's stderr is logged line by line. Once both halves of
//! the stream are closed the child is given time to exit, then asked to
//! terminate, then killed.
use std::{process::Stdio, time::Duration};

use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{Child, ChildStderr, Command},
  sync::oneshot,
};
use tracing_futures::Instrument;

use super::{OutputFactory, StreamError, StreamManager};
use crate::{
  stream::{BoxWriter, ReadHalf, Stream, WriteHalf},
  util::tee::TeeWriter,
};

/// How long a child is waited upon at each stage of shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownGrace {
  /// Time allowed to exit on its own after its stream closes
  pub exit: Duration,
  /// Time allowed to exit after being asked to terminate
  pub terminate: Duration,
}

impl Default for ShutdownGrace {
  fn default() -> Self {
    Self {
      exit: Duration::from_secs(10),
      terminate: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
  Exited,
  Terminated,
  Killed,
}

pub struct ExecStreamManager {
  program: String,
  args: Vec<String>,
  tee: Option<OutputFactory>,
  grace: ShutdownGrace,
}

impl ExecStreamManager {
  /// `argv[0]` is the program to run, the rest are its arguments
  pub fn new(argv: Vec<String>) -> Result<Self, StreamError> {
    let mut argv = argv.into_iter();
    let program = argv.next().ok_or(StreamError::EmptyCommand)?;
    Ok(Self {
      program,
      args: argv.collect(),
      tee: None,
      grace: ShutdownGrace::default(),
    })
  }

  /// Also copies everything the peer sends the child into `output`
  pub fn with_tee(mut self, output: OutputFactory) -> Self {
    self.tee = Some(output);
    self
  }

  pub fn with_grace(mut self, grace: ShutdownGrace) -> Self {
    self.grace = grace;
    self
  }
}

impl StreamManager for ExecStreamManager {
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| StreamError::Spawn {
        program: self.program.clone(),
        source,
      })?;
    let pid = child.id().unwrap_or_default();
    let span = tracing::debug_span!("exec", pid, stream = name);
    span.in_scope(|| tracing::debug!(program = %self.program, "started subprocess"));

    let stdin = child.stdin.take().ok_or(StreamError::MissingPipe("stdin"))?;
    let stdout = child
      .stdout
      .take()
      .ok_or(StreamError::MissingPipe("stdout"))?;
    let stderr = child
      .stderr
      .take()
      .ok_or(StreamError::MissingPipe("stderr"))?;

    tokio::task::spawn(log_stderr(stderr).instrument(span.clone()));

    let (stdin_closed, on_stdin_closed) = oneshot::channel::<()>();
    let (stdout_closed, on_stdout_closed) = oneshot::channel::<()>();
    let grace = self.grace;
    tokio::task::spawn(
      async move {
        // Both halves must be released first; the child may block on either pipe
        let _ = on_stdin_closed.await;
        let _ = on_stdout_closed.await;
        tracing::trace!("stream closed, reaping subprocess");
        if let Err(e) = shutdown_child(&mut child, grace).await {
          tracing::error!(error = %e, "failed to reap subprocess");
        }
      }
      .instrument(span),
    );

    let stdin: BoxWriter = match &self.tee {
      Some(tee) => Box::new(TeeWriter::new(stdin, tee())),
      None => Box::new(stdin),
    };
    Ok(Stream::new(
      ReadHalf::with_close_hook(stdout, move || {
        let _ = stdout_closed.send(());
      }),
      WriteHalf::with_close_hook(stdin, move || {
        let _ = stdin_closed.send(());
      }),
    ))
  }
}

async fn log_stderr(stderr: ChildStderr) {
  let mut lines = BufReader::new(stderr).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => tracing::info!(target: "ndog::exec::stderr", "{}", line),
      Ok(None) => break,
      Err(e) => {
        tracing::debug!(error = %e, "stderr closed");
        break;
      }
    }
  }
}

/// Waits for `child` to exit, escalating to terminate and then kill
pub async fn shutdown_child(
  child: &mut Child,
  grace: ShutdownGrace,
) -> std::io::Result<ShutdownOutcome> {
  match tokio::time::timeout(grace.exit, child.wait()).await {
    Ok(status) => {
      let status = status?;
      tracing::debug!(?status, "subprocess exited");
      return Ok(ShutdownOutcome::Exited);
    }
    Err(_) => tracing::debug!("subprocess still running, terminating"),
  }

  request_termination(child);
  match tokio::time::timeout(grace.terminate, child.wait()).await {
    Ok(status) => {
      let status = status?;
      tracing::debug!(?status, "subprocess terminated");
      return Ok(ShutdownOutcome::Terminated);
    }
    Err(_) => tracing::error!("subprocess ignored termination, killing"),
  }

  // Kills and then reaps
  child.kill().await?;
  Ok(ShutdownOutcome::Killed)
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
  use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
  };
  if let Some(pid) = child.id() {
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
      tracing::warn!(pid, error = %e, "failed to send SIGTERM");
    }
  }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
  if let Err(e) = child.start_kill() {
    tracing::warn!(error = %e, "failed to terminate subprocess");
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::{
    process::Stdio,
    time::{Duration, Instant},
  };

  use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
  };
  use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
  };

  use super::{shutdown_child, ExecStreamManager, ShutdownGrace, ShutdownOutcome};
  use crate::manager::{testing::captured_output, StreamManager};

  const TIMEOUT: Duration = Duration::from_secs(10);

  fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
  }

  fn spawn_sh(script: &str) -> tokio::process::Child {
    Command::new("sh")
      .arg("-c")
      .arg(script)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .unwrap()
  }

  fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None::<Signal>).is_ok()
  }

  #[test]
  fn empty_command_is_rejected() {
    assert!(ExecStreamManager::new(Vec::new()).is_err());
  }

  #[tokio::test]
  async fn peer_bytes_round_trip_through_child() {
    let manager = ExecStreamManager::new(argv(&["cat"])).unwrap();
    let mut stream = manager.new_stream("peer").unwrap();
    stream.writer.write_all(b"ping\n").await.unwrap();
    stream.writer.close().await.unwrap();
    let mut read = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.reader.read_to_end(&mut read))
      .await
      .expect("child must exit once stdin closes")
      .unwrap();
    assert_eq!(read, b"ping\n");
    stream.close().await.unwrap();
  }

  #[tokio::test]
  async fn tee_copies_child_input() {
    let (output, mut tee_sink) = captured_output();
    let manager = ExecStreamManager::new(argv(&["cat"]))
      .unwrap()
      .with_tee(output);
    let mut stream = manager.new_stream("peer").unwrap();
    stream.writer.write_all(b"abc").await.unwrap();
    stream.writer.close().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.reader.read_to_end(&mut echoed))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(echoed, b"abc");
    let mut teed = Vec::new();
    tokio::time::timeout(TIMEOUT, tee_sink.read_to_end(&mut teed))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(teed, b"abc");
  }

  #[tokio::test]
  async fn child_exiting_promptly_is_not_signalled() {
    let mut child = spawn_sh("exit 0");
    let outcome = shutdown_child(&mut child, ShutdownGrace::default())
      .await
      .unwrap();
    assert_eq!(outcome, ShutdownOutcome::Exited);
  }

  #[tokio::test]
  async fn lingering_child_is_terminated() {
    let mut child = spawn_sh("exec sleep 30");
    let grace = ShutdownGrace {
      exit: Duration::from_millis(100),
      terminate: Duration::from_secs(5),
    };
    let started = Instant::now();
    let outcome = shutdown_child(&mut child, grace).await.unwrap();
    assert_eq!(outcome, ShutdownOutcome::Terminated);
    assert!(started.elapsed() >= grace.exit);
    assert!(started.elapsed() < grace.exit + grace.terminate);
  }

  #[tokio::test]
  async fn stubborn_child_is_killed_after_both_windows() {
    let mut child = spawn_sh("trap '' TERM; while :; do sleep 1; done");
    let grace = ShutdownGrace {
      exit: Duration::from_millis(300),
      terminate: Duration::from_millis(300),
    };
    let started = Instant::now();
    let outcome = tokio::time::timeout(TIMEOUT, shutdown_child(&mut child, grace))
      .await
      .expect("kill must not hang")
      .unwrap();
    assert_eq!(outcome, ShutdownOutcome::Killed);
    assert!(started.elapsed() >= grace.exit + grace.terminate);
  }

  #[tokio::test]
  async fn child_outlives_a_half_closed_stream() {
    let grace = ShutdownGrace {
      exit: Duration::from_millis(300),
      terminate: Duration::from_millis(300),
    };
    let manager = ExecStreamManager::new(argv(&[
      "sh",
      "-c",
      "trap '' TERM; echo $$; while :; do sleep 0.1; done",
    ]))
    .unwrap()
    .with_grace(grace);
    let stream = manager.new_stream("peer").unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    tokio::time::timeout(TIMEOUT, reader.read_line(&mut line))
      .await
      .expect("child must report its pid")
      .unwrap();
    let pid: i32 = line.trim().parse().unwrap();

    // Closing stdin alone starts no teardown
    writer.close().await.unwrap();
    tokio::time::sleep(grace.exit + grace.terminate + Duration::from_millis(200)).await;
    assert!(is_alive(pid), "child must survive while its output is open");

    let started = Instant::now();
    reader.get_mut().close();
    assert!(is_alive(pid), "child must get its exit window");
    while is_alive(pid) {
      assert!(started.elapsed() < TIMEOUT, "child must be killed");
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(started.elapsed() >= grace.exit + grace.terminate);
  }
}
