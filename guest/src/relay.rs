//! Byte relays between host stdio connections and a process.
//!
//! A [`PipeRelay`] owns the agent side of three pipes whose other ends
//! become the process's stdin/stdout/stderr. A [`TtyRelay`] owns the
//! master side of the process's pseudo-terminal.
//!
//! Both accept host connections with `replace_connections` before
//! `start`. Connections replaced later are used by the next `start`.

use std::io;
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stdio::StdioSet;

/// Child ends of the relay pipes, handed to the runtime.
#[derive(Debug)]
pub struct ChildPipes {
    /// Read end of stdin
    pub stdin: OwnedFd,
    /// Write end of stdout
    pub stdout: OwnedFd,
    /// Write end of stderr
    pub stderr: OwnedFd,
}

#[derive(Default)]
struct PipeEnds {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

#[derive(Default)]
struct PipeRelayState {
    pipes: PipeEnds,
    stdio: StdioSet,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PipeRelay {
    state: Mutex<PipeRelayState>,
}

impl PipeRelay {
    pub fn new() -> io::Result<(Self, ChildPipes)> {
        let (stdin_r, stdin_w) = pipe2(OFlag::O_CLOEXEC)?;
        let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC)?;
        let (stderr_r, stderr_w) = pipe2(OFlag::O_CLOEXEC)?;

        let relay = Self {
            state: Mutex::new(PipeRelayState {
                pipes: PipeEnds {
                    stdin: Some(stdin_w),
                    stdout: Some(stdout_r),
                    stderr: Some(stderr_r),
                },
                ..Default::default()
            }),
        };
        let child = ChildPipes {
            stdin: stdin_r,
            stdout: stdout_w,
            stderr: stderr_w,
        };
        Ok((relay, child))
    }

    pub fn replace_connections(&self, stdio: StdioSet) {
        self.state.lock().stdio = stdio;
    }

    /// Close the agent end of every pipe that has no host connection, so
    /// the process sees EOF on stdin and EPIPE on unconsumed output.
    pub fn close_unused_pipes(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        if state.stdio.stdin.is_none() {
            state.pipes.stdin.take();
        }
        if state.stdio.stdout.is_none() {
            state.pipes.stdout.take();
        }
        if state.stdio.stderr.is_none() {
            state.pipes.stderr.take();
        }
    }

    /// Start copying between each connected pipe and its connection.
    pub fn start(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;

        if let (Some(pipe), Some(conn)) = (state.pipes.stdin.take(), state.stdio.stdin.take()) {
            state.tasks.push(spawn_copy("stdin", conn, fd_file(pipe)));
        }
        if let (Some(pipe), Some(conn)) = (state.pipes.stdout.take(), state.stdio.stdout.take()) {
            state.tasks.push(spawn_copy("stdout", fd_file(pipe), conn));
        }
        if let (Some(pipe), Some(conn)) = (state.pipes.stderr.take(), state.stdio.stderr.take()) {
            state.tasks.push(spawn_copy("stderr", fd_file(pipe), conn));
        }
    }

    /// Stop copying and close every pipe and connection.
    pub fn close(&self) {
        let mut state = self.state.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.stdio.close();
        state.pipes = PipeEnds::default();
    }
}

impl Drop for PipeRelay {
    fn drop(&mut self) {
        for task in self.state.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Default)]
struct TtyRelayState {
    stdio: StdioSet,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TtyRelay {
    master: OwnedFd,
    state: Mutex<TtyRelayState>,
}

impl TtyRelay {
    pub fn new(master: OwnedFd) -> Self {
        Self {
            master,
            state: Mutex::new(TtyRelayState::default()),
        }
    }

    pub fn replace_connections(&self, stdio: StdioSet) {
        self.state.lock().stdio = stdio;
    }

    /// Host stdin → master, master → host stdout. A terminal has no
    /// separate stderr; any stderr connection is closed.
    pub fn start(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(conn) = state.stdio.stdin.take() {
            let master = fd_file(self.master.try_clone()?);
            state.tasks.push(spawn_copy("tty-in", conn, master));
        }
        if let Some(conn) = state.stdio.stdout.take() {
            let master = fd_file(self.master.try_clone()?);
            state.tasks.push(spawn_copy("tty-out", master, conn));
        }
        state.stdio.stderr.take();
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.stdio.close();
    }
}

impl Drop for TtyRelay {
    fn drop(&mut self) {
        for task in self.state.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

fn fd_file(fd: OwnedFd) -> tokio::fs::File {
    tokio::fs::File::from_std(std::fs::File::from(fd))
}

fn spawn_copy<R, W>(stream: &'static str, mut reader: R, mut writer: W) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(bytes) => debug!(stream, bytes, "relay finished"),
            // EIO is how a pty master reports that the slave side closed.
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => {
                debug!(stream, "relay source closed")
            }
            Err(e) => warn!(stream, error = %e, "relay failed"),
        }
        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::Connection;
    use std::io::{Read, Write};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_pipe_relay_copies_both_directions() {
        let (relay, child) = PipeRelay::new().unwrap();
        let (agent_in, mut host_in) = UnixStream::pair().unwrap();
        let (agent_out, mut host_out) = UnixStream::pair().unwrap();

        relay.replace_connections(StdioSet {
            stdin: Some(Connection::Unix(agent_in)),
            stdout: Some(Connection::Unix(agent_out)),
            stderr: None,
        });
        relay.close_unused_pipes();
        relay.start();

        tokio::io::AsyncWriteExt::write_all(&mut host_in, b"ping")
            .await
            .unwrap();
        drop(host_in);

        let mut child_stdin = std::fs::File::from(child.stdin);
        let stdin_data = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            child_stdin.read_to_end(&mut buf).map(|_| buf)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stdin_data, b"ping");

        let mut child_stdout = std::fs::File::from(child.stdout);
        child_stdout.write_all(b"pong").unwrap();
        drop(child_stdout);

        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), host_out.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"pong");
    }

    #[tokio::test]
    async fn test_unused_stdin_is_closed() {
        let (relay, child) = PipeRelay::new().unwrap();
        relay.replace_connections(StdioSet::default());
        relay.close_unused_pipes();

        let mut child_stdin = std::fs::File::from(child.stdin);
        let mut buf = Vec::new();
        let n = child_stdin.read_to_end(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
