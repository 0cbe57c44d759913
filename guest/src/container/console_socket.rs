//! Console socket for PTY handling.
//!
//! libcontainer connects to this socket and sends the PTY master of a
//! terminal process over SCM_RIGHTS.

use gcs_shared::{GcsError, GcsResult};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use std::io::IoSliceMut;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

pub(super) struct ConsoleSocket {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ConsoleSocket {
    /// Bind a socket named after `id` inside `dir`.
    pub fn new(dir: &Path, id: &str) -> GcsResult<Self> {
        let socket_path = dir.join(format!("console-{}.sock", id));

        // Remove stale socket if exists
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            GcsError::Runtime(format!(
                "failed to create console socket {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        tracing::debug!(socket_path = %socket_path.display(), "Created console socket");

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn path(&self) -> String {
        self.socket_path.to_string_lossy().into_owned()
    }

    /// Accept libcontainer's connection and take the PTY master it sends.
    pub fn receive_pty_master(self) -> GcsResult<OwnedFd> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| GcsError::Runtime(format!("console socket accept failed: {}", e)))?;

        let mut buf = [0u8; 1024];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|e| GcsError::Runtime(format!("failed to receive PTY master: {}", e)))?;

        for cmsg in msg.cmsgs().into_iter().flatten() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    tracing::debug!(fd, "Received PTY master");
                    // SAFETY: SCM_RIGHTS hands us a new descriptor we now own.
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        Err(GcsError::Runtime("no PTY master received".to_string()))
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(
                socket_path = %self.socket_path.display(),
                error = %e,
                "Failed to clean up console socket"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{sendmsg, ControlMessage};
    use std::io::IoSlice;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_console_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::new(dir.path(), "exec-123").unwrap();

        let path = socket.path();
        assert!(path.ends_with("console-exec-123.sock"));
        assert!(Path::new(&path).exists());

        drop(socket);
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn test_receives_passed_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::new(dir.path(), "init").unwrap();

        let file = tempfile::tempfile().unwrap();
        let client = UnixStream::connect(socket.path()).unwrap();
        let fds = [file.as_raw_fd()];
        sendmsg::<UnixAddr>(
            client.as_raw_fd(),
            &[IoSlice::new(b"pty")],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();

        let received = socket.receive_pty_master().unwrap();
        assert_ne!(received.as_raw_fd(), file.as_raw_fd());
    }
}
