use crate::error::{AuthoriserError, AuthoriserResult};
use std::fs::{self, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::{info, warn};

/// Unlinks the socket path when dropped.
///
/// Only ever constructed after this process bound the path, so a second
/// instance that fails to bind never removes the first one's socket.
#[derive(Debug)]
pub struct SocketPathGuard {
    path: PathBuf,
}

impl SocketPathGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketPathGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Removed relay socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove relay socket"),
        }
    }
}

/// A bound relay socket paired with the guard that removes it.
#[derive(Debug)]
pub struct RelaySocket {
    listener: UnixListener,
    guard: SocketPathGuard,
}

impl RelaySocket {
    /// Bind `path` and restrict it to `mode`.
    ///
    /// Fails with [`AuthoriserError::SocketInUse`] if the path already
    /// exists, whether another instance is live or a previous run left it.
    pub fn bind(path: &Path, mode: u32) -> AuthoriserResult<Self> {
        let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => AuthoriserError::SocketInUse(path.to_path_buf()),
            _ => AuthoriserError::Io(e),
        })?;
        let guard = SocketPathGuard {
            path: path.to_path_buf(),
        };

        fs::set_permissions(path, Permissions::from_mode(mode))?;

        info!(path = %path.display(), mode = %format!("{:o}", mode), "Relay socket bound");
        Ok(Self { listener, guard })
    }

    pub fn into_parts(self) -> (UnixListener, SocketPathGuard) {
        (self.listener, self.guard)
    }
}
