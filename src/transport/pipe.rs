//! Platform-specific local IPC.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use groundlink::transport::{generate_pipe_path, PipeListener};
//!
//! let path = generate_pipe_path("core");
//! let listener = PipeListener::bind(&path).await?;
//! let stream = listener.accept().await?;
//! ```

use std::io;

/// A fresh socket path, unique per process and call.
///
/// Format:
/// - Unix: `/tmp/groundlink-{name}-{pid}-{random}.sock`
/// - Windows: `\\.\pipe\groundlink-{name}-{pid}-{random}`
pub fn generate_pipe_path(name: &str) -> String {
    let pid = std::process::id();
    let rand: u64 = rand_u64();

    #[cfg(unix)]
    {
        format!("/tmp/groundlink-{}-{}-{:x}.sock", name, pid, rand)
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\groundlink-{}-{}-{:x}", name, pid, rand)
    }
}

/// Well-known pipe path for a named IPC server.
///
/// Peers that agree on `id` find each other without exchanging paths.
/// - Unix: `/tmp/app.{id}`
/// - Windows: `\\.\pipe\tmp-app.{id}`
pub fn ipc_path_for(id: &str) -> String {
    #[cfg(unix)]
    {
        format!("/tmp/app.{}", id)
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\tmp-app.{}", id)
    }
}

/// Simple random u64 using system time, process ID and a call counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static CALLS: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    let calls = CALLS.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ calls.rotate_left(32)
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Connected local stream.
    pub type PipeStream = UnixStream;

    /// Local IPC listener on a Unix domain socket.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    impl PipeListener {
        /// Bind `path`.
        ///
        /// A stale socket file left by a crashed process is removed first.
        pub async fn bind(path: &str) -> io::Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Accept the next connection.
        pub async fn accept(&self) -> io::Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }

        /// Get the socket path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Connect to a listening socket.
    ///
    /// A missing socket file surfaces as `NotFound`, a stale one as
    /// `ConnectionRefused`; both mean "not listening yet".
    pub async fn connect_pipe(path: &str) -> io::Result<PipeStream> {
        UnixStream::connect(path).await
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use tokio::sync::Mutex;

    /// `ERROR_PIPE_BUSY`: every server instance is connected.
    const ERROR_PIPE_BUSY: i32 = 231;

    /// Connected named pipe, server or client end.
    pub enum PipeStream {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    /// Local IPC listener on a Windows named pipe.
    ///
    /// Holds the instance the next client will connect to; each accept
    /// hands that instance out and creates a fresh one.
    pub struct PipeListener {
        path: String,
        next: Mutex<NamedPipeServer>,
    }

    impl PipeListener {
        /// Create the first Named Pipe server instance.
        pub async fn bind(path: &str) -> io::Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)?;

            Ok(Self {
                path: path.to_string(),
                next: Mutex::new(first),
            })
        }

        /// Accept the next connection.
        pub async fn accept(&self) -> io::Result<PipeStream> {
            let mut next = self.next.lock().await;
            next.connect().await?;

            let fresh = ServerOptions::new().create(&self.path)?;
            let connected = std::mem::replace(&mut *next, fresh);

            Ok(PipeStream::Server(connected))
        }

        /// Get the pipe path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    /// Connect to a named pipe server, waiting out busy instances.
    pub async fn connect_pipe(path: &str) -> io::Result<PipeStream> {
        loop {
            match ClientOptions::new().open(path) {
                Ok(client) => return Ok(PipeStream::Client(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    impl tokio::io::AsyncRead for PipeStream {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_read(cx, buf),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_read(cx, buf),
            }
        }
    }

    impl tokio::io::AsyncWrite for PipeStream {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_write(cx, buf),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_write(cx, buf),
            }
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_flush(cx),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_flush(cx),
            }
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_shutdown(cx),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_shutdown(cx),
            }
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{connect_pipe, PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{connect_pipe, PipeListener, PipeStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pipe_path_format() {
        let path = generate_pipe_path("core");

        #[cfg(unix)]
        {
            assert!(path.starts_with("/tmp/groundlink-core-"));
            assert!(path.ends_with(".sock"));
        }

        #[cfg(windows)]
        {
            assert!(path.starts_with(r"\\.\pipe\groundlink-core-"));
        }
    }

    #[test]
    fn test_generate_pipe_path_uniqueness() {
        let paths: Vec<String> = (0..10).map(|_| generate_pipe_path("t")).collect();

        for (i, p1) in paths.iter().enumerate() {
            for (j, p2) in paths.iter().enumerate() {
                if i != j {
                    assert_ne!(p1, p2, "Paths should be unique");
                }
            }
        }
    }

    #[test]
    fn test_ipc_path_for() {
        #[cfg(unix)]
        assert_eq!(ipc_path_for("core"), "/tmp/app.core");

        #[cfg(windows)]
        assert_eq!(ipc_path_for("core"), r"\\.\pipe\tmp-app.core");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_missing_socket_is_not_found() {
        let path = generate_pipe_path("missing");
        let err = connect_pipe(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_accepts_multiple_clients() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = generate_pipe_path("multi");
        let listener = PipeListener::bind(&path).await.unwrap();

        let mut first = connect_pipe(&path).await.unwrap();
        let mut second = connect_pipe(&path).await.unwrap();

        let mut a = listener.accept().await.unwrap();
        let mut b = listener.accept().await.unwrap();

        first.write_all(b"1").await.unwrap();
        second.write_all(b"2").await.unwrap();

        let mut buf = [0u8; 1];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1");
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2");
    }
}
