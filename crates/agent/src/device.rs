//! Device endpoint: the platform byte-stream underneath the session.
//!
//! On Unix guests this is a virtio-serial character device, auto-detected
//! by port name under the virtio-ports sysfs tree. On Windows guests it is
//! the named device handle the virtio-serial driver exposes. The endpoint
//! does no buffering of its own; framing and buffering live upstream.
//!
//! Disconnects surface as EOF on read (`Ok(0)`), which the frame codec
//! converts into its disconnect error. Reopening after a disconnect is the
//! session layer's job, through the [`DeviceFactory`] it was given.

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

pub type DeviceReader = Box<dyn AsyncRead + Send + Unpin>;
pub type DeviceWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device is missing or cannot currently be opened. The connect
    /// loop keeps retrying; the hypervisor may attach the port later.
    #[error("device unavailable: {0}")]
    Unavailable(String),
    /// The device exists but this process may never open it. Fatal at
    /// boot (exit code 2).
    #[error("device permission denied: {0}")]
    PermissionDenied(String),
}

/// Opens a fresh reader/writer pair per connection attempt. Tests swap in
/// an in-memory factory; production uses the platform variant below.
pub trait DeviceFactory: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<(DeviceReader, DeviceWriter), DeviceError>>;
    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}

#[cfg(unix)]
pub use unix::VirtioPortFactory;
#[cfg(windows)]
pub use windows::NamedDeviceFactory;

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::{Path, PathBuf};
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll, ready};

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tracing::debug;

    use super::{DeviceError, DeviceFactory, DeviceReader, DeviceWriter};

    const VIRTIO_PORTS_SYSFS: &str = "/sys/class/virtio-ports";

    pub struct VirtioPortFactory {
        device_path: Option<PathBuf>,
        port_name: String,
    }

    impl VirtioPortFactory {
        pub fn new(device_path: Option<PathBuf>, port_name: String) -> Self {
            VirtioPortFactory {
                device_path,
                port_name,
            }
        }

        fn resolve(&self) -> Result<PathBuf, DeviceError> {
            match &self.device_path {
                Some(path) => Ok(path.clone()),
                None => detect_port(Path::new(VIRTIO_PORTS_SYSFS), &self.port_name),
            }
        }
    }

    impl DeviceFactory for VirtioPortFactory {
        fn open(&self) -> BoxFuture<'_, Result<(DeviceReader, DeviceWriter), DeviceError>> {
            async move {
                let path = self.resolve()?;
                debug!(path = %path.display(), "opening virtio-serial port");
                let (reader, writer) = open_port(&path)?;
                Ok((
                    Box::new(reader) as DeviceReader,
                    Box::new(writer) as DeviceWriter,
                ))
            }
            .boxed()
        }

        fn describe(&self) -> String {
            match &self.device_path {
                Some(path) => path.display().to_string(),
                None => format!("virtio port {:?}", self.port_name),
            }
        }
    }

    /// Scan the virtio-ports class tree for the entry whose `name`
    /// attribute matches and map it to its /dev node.
    pub(crate) fn detect_port(sysfs_root: &Path, port_name: &str) -> Result<PathBuf, DeviceError> {
        let entries = std::fs::read_dir(sysfs_root)
            .map_err(|err| DeviceError::Unavailable(format!("no virtio-ports tree: {err}")))?;
        for entry in entries.flatten() {
            let Ok(name) = std::fs::read_to_string(entry.path().join("name")) else {
                continue;
            };
            if name.trim_end() == port_name {
                return Ok(PathBuf::from("/dev").join(entry.file_name()));
            }
        }
        Err(DeviceError::Unavailable(format!(
            "no virtio port named {port_name:?}"
        )))
    }

    fn open_port(path: &Path) -> Result<(PortReader, PortWriter), DeviceError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    DeviceError::PermissionDenied(format!("{}: {err}", path.display()))
                }
                _ => DeviceError::Unavailable(format!("{}: {err}", path.display())),
            })?;
        let fd = AsyncFd::new(file)
            .map_err(|err| DeviceError::Unavailable(format!("register with reactor: {err}")))?;
        let fd = Arc::new(fd);
        Ok((PortReader { fd: fd.clone() }, PortWriter { fd }))
    }

    /// Read half of the port. Reads and writes are independent syscalls on
    /// the same descriptor, so the halves share one registration.
    pub struct PortReader {
        fd: Arc<AsyncFd<File>>,
    }

    pub struct PortWriter {
        fd: Arc<AsyncFd<File>>,
    }

    impl AsyncRead for PortReader {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            loop {
                let mut guard = ready!(self.fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|fd| (&*fd.get_ref()).read(unfilled)) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(err)) => return Poll::Ready(Err(err)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl AsyncWrite for PortWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            loop {
                let mut guard = ready!(self.fd.poll_write_ready(cx))?;
                match guard.try_io(|fd| (&*fd.get_ref()).write(data)) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            // Character device; nothing buffered on our side.
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn fake_port(root: &Path, node: &str, name: &str) {
            let dir = root.join(node);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("name"), format!("{name}\n")).unwrap();
        }

        #[test]
        fn detects_port_by_name() {
            let tmp = tempfile::tempdir().unwrap();
            fake_port(tmp.path(), "vport0p1", "org.spice.webdav.0");
            fake_port(tmp.path(), "vport1p2", "org.helion.agent.0");

            let path = detect_port(tmp.path(), "org.helion.agent.0").unwrap();
            assert_eq!(path, PathBuf::from("/dev/vport1p2"));
        }

        #[test]
        fn missing_port_is_unavailable() {
            let tmp = tempfile::tempdir().unwrap();
            fake_port(tmp.path(), "vport0p1", "something.else");
            assert!(matches!(
                detect_port(tmp.path(), "org.helion.agent.0"),
                Err(DeviceError::Unavailable(_))
            ));
        }

        #[test]
        fn missing_sysfs_tree_is_unavailable() {
            assert!(matches!(
                detect_port(Path::new("/nonexistent/virtio-ports"), "x"),
                Err(DeviceError::Unavailable(_))
            ));
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::path::PathBuf;

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::{DeviceError, DeviceFactory, DeviceReader, DeviceWriter};

    /// Default named handle the Windows virtio-serial driver exposes for
    /// our port.
    const DEFAULT_DEVICE_PATH: &str = r"\\.\Global\org.helion.agent.0";

    pub struct NamedDeviceFactory {
        device_path: PathBuf,
    }

    impl NamedDeviceFactory {
        pub fn new(device_path: Option<PathBuf>) -> Self {
            NamedDeviceFactory {
                device_path: device_path.unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_PATH)),
            }
        }
    }

    impl DeviceFactory for NamedDeviceFactory {
        fn open(&self) -> BoxFuture<'_, Result<(DeviceReader, DeviceWriter), DeviceError>> {
            async move {
                let open = |path: &PathBuf| {
                    std::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(path)
                        .map_err(|err| match err.kind() {
                            std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(
                                format!("{}: {err}", path.display()),
                            ),
                            _ => DeviceError::Unavailable(format!("{}: {err}", path.display())),
                        })
                };
                let read_half = open(&self.device_path)?;
                let write_half = read_half.try_clone().map_err(|err| {
                    DeviceError::Unavailable(format!("duplicate device handle: {err}"))
                })?;
                // tokio::fs::File routes the blocking device I/O through
                // the blocking pool.
                Ok((
                    Box::new(tokio::fs::File::from_std(read_half)) as DeviceReader,
                    Box::new(tokio::fs::File::from_std(write_half)) as DeviceWriter,
                ))
            }
            .boxed()
        }

        fn describe(&self) -> String {
            self.device_path.display().to_string()
        }
    }
}

/// Platform device factory for this build.
pub fn platform_factory(cfg: &crate::config::Config) -> std::sync::Arc<dyn DeviceFactory> {
    #[cfg(unix)]
    {
        std::sync::Arc::new(VirtioPortFactory::new(
            cfg.device_path.clone(),
            cfg.virtio_port_name.clone(),
        ))
    }
    #[cfg(windows)]
    {
        std::sync::Arc::new(NamedDeviceFactory::new(cfg.device_path.clone()))
    }
}
