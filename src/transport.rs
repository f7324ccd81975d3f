//! Byte-stream transports underneath a connection.
//!
//! A transport is shared by the connection's reader and writer tasks, so
//! every operation takes `&self` and drives the socket through readiness
//! I/O.  Reads and writes may return partial counts; the `_exact`/`_all`
//! helpers loop.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::str::FromStr;

use nix::sys::socket::{
    self, sockopt, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use tokio::io::Interest;
#[cfg(test)]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::address::{ServerAddress, TcpAddress, TcpFamily};

/// The nonce a `nonce-tcp:` server expects as the very first bytes written.
pub const NONCE_LEN: usize = 16;

const SCM_MAX_FDS: usize = 16;

#[derive(Debug)]
pub struct Transport {
    kind: TransportKind,
}

#[derive(Debug)]
enum TransportKind {
    Unix(UnixStream),
    Tcp(TcpStream),
    #[cfg(test)]
    Mem(MemTransport),
}

#[cfg(test)]
#[derive(Debug)]
struct MemTransport {
    read: tokio::sync::Mutex<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    write: tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
}

fn nix_err(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn connect_abstract(name: &[u8]) -> io::Result<StdUnixStream> {
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(nix_err)?;
    let addr = UnixAddr::new_abstract(name).map_err(nix_err)?;
    socket::connect(fd.as_raw_fd(), &addr).map_err(nix_err)?;
    let stream = StdUnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(stream)
}

async fn connect_tcp(addr: &TcpAddress) -> io::Result<TcpStream> {
    let mut last = None;
    for candidate in tokio::net::lookup_host((addr.host.as_str(), addr.port)).await? {
        let family_ok = match addr.family {
            None => true,
            Some(TcpFamily::Ipv4) => candidate.is_ipv4(),
            Some(TcpFamily::Ipv6) => candidate.is_ipv6(),
        };
        if !family_ok {
            continue;
        }
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no address matched the requested family")
    }))
}

async fn machine_id() -> io::Result<String> {
    for path in ["/var/lib/dbus/machine-id", "/etc/machine-id"] {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no D-Bus machine id on this system",
    ))
}

/// Resolve `autolaunch:` by way of dbus-launch, which reuses the X-owned
/// session address if one exists and spawns a bus otherwise.
async fn autolaunch_address() -> io::Result<String> {
    let id = machine_id().await?;
    let out = tokio::process::Command::new("dbus-launch")
        .arg(format!("--autolaunch={id}"))
        .arg("--sh-syntax")
        .output()
        .await?;
    if !out.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "dbus-launch exited with failure",
        ));
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("DBUS_SESSION_BUS_ADDRESS=") {
            let addr = rest.trim_end_matches(';').trim_matches('\'');
            return Ok(addr.to_string());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "dbus-launch produced no bus address",
    ))
}

impl Transport {
    /// Open a stream to one parsed server address.
    pub async fn connect(addr: &ServerAddress) -> io::Result<Transport> {
        match addr {
            ServerAddress::Unix(u) => {
                if u.tmpdir().is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "tmpdir addresses are only usable by servers",
                    ));
                }
                let bytes = u.path().as_os_str().as_encoded_bytes();
                let stream = match bytes.first() {
                    // A leading NUL selects Linux's abstract namespace.
                    Some(0) => UnixStream::from_std(connect_abstract(&bytes[1..])?)?,
                    _ => UnixStream::connect(u.path()).await?,
                };
                Ok(Transport {
                    kind: TransportKind::Unix(stream),
                })
            }
            ServerAddress::Tcp(t) => Ok(Transport {
                kind: TransportKind::Tcp(connect_tcp(t).await?),
            }),
            ServerAddress::NonceTcp(n) => {
                let nonce = tokio::fs::read(&n.noncefile).await?;
                if nonce.len() < NONCE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "nonce file is shorter than 16 bytes",
                    ));
                }
                let transport = Transport {
                    kind: TransportKind::Tcp(connect_tcp(&n.tcp).await?),
                };
                transport.write_all(&nonce[..NONCE_LEN]).await?;
                Ok(transport)
            }
            ServerAddress::Autolaunch => {
                let resolved = autolaunch_address().await?;
                let parsed = ServerAddress::from_str(
                    resolved.split(';').next().unwrap_or(&resolved),
                )
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Box::pin(Transport::connect(&parsed)).await
            }
        }
    }

    /// Whether this transport can carry file descriptors out of band.
    pub fn supports_fd_passing(&self) -> bool {
        matches!(self.kind, TransportKind::Unix(_))
    }

    /// Credentials of the peer, for EXTERNAL verification on the accepting
    /// side.
    pub fn peer_uid(&self) -> io::Result<u32> {
        match &self.kind {
            TransportKind::Unix(s) => {
                let creds = socket::getsockopt(s, sockopt::PeerCredentials).map_err(nix_err)?;
                Ok(creds.uid())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "peer credentials need a unix transport",
            )),
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.kind {
            TransportKind::Unix(s) => loop {
                s.readable().await?;
                match s.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            TransportKind::Tcp(s) => loop {
                s.readable().await?;
                match s.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            #[cfg(test)]
            TransportKind::Mem(m) => m.read.lock().await.read(buf).await,
        }
    }

    /// Like [`read`](Transport::read), collecting any SCM_RIGHTS payload
    /// that arrived with the bytes.
    pub async fn read_with_fds(
        &self,
        buf: &mut [u8],
        fds: &mut Vec<OwnedFd>,
    ) -> io::Result<usize> {
        let s = match &self.kind {
            TransportKind::Unix(s) => s,
            _ => return self.read(buf).await,
        };
        loop {
            s.ready(Interest::READABLE).await?;
            let res = s.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(buf)];
                let mut cmsg = nix::cmsg_space!([RawFd; SCM_MAX_FDS]);
                let msg = socket::recvmsg::<()>(
                    s.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(nix_err)?;
                let mut received = Vec::new();
                for c in msg.cmsgs().map_err(nix_err)? {
                    if let ControlMessageOwned::ScmRights(raw) = c {
                        for fd in raw {
                            // recvmsg transferred ownership of these to us.
                            received.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                Ok((msg.bytes, received))
            });
            match res {
                Ok((n, received)) => {
                    fds.extend(received);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.kind {
            TransportKind::Unix(s) => loop {
                s.writable().await?;
                match s.try_write(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            TransportKind::Tcp(s) => loop {
                s.writable().await?;
                match s.try_write(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            #[cfg(test)]
            TransportKind::Mem(m) => m.write.lock().await.write(buf).await,
        }
    }

    /// Write `buf`, attaching `fds` as SCM_RIGHTS ancillary data.  Unix
    /// transports only.
    pub async fn write_with_fds(&self, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let s = match &self.kind {
            TransportKind::Unix(s) => s,
            _ if fds.is_empty() => return self.write(buf).await,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "fd passing needs a unix transport",
                ))
            }
        };
        loop {
            s.ready(Interest::WRITABLE).await?;
            let res = s.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(buf)];
                let cmsgs = if fds.is_empty() {
                    Vec::new()
                } else {
                    vec![ControlMessage::ScmRights(fds)]
                };
                socket::sendmsg::<()>(s.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                    .map_err(nix_err)
            });
            match res {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Write a whole frame; the fds ride on the first chunk.
    pub async fn write_all_with_fds(&self, buf: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = if pos == 0 {
                self.write_with_fds(buf, fds).await?
            } else {
                self.write(&buf[pos..]).await?
            };
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            pos += n;
        }
        Ok(())
    }

    pub async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.read(&mut buf[pos..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            pos += n;
        }
        Ok(())
    }

    pub async fn read_exact_with_fds(
        &self,
        buf: &mut [u8],
        fds: &mut Vec<OwnedFd>,
    ) -> io::Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.read_with_fds(&mut buf[pos..], fds).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            pos += n;
        }
        Ok(())
    }

    /// Nothing is buffered in user space, so this only exists to complete
    /// the transport contract.
    pub async fn flush(&self) -> io::Result<()> {
        #[cfg(test)]
        if let TransportKind::Mem(m) = &self.kind {
            return m.write.lock().await.flush().await;
        }
        Ok(())
    }

    /// Shut the stream down in both directions.  Safe to call more than
    /// once; a blocked reader observes EOF.
    pub async fn close(&self) {
        match &self.kind {
            TransportKind::Unix(s) => {
                let _ = socket::shutdown(s.as_raw_fd(), socket::Shutdown::Both);
            }
            TransportKind::Tcp(s) => {
                let _ = socket::shutdown(s.as_raw_fd(), socket::Shutdown::Both);
            }
            #[cfg(test)]
            TransportKind::Mem(m) => {
                let _ = m.write.lock().await.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
impl Transport {
    /// Two connected in-memory endpoints.
    pub fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (Transport::from_duplex(a), Transport::from_duplex(b))
    }

    fn from_duplex(d: tokio::io::DuplexStream) -> Transport {
        let (r, w) = tokio::io::split(d);
        Transport {
            kind: TransportKind::Mem(MemTransport {
                read: tokio::sync::Mutex::new(r),
                write: tokio::sync::Mutex::new(w),
            }),
        }
    }

    /// Two connected unix-socket endpoints, for fd-passing tests.
    pub fn unix_pair() -> io::Result<(Transport, Transport)> {
        let (a, b) = UnixStream::pair()?;
        Ok((
            Transport {
                kind: TransportKind::Unix(a),
            },
            Transport {
                kind: TransportKind::Unix(b),
            },
        ))
    }
}
