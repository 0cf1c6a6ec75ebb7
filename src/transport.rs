// src/transport.rs

//! Byte-transfer capability and its concrete adapters.
//!
//! Boundary units only see [`ByteTransfer`]. Both directions may transfer
//! fewer bytes than asked and may block. End of stream is reported as
//! [`TransferError::Eof`], never as `Ok(0)`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use crate::error::{TransferError, TransferResult};

/// Moves bytes between a boundary unit and the outside world.
pub trait ByteTransfer: Send {
    /// Receives up to `buf.len()` bytes.
    fn recv(&mut self, buf: &mut [u8]) -> TransferResult<usize>;

    /// Sends up to `buf.len()` bytes.
    fn send(&mut self, buf: &[u8]) -> TransferResult<usize>;
}

impl<B: ByteTransfer + ?Sized> ByteTransfer for Box<B> {
    fn recv(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        (**self).recv(buf)
    }

    fn send(&mut self, buf: &[u8]) -> TransferResult<usize> {
        (**self).send(buf)
    }
}

/// Sends all of `buf`, looping over partial sends.
///
/// # Errors
///
/// Whatever the transfer reports, or `WriteZero` if it stops accepting bytes.
pub fn send_all<B: ByteTransfer + ?Sized>(transfer: &mut B, mut buf: &[u8]) -> TransferResult<()> {
    while !buf.is_empty() {
        match transfer.send(buf)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

fn unsupported(what: &str) -> TransferError {
    io::Error::new(io::ErrorKind::Unsupported, format!("{what} is not supported")).into()
}

fn map_open_error(err: io::Error, path: &Path) -> TransferError {
    if err.kind() == io::ErrorKind::NotFound {
        TransferError::FileNotFound(path.display().to_string())
    } else {
        TransferError::Io(err)
    }
}

fn map_net_error(err: io::Error, addr: &str) -> TransferError {
    match err.kind() {
        io::ErrorKind::AddrInUse => TransferError::AddressInUse(addr.to_string()),
        io::ErrorKind::ConnectionRefused => TransferError::ConnectionRefused(addr.to_string()),
        _ => TransferError::Io(err),
    }
}

/// How many times a [`FileSource`] replays its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopCount {
    /// Replay forever. Written `-1` on the command line.
    Forever,
    /// Replay this many additional times after the first pass.
    Times(u32),
}

impl FromStr for LoopCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(-1) => Ok(LoopCount::Forever),
            Ok(n) if n >= 0 => u32::try_from(n)
                .map(LoopCount::Times)
                .map_err(|_| format!("loop count {n} is too large")),
            Ok(n) => Err(format!("loop count must be -1 or non-negative, got {n}")),
            Err(e) => Err(format!("invalid loop count '{s}': {e}")),
        }
    }
}

/// Sequential file reader that can replay its input.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: PathBuf,
    loops: LoopCount,
    replays: u32,
    /// Bytes produced since the last rewind; guards against spinning on an
    /// empty file with `LoopCount::Forever`.
    pass_bytes: u64,
}

impl FileSource {
    /// Opens `path`. `loops == None` reads the file once.
    ///
    /// # Errors
    ///
    /// `FileNotFound` if the file does not exist.
    pub fn open(path: impl AsRef<Path>, loops: Option<LoopCount>) -> TransferResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| map_open_error(e, path))?;
        let loops = loops.unwrap_or(LoopCount::Times(0));
        debug!("FileSource opened {} ({:?})", path.display(), loops);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            loops,
            replays: 0,
            pass_bytes: 0,
        })
    }

    /// Completed rewinds so far.
    #[must_use]
    pub fn replays(&self) -> u32 {
        self.replays
    }

    fn rewind(&mut self) -> TransferResult<bool> {
        let more = match self.loops {
            LoopCount::Forever => self.pass_bytes > 0,
            LoopCount::Times(k) => self.replays < k,
        };
        if !more {
            return Ok(false);
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.replays += 1;
        self.pass_bytes = 0;
        trace!("FileSource rewound {} (replay {})", self.path.display(), self.replays);
        Ok(true)
    }
}

impl ByteTransfer for FileSource {
    fn recv(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.file.read(buf) {
                Ok(0) => {
                    if !self.rewind()? {
                        info!(
                            "FileSource reached end of {} after {} replay(s)",
                            self.path.display(),
                            self.replays
                        );
                        return Err(TransferError::Eof);
                    }
                }
                Ok(n) => {
                    self.pass_bytes += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&mut self, _buf: &[u8]) -> TransferResult<usize> {
        Err(unsupported("sending to a file source"))
    }
}

/// File-backed byte sink. Creates or truncates its file.
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// # Errors
    ///
    /// `FileNotFound` if the parent directory does not exist.
    pub fn create(path: impl AsRef<Path>) -> TransferResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| map_open_error(e, path))?;
        debug!("FileSink created {}", path.display());
        Ok(Self { file })
    }
}

impl ByteTransfer for FileSink {
    fn recv(&mut self, _buf: &mut [u8]) -> TransferResult<usize> {
        Err(unsupported("receiving from a file sink"))
    }

    fn send(&mut self, buf: &[u8]) -> TransferResult<usize> {
        Ok(self.file.write(buf)?)
    }
}

/// Socket adapters: datagram or stream, local (bind/listen) or remote
/// (connect).
#[derive(Debug)]
pub enum SocketTransfer {
    Datagram {
        socket: UdpSocket,
        /// Last sender seen by a bound socket; replies go there.
        peer: Option<SocketAddr>,
        connected: bool,
    },
    Stream(TcpStream),
}

impl SocketTransfer {
    /// Binds a datagram socket to `addr` and waits for peers to send.
    ///
    /// # Errors
    ///
    /// `AddressInUse` if the address is taken.
    pub fn datagram_bind(addr: &str) -> TransferResult<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| map_net_error(e, addr))?;
        info!("Datagram socket bound to {}", addr);
        Ok(SocketTransfer::Datagram {
            socket,
            peer: None,
            connected: false,
        })
    }

    /// Binds an ephemeral datagram socket and connects it to `addr`.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused`/`AddressInUse` or other I/O failures.
    pub fn datagram_connect(addr: &str) -> TransferResult<Self> {
        let remote = resolve(addr)?;
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).map_err(|e| map_net_error(e, local))?;
        socket.connect(remote).map_err(|e| map_net_error(e, addr))?;
        info!("Datagram socket connected to {}", addr);
        Ok(SocketTransfer::Datagram {
            socket,
            peer: Some(remote),
            connected: true,
        })
    }

    /// Listens on `addr` and blocks until one peer connects.
    ///
    /// # Errors
    ///
    /// `AddressInUse` if the address is taken.
    pub fn stream_listen(addr: &str) -> TransferResult<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| map_net_error(e, addr))?;
        info!("Listening on {}", addr);
        let (stream, peer) = listener.accept()?;
        info!("Accepted stream connection from {}", peer);
        Ok(SocketTransfer::Stream(stream))
    }

    /// Connects a stream socket to `addr`.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` if nobody listens there.
    pub fn stream_connect(addr: &str) -> TransferResult<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| map_net_error(e, addr))?;
        info!("Stream connected to {}", addr);
        Ok(SocketTransfer::Stream(stream))
    }
}

fn resolve(addr: &str) -> TransferResult<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {addr}")).into())
}

impl ByteTransfer for SocketTransfer {
    fn recv(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        match self {
            SocketTransfer::Datagram {
                socket,
                peer,
                connected,
            } => {
                if *connected {
                    return Ok(socket.recv(buf)?);
                }
                let (n, from) = socket.recv_from(buf)?;
                *peer = Some(from);
                Ok(n)
            }
            SocketTransfer::Stream(stream) => match stream.read(buf)? {
                0 if !buf.is_empty() => Err(TransferError::Eof),
                n => Ok(n),
            },
        }
    }

    fn send(&mut self, buf: &[u8]) -> TransferResult<usize> {
        match self {
            SocketTransfer::Datagram {
                socket,
                peer,
                connected,
            } => {
                if *connected {
                    return Ok(socket.send(buf)?);
                }
                match peer {
                    Some(peer) => Ok(socket.send_to(buf, *peer)?),
                    None => Err(io::Error::from(io::ErrorKind::NotConnected).into()),
                }
            }
            SocketTransfer::Stream(stream) => Ok(stream.write(buf)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use test_log::test;

    fn read_to_eof(src: &mut FileSource, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            match src.recv(&mut buf) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(TransferError::Eof) => return out,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn loop_count_parses_cli_forms() {
        assert_eq!("-1".parse::<LoopCount>(), Ok(LoopCount::Forever));
        assert_eq!("0".parse::<LoopCount>(), Ok(LoopCount::Times(0)));
        assert_eq!(" 3 ".parse::<LoopCount>(), Ok(LoopCount::Times(3)));
        assert!("-2".parse::<LoopCount>().is_err());
        assert!("many".parse::<LoopCount>().is_err());
    }

    #[test]
    fn file_source_reads_once_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"hello").unwrap();

        let mut src = FileSource::open(&path, None).unwrap();
        assert_eq!(read_to_eof(&mut src, 2), b"hello");
        assert_eq!(src.replays(), 0);
        assert!(src.recv(&mut [0u8; 4]).unwrap_err().is_eof());
    }

    #[test]
    fn file_source_replays_exactly_k_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"abc").unwrap();

        let mut src = FileSource::open(&path, Some(LoopCount::Times(2))).unwrap();
        assert_eq!(read_to_eof(&mut src, 4), b"abcabcabc");
        assert_eq!(src.replays(), 2);
    }

    #[test]
    fn file_source_forever_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"xy").unwrap();

        let mut src = FileSource::open(&path, Some(LoopCount::Forever)).unwrap();
        let mut buf = [0u8; 2];
        for _ in 0..100 {
            assert_eq!(src.recv(&mut buf).unwrap(), 2);
            assert_eq!(&buf, b"xy");
        }
        assert!(src.replays() >= 99);
    }

    #[test]
    fn empty_file_forever_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let mut src = FileSource::open(&path, Some(LoopCount::Forever)).unwrap();
        assert!(src.recv(&mut [0u8; 8]).unwrap_err().is_eof());
    }

    #[test]
    fn missing_input_is_file_not_found() {
        let err = FileSource::open("/definitely/not/here.bin", None).unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));

        let err = FileSink::create("/definitely/not/here/out.bin").unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
    }

    #[test]
    fn file_sink_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        {
            let mut sink = FileSink::create(&path).unwrap();
            send_all(&mut sink, b"payload").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn datagram_bind_twice_is_address_in_use() {
        let first = SocketTransfer::datagram_bind("127.0.0.1:0").unwrap();
        let SocketTransfer::Datagram { socket, .. } = &first else {
            panic!("expected datagram socket");
        };
        let addr = socket.local_addr().unwrap().to_string();

        let err = SocketTransfer::datagram_bind(&addr).unwrap_err();
        assert!(matches!(err, TransferError::AddressInUse(a) if a == addr));
    }

    #[test]
    fn stream_connect_without_listener_is_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let err = SocketTransfer::stream_connect(&addr).unwrap_err();
        assert!(matches!(err, TransferError::ConnectionRefused(_)));
    }

    #[test]
    fn stream_round_trip_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut server = SocketTransfer::Stream(stream);
            send_all(&mut server, b"ping").unwrap();
        });

        let mut client = SocketTransfer::stream_connect(&addr).unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match client.recv(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(TransferError::Eof) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        server.join().unwrap();
        assert_eq!(got, b"ping");
    }

    #[test]
    fn bound_datagram_replies_to_last_sender() {
        let mut server = SocketTransfer::datagram_bind("127.0.0.1:0").unwrap();
        let SocketTransfer::Datagram { socket, .. } = &server else {
            panic!("expected datagram socket");
        };
        let addr = socket.local_addr().unwrap().to_string();

        let mut client = SocketTransfer::datagram_connect(&addr).unwrap();
        assert_eq!(client.send(b"hi").unwrap(), 2);

        let mut buf = [0u8; 8];
        assert_eq!(server.recv(&mut buf).unwrap(), 2);
        assert_eq!(server.send(b"yo").unwrap(), 2);
        assert_eq!(client.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"yo");
    }
}
