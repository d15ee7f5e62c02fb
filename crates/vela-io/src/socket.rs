use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};

use vela_rt::{AsyncFd, CancelToken, Deadline};
use vela_sync::WaitOutcome;

use crate::addr::{decode_sockaddr, encode_sockaddr, family};
use crate::direction::{wait_ready, DirKind, Direction};
use crate::error::IoError;
use crate::sys;

/// Whether a transfer returns on the first chunk or runs to completion.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Partial,
    Whole,
}

/// Reactor registration plus fd ownership for one socket.
///
/// Field order matters: the reactor registration must be deleted before
/// the descriptor is closed.
struct Core {
    afd: AsyncFd,
    fd: OwnedFd,
}

impl Core {
    fn adopt(fd: OwnedFd) -> crate::Result<Self> {
        let afd = AsyncFd::new(fd.as_raw_fd())?;
        Ok(Core { afd, fd })
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A non-blocking stream socket with deadline-bound operations.
///
/// The descriptor is owned through a directionally-split control block:
/// independent read/write suspension state, each half admitting one
/// operation at a time. Peer and local addresses are fetched once and
/// memoized for the lifetime of the socket.
///
/// All methods take `&self`; the socket can be shared across tasks (e.g.
/// one reader, one writer) behind an `Arc`.
pub struct Socket {
    core: Mutex<Option<Arc<Core>>>,
    read: Direction,
    write: Direction,
    peer: OnceLock<SocketAddr>,
    local: OnceLock<SocketAddr>,
}

impl Socket {
    fn adopt(fd: OwnedFd) -> crate::Result<Self> {
        Ok(Socket {
            core: Mutex::new(Some(Arc::new(Core::adopt(fd)?))),
            read: Direction::new(DirKind::Read),
            write: Direction::new(DirKind::Write),
            peer: OnceLock::new(),
            local: OnceLock::new(),
        })
    }

    /// Establish a connection to `addr`.
    ///
    /// Checks cancellation before starting. If the connect does not
    /// complete synchronously, suspends until the socket is writable or
    /// the deadline elapses ([`IoError::ConnectTimeout`]); a pending
    /// OS-level error surfaces as [`IoError::System`].
    pub async fn connect(
        addr: SocketAddr,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> crate::Result<Socket> {
        if cancel.checkpoint() {
            return Err(IoError::Cancelled);
        }

        let fd = sys::socket_nonblocking(family(&addr))?;
        let (raw_addr, addr_len) = encode_sockaddr(&addr);
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &raw_addr as *const _ as *const libc::sockaddr,
                addr_len,
            )
        };
        let pending = if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err.into());
            }
            true
        } else {
            false
        };

        let socket = Socket::adopt(fd)?;
        if pending {
            let core = socket.core()?;
            match wait_ready(&core.afd, DirKind::Write, deadline, cancel).await {
                WaitOutcome::TimedOut => return Err(IoError::ConnectTimeout),
                WaitOutcome::Cancelled => return Err(IoError::Cancelled),
                WaitOutcome::Signaled => {}
            }
            let err_value = socket.get_option(libc::SOL_SOCKET, libc::SO_ERROR)?;
            if err_value != 0 {
                return Err(io::Error::from_raw_os_error(err_value).into());
            }
        }
        Ok(socket)
    }

    /// Bind to `addr` and start listening.
    ///
    /// `SO_REUSEADDR` is always set; `SO_REUSEPORT` is best-effort — the
    /// failure is logged, not surfaced, since only multi-listener setups
    /// care.
    pub fn listen(addr: SocketAddr, backlog: i32) -> crate::Result<Socket> {
        let fd = sys::socket_nonblocking(family(&addr))?;
        let raw = fd.as_raw_fd();

        set_int_option(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if let Err(err) = sys::set_reuse_port(raw) {
            log::warn!(
                "SO_REUSEPORT unavailable ({err}); multithreaded listeners \
                 may not balance accepts"
            );
        }

        let (raw_addr, addr_len) = encode_sockaddr(&addr);
        let rc = unsafe {
            libc::bind(
                raw,
                &raw_addr as *const _ as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if unsafe { libc::listen(raw, backlog) } < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Socket::adopt(fd)
    }

    /// Accept one incoming connection, suspending until a connection is
    /// pending or the deadline elapses ([`IoError::ConnectTimeout`]).
    ///
    /// Transient accept failures (connection aborted before accept,
    /// interrupted call, link/route-level errors) are retried internally
    /// without consuming the deadline. The peer address of the accepted
    /// socket is cached from the accept itself, never refetched.
    pub async fn accept(&self, deadline: Deadline, cancel: &CancelToken) -> crate::Result<Socket> {
        let core = self.core()?;
        if cancel.checkpoint() {
            return Err(IoError::Cancelled);
        }
        let _guard = self.read.lock()?;

        loop {
            match sys::accept_nonblocking(core.raw()) {
                Ok((fd, storage)) => {
                    let peer = decode_sockaddr(&storage)?;
                    let socket = Socket::adopt(fd)?;
                    let _ = socket.peer.set(peer);
                    return Ok(socket);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    match wait_ready(&core.afd, DirKind::Read, deadline, cancel).await {
                        WaitOutcome::TimedOut => return Err(IoError::ConnectTimeout),
                        WaitOutcome::Cancelled => return Err(IoError::Cancelled),
                        WaitOutcome::Signaled => continue,
                    }
                }
                Err(err) if is_transient_accept(&err) => {
                    log::trace!("retrying accept after transient error: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// One receive: returns as soon as any bytes arrive, or `Ok(0)` when
    /// the peer has closed. Suspends while there is no data.
    pub async fn recv_some(
        &self,
        buf: &mut [u8],
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> crate::Result<usize> {
        self.recv_loop(buf, TransferMode::Partial, deadline, cancel)
            .await
    }

    /// Receive until `buf` is full or the peer closes; a short count means
    /// peer close. The deadline bounds the entire call; on expiry the
    /// error carries the bytes already read.
    pub async fn recv_all(
        &self,
        buf: &mut [u8],
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> crate::Result<usize> {
        self.recv_loop(buf, TransferMode::Whole, deadline, cancel)
            .await
    }

    /// Send the whole buffer, suspending whenever the socket is not
    /// writable. A disconnected peer is an [`IoError::System`] (`EPIPE`),
    /// never a process-level signal.
    pub async fn send_all(
        &self,
        buf: &[u8],
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> crate::Result<usize> {
        let core = self.core()?;
        let _guard = self.write.lock()?;

        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe {
                libc::send(
                    core.raw(),
                    buf[sent..].as_ptr() as *const libc::c_void,
                    buf.len() - sent,
                    sys::SEND_FLAGS,
                )
            };
            if n >= 0 {
                sent += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    match wait_ready(&core.afd, DirKind::Write, deadline, cancel).await {
                        WaitOutcome::Signaled => {}
                        WaitOutcome::TimedOut => return Err(IoError::Timeout { bytes: sent }),
                        WaitOutcome::Cancelled => return Err(IoError::Cancelled),
                    }
                }
                io::ErrorKind::Interrupted => {}
                _ => return Err(err.into()),
            }
        }
        Ok(sent)
    }

    async fn recv_loop(
        &self,
        buf: &mut [u8],
        mode: TransferMode,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> crate::Result<usize> {
        let core = self.core()?;
        let _guard = self.read.lock()?;

        let mut received = 0;
        loop {
            let n = unsafe {
                libc::recv(
                    core.raw(),
                    buf[received..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - received,
                    0,
                )
            };
            if n > 0 {
                received += n as usize;
                if mode == TransferMode::Partial || received == buf.len() {
                    return Ok(received);
                }
                continue;
            }
            if n == 0 {
                // Peer closed: a distinguishable result, not an error.
                return Ok(received);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    match wait_ready(&core.afd, DirKind::Read, deadline, cancel).await {
                        WaitOutcome::Signaled => {}
                        WaitOutcome::TimedOut => {
                            return Err(IoError::Timeout { bytes: received })
                        }
                        WaitOutcome::Cancelled => return Err(IoError::Cancelled),
                    }
                }
                io::ErrorKind::Interrupted => {}
                _ => return Err(err.into()),
            }
        }
    }

    /// Close the socket. Subsequent operations fail with
    /// [`IoError::Closed`] without touching the OS.
    ///
    /// Closing is not a cancellation mechanism: an operation already in
    /// flight keeps its reactor registration until it finishes.
    pub fn close(&self) {
        self.core.lock().unwrap().take();
    }

    /// Whether the socket still owns its descriptor.
    pub fn is_open(&self) -> bool {
        self.core.lock().unwrap().is_some()
    }

    /// The peer's address, fetched once and cached for the lifetime of
    /// the socket.
    pub fn peer_addr(&self) -> crate::Result<SocketAddr> {
        if let Some(addr) = self.peer.get() {
            return Ok(*addr);
        }
        let core = self.core()?;
        let addr = fetch_name(core.raw(), libc::getpeername)?;
        Ok(*self.peer.get_or_init(|| addr))
    }

    /// The local address, fetched once and cached.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        if let Some(addr) = self.local.get() {
            return Ok(*addr);
        }
        let core = self.core()?;
        let addr = fetch_name(core.raw(), libc::getsockname)?;
        Ok(*self.local.get_or_init(|| addr))
    }

    /// Read an integer socket option.
    pub fn get_option(&self, layer: libc::c_int, name: libc::c_int) -> crate::Result<i32> {
        let core = self.core()?;
        let mut value: libc::c_int = -1;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                core.raw(),
                layer,
                name,
                &mut value as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(value)
    }

    /// Set an integer socket option.
    pub fn set_option(
        &self,
        layer: libc::c_int,
        name: libc::c_int,
        value: i32,
    ) -> crate::Result<()> {
        let core = self.core()?;
        set_int_option(core.raw(), layer, name, value)?;
        Ok(())
    }

    fn core(&self) -> crate::Result<Arc<Core>> {
        self.core.lock().unwrap().clone().ok_or(IoError::Closed)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock().unwrap();
        f.debug_struct("Socket")
            .field("fd", &core.as_ref().map(|c| c.raw()))
            .field("peer", &self.peer.get())
            .field("local", &self.local.get())
            .finish()
    }
}

fn set_int_option(
    fd: RawFd,
    layer: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            layer,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

type NameGetter =
    unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;

fn fetch_name(fd: RawFd, getter: NameGetter) -> crate::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { getter(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(decode_sockaddr(&storage)?)
}

fn is_transient_accept(err: &io::Error) -> bool {
    err.raw_os_error()
        .is_some_and(sys::is_transient_accept_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use vela_rt::{block_on, spawn, yield_now};

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    fn loopback_listener() -> (Socket, SocketAddr) {
        let listener = Socket::listen("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// A connected (client, server) pair over loopback.
    async fn pair() -> (Socket, Socket) {
        let (listener, addr) = loopback_listener();
        let cancel = CancelToken::new();
        let client = Socket::connect(addr, Deadline::from_duration(LONG), &cancel)
            .await
            .unwrap();
        let server = listener
            .accept(Deadline::from_duration(LONG), &cancel)
            .await
            .unwrap();
        (client, server)
    }

    #[test]
    fn echo_roundtrip() {
        block_on(async {
            let (listener, addr) = loopback_listener();
            let listener = Arc::new(listener);

            let server = listener.clone();
            spawn(async move {
                let cancel = CancelToken::new();
                let peer = server
                    .accept(Deadline::from_duration(LONG), &cancel)
                    .await
                    .unwrap();
                let mut buf = [0u8; 4];
                let n = peer
                    .recv_all(&mut buf, Deadline::from_duration(LONG), &cancel)
                    .await
                    .unwrap();
                assert_eq!(n, 4);
                peer.send_all(&buf, Deadline::from_duration(LONG), &cancel)
                    .await
                    .unwrap();
            });

            let cancel = CancelToken::new();
            let client = Socket::connect(addr, Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            client
                .send_all(b"ping", Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            let n = client
                .recv_all(&mut buf, Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            assert_eq!(n, 4);
            assert_eq!(&buf, b"ping");
        });
    }

    #[test]
    fn recv_all_returns_short_count_on_peer_close() {
        block_on(async {
            let (client, server) = pair().await;
            let cancel = CancelToken::new();

            server
                .send_all(b"xy", Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            server.close();

            let mut buf = [0u8; 8];
            let n = client
                .recv_all(&mut buf, Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            assert_eq!(n, 2);
            assert_eq!(&buf[..2], b"xy");
        });
    }

    #[test]
    fn recv_times_out_with_no_data() {
        block_on(async {
            let (client, _server) = pair().await;
            let cancel = CancelToken::new();
            let mut buf = [0u8; 4];
            let err = client
                .recv_some(&mut buf, Deadline::from_duration(SHORT), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, IoError::Timeout { bytes: 0 }));
        });
    }

    #[test]
    fn accept_times_out_with_no_connection() {
        block_on(async {
            let (listener, _addr) = loopback_listener();
            let cancel = CancelToken::new();
            let err = listener
                .accept(Deadline::from_duration(SHORT), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, IoError::ConnectTimeout));
        });
    }

    #[test]
    fn transient_accept_failures_are_retried() {
        block_on(async {
            let (listener, addr) = loopback_listener();
            let raw = listener.core().unwrap().raw();
            sys::fault::inject_accept_errno(raw, libc::ECONNABORTED);
            sys::fault::inject_accept_errno(raw, libc::EINTR);

            let listener = Arc::new(listener);
            let server = listener.clone();
            let accepted = Arc::new(AtomicBool::new(false));
            let accepted_clone = accepted.clone();
            spawn(async move {
                let cancel = CancelToken::new();
                server
                    .accept(Deadline::from_duration(LONG), &cancel)
                    .await
                    .unwrap();
                accepted_clone.store(true, Ordering::SeqCst);
            });

            let cancel = CancelToken::new();
            let _client = Socket::connect(addr, Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            while !accepted.load(Ordering::SeqCst) {
                yield_now().await;
            }
            assert!(
                !sys::fault::has_pending(raw),
                "every injected transient error should have been retried through"
            );
        });
    }

    #[test]
    fn transient_accept_error_preserves_deadline() {
        block_on(async {
            let (listener, _addr) = loopback_listener();
            let raw = listener.core().unwrap().raw();
            sys::fault::inject_accept_errno(raw, libc::ECONNABORTED);

            let cancel = CancelToken::new();
            let start = Instant::now();
            let err = listener
                .accept(Deadline::from_duration(SHORT), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, IoError::ConnectTimeout));
            assert!(
                start.elapsed() >= SHORT,
                "a retried error must not consume the deadline budget"
            );
        });
    }

    #[test]
    fn fatal_accept_error_surfaces() {
        block_on(async {
            let (listener, _addr) = loopback_listener();
            let raw = listener.core().unwrap().raw();
            sys::fault::inject_accept_errno(raw, libc::EBADF);

            let cancel = CancelToken::new();
            let err = listener
                .accept(Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, IoError::System(_)));
        });
    }

    #[test]
    fn connect_times_out_not_system_error() {
        block_on(async {
            // A listener with a tiny backlog that never accepts: once the
            // accept queue is full the kernel drops further SYNs and the
            // connect hangs until the deadline.
            let listener = Socket::listen("127.0.0.1:0".parse().unwrap(), 1).unwrap();
            let addr = listener.local_addr().unwrap();
            let cancel = CancelToken::new();

            let mut held = Vec::new();
            let mut timed_out = false;
            for _ in 0..8 {
                match Socket::connect(addr, Deadline::from_duration(SHORT), &cancel).await {
                    Ok(socket) => held.push(socket),
                    Err(IoError::ConnectTimeout) => {
                        timed_out = true;
                        break;
                    }
                    Err(other) => panic!("expected ConnectTimeout, got {other:?}"),
                }
            }
            assert!(timed_out, "connect should time out once the backlog is full");
        });
    }

    #[test]
    fn cancelled_connect_reports_cancelled() {
        block_on(async {
            let cancel = CancelToken::new();
            cancel.cancel();
            let err = Socket::connect(
                "127.0.0.1:1".parse().unwrap(),
                Deadline::never(),
                &cancel,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, IoError::Cancelled));
        });
    }

    #[test]
    fn second_concurrent_recv_is_rejected() {
        block_on(async {
            let (client, server) = pair().await;
            let client = Arc::new(client);
            let cancel = CancelToken::new();

            let reader = client.clone();
            let got = Arc::new(AtomicBool::new(false));
            let got_clone = got.clone();
            spawn(async move {
                let cancel = CancelToken::new();
                let mut buf = [0u8; 1];
                let n = reader
                    .recv_some(&mut buf, Deadline::from_duration(LONG), &cancel)
                    .await
                    .unwrap();
                assert_eq!(n, 1);
                got_clone.store(true, Ordering::SeqCst);
            });
            yield_now().await;
            yield_now().await;

            // The read half is held by the suspended task: misuse, not a queue.
            let mut buf = [0u8; 1];
            let err = client
                .recv_some(&mut buf, Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, IoError::DirectionBusy(DirKind::Read)));

            server
                .send_all(b"x", Deadline::from_duration(LONG), &cancel)
                .await
                .unwrap();
            while !got.load(Ordering::SeqCst) {
                yield_now().await;
            }
        });
    }

    #[test]
    fn closed_socket_fails_every_operation() {
        block_on(async {
            let (client, _server) = pair().await;
            let cancel = CancelToken::new();

            assert!(client.is_open());
            client.close();
            assert!(!client.is_open());

            let mut buf = [0u8; 1];
            assert!(matches!(
                client
                    .recv_some(&mut buf, Deadline::never(), &cancel)
                    .await
                    .unwrap_err(),
                IoError::Closed
            ));
            assert!(matches!(
                client
                    .send_all(b"x", Deadline::never(), &cancel)
                    .await
                    .unwrap_err(),
                IoError::Closed
            ));
            assert!(matches!(
                client.accept(Deadline::never(), &cancel).await.unwrap_err(),
                IoError::Closed
            ));
            assert!(matches!(
                client.get_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE),
                Err(IoError::Closed)
            ));
        });
    }

    #[test]
    fn addresses_are_memoized() {
        block_on(async {
            let (client, server) = pair().await;

            // The accepted socket's peer address was cached at accept time.
            let peer_first = server.peer_addr().unwrap();
            let peer_again = server.peer_addr().unwrap();
            assert_eq!(peer_first, peer_again);
            assert_eq!(peer_first, client.local_addr().unwrap());

            // Memoized values survive close.
            let local = client.local_addr().unwrap();
            client.close();
            assert_eq!(client.local_addr().unwrap(), local);
        });
    }

    #[test]
    fn integer_options_roundtrip() {
        block_on(async {
            let (client, _server) = pair().await;
            client
                .set_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
                .unwrap();
            assert_eq!(
                client.get_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE).unwrap(),
                1
            );
        });
    }

    #[test]
    fn send_to_disconnected_peer_is_an_error_not_a_signal() {
        block_on(async {
            let (client, server) = pair().await;
            let cancel = CancelToken::new();
            server.close();

            // The first sends may land in kernel buffers; keep pushing
            // until the disconnect is observed.
            let payload = [0u8; 65536];
            let mut saw_error = false;
            for _ in 0..100 {
                match client
                    .send_all(&payload, Deadline::from_duration(SHORT), &cancel)
                    .await
                {
                    Ok(_) => continue,
                    Err(IoError::System(_)) => {
                        saw_error = true;
                        break;
                    }
                    Err(IoError::Timeout { .. }) => continue,
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
            assert!(saw_error, "broken pipe should surface as a System error");
        });
    }
}
