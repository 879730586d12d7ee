//! Platform-specific batched UDP I/O, assumed "behind a trait" by §1/§4.4.
//! Grounded directly on the reference batched-UDP module in the example
//! pack: a `batch-udp-unix` + Linux path built on `recvmmsg`/`sendmmsg`,
//! falling back everywhere else to a sequential `recv_from`/`send_to` loop
//! topped up with non-blocking `try_recv_from`/`try_send_to`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum BatchIoError {
    #[error("batched recv failed: {source}")]
    Receive { source: io::Error },
    #[error("batched send failed: {source}")]
    Send { source: io::Error },
}

/// Input buffer plus output metadata for one slot of a batched receive.
#[derive(Debug)]
pub struct RecvBatchSlot<'a> {
    buffer: &'a mut [u8],
    len: usize,
    addr: Option<SocketAddr>,
}

impl<'a> RecvBatchSlot<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            len: 0,
            addr: None,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.addr = None;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer
    }

    fn finish(&mut self, len: usize, addr: SocketAddr) {
        self.len = len;
        self.addr = Some(addr);
    }
}

/// Payload plus destination for one slot of a batched send.
#[derive(Debug)]
pub struct SendBatchSlot<'a> {
    payload: &'a [u8],
    addr: SocketAddr,
    sent: usize,
}

impl<'a> SendBatchSlot<'a> {
    pub fn new(payload: &'a [u8], addr: SocketAddr) -> Self {
        Self {
            payload,
            addr,
            sent: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    pub fn target(&self) -> SocketAddr {
        self.addr
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    fn mark_sent(&mut self, sent: usize) {
        self.sent = sent;
    }
}

pub async fn recv_many(
    socket: &UdpSocket,
    slots: &mut [RecvBatchSlot<'_>],
) -> Result<usize, BatchIoError> {
    for slot in slots.iter_mut() {
        slot.reset();
    }
    platform::recv_many(socket, slots)
        .await
        .map_err(|source| BatchIoError::Receive { source })
}

pub async fn send_many(
    socket: &UdpSocket,
    slots: &mut [SendBatchSlot<'_>],
) -> Result<usize, BatchIoError> {
    platform::send_many(socket, slots)
        .await
        .map_err(|source| BatchIoError::Send { source })
}

#[cfg(all(feature = "batch-udp-unix", target_os = "linux"))]
mod platform {
    use super::{RecvBatchSlot, SendBatchSlot};
    use std::io::{self, ErrorKind};
    use std::net::SocketAddr;
    use std::os::unix::io::AsRawFd;

    use nix::errno::Errno;
    use nix::libc;
    use nix::sys::socket::{AddressFamily, SockaddrLike, SockaddrStorage};
    use socket2::SockAddr;
    use tokio::io::Interest;
    use tokio::net::UdpSocket;

    fn nix_err_to_io(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno as i32)
    }

    fn storage_to_std(storage: &SockaddrStorage) -> io::Result<SocketAddr> {
        match storage.family() {
            Some(AddressFamily::Inet) => storage
                .as_sockaddr_in()
                .map(|a| SocketAddr::V4((*a).into()))
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "missing ipv4 address")),
            Some(AddressFamily::Inet6) => storage
                .as_sockaddr_in6()
                .map(|a| SocketAddr::V6((*a).into()))
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "missing ipv6 address")),
            _ => Err(io::Error::new(
                ErrorKind::InvalidData,
                "batched recv only supports ipv4/ipv6",
            )),
        }
    }

    pub(super) async fn recv_many(
        socket: &UdpSocket,
        slots: &mut [RecvBatchSlot<'_>],
    ) -> io::Result<usize> {
        if slots.is_empty() {
            return Ok(0);
        }
        loop {
            match socket.try_io(Interest::READABLE, || recv_once(socket, slots)) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn recv_once(socket: &UdpSocket, slots: &mut [RecvBatchSlot<'_>]) -> io::Result<usize> {
        let fd = socket.as_raw_fd();
        let count = slots.len();
        let mut storages: Vec<SockaddrStorage> =
            (0..count).map(|_| unsafe { std::mem::zeroed() }).collect();
        let mut iovecs: Vec<libc::iovec> = slots
            .iter_mut()
            .map(|slot| {
                let buf = slot.buffer_mut();
                libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                }
            })
            .collect();
        let mut headers: Vec<libc::mmsghdr> = (0..count)
            .map(|idx| libc::mmsghdr {
                msg_hdr: libc::msghdr {
                    msg_name: (&mut storages[idx]) as *mut _ as *mut libc::c_void,
                    msg_namelen: std::mem::size_of::<SockaddrStorage>() as libc::socklen_t,
                    msg_iov: &mut iovecs[idx],
                    msg_iovlen: 1,
                    msg_control: std::ptr::null_mut(),
                    msg_controllen: 0,
                    msg_flags: 0,
                },
                msg_len: 0,
            })
            .collect();

        let received = unsafe {
            libc::recvmmsg(
                fd,
                headers.as_mut_ptr(),
                headers.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            )
        };
        if received < 0 {
            return Err(nix_err_to_io(Errno::last()));
        }
        let received = received as usize;
        for idx in 0..received {
            let addr = storage_to_std(&storages[idx])?;
            slots[idx].finish(headers[idx].msg_len as usize, addr);
        }
        Ok(received)
    }

    pub(super) async fn send_many(
        socket: &UdpSocket,
        slots: &mut [SendBatchSlot<'_>],
    ) -> io::Result<usize> {
        if slots.is_empty() {
            return Ok(0);
        }
        loop {
            match socket.try_io(Interest::WRITABLE, || send_once(socket, slots)) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn send_once(socket: &UdpSocket, slots: &mut [SendBatchSlot<'_>]) -> io::Result<usize> {
        let fd = socket.as_raw_fd();
        let count = slots.len();
        let sockaddrs: Vec<SockAddr> = slots.iter().map(|s| SockAddr::from(s.target())).collect();
        let mut iovecs: Vec<libc::iovec> = slots
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.payload().as_ptr() as *mut libc::c_void,
                iov_len: s.payload().len(),
            })
            .collect();
        let mut headers: Vec<libc::mmsghdr> = (0..count)
            .map(|idx| libc::mmsghdr {
                msg_hdr: libc::msghdr {
                    msg_name: sockaddrs[idx].as_ptr() as *mut libc::c_void,
                    msg_namelen: sockaddrs[idx].len() as libc::socklen_t,
                    msg_iov: &mut iovecs[idx],
                    msg_iovlen: 1,
                    msg_control: std::ptr::null_mut(),
                    msg_controllen: 0,
                    msg_flags: 0,
                },
                msg_len: 0,
            })
            .collect();

        let sent = unsafe {
            libc::sendmmsg(
                fd,
                headers.as_mut_ptr(),
                headers.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
            )
        };
        if sent < 0 {
            return Err(nix_err_to_io(Errno::last()));
        }
        let sent = sent as usize;
        for idx in 0..sent {
            slots[idx].mark_sent(headers[idx].msg_len as usize);
        }
        Ok(sent)
    }
}

#[cfg(not(all(feature = "batch-udp-unix", target_os = "linux")))]
mod platform {
    use super::{RecvBatchSlot, SendBatchSlot};
    use std::io::{self, ErrorKind};
    use tokio::net::UdpSocket;

    pub(super) async fn recv_many(
        socket: &UdpSocket,
        slots: &mut [RecvBatchSlot<'_>],
    ) -> io::Result<usize> {
        if slots.is_empty() {
            return Ok(0);
        }
        let (len, addr) = socket.recv_from(slots[0].buffer_mut()).await?;
        slots[0].finish(len, addr);
        let mut filled = 1;
        for slot in &mut slots[1..] {
            match socket.try_recv_from(slot.buffer_mut()) {
                Ok((len, addr)) => {
                    slot.finish(len, addr);
                    filled += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub(super) async fn send_many(
        socket: &UdpSocket,
        slots: &mut [SendBatchSlot<'_>],
    ) -> io::Result<usize> {
        if slots.is_empty() {
            return Ok(0);
        }
        let mut sent = 0;
        let written = socket.send_to(slots[0].payload(), slots[0].target()).await?;
        slots[0].mark_sent(written);
        sent += 1;
        for slot in &mut slots[1..] {
            match socket.try_send_to(slot.payload(), slot.target()) {
                Ok(written) => {
                    slot.mark_sent(written);
                    sent += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let written = socket.send_to(slot.payload(), slot.target()).await?;
                    slot.mark_sent(written);
                    sent += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }
}
