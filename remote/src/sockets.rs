// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Raw socket plumbing: outbound connections bound to the interface
//! address they logically originate from, and the TCP user timeout.

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, SockFlag, SockProtocol, SockType, SockaddrIn, bind, connect, socket,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd};
use std::time::Duration;

/// Open a non-blocking TCP connection to `dest`, bound to `source_ip`
/// with an ephemeral port so the peer sees our daemon address rather
/// than whatever the routing table picks.
pub(crate) fn connect_bound(
    source_ip: Option<Ipv4Addr>,
    dest: SocketAddrV4,
) -> io::Result<mio::net::TcpStream> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;
    if let Some(ip) = source_ip {
        let local = SockaddrIn::from(SocketAddrV4::new(ip, 0));
        bind(fd.as_raw_fd(), &local).map_err(io::Error::from)?;
    }
    match connect(fd.as_raw_fd(), &SockaddrIn::from(dest)) {
        Ok(()) | Err(Errno::EINPROGRESS) => {}
        Err(err) => return Err(io::Error::from(err)),
    }
    // Safety: the fd is freshly created above and ownership moves into
    // the stream exactly once.
    let stream = unsafe {
        <std::net::TcpStream as std::os::fd::FromRawFd>::from_raw_fd(fd.into_raw_fd())
    };
    Ok(mio::net::TcpStream::from_std(stream))
}

/// Arm `TCP_USER_TIMEOUT` so unacknowledged data kills the connection
/// after `timeout` rather than the kernel default of many minutes.
pub(crate) fn set_user_timeout(fd: i32, timeout: Duration) -> io::Result<()> {
    // Safety: the caller guarantees fd stays open for the call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
    nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::TcpUserTimeout, &millis)
        .map_err(io::Error::from)
}
