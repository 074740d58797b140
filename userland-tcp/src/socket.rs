//! Raw IPv4 socket channel.
//!
//! [`RawSocket`] is a thin async wrapper around
//! `socket(AF_INET, SOCK_RAW, IPPROTO_TCP)`: the kernel delivers every
//! inbound TCP datagram addressed to the bound address (IP header
//! included) and, unless `IP_HDRINCL` is set, builds the IP header for
//! outbound segments.  All protocol logic lives elsewhere; this module owns
//! only byte I/O.
//!
//! Opening a raw socket needs `CAP_NET_RAW`.  The host's own TCP stack will
//! also see the traffic and answer unknown ports with RST; drop those with a
//! firewall rule when testing against a real peer.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

use crate::channel::{Channel, ChannelError, MAX_DATAGRAM};

#[derive(Debug)]
pub struct RawSocket {
    /// Address this socket is bound to.
    pub local_addr: Ipv4Addr,
    inner: AsyncFd<OwnedFd>,
}

impl RawSocket {
    /// Open a raw TCP socket bound to `local_addr`.  With
    /// `include_ip_header` the caller supplies IP headers on send.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(local_addr: Ipv4Addr, include_ip_header: bool) -> Result<Self, ChannelError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Owned from here on, so early returns close it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if include_ip_header {
            let on: libc::c_int = 1;
            let res = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_HDRINCL,
                    &on as *const libc::c_int as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if res < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        let addr = sockaddr_in(local_addr);
        let res = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }

        log::debug!("raw socket bound to {local_addr} (IP_HDRINCL={include_ip_header})");
        Ok(Self {
            local_addr,
            inner: AsyncFd::new(fd)?,
        })
    }
}

impl Channel for RawSocket {
    async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let mut guard = self.inner.readable().await?;
            let res = guard.try_io(|fd| {
                let n = unsafe {
                    libc::recv(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, destination: Ipv4Addr, datagram: &[u8]) -> Result<(), ChannelError> {
        let addr = sockaddr_in(destination);
        loop {
            let mut guard = self.inner.writable().await?;
            let res = guard.try_io(|fd| {
                let n = unsafe {
                    libc::sendto(
                        fd.as_raw_fd(),
                        datagram.as_ptr() as *const libc::c_void,
                        datagram.len(),
                        0,
                        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(Ok(sent)) if sent == datagram.len() => return Ok(()),
                Ok(Ok(sent)) => {
                    return Err(ChannelError::ShortWrite {
                        expected: datagram.len(),
                        sent,
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// `sockaddr_in` for a raw socket; the port is unused.
fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = 0;
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    };
    sa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_keeps_network_order() {
        let sa = sockaddr_in(Ipv4Addr::new(10, 126, 0, 2));
        assert_eq!(sa.sin_addr.s_addr.to_ne_bytes(), [10, 126, 0, 2]);
        assert_eq!(sa.sin_family, libc::AF_INET as libc::sa_family_t);
    }
}
