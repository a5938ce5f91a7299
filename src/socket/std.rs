use crate::{net::SocketAddr, Error, SyncUdpSocket};

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::Duration;

fn would_block(kind: ErrorKind) -> bool {
    // Read timeouts surface as either kind depending on the platform
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl SyncUdpSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> crate::Result<usize> {
        match self.send_to(buf, addr) {
            Ok(size) => Ok(size),
            Err(_) => Err(Error::Network),
        }
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> crate::Result<(usize, SocketAddr)> {
        match self.recv_from(buf) {
            Ok((size, addr)) => Ok((size, addr)),
            Err(_) => Err(Error::Network),
        }
    }

    fn poll_readable(&self, timeout: Duration) -> crate::Result<bool> {
        // A one byte peek is enough to learn whether a datagram is queued;
        // the datagram itself stays queued for the following recv_from
        let mut probe = [0u8; 1];

        if timeout.is_zero() {
            self.set_nonblocking(true).map_err(|_| Error::Network)?;
            let polled = self.peek_from(&mut probe);
            self.set_nonblocking(false).map_err(|_| Error::Network)?;

            return match polled {
                Ok(_) => Ok(true),
                Err(err) if would_block(err.kind()) => Ok(false),
                Err(_) => Err(Error::Network),
            };
        }

        self.set_read_timeout(Some(timeout))
            .map_err(|_| Error::Network)?;

        match self.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(err) if would_block(err.kind()) => Ok(false),
            Err(_) => Err(Error::Network),
        }
    }
}
