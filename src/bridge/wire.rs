/*!
 * Bridge Wire Shapes
 * Provider-side address and timeout layouts, and their POSIX conversions
 */

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use crate::core::limits::{IPV4_ADDR_LEN, IPV6_ADDR_LEN, SOCKADDR_PAYLOAD_LEN};

/// Length of the POSIX `sockaddr_in` encoding
pub const SOCKADDR_IN_LEN: usize = 16;

/// Length of the POSIX `sockaddr_in6` encoding
pub const SOCKADDR_IN6_LEN: usize = 28;

/// Socket address as the bridge provider lays it out
///
/// `port` holds the two port bytes exactly as they sit in the POSIX structure
/// (network order); nothing is byte-swapped on the way through. `bytes` carries
/// everything after the port.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SockAddr {
    pub family: i16,
    pub port: u16,
    pub bytes: [u8; SOCKADDR_PAYLOAD_LEN],
}

impl SockAddr {
    /// Size of the wire image
    pub const SIZE: usize = 4 + SOCKADDR_PAYLOAD_LEN;

    pub const fn zeroed() -> Self {
        Self {
            family: 0,
            port: 0,
            bytes: [0; SOCKADDR_PAYLOAD_LEN],
        }
    }

    /// Field-by-field copy out of a POSIX sockaddr image; short input is zero-filled
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut image = [0u8; Self::SIZE];
        let n = raw.len().min(Self::SIZE);
        image[..n].copy_from_slice(&raw[..n]);

        let mut bytes = [0u8; SOCKADDR_PAYLOAD_LEN];
        bytes.copy_from_slice(&image[4..]);
        Self {
            family: i16::from_ne_bytes([image[0], image[1]]),
            port: u16::from_ne_bytes([image[2], image[3]]),
            bytes,
        }
    }

    /// Field-by-field copy into a POSIX sockaddr buffer
    ///
    /// Copies at most `min(out.len(), len)` bytes and returns how many were written.
    pub fn write_raw(&self, out: &mut [u8], len: usize) -> usize {
        let image = self.to_image();
        let n = out.len().min(len).min(Self::SIZE);
        out[..n].copy_from_slice(&image[..n]);
        n
    }

    fn to_image(&self) -> [u8; Self::SIZE] {
        let mut image = [0u8; Self::SIZE];
        image[..2].copy_from_slice(&self.family.to_ne_bytes());
        image[2..4].copy_from_slice(&self.port.to_ne_bytes());
        image[4..].copy_from_slice(&self.bytes);
        image
    }

    /// Length of the POSIX encoding for this family
    pub fn encoded_len(&self) -> usize {
        match i32::from(self.family) {
            libc::AF_INET => SOCKADDR_IN_LEN,
            libc::AF_INET6 => SOCKADDR_IN6_LEN,
            _ => Self::SIZE,
        }
    }

    /// Decode an IPv4/IPv6 address
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::from_be_bytes(self.port.to_ne_bytes());
        match i32::from(self.family) {
            libc::AF_INET => {
                let mut octets = [0u8; IPV4_ADDR_LEN];
                octets.copy_from_slice(&self.bytes[..IPV4_ADDR_LEN]);
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            libc::AF_INET6 => {
                let flowinfo = u32::from_ne_bytes(word(&self.bytes[0..4]));
                let mut octets = [0u8; IPV6_ADDR_LEN];
                octets.copy_from_slice(&self.bytes[4..4 + IPV6_ADDR_LEN]);
                let scope_id = u32::from_ne_bytes(word(&self.bytes[20..24]));
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            _ => None,
        }
    }
}

fn word(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        let mut wire = SockAddr::zeroed();
        wire.port = u16::from_ne_bytes(addr.port().to_be_bytes());
        match addr {
            SocketAddr::V4(v4) => {
                wire.family = libc::AF_INET as i16;
                wire.bytes[..IPV4_ADDR_LEN].copy_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                wire.family = libc::AF_INET6 as i16;
                wire.bytes[0..4].copy_from_slice(&v6.flowinfo().to_ne_bytes());
                wire.bytes[4..4 + IPV6_ADDR_LEN].copy_from_slice(&v6.ip().octets());
                wire.bytes[20..24].copy_from_slice(&v6.scope_id().to_ne_bytes());
            }
        }
        wire
    }
}

impl std::fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "SockAddr({})", addr),
            None => f
                .debug_struct("SockAddr")
                .field("family", &self.family)
                .field("port", &self.port)
                .finish_non_exhaustive(),
        }
    }
}

/// Encode a socket address as a POSIX sockaddr image
pub fn encode_socket_addr(addr: SocketAddr) -> Vec<u8> {
    let wire = SockAddr::from(addr);
    let mut out = vec![0u8; wire.encoded_len()];
    wire.write_raw(&mut out, usize::MAX);
    out
}

/// Decode a POSIX sockaddr image
pub fn decode_socket_addr(raw: &[u8]) -> Option<SocketAddr> {
    SockAddr::from_raw(raw).to_socket_addr()
}

/// Timeout as the bridge provider lays it out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Timeval {
    pub seconds: i32,
    pub microseconds: i32,
}

impl Timeval {
    /// Saturates at `i32::MAX` seconds
    pub fn from_duration(d: Duration) -> Self {
        Self {
            seconds: i32::try_from(d.as_secs()).unwrap_or(i32::MAX),
            microseconds: d.subsec_micros() as i32,
        }
    }

    /// Narrow a platform timeval, saturating out-of-range seconds
    pub fn from_raw(tv: &libc::timeval) -> Self {
        let seconds = i64::from(tv.tv_sec).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let microseconds = i64::from(tv.tv_usec).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        Self {
            seconds,
            microseconds,
        }
    }

    /// Negative fields clamp to zero
    pub fn to_duration(self) -> Duration {
        let secs = u64::try_from(self.seconds).unwrap_or(0);
        let micros = u64::try_from(self.microseconds).unwrap_or(0);
        Duration::from_secs(secs) + Duration::from_micros(micros)
    }

    /// Platform timeval for the direct path
    pub fn to_raw(self) -> libc::timeval {
        libc::timeval {
            tv_sec: self.seconds as libc::time_t,
            tv_usec: self.microseconds as libc::suseconds_t,
        }
    }

    /// Total microseconds, `-1` when absent (wait forever)
    pub fn to_micros(timeout: Option<&Timeval>) -> i64 {
        match timeout {
            Some(tv) => i64::from(tv.seconds) * 1_000_000 + i64::from(tv.microseconds),
            None => -1,
        }
    }
}
