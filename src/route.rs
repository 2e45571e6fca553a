// Routing table snapshot parser.
//
// `sysctl {CTL_NET, PF_ROUTE, 0, family, NET_RT_DUMP, 0}` returns a run of
// routing messages:
//
//   | rt_msghdr | sockaddr | pad | sockaddr | pad | ... | rt_msghdr | ...
//
// `rtm_msglen` gives each message's total size. The socket addresses that
// follow the header are packed in RTAX order; `rtm_addrs` is a bitmask
// saying which of them are present. Each one is padded to the platform's
// sockaddr alignment, and a zero `sa_len` still occupies one alignment unit.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::wire::{align_up, ne_u16, ne_u32};

pub const RTAX_DST: usize = 0;
pub const RTAX_GATEWAY: usize = 1;
pub const RTAX_NETMASK: usize = 2;
pub const RTAX_MAX: usize = 8;

const AF_INET: u8 = 2;
const AF_LINK: u8 = 18;

/// Shape of `struct rt_msghdr` and sockaddr packing for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLayout {
    /// Offset of `rtm_addrs`.
    pub addrs_offset: usize,
    /// `sizeof(struct rt_msghdr)`; sockaddrs start here.
    pub header_len: usize,
    /// Sockaddr padding unit.
    pub sa_align: usize,
    /// `AF_INET6`, which differs between the BSDs.
    pub af_inet6: u8,
}

impl RouteLayout {
    /// macOS: 32-bit `rt_metrics`, sockaddrs rounded to 4 bytes.
    pub const DARWIN: Self = Self {
        addrs_offset: 12,
        header_len: 92,
        sa_align: 4,
        af_inet6: 30,
    };

    /// FreeBSD on LP64: `u_long` metrics, sockaddrs rounded to `sizeof(long)`.
    pub const FREEBSD: Self = Self {
        addrs_offset: 12,
        header_len: 152,
        sa_align: 8,
        af_inet6: 28,
    };

    #[cfg(target_os = "freebsd")]
    pub const NATIVE: Self = Self::FREEBSD;

    #[cfg(not(target_os = "freebsd"))]
    pub const NATIVE: Self = Self::DARWIN;
}

// ---------------------------------------------------------------------------
// Socket addresses
// ---------------------------------------------------------------------------

/// A socket address taken from a routing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    Inet(Ipv4Addr, u16),
    Inet6(Ipv6Addr, u16),
    /// `sockaddr_dl`: interface index and link-level address, if any.
    Link { index: u16, addr: Vec<u8> },
    /// Zero `sa_len`; the kernel's shorthand for an all-zero mask.
    Empty,
    Other { family: u8 },
}

impl SockAddr {
    /// Decodes one sockaddr. `bytes` is exactly `sa_len` long.
    ///
    /// Netmasks are often shortened to their significant bytes, so missing
    /// address bytes read as zero.
    fn parse(bytes: &[u8], af_inet6: u8) -> Self {
        let Some(&family) = bytes.get(1) else {
            return SockAddr::Empty;
        };
        let port = bytes
            .get(2..4)
            .map(|p| u16::from_be_bytes([p[0], p[1]]))
            .unwrap_or(0);

        match family {
            AF_INET => {
                let mut octets = [0u8; 4];
                copy_available(&mut octets, bytes, 4);
                SockAddr::Inet(Ipv4Addr::from(octets), port)
            }
            f if f == af_inet6 => {
                let mut octets = [0u8; 16];
                copy_available(&mut octets, bytes, 8);
                SockAddr::Inet6(Ipv6Addr::from(octets), port)
            }
            AF_LINK => {
                // sdl_index at 2, sdl_nlen at 5, sdl_alen at 6, sdl_data at 8
                let index = ne_u16(bytes, 2).unwrap_or(0);
                let nlen = usize::from(bytes.get(5).copied().unwrap_or(0));
                let alen = usize::from(bytes.get(6).copied().unwrap_or(0));
                let start = 8 + nlen;
                let addr = bytes
                    .get(start..start + alen)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                SockAddr::Link { index, addr }
            }
            family => SockAddr::Other { family },
        }
    }
}

fn copy_available(dst: &mut [u8], src: &[u8], start: usize) {
    if let Some(avail) = src.get(start..) {
        let n = avail.len().min(dst.len());
        dst[..n].copy_from_slice(&avail[..n]);
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(ip, 0) => write!(f, "{ip}"),
            SockAddr::Inet(ip, port) => write!(f, "{ip}:{port}"),
            SockAddr::Inet6(ip, 0) => write!(f, "{ip}"),
            SockAddr::Inet6(ip, port) => write!(f, "[{ip}]:{port}"),
            SockAddr::Link { index, addr } if addr.is_empty() => write!(f, "link#{index}"),
            SockAddr::Link { addr, .. } => {
                for (i, b) in addr.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            SockAddr::Empty => f.write_str("empty"),
            SockAddr::Other { family } => write!(f, "af#{family}"),
        }
    }
}

/// Picks the sockaddrs named by `mask` out of a packed run.
///
/// Stops early if a sockaddr runs past the end of `region`; the slots it
/// would have filled stay `None`.
fn collect_addrs(
    mut region: &[u8],
    mask: u32,
    layout: RouteLayout,
) -> [Option<SockAddr>; RTAX_MAX] {
    let mut slots: [Option<SockAddr>; RTAX_MAX] = Default::default();
    for (i, slot) in slots.iter_mut().enumerate() {
        if mask & (1 << i) == 0 {
            continue;
        }
        let Some(&sa_len) = region.first() else {
            break;
        };
        let sa_len = usize::from(sa_len);
        let Some(bytes) = region.get(..sa_len) else {
            break;
        };
        *slot = Some(if sa_len == 0 {
            SockAddr::Empty
        } else {
            SockAddr::parse(bytes, layout.af_inet6)
        });

        let step = if sa_len == 0 {
            layout.sa_align
        } else {
            align_up(sa_len, layout.sa_align)
        };
        region = region.get(step..).unwrap_or(&[]);
    }
    slots
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One route from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Option<SockAddr>,
    pub gateway: Option<SockAddr>,
    pub netmask: Option<SockAddr>,
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(dst) = &self.destination {
            write!(f, "dest: {dst}")?;
            sep = ", ";
        }
        if let Some(gw) = &self.gateway {
            write!(f, "{sep}gateway: {gw}")?;
        }
        Ok(())
    }
}

/// Lazy iterator over the messages of a `NET_RT_DUMP` buffer.
pub struct RouteMessages<'a> {
    buf: &'a [u8],
    pos: usize,
    layout: RouteLayout,
}

impl<'a> RouteMessages<'a> {
    pub fn new(buf: &'a [u8], layout: RouteLayout) -> Self {
        Self {
            buf,
            pos: 0,
            layout,
        }
    }

    fn stop(&mut self, reason: &str) -> Option<RouteEntry> {
        log::warn!(
            "route dump: {} at offset {} of {}",
            reason,
            self.pos,
            self.buf.len()
        );
        self.pos = self.buf.len();
        None
    }
}

impl Iterator for RouteMessages<'_> {
    type Item = RouteEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        let rest = &self.buf[self.pos..];
        let Some(msglen) = ne_u16(rest, 0).map(usize::from) else {
            return self.stop("short message header");
        };
        if msglen < self.layout.header_len {
            return self.stop("rtm_msglen smaller than rt_msghdr");
        }
        let Some(msg) = rest.get(..msglen) else {
            return self.stop("truncated message");
        };
        let Some(mask) = ne_u32(msg, self.layout.addrs_offset) else {
            return self.stop("short message header");
        };

        let mut addrs = collect_addrs(&msg[self.layout.header_len..], mask, self.layout);
        self.pos += msglen;
        Some(RouteEntry {
            destination: addrs[RTAX_DST].take(),
            gateway: addrs[RTAX_GATEWAY].take(),
            netmask: addrs[RTAX_NETMASK].take(),
        })
    }
}

// ---------------------------------------------------------------------------
// sysctl
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use self::sysctl::dump;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod sysctl {
    use std::ptr;

    use crate::error::CaptureError;

    const NET_RT_DUMP: libc::c_int = 1;

    /// Snapshot of the routing table for `family` (0 for every family).
    pub fn dump(family: libc::c_int) -> Result<Vec<u8>, CaptureError> {
        let mut mib = [libc::CTL_NET, libc::PF_ROUTE, 0, family, NET_RT_DUMP, 0];
        let mut len: libc::size_t = 0;

        let ret = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as libc::c_uint,
                ptr::null_mut(),
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        if ret != 0 {
            return Err(CaptureError::Sysctl(std::io::Error::last_os_error()));
        }

        // Routes can be added between the two calls.
        len = len * 3 / 2;
        let mut buf = vec![0u8; len];

        let ret = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as libc::c_uint,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        if ret != 0 {
            return Err(CaptureError::Sysctl(std::io::Error::last_os_error()));
        }

        buf.truncate(len);
        log::debug!("route dump: {len} bytes for family {family}");
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTA_DST: u32 = 1 << RTAX_DST;
    const RTA_GATEWAY: u32 = 1 << RTAX_GATEWAY;
    const RTA_NETMASK: u32 = 1 << RTAX_NETMASK;

    fn sockaddr_in(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut sa = vec![16, AF_INET];
        sa.extend_from_slice(&port.to_be_bytes());
        sa.extend_from_slice(&ip);
        sa.resize(16, 0);
        sa
    }

    fn sockaddr_in6(ip: Ipv6Addr, af: u8) -> Vec<u8> {
        let mut sa = vec![28, af, 0, 0, 0, 0, 0, 0];
        sa.extend_from_slice(&ip.octets());
        sa.resize(28, 0);
        sa
    }

    fn sockaddr_dl(index: u16, name: &[u8], lladdr: &[u8]) -> Vec<u8> {
        let mut sa = vec![0, AF_LINK];
        sa.extend_from_slice(&index.to_ne_bytes());
        sa.push(6); // IFT_ETHER
        sa.push(name.len() as u8);
        sa.push(lladdr.len() as u8);
        sa.push(0);
        sa.extend_from_slice(name);
        sa.extend_from_slice(lladdr);
        sa.resize(sa.len().max(20), 0);
        sa[0] = sa.len() as u8;
        sa
    }

    /// Appends one message: header with `mask`, then each sockaddr padded.
    fn push_message(buf: &mut Vec<u8>, layout: RouteLayout, mask: u32, addrs: &[Vec<u8>]) {
        let start = buf.len();
        buf.resize(start + layout.header_len, 0);
        buf[start + 2] = 5; // RTM_VERSION
        buf[start + 3] = 4; // RTM_GET
        buf[start + layout.addrs_offset..start + layout.addrs_offset + 4]
            .copy_from_slice(&mask.to_ne_bytes());
        for sa in addrs {
            buf.extend_from_slice(sa);
            let step = if sa[0] == 0 {
                layout.sa_align
            } else {
                align_up(sa.len(), layout.sa_align)
            };
            buf.resize(buf.len() + step - sa.len(), 0);
        }
        let msglen = (buf.len() - start) as u16;
        buf[start..start + 2].copy_from_slice(&msglen.to_ne_bytes());
    }

    #[test]
    fn empty_dump_has_no_routes() {
        assert_eq!(RouteMessages::new(&[], RouteLayout::DARWIN).count(), 0);
    }

    #[test]
    fn default_route_via_gateway() {
        let layout = RouteLayout::DARWIN;
        let mut buf = Vec::new();
        push_message(
            &mut buf,
            layout,
            RTA_DST | RTA_GATEWAY | RTA_NETMASK,
            &[
                sockaddr_in([0, 0, 0, 0], 0),
                sockaddr_in([192, 168, 1, 1], 0),
                vec![0],
            ],
        );

        let routes: Vec<_> = RouteMessages::new(&buf, layout).collect();
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes[0].gateway,
            Some(SockAddr::Inet(Ipv4Addr::new(192, 168, 1, 1), 0))
        );
        assert_eq!(routes[0].netmask, Some(SockAddr::Empty));
        assert_eq!(routes[0].to_string(), "dest: 0.0.0.0, gateway: 192.168.1.1");
    }

    #[test]
    fn absent_slots_do_not_consume_addresses() {
        let layout = RouteLayout::DARWIN;
        let mut buf = Vec::new();
        // DST and NETMASK only: the second sockaddr belongs to slot 2.
        push_message(
            &mut buf,
            layout,
            RTA_DST | RTA_NETMASK,
            &[
                sockaddr_in([10, 0, 0, 0], 0),
                sockaddr_in([255, 0, 0, 0], 0),
            ],
        );

        let route = RouteMessages::new(&buf, layout).next().unwrap();
        assert_eq!(route.gateway, None);
        assert_eq!(
            route.netmask,
            Some(SockAddr::Inet(Ipv4Addr::new(255, 0, 0, 0), 0))
        );
        assert_eq!(route.to_string(), "dest: 10.0.0.0");
    }

    #[test]
    fn link_gateway_shows_index_or_address() {
        let layout = RouteLayout::DARWIN;
        let mut buf = Vec::new();
        push_message(
            &mut buf,
            layout,
            RTA_DST | RTA_GATEWAY,
            &[sockaddr_in([127, 0, 0, 1], 0), sockaddr_dl(1, b"", &[])],
        );
        push_message(
            &mut buf,
            layout,
            RTA_DST | RTA_GATEWAY,
            &[
                sockaddr_in([192, 168, 1, 1], 0),
                sockaddr_dl(4, b"en0", &[0x02, 0, 0, 0xab, 0xcd, 0xef]),
            ],
        );

        let lines: Vec<_> = RouteMessages::new(&buf, layout)
            .map(|r| r.to_string())
            .collect();
        assert_eq!(
            lines,
            [
                "dest: 127.0.0.1, gateway: link#1",
                "dest: 192.168.1.1, gateway: 02:00:00:ab:cd:ef",
            ]
        );
    }

    #[test]
    fn inet6_family_number_is_per_layout() {
        let ip: Ipv6Addr = "fe80::1".parse().unwrap();
        for layout in [RouteLayout::DARWIN, RouteLayout::FREEBSD] {
            let mut buf = Vec::new();
            push_message(&mut buf, layout, RTA_DST, &[sockaddr_in6(ip, layout.af_inet6)]);
            let route = RouteMessages::new(&buf, layout).next().unwrap();
            assert_eq!(route.destination, Some(SockAddr::Inet6(ip, 0)));
        }
    }

    #[test]
    fn short_netmask_reads_missing_bytes_as_zero() {
        let layout = RouteLayout::DARWIN;
        let mut buf = Vec::new();
        // sa_len 6: only the first two address octets are present.
        push_message(
            &mut buf,
            layout,
            RTA_DST | RTA_NETMASK,
            &[sockaddr_in([172, 16, 0, 0], 0), vec![6, AF_INET, 0, 0, 255, 255]],
        );
        let route = RouteMessages::new(&buf, layout).next().unwrap();
        assert_eq!(
            route.netmask,
            Some(SockAddr::Inet(Ipv4Addr::new(255, 255, 0, 0), 0))
        );
    }

    #[test]
    fn wider_alignment_is_honoured() {
        let layout = RouteLayout::FREEBSD;
        let mut buf = Vec::new();
        // sockaddr_dl of 20 bytes pads to 24 under 8-byte rounding.
        push_message(
            &mut buf,
            layout,
            RTA_DST | RTA_GATEWAY | RTA_NETMASK,
            &[
                sockaddr_dl(2, b"em0", &[]),
                sockaddr_in([10, 0, 0, 1], 0),
                sockaddr_in([255, 255, 255, 0], 0),
            ],
        );
        let route = RouteMessages::new(&buf, layout).next().unwrap();
        assert_eq!(route.to_string(), "dest: link#2, gateway: 10.0.0.1");
        assert_eq!(
            route.netmask,
            Some(SockAddr::Inet(Ipv4Addr::new(255, 255, 255, 0), 0))
        );
    }

    #[test]
    fn stops_at_truncated_message() {
        let layout = RouteLayout::DARWIN;
        let mut buf = Vec::new();
        push_message(&mut buf, layout, RTA_DST, &[sockaddr_in([10, 0, 0, 0], 0)]);
        push_message(&mut buf, layout, RTA_DST, &[sockaddr_in([10, 1, 0, 0], 0)]);
        buf.truncate(buf.len() - 4);
        assert_eq!(RouteMessages::new(&buf, layout).count(), 1);
    }

    #[test]
    fn stops_at_zero_message_length() {
        let mut buf = vec![0u8; 200];
        assert_eq!(RouteMessages::new(&buf, RouteLayout::DARWIN).count(), 0);
        buf.clear();
        assert_eq!(RouteMessages::new(&buf, RouteLayout::DARWIN).count(), 0);
    }

    #[test]
    fn unknown_family_and_ports() {
        assert_eq!(SockAddr::Other { family: 1 }.to_string(), "af#1");
        assert_eq!(
            SockAddr::parse(&sockaddr_in([10, 0, 0, 1], 8080), 30).to_string(),
            "10.0.0.1:8080"
        );
        let ip: Ipv6Addr = "::1".parse().unwrap();
        assert_eq!(SockAddr::Inet6(ip, 22).to_string(), "[::1]:22");
    }
}
