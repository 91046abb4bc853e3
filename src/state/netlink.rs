//! `NETLINK_SOCK_DIAG` accessor.
//!
//! Looks up exactly one socket per read with a non-dump `inet_diag` request
//! (the kernel resolves the 4-tuple with a hash lookup) and decodes the
//! `INET_DIAG_INFO` attribute. Sockets carry a receive timeout so a read never
//! waits longer than the configured bound.

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, trace};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{MonitorError, Result};
use crate::protocol::{ConnectionKey, IPPROTO_TCP};
use crate::state::tcp_info::TcpInfo;
use crate::state::{ConnectionHandle, ConnectionStateAccessor, TcpCounters};

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 1;
const SOCK_DIAG_BY_FAMILY: u16 = 20;

const INET_DIAG_REQ_V2_LEN: usize = 56;
const INET_DIAG_MSG_LEN: usize = 72;
const INET_DIAG_INFO: u16 = 2;
const INET_DIAG_NOCOOKIE: u32 = !0;
const COOKIE_OFFSET: usize = 44;
const RTA_HDRLEN: usize = 4;

const RECV_BUFFER_LEN: usize = 8192;
const MAX_POOLED_SOCKETS: usize = 4;
const MAX_RECV_ATTEMPTS: usize = 4;

const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Outcome of decoding one receive buffer.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Found(TcpCounters),
    /// Kernel answered: no live TCP socket with `tcp_info` for this tuple.
    Missing,
    /// Nothing in the buffer answers our sequence number.
    Stale,
}

pub struct NetlinkStateAccessor {
    pool: Mutex<Vec<Socket>>,
    timeout: Duration,
    srtt_shift: u32,
    seq: AtomicU32,
}

impl NetlinkStateAccessor {
    /// Opens the first diag socket eagerly so missing privileges are reported
    /// at startup instead of on the packet path.
    pub fn new(timeout: Duration, srtt_shift: u32) -> Result<Self> {
        let socket = open_socket(timeout)?;
        Ok(Self {
            pool: Mutex::new(vec![socket]),
            timeout,
            srtt_shift,
            seq: AtomicU32::new(1),
        })
    }

    fn checkout(&self) -> Result<Socket> {
        if let Some(socket) = self.pool.lock().pop() {
            return Ok(socket);
        }
        debug!("netlink pool empty, opening another diag socket");
        open_socket(self.timeout)
    }

    fn checkin(&self, socket: Socket) {
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED_SOCKETS {
            pool.push(socket);
        }
    }

    fn query(&self, socket: &Socket, key: &ConnectionKey) -> Result<Option<TcpCounters>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = build_request(key, seq);
        socket.send(&request)?;

        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut reader: &Socket = socket;
        for _ in 0..MAX_RECV_ATTEMPTS {
            let n = reader.read(&mut buf)?;
            match parse_reply(&buf[..n], seq, key, self.srtt_shift)? {
                Reply::Found(counters) => return Ok(Some(counters)),
                Reply::Missing => return Ok(None),
                Reply::Stale => trace!("skipping stale netlink reply (want seq {})", seq),
            }
        }
        Err(MonitorError::Netlink(format!("no reply for seq {}", seq)))
    }
}

impl ConnectionStateAccessor for NetlinkStateAccessor {
    fn read(&self, key: &ConnectionKey) -> Result<Option<TcpCounters>> {
        let socket = self.checkout()?;
        // a socket that failed mid-exchange may hold a late reply; drop it
        let counters = self.query(&socket, key)?;
        self.checkin(socket);
        Ok(counters)
    }
}

fn open_socket(timeout: Duration) -> Result<Socket> {
    let socket = Socket::new(
        Domain::from(libc::AF_NETLINK),
        Type::from(libc::SOCK_RAW),
        Some(Protocol::from(libc::NETLINK_SOCK_DIAG)),
    )?;
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket)
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_slice(&ip.octets());
            buf.put_bytes(0, 12);
        }
        IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
    }
}

/// `nlmsghdr` + `inet_diag_req_v2` for an exact 4-tuple.
fn build_request(key: &ConnectionKey, seq: u32) -> BytesMut {
    let len = NLMSG_HDRLEN + INET_DIAG_REQ_V2_LEN;
    let mut buf = BytesMut::with_capacity(len);

    buf.put_u32_ne(len as u32);
    buf.put_u16_ne(SOCK_DIAG_BY_FAMILY);
    buf.put_u16_ne(NLM_F_REQUEST);
    buf.put_u32_ne(seq);
    buf.put_u32_ne(0);

    buf.put_u8(key.family().af());
    buf.put_u8(IPPROTO_TCP);
    buf.put_u8(1 << (INET_DIAG_INFO - 1));
    buf.put_u8(0);
    buf.put_u32_ne(u32::MAX);

    // inet_diag_sockid: ports and addresses in network order
    buf.put_u16(key.local.port());
    buf.put_u16(key.remote.port());
    put_addr(&mut buf, &key.local);
    put_addr(&mut buf, &key.remote);
    buf.put_u32_ne(0);
    buf.put_u32_ne(INET_DIAG_NOCOOKIE);
    buf.put_u32_ne(INET_DIAG_NOCOOKIE);

    buf
}

fn parse_reply(data: &[u8], seq: u32, key: &ConnectionKey, shift: u32) -> Result<Reply> {
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= data.len() {
        let mut header = &data[offset..offset + NLMSG_HDRLEN];
        let len = header.get_u32_ne() as usize;
        let kind = header.get_u16_ne();
        let _flags = header.get_u16_ne();
        let msg_seq = header.get_u32_ne();

        if len < NLMSG_HDRLEN || offset + len > data.len() {
            return Err(MonitorError::Netlink(format!(
                "malformed netlink message: len {} at offset {} of {}",
                len,
                offset,
                data.len()
            )));
        }
        let body = &data[offset + NLMSG_HDRLEN..offset + len];
        offset += nlmsg_align(len);

        if msg_seq != seq {
            continue;
        }
        match kind {
            NLMSG_ERROR => {
                if body.len() < 4 {
                    return Err(MonitorError::Netlink("truncated NLMSG_ERROR".to_string()));
                }
                let errno = -(&body[..4]).get_i32_ne();
                match errno {
                    0 => {}
                    libc::ENOENT => return Ok(Reply::Missing),
                    libc::EPERM | libc::EACCES => {
                        return Err(MonitorError::PermissionDenied(
                            "sock_diag lookup refused".to_string(),
                        ))
                    }
                    e => return Err(MonitorError::Netlink(format!("kernel returned errno {}", e))),
                }
            }
            NLMSG_DONE => return Ok(Reply::Missing),
            SOCK_DIAG_BY_FAMILY => return parse_diag_msg(body, key, shift),
            _ => {}
        }
    }
    Ok(Reply::Stale)
}

/// `inet_diag_msg` followed by route attributes.
fn parse_diag_msg(body: &[u8], key: &ConnectionKey, shift: u32) -> Result<Reply> {
    if body.len() < INET_DIAG_MSG_LEN {
        return Err(MonitorError::Netlink(format!(
            "inet_diag_msg too short: {} bytes",
            body.len()
        )));
    }
    let mut cookie_bytes = &body[COOKIE_OFFSET..COOKIE_OFFSET + 8];
    let low = cookie_bytes.get_u32_ne();
    let high = cookie_bytes.get_u32_ne();
    let cookie = u64::from(low) | (u64::from(high) << 32);

    let mut attrs = &body[INET_DIAG_MSG_LEN..];
    while attrs.len() >= RTA_HDRLEN {
        let mut rta = &attrs[..RTA_HDRLEN];
        let rta_len = usize::from(rta.get_u16_ne());
        let rta_type = rta.get_u16_ne();
        if rta_len < RTA_HDRLEN || rta_len > attrs.len() {
            return Err(MonitorError::Netlink(format!(
                "malformed attribute: len {} with {} bytes left",
                rta_len,
                attrs.len()
            )));
        }
        // NLA_TYPE_MASK strips the nested/byte-order flags
        if rta_type & 0x3FFF == INET_DIAG_INFO {
            let info = TcpInfo::parse(&attrs[RTA_HDRLEN..rta_len])?;
            let handle = ConnectionHandle::new(*key, Some(cookie));
            return Ok(Reply::Found(info.to_counters(handle, shift)));
        }
        let step = nlmsg_align(rta_len).min(attrs.len());
        attrs = &attrs[step..];
    }
    // time-wait and request sockets carry no tcp_info
    Ok(Reply::Missing)
}
