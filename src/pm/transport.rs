//! UDP-multicast pub/sub bus carrying the deputy's wire messages.
//!
//! Messages are JSON envelopes `{channel, data}` sent to one multicast
//! group; every deputy and the sheriff join the same group and filter by
//! channel. The socket is non-blocking and meant to be driven from the
//! reactor: register [`Transport::fileno`] as a read notifier and call
//! [`Transport::handle`] when it becomes readable.

use std::cell::{Cell, RefCell};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::rc::Rc;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::pm::log::pm_debug;

pub const DEFAULT_URL: &str = "udpm://239.255.76.67:7667";

#[derive(Serialize)]
struct WireOut<'a, M: Serialize> {
    channel: &'a str,
    data: &'a M,
}

#[derive(Deserialize)]
struct WireIn {
    channel: String,
    data: serde_json::Value,
}

struct SubEntry {
    id: u64,
    channel: String,
    alive: Cell<bool>,
    callback: Box<dyn Fn(&serde_json::Value)>,
}

/// Handle returned by [`Transport::subscribe`]; pass it back to
/// [`Transport::unsubscribe`] to stop deliveries.
pub struct Subscription {
    id: u64,
}

pub struct Transport {
    socket: UdpSocket,
    dest: SocketAddrV4,
    subs: RefCell<Vec<Rc<SubEntry>>>,
    next_sub_id: Cell<u64>,
}

fn parse_url(url: &str) -> anyhow::Result<SocketAddrV4> {
    let rest = url.strip_prefix("udpm://").ok_or_else(|| {
        anyhow::anyhow!("unsupported transport url {url:?} (expected udpm://ADDR:PORT)")
    })?;
    rest.parse()
        .with_context(|| format!("bad transport address in {url:?}"))
}

/// Binds the shared multicast port. SO_REUSEADDR (and SO_REUSEPORT on
/// Linux) let several deputies on one host share it, which is what makes
/// same-host conflict detection work at all.
fn multicast_socket(dest: SocketAddrV4) -> anyhow::Result<UdpSocket> {
    // SAFETY: plain socket syscalls; the fd is handed to UdpSocket below,
    // which owns it from then on.
    let socket = unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("socket");
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        #[cfg(target_os = "linux")]
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: dest.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY,
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).with_context(|| format!("bind port {}", dest.port()));
        }
        UdpSocket::from_raw_fd(fd)
    };

    socket
        .join_multicast_v4(dest.ip(), &Ipv4Addr::UNSPECIFIED)
        .with_context(|| format!("join multicast group {}", dest.ip()))?;
    // Own messages must come back: a deputy filters its own discovery pings
    // by nonce, and peers on the same host need to hear each other.
    socket.set_multicast_loop_v4(true).context("multicast loop")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    Ok(socket)
}

impl Transport {
    pub fn new(url: &str) -> anyhow::Result<Transport> {
        let dest = parse_url(url)?;
        let socket = multicast_socket(dest)?;
        Ok(Transport {
            socket,
            dest,
            subs: RefCell::new(Vec::new()),
            next_sub_id: Cell::new(1),
        })
    }

    /// The fd to watch for inbound traffic.
    pub fn fileno(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn publish<M: Serialize>(&self, channel: &str, msg: &M) -> anyhow::Result<()> {
        let frame = serde_json::to_vec(&WireOut { channel, data: msg })?;
        self.socket
            .send_to(&frame, self.dest)
            .with_context(|| format!("publish on {channel}"))?;
        Ok(())
    }

    /// Registers `callback` for decoded messages on `channel`. Payloads
    /// that fail to decode are dropped with a verbose-only diagnostic.
    pub fn subscribe<M, F>(&self, channel: &str, callback: F) -> Subscription
    where
        M: DeserializeOwned + 'static,
        F: Fn(M) + 'static,
    {
        let id = self.next_sub_id.get();
        self.next_sub_id.set(id + 1);
        let channel_name = channel.to_string();
        let entry = Rc::new(SubEntry {
            id,
            channel: channel.to_string(),
            alive: Cell::new(true),
            callback: Box::new(move |value| {
                match serde_json::from_value::<M>(value.clone()) {
                    Ok(msg) => callback(msg),
                    Err(e) => pm_debug(
                        "transport",
                        None,
                        format!("dropping undecodable {channel_name} payload: {e}"),
                    ),
                }
            }),
        });
        self.subs.borrow_mut().push(entry);
        Subscription { id }
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        let mut subs = self.subs.borrow_mut();
        if let Some(entry) = subs.iter().find(|s| s.id == sub.id) {
            entry.alive.set(false);
        }
        subs.retain(|s| s.id != sub.id);
    }

    /// Reads one pending datagram, if any, and dispatches it to matching
    /// subscribers. Foreign or malformed datagrams are ignored.
    pub fn handle(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 65536];
        let len = match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e).context("transport recv"),
        };
        let Ok(wire) = serde_json::from_slice::<WireIn>(&buf[..len]) else {
            return Ok(());
        };
        // Snapshot so a callback may subscribe or unsubscribe; the alive
        // flag suppresses entries cancelled mid-dispatch.
        let matched: Vec<Rc<SubEntry>> = self
            .subs
            .borrow()
            .iter()
            .filter(|s| s.alive.get() && s.channel == wire.channel)
            .cloned()
            .collect();
        for entry in matched {
            if entry.alive.get() {
                (entry.callback)(&wire.data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udpm_urls() {
        let dest = parse_url("udpm://239.255.76.67:7667").unwrap();
        assert_eq!(dest.ip(), &Ipv4Addr::new(239, 255, 76, 67));
        assert_eq!(dest.port(), 7667);

        assert!(parse_url("tcp://1.2.3.4:1").is_err());
        assert!(parse_url("udpm://not-an-addr").is_err());
    }

    #[test]
    fn envelope_round_trips() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Ping {
            seq: u32,
        }
        let frame = serde_json::to_vec(&WireOut {
            channel: "PING",
            data: &Ping { seq: 7 },
        })
        .unwrap();
        let wire: WireIn = serde_json::from_slice(&frame).unwrap();
        assert_eq!(wire.channel, "PING");
        let ping: Ping = serde_json::from_value(wire.data).unwrap();
        assert_eq!(ping, Ping { seq: 7 });
    }
}
