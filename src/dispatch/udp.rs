// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use rand::RngExt;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    dispatch::{
        Dispatch, DispatchAttrs, DispatchEntry, DispatchError, IoHandler,
        ResponseHandler, Socket, SocketCancel, apply_dscp,
    },
    engine::task::Task,
    message::wire,
};

/// How many random draws to try before declaring the id space exhausted.
const ID_ATTEMPTS: usize = 64;

pub(crate) struct Slot {
    pub(crate) task: Task,
    pub(crate) dest: SocketAddr,
    pub(crate) handler: ResponseHandler,
}

struct UdpEntry {
    id: u16,
}

impl DispatchEntry for UdpEntry {
    fn id(&self) -> u16 {
        self.id
    }

    fn socket(&self) -> Option<Arc<dyn Socket>> {
        None
    }
}

/// Send half of the shared UDP socket, handed to the engine as its
/// [`Socket`].
struct UdpSender {
    socket: Arc<UdpSocket>,
    send_cancel: Mutex<CancellationToken>,
}

impl Socket for UdpSender {
    fn connect(&self, _dest: SocketAddr, task: &Task, handler: IoHandler) {
        // The engine never connects a UDP dispatch socket.
        task.send(move || {
            handler(Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "connect on a UDP dispatch socket",
            )))
        });
    }

    fn send_to(
        &self,
        payload: Bytes,
        dest: Option<SocketAddr>,
        dscp: Option<u8>,
        task: &Task,
        handler: IoHandler,
    ) {
        let socket = self.socket.clone();
        let token = self.send_cancel.lock().clone();
        let task = task.clone();
        tokio::spawn(async move {
            let send = async {
                if let Some(dscp) = dscp {
                    apply_dscp(&*socket, dscp, dest.is_none_or(|addr| addr.is_ipv4()));
                }
                match dest {
                    Some(addr) => socket.send_to(&payload, addr).await.map(|_| ()),
                    None => socket.send(&payload).await.map(|_| ()),
                }
            };
            let result = tokio::select! {
                _ = token.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "send canceled"))
                },
                result = send => result,
            };
            task.send(move || handler(result));
        });
    }

    fn cancel(&self, which: SocketCancel) {
        if which == SocketCancel::Send {
            let mut token = self.send_cancel.lock();
            token.cancel();
            *token = CancellationToken::new();
        }
    }
}

/// A UDP dispatch: one shared socket, a message-id demux table, and a
/// receive loop routing each incoming datagram to the request that
/// registered its id.
pub struct UdpDispatch {
    attrs: DispatchAttrs,
    local: SocketAddr,
    sender: Arc<UdpSender>,
    slots: Arc<DashMap<u16, Slot>>,
    cancel: CancellationToken,
}

impl UdpDispatch {
    /// Bind a socket to `src` and start the receive loop. Must run inside a
    /// tokio runtime.
    pub fn bind(src: SocketAddr, recv_buffer: usize) -> Result<Arc<Self>, DispatchError> {
        let std_socket = std::net::UdpSocket::bind(src)?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local = socket.local_addr()?;

        let attrs = DispatchAttrs::UDP
            | if local.is_ipv4() {
                DispatchAttrs::IPV4
            } else {
                DispatchAttrs::IPV6
            };

        let slots: Arc<DashMap<u16, Slot>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        debug!("udp dispatch: bound {local}");
        tokio::spawn(recv_loop(
            socket.clone(),
            slots.clone(),
            cancel.clone(),
            recv_buffer,
        ));

        Ok(Arc::new(Self {
            attrs,
            local,
            sender: Arc::new(UdpSender {
                socket,
                send_cancel: Mutex::new(CancellationToken::new()),
            }),
            slots,
            cancel,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Dispatch for UdpDispatch {
    fn attributes(&self) -> DispatchAttrs {
        self.attrs
    }

    fn add_response(
        &self,
        fixed_id: Option<u16>,
        dest: SocketAddr,
        task: &Task,
        handler: ResponseHandler,
    ) -> Result<(u16, Arc<dyn DispatchEntry>), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Exiting);
        }
        let id = insert_slot(
            &self.slots,
            fixed_id,
            Slot {
                task: task.clone(),
                dest,
                handler,
            },
        )?;
        Ok((id, Arc::new(UdpEntry { id })))
    }

    fn remove_response(&self, entry: &dyn DispatchEntry) {
        self.slots.remove(&entry.id());
    }

    fn socket(&self) -> Arc<dyn Socket> {
        self.sender.clone()
    }

    fn start_tcp(&self) {}
}

impl Drop for UdpDispatch {
    fn drop(&mut self) {
        self.cancel.cancel();
        fail_slots(&self.slots);
    }
}

/// Reserve an id in the demux table: the caller's when pinned, a random
/// free one otherwise.
pub(crate) fn insert_slot(
    slots: &DashMap<u16, Slot>,
    fixed_id: Option<u16>,
    slot: Slot,
) -> Result<u16, DispatchError> {
    match fixed_id {
        Some(id) => match slots.entry(id) {
            Entry::Occupied(_) => Err(DispatchError::IdInUse(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(id)
            },
        },
        None => {
            let mut rng = rand::rng();
            let mut pending = Some(slot);
            for _ in 0..ID_ATTEMPTS {
                let id: u16 = rng.random();
                if let Entry::Vacant(vacant) = slots.entry(id)
                    && let Some(slot) = pending.take()
                {
                    vacant.insert(slot);
                    return Ok(id);
                }
            }
            // Only reachable when the table is nearly full.
            Err(DispatchError::NoFreeId)
        },
    }
}

/// Fire every remaining slot with a terminal error.
pub(crate) fn fail_slots(slots: &DashMap<u16, Slot>) {
    let ids: Vec<u16> = slots.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, slot)) = slots.remove(&id) {
            let handler = slot.handler;
            slot.task
                .send(move || handler(Err(DispatchError::ConnectionLost)));
        }
    }
}

/// Deliver a datagram/frame to the slot that registered its id, validating
/// the peer for UDP. Unsolicited or spoofed messages are dropped with a
/// debug log.
pub(crate) fn route_message(
    slots: &DashMap<u16, Slot>,
    payload: &[u8],
    peer: Option<SocketAddr>,
) {
    let Some(id) = wire::message_id(payload) else {
        debug!("dropping short message ({} bytes)", payload.len());
        return;
    };
    match slots.get(&id) {
        Some(slot) => {
            if let Some(peer) = peer
                && slot.dest != peer
            {
                debug!("dropping response for id {id:#06x}: wrong peer {peer}");
                return;
            }
        },
        None => {
            debug!("dropping unsolicited response for id {id:#06x}");
            return;
        },
    }
    if let Some((_, slot)) = slots.remove(&id) {
        let answer = Bytes::copy_from_slice(payload);
        let handler = slot.handler;
        slot.task.send(move || handler(Ok(answer)));
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    slots: Arc<DashMap<u16, Slot>>,
    cancel: CancellationToken,
    recv_buffer: usize,
) {
    let mut buf = vec![0u8; recv_buffer.max(wire::HEADER_LEN)];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, peer)) => route_message(&slots, &buf[..len], Some(peer)),
            Err(err) => {
                // Transient (e.g. ICMP port unreachable surfacing here);
                // the request timer owns the deadline.
                warn!("udp dispatch: recv failed: {err}");
            },
        }
    }
}
