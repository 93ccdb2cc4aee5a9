// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    dispatch::{
        Dispatch, DispatchAttrs, DispatchEntry, DispatchError, IoHandler,
        ResponseHandler, Socket, SocketCancel, apply_dscp,
        udp::{Slot, fail_slots, insert_slot, route_message},
    },
    engine::task::Task,
};

struct TcpEntry {
    id: u16,
}

impl DispatchEntry for TcpEntry {
    fn id(&self) -> u16 {
        self.id
    }

    fn socket(&self) -> Option<Arc<dyn Socket>> {
        None
    }
}

enum ConnState {
    /// Bound but unconnected socket; consumed by the first connect.
    Unconnected(TcpSocket),
    Connecting,
    Connected,
    Failed,
}

enum ConnectAction {
    Start(TcpSocket),
    Wait,
    Ready(io::Result<()>),
}

fn interrupted(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, reason.to_string())
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection failed")
}

/// Connection state and I/O halves, shared between the dispatch and the
/// spawned connect/send/read tasks. Holds only a weak reference to itself
/// so in-flight I/O never keeps a dropped dispatch alive.
///
/// A connection may be shared before its connect completes; later connects
/// join the waiter list and complete together with the first one.
struct TcpIo {
    dest: SocketAddr,
    state: Mutex<ConnState>,
    waiters: Mutex<Vec<(Task, IoHandler)>>,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    /// Global "kill now" token: stops the read loop and all pending I/O.
    cancel: CancellationToken,
    connect_cancel: Mutex<CancellationToken>,
    send_cancel: Mutex<CancellationToken>,
    self_weak: OnceCell<Weak<TcpIo>>,
}

impl TcpIo {
    fn attach_self(self: &Arc<Self>) {
        let _ = self.self_weak.set(Arc::downgrade(self));
    }

    fn weak(&self) -> Weak<TcpIo> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), ConnState::Connected)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn drain_waiters(&self, connected: bool) {
        for (task, handler) in self.waiters.lock().drain(..) {
            let result = if connected { Ok(()) } else { Err(not_connected()) };
            task.send(move || handler(result));
        }
    }
}

impl Socket for TcpIo {
    fn connect(&self, dest: SocketAddr, task: &Task, handler: IoHandler) {
        let action = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ConnState::Connecting) {
                ConnState::Unconnected(socket) => ConnectAction::Start(socket),
                ConnState::Connecting => ConnectAction::Wait,
                ConnState::Connected => {
                    *state = ConnState::Connected;
                    ConnectAction::Ready(Ok(()))
                },
                ConnState::Failed => {
                    *state = ConnState::Failed;
                    ConnectAction::Ready(Err(not_connected()))
                },
            }
        };

        let socket = match action {
            ConnectAction::Start(socket) => socket,
            ConnectAction::Wait => {
                self.waiters.lock().push((task.clone(), handler));
                return;
            },
            ConnectAction::Ready(result) => {
                task.send(move || handler(result));
                return;
            },
        };

        let hard = self.cancel.clone();
        let token = self.connect_cancel.lock().clone();
        let task = task.clone();
        let weak = self.weak();
        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = hard.cancelled() => Err(interrupted("dispatch closed")),
                _ = token.cancelled() => Err(interrupted("connect canceled")),
                result = socket.connect(dest) => result,
            };
            let result = match connected {
                Ok(stream) => match weak.upgrade() {
                    Some(io) => {
                        let _ = stream.set_nodelay(true);
                        let (read_half, write_half) = stream.into_split();
                        *io.reader.lock().await = Some(read_half);
                        *io.writer.lock().await = Some(write_half);
                        *io.state.lock() = ConnState::Connected;
                        io.drain_waiters(true);
                        Ok(())
                    },
                    None => Err(interrupted("dispatch dropped")),
                },
                Err(err) => {
                    if let Some(io) = weak.upgrade() {
                        *io.state.lock() = ConnState::Failed;
                        io.mark_closed();
                        io.drain_waiters(false);
                    }
                    Err(err)
                },
            };
            task.send(move || handler(result));
        });
    }

    fn send_to(
        &self,
        payload: Bytes,
        _dest: Option<SocketAddr>,
        _dscp: Option<u8>,
        task: &Task,
        handler: IoHandler,
    ) {
        // DSCP was applied when the socket was prepared.
        let hard = self.cancel.clone();
        let token = self.send_cancel.lock().clone();
        let task = task.clone();
        let weak = self.weak();
        tokio::spawn(async move {
            let write = async {
                let Some(io) = weak.upgrade() else {
                    return Err(interrupted("dispatch dropped"));
                };
                let mut writer = io.writer.lock().await;
                let Some(writer) = writer.as_mut() else {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "socket is not connected",
                    ));
                };
                writer.write_all(&payload).await
            };
            let result = tokio::select! {
                _ = hard.cancelled() => Err(interrupted("dispatch closed")),
                _ = token.cancelled() => Err(interrupted("send canceled")),
                result = write => result,
            };
            task.send(move || handler(result));
        });
    }

    fn cancel(&self, which: SocketCancel) {
        let cell = match which {
            SocketCancel::Connect => &self.connect_cancel,
            SocketCancel::Send => &self.send_cancel,
        };
        let mut token = cell.lock();
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// A TCP dispatch: one connection to one peer, shared by every request
/// whose message id it carries. The engine drives the connect; once it
/// completes, [`Dispatch::start_tcp`] spawns the framed receive loop.
pub struct TcpDispatch {
    attrs: DispatchAttrs,
    dest: SocketAddr,
    src: Option<SocketAddr>,
    io: Arc<TcpIo>,
    slots: Arc<DashMap<u16, Slot>>,
    started: AtomicBool,
}

impl TcpDispatch {
    /// Prepare a bound, DSCP-marked socket for `dest` without connecting.
    pub fn create(
        src: Option<SocketAddr>,
        dest: SocketAddr,
        dscp: Option<u8>,
    ) -> Result<Arc<Self>, DispatchError> {
        let socket = if dest.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(src) = src {
            // The source port is never pinned for outgoing TCP.
            let mut bind_addr = src;
            bind_addr.set_port(0);
            socket.bind(bind_addr)?;
        }
        if let Some(dscp) = dscp {
            apply_dscp(&socket, dscp, dest.is_ipv4());
        }

        let attrs = DispatchAttrs::TCP
            | if dest.is_ipv4() {
                DispatchAttrs::IPV4
            } else {
                DispatchAttrs::IPV6
            };

        let io = Arc::new(TcpIo {
            dest,
            state: Mutex::new(ConnState::Unconnected(socket)),
            waiters: Mutex::new(Vec::new()),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connect_cancel: Mutex::new(CancellationToken::new()),
            send_cancel: Mutex::new(CancellationToken::new()),
            self_weak: OnceCell::new(),
        });
        io.attach_self();

        debug!("tcp dispatch: prepared for {dest}");
        Ok(Arc::new(Self {
            attrs,
            dest,
            src,
            io,
            slots: Arc::new(DashMap::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn src(&self) -> Option<SocketAddr> {
        self.src
    }

    /// Whether the connect has completed.
    pub fn is_connected(&self) -> bool {
        self.io.is_connected()
    }

    /// Whether the connection failed or was torn down.
    pub fn is_closed(&self) -> bool {
        self.io.closed.load(Ordering::SeqCst)
    }
}

impl Dispatch for TcpDispatch {
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
        if self.is_closed() {
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
        Ok((id, Arc::new(TcpEntry { id })))
    }

    fn remove_response(&self, entry: &dyn DispatchEntry) {
        self.slots.remove(&entry.id());
    }

    fn socket(&self) -> Arc<dyn Socket> {
        self.io.clone()
    }

    fn start_tcp(&self) {
        if !self.is_connected() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(read_loop(self.io.clone(), self.slots.clone()));
    }
}

impl Drop for TcpDispatch {
    fn drop(&mut self) {
        self.io.cancel.cancel();
        self.io.mark_closed();
        fail_slots(&self.slots);
    }
}

/// Read length-prefixed DNS messages off the connection and route them by
/// message id. Any read failure is terminal for the whole dispatch: every
/// outstanding slot fails.
async fn read_loop(io: Arc<TcpIo>, slots: Arc<DashMap<u16, Slot>>) {
    let Some(mut reader) = io.reader.lock().await.take() else {
        return;
    };
    let mut scratch = BytesMut::new();

    loop {
        let frame = tokio::select! {
            _ = io.cancel.cancelled() => Err(interrupted("dispatch closed")),
            frame = read_frame(&mut reader, &mut scratch) => frame,
        };
        match frame {
            Ok(frame) => route_message(&slots, &frame, None),
            Err(err) => {
                warn!("tcp dispatch to {}: read failed: {err}", io.dest);
                io.mark_closed();
                fail_slots(&slots);
                return;
            },
        }
    }
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    scratch: &mut BytesMut,
) -> io::Result<Bytes> {
    let mut len_prefix = [0u8; 2];
    reader.read_exact(&mut len_prefix).await?;
    let len = usize::from(u16::from_be_bytes(len_prefix));

    scratch.clear();
    scratch.resize(len, 0);
    reader.read_exact(&mut scratch[..len]).await?;
    Ok(scratch.split_to(len).freeze())
}
