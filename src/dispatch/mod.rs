// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod manager;
pub mod tcp;
pub mod udp;

use std::{io, net::SocketAddr, sync::Arc};

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

use crate::{acl::Acl, engine::task::Task};

bitflags! {
    /// Attributes a dispatch exposes to the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispatchAttrs: u32 {
        const UDP       = 0b0000_0001;
        const TCP       = 0b0000_0010;
        /// Each response entry owns its own socket.
        const EXCLUSIVE = 0b0000_0100;
        const IPV4      = 0b0000_1000;
        const IPV6      = 0b0001_0000;
    }
}

/// Which in-flight socket operation a cancel targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCancel {
    Connect,
    Send,
}

/// Completion handler for a connect or send issued on a [`Socket`].
pub type IoHandler = Box<dyn FnOnce(io::Result<()>) + Send + Sync + 'static>;

/// Delivery handler for a registered response slot. Fires at most once.
pub type ResponseHandler =
    Box<dyn FnOnce(Result<Bytes, DispatchError>) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message id {0:#06x} is already in use")]
    IdInUse(u16),
    #[error("no free message id")]
    NoFreeId,
    #[error("dispatch is shutting down")]
    Exiting,
    #[error("connection to the peer was lost")]
    ConnectionLost,
    #[error("dispatch i/o failed: {0}")]
    Io(String),
}

impl From<io::Error> for DispatchError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Asynchronous socket surface the engine drives.
///
/// `connect` and `send_to` never block and never fail synchronously: the
/// outcome is posted to `task` through the supplied handler, mirroring how
/// every other request event is delivered. `cancel` aborts matching
/// in-flight operations; their handlers still run, with an error result.
pub trait Socket: Send + Sync {
    fn connect(&self, dest: SocketAddr, task: &Task, handler: IoHandler);

    /// Send one datagram/frame. `dest` is `None` on connected sockets.
    fn send_to(
        &self,
        payload: Bytes,
        dest: Option<SocketAddr>,
        dscp: Option<u8>,
        task: &Task,
        handler: IoHandler,
    );

    fn cancel(&self, which: SocketCancel);
}

/// A reservation binding one 16-bit message id to a response handler.
pub trait DispatchEntry: Send + Sync {
    fn id(&self) -> u16;

    /// The per-entry socket, for dispatches with [`DispatchAttrs::EXCLUSIVE`].
    fn socket(&self) -> Option<Arc<dyn Socket>>;
}

/// A socket shared by many requests: allocates message ids and routes
/// incoming messages back to the entry that registered each id.
pub trait Dispatch: Send + Sync {
    fn attributes(&self) -> DispatchAttrs;

    /// Register a response slot. `fixed_id` pins the caller-chosen id and
    /// fails with [`DispatchError::IdInUse`] on collision; otherwise the
    /// dispatch picks a free id. The handler is posted to `task` when a
    /// response for the id arrives from `dest`, or when the dispatch fails
    /// terminally.
    fn add_response(
        &self,
        fixed_id: Option<u16>,
        dest: SocketAddr,
        task: &Task,
        handler: ResponseHandler,
    ) -> Result<(u16, Arc<dyn DispatchEntry>), DispatchError>;

    /// Drop a response slot. Safe to call at any time; a handler that was
    /// already posted may still run.
    fn remove_response(&self, entry: &dyn DispatchEntry);

    /// The shared dispatch socket.
    fn socket(&self) -> Arc<dyn Socket>;

    /// Begin reading from a TCP dispatch once its socket has connected.
    /// A no-op on UDP dispatches and on TCP dispatches already started.
    fn start_tcp(&self);
}

/// Best-effort DSCP marking: the 6-bit code point shifted into the IP
/// TOS/TCLASS byte. Failures are logged, not surfaced; marking is advisory.
pub(crate) fn apply_dscp<S: std::os::fd::AsFd>(socket: &S, dscp: u8, v4: bool) {
    let tos = u32::from(dscp) << 2;
    let sock = socket2::SockRef::from(socket);
    let result = if v4 {
        sock.set_tos_v4(tos)
    } else {
        sock.set_tclass_v6(tos)
    };
    if let Err(err) = result {
        tracing::debug!("failed to apply dscp {dscp}: {err}");
    }
}

/// Factory and cache for dispatches, the engine's view of the socket pool.
pub trait DispatchManager: Send + Sync {
    /// A UDP dispatch bound to `src` (shared with other requests using the
    /// same source).
    fn get_udp(&self, src: SocketAddr) -> Result<Arc<dyn Dispatch>, DispatchError>;

    /// An existing TCP dispatch to `dest` from `src`, together with whether
    /// its connect already completed. Pending dispatches are eligible; the
    /// `connected` flag tells the caller to defer its first send to the
    /// owner's connect completion.
    fn get_tcp(
        &self,
        dest: SocketAddr,
        src: Option<SocketAddr>,
    ) -> Option<(Arc<dyn Dispatch>, bool)>;

    /// A fresh, not-yet-connected TCP dispatch to `dest`, bound to `src`
    /// when given.
    fn create_tcp(
        &self,
        src: Option<SocketAddr>,
        dest: SocketAddr,
        dscp: Option<u8>,
    ) -> Result<Arc<dyn Dispatch>, DispatchError>;

    /// Destinations queries must never be sent to.
    fn blackhole(&self) -> Option<Arc<dyn Acl>>;
}
