// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod create;
pub mod request;
pub mod task;
pub mod timer;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bitflags::bitflags;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::{
    dispatch::{Dispatch, DispatchAttrs, DispatchError, DispatchManager},
    engine::{request::RequestInner, task::Task},
    message::MessageError,
};

/// Size of the shard-lock bank. Requests are assigned round-robin and keep
/// their shard for life, so per-request work only contends within a shard.
const NSHARDS: usize = 7;

/// Error kinds surfaced to callers, either synchronously from the factories
/// or through the completion callback.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    TimedOut,
    #[error("request canceled")]
    Canceled,
    #[error("destination address is blackholed")]
    Blackholed,
    #[error("query is not a valid DNS message")]
    FormErr,
    #[error("request engine is shutting down")]
    ShuttingDown,
    #[error("source and destination address families differ")]
    FamilyMismatch,
    #[error("no dispatch available for the destination address family")]
    FamilyNotSupported,
    #[error("no response has been received yet")]
    NotReady,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Outcome delivered to the completion callback: `Ok(())` means a response
/// arrived and can be read with [`request::Request::get_response`].
pub type RequestResult = Result<(), RequestError>;

/// Completion callback. Runs on the caller's [`Task`], exactly once per
/// successfully created request.
pub type ResponseCallback = Box<dyn FnOnce(RequestResult) + Send + 'static>;

bitflags! {
    /// Option flags accepted by the request factories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Force TCP even when the query fits a UDP payload.
        const TCP            = 0b0001;
        /// Allow reusing a cached TCP connection to the same peer.
        const SHARE          = 0b0010;
        /// Keep the message id already present in the wire buffer.
        const FIXED_ID       = 0b0100;
        /// Render with case-sensitive name compression.
        const CASE_SENSITIVE = 0b1000;
    }
}

/// Everything a request factory needs to know besides the message itself.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub source: Option<SocketAddr>,
    pub destination: SocketAddr,
    pub dscp: Option<u8>,
    pub flags: RequestFlags,
    /// Overall deadline. Must be non-zero.
    pub timeout: Duration,
    /// UDP retransmission period. Derived from `timeout` and `udp_retries`
    /// when unset.
    pub udp_timeout: Option<Duration>,
    pub udp_retries: u32,
}

impl RequestParams {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(destination: SocketAddr) -> Self {
        Self {
            source: None,
            destination,
            dscp: None,
            flags: RequestFlags::empty(),
            timeout: Self::DEFAULT_TIMEOUT,
            udp_timeout: None,
            udp_retries: 0,
        }
    }

    pub fn source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn dscp(mut self, dscp: u8) -> Self {
        self.dscp = Some(dscp);
        self
    }

    pub fn flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn udp_timeout(mut self, udp_timeout: Duration) -> Self {
        self.udp_timeout = Some(udp_timeout);
        self
    }

    pub fn udp_retries(mut self, udp_retries: u32) -> Self {
        self.udp_retries = udp_retries;
        self
    }
}

struct ShutdownHook {
    task: Task,
    event: Box<dyn FnOnce() + Send + 'static>,
}

pub(crate) struct EngineState {
    eref: usize,
    iref: usize,
    exiting: bool,
    requests: HashMap<u64, Arc<RequestInner>>,
    whenshutdown: Vec<ShutdownHook>,
}

pub(crate) struct EngineInner {
    pub(crate) state: Mutex<EngineState>,
    shards: [Arc<Mutex<()>>; NSHARDS],
    shard_counter: AtomicUsize,
    next_request_id: AtomicU64,
    pub(crate) dispatcher: Arc<dyn DispatchManager>,
    pub(crate) dispatch_v4: Option<Arc<dyn Dispatch>>,
    pub(crate) dispatch_v6: Option<Arc<dyn Dispatch>>,
}

impl EngineInner {
    pub(crate) fn next_shard(&self) -> Arc<Mutex<()>> {
        let idx = self.shard_counter.fetch_add(1, Ordering::Relaxed) % NSHARDS;
        self.shards[idx].clone()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Caller holds the state lock.
    fn shutdown_locked(state: &mut EngineState) {
        if state.exiting {
            return;
        }
        state.exiting = true;
        debug!(
            "engine shutdown: canceling {} live requests",
            state.requests.len()
        );
        for request in state.requests.values() {
            request.post_cancel();
        }
        if state.iref == 0 {
            debug_assert!(state.requests.is_empty());
            Self::send_shutdown_hooks(state);
        }
    }

    /// Caller holds the state lock. Posting is non-blocking.
    fn send_shutdown_hooks(state: &mut EngineState) {
        for hook in state.whenshutdown.drain(..) {
            hook.task.send(hook.event);
        }
    }
}

/// Internal strong handle held by every live request; keeps the engine
/// alive independently of external holders and gates shutdown completion.
pub(crate) struct EngineRef {
    inner: Arc<EngineInner>,
}

impl EngineRef {
    /// Caller holds the state lock and has checked `exiting`.
    pub(crate) fn attach_locked(inner: &Arc<EngineInner>, state: &mut EngineState) -> Self {
        state.iref += 1;
        debug!("engine attach: eref {} iref {}", state.eref, state.iref);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for EngineRef {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.iref > 0);
        state.iref -= 1;
        debug!("engine detach: eref {} iref {}", state.eref, state.iref);
        if state.iref == 0 && state.exiting {
            debug_assert!(state.requests.is_empty());
            EngineInner::send_shutdown_hooks(&mut state);
        }
    }
}

/// The request engine: registry of live requests, shared dispatch
/// selection, shutdown orchestration.
///
/// `RequestEngine` is a clonable external handle. The engine stays alive
/// while any handle or any live request exists; the last external handle to
/// drop shuts the engine down if nobody did explicitly.
pub struct RequestEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl RequestEngine {
    /// Create an engine on top of a dispatch manager, with optional default
    /// UDP dispatches used for requests that do not pin a source address.
    ///
    /// # Panics
    ///
    /// Panics if a default dispatch does not carry the UDP attribute.
    pub fn create(
        dispatcher: Arc<dyn DispatchManager>,
        dispatch_v4: Option<Arc<dyn Dispatch>>,
        dispatch_v6: Option<Arc<dyn Dispatch>>,
    ) -> Self {
        for dispatch in [dispatch_v4.as_ref(), dispatch_v6.as_ref()]
            .into_iter()
            .flatten()
        {
            assert!(
                dispatch.attributes().contains(DispatchAttrs::UDP),
                "default dispatches must be UDP"
            );
        }

        debug!("engine create");
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    eref: 1,
                    iref: 0,
                    exiting: false,
                    requests: HashMap::new(),
                    whenshutdown: Vec::new(),
                }),
                shards: std::array::from_fn(|_| Arc::new(Mutex::new(()))),
                shard_counter: AtomicUsize::new(0),
                next_request_id: AtomicU64::new(1),
                dispatcher,
                dispatch_v4,
                dispatch_v6,
            }),
        }
    }

    /// Cancel every live request and refuse new ones. Idempotent. Shutdown
    /// completes — and `when_shutdown` events fire — once every request has
    /// delivered its callback and been released by its caller.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        EngineInner::shutdown_locked(&mut state);
    }

    /// Run `event` on `task` once shutdown has been initiated; immediately
    /// when it already was.
    pub fn when_shutdown(&self, task: &Task, event: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.exiting {
            task.send(event);
        } else {
            state.whenshutdown.push(ShutdownHook {
                task: task.clone(),
                event: Box::new(event),
            });
        }
    }
}

impl Clone for RequestEngine {
    fn clone(&self) -> Self {
        let mut state = self.inner.state.lock();
        state.eref += 1;
        debug!("engine attach: eref {} iref {}", state.eref, state.iref);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for RequestEngine {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.eref > 0);
        state.eref -= 1;
        debug!("engine detach: eref {} iref {}", state.eref, state.iref);
        if state.eref == 0 {
            EngineInner::shutdown_locked(&mut state);
        }
    }
}
