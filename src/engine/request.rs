// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, net::SocketAddr, sync::Arc};

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    dispatch::{
        Dispatch, DispatchAttrs, DispatchEntry, DispatchError, Socket, SocketCancel,
    },
    engine::{
        EngineInner, EngineRef, RequestError, RequestResult, ResponseCallback,
        task::Task,
        timer::{TimerEvent, TimerHandle},
    },
    message::{ParseOptions, ResponseMessage, TsigKey},
};

bitflags! {
    /// Request state bits, guarded by the shard lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StateFlags: u32 {
        const CONNECTING = 0b0000_0001;
        const SENDING    = 0b0000_0010;
        /// Sticky: once set it is never cleared.
        const CANCELED   = 0b0000_0100;
        /// Canceled because the overall timer expired.
        const TIMEDOUT   = 0b0000_1000;
        /// The request went over TCP.
        const TCP        = 0b0001_0000;
    }
}

/// Mutable request state. Only touched while holding the request's shard
/// lock; the inner mutex is never contended on its own.
pub(crate) struct ReqVars {
    pub(crate) flags: StateFlags,
    /// A cancel control event is on its way to the caller's task.
    pub(crate) canceling: bool,
    /// Remaining UDP retransmissions.
    pub(crate) udp_count: u32,
    /// First terminal result proposed by any handler; what the callback
    /// will eventually see.
    pub(crate) result: Option<RequestResult>,
    /// Completion callback slot. Taken exactly once.
    pub(crate) event: Option<ResponseCallback>,
    pub(crate) query: Option<Bytes>,
    pub(crate) answer: Option<Bytes>,
    pub(crate) dispatch: Option<Arc<dyn Dispatch>>,
    pub(crate) entry: Option<Arc<dyn DispatchEntry>>,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) tsig_key: Option<TsigKey>,
    pub(crate) query_tsig: Option<Bytes>,
    pub(crate) engine_ref: Option<EngineRef>,
}

/// One in-flight query. The public face is [`Request`]; handlers run on the
/// caller's task against this shared state.
pub(crate) struct RequestInner {
    pub(crate) id: u64,
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) shard: Arc<Mutex<()>>,
    pub(crate) task: Task,
    pub(crate) dest: SocketAddr,
    pub(crate) dscp: Option<u8>,
    pub(crate) vars: Mutex<ReqVars>,
}

impl RequestInner {
    pub(crate) fn new(
        engine: Arc<EngineInner>,
        task: Task,
        dest: SocketAddr,
        dscp: Option<u8>,
        udp_count: u32,
    ) -> Arc<Self> {
        let id = engine.next_request_id();
        let shard = engine.next_shard();
        let inner = Arc::new(Self {
            id,
            engine,
            shard,
            task,
            dest,
            dscp,
            vars: Mutex::new(ReqVars {
                flags: StateFlags::empty(),
                canceling: false,
                udp_count,
                result: None,
                event: None,
                query: None,
                answer: None,
                dispatch: None,
                entry: None,
                timer: None,
                tsig_key: None,
                query_tsig: None,
                engine_ref: None,
            }),
        });
        inner.install_timer();
        inner
    }

    /// Create the (inactive) request timer; armed later, after admission.
    fn install_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timer = TimerHandle::new(self.task.clone(), move |event| {
            if let Some(request) = weak.upgrade() {
                request.on_timer(event);
            }
        });
        self.vars.lock().timer = Some(timer);
    }

    /// The socket current I/O should run on: the per-entry socket on
    /// exclusive dispatches, the shared dispatch socket otherwise.
    fn current_socket(vars: &ReqVars) -> Option<Arc<dyn Socket>> {
        let dispatch = vars.dispatch.as_ref()?;
        if dispatch.attributes().contains(DispatchAttrs::EXCLUSIVE)
            && let Some(sock) = vars.entry.as_ref().and_then(|entry| entry.socket())
        {
            return Some(sock);
        }
        Some(dispatch.socket())
    }

    /// Record the first terminal result; later proposals lose.
    fn propose(vars: &mut ReqVars, result: RequestResult) {
        if vars.result.is_none() {
            vars.result = Some(result);
        }
    }

    /// Emit the completion iff nothing is pending: callback slot occupied,
    /// no cancel control event in flight, no connect or send outstanding,
    /// and a result has been decided. Called at the end of every handler.
    fn send_if_done(&self, vars: &mut ReqVars) {
        if vars.canceling
            || vars
                .flags
                .intersects(StateFlags::CONNECTING | StateFlags::SENDING)
            || vars.result.is_none()
            || vars.event.is_none()
        {
            return;
        }
        if let (Some(callback), Some(result)) = (vars.event.take(), vars.result.take()) {
            debug!("request {}: completion {:?}", self.id, result);
            self.task.send(move || callback(result));
        }
    }

    /// The terminal result already chosen for a canceled request.
    fn canceled_result(vars: &ReqVars) -> RequestResult {
        if vars.flags.contains(StateFlags::TIMEDOUT) {
            Err(RequestError::TimedOut)
        } else {
            Err(RequestError::Canceled)
        }
    }

    /// Issue a send of the wire query. Completion arrives at
    /// [`RequestInner::on_send_done`]. A request whose dispatch is already
    /// torn down silently skips the send; its terminal event is on its way.
    pub(crate) fn issue_send(
        self: &Arc<Self>,
        vars: &mut ReqVars,
        dest: Option<SocketAddr>,
    ) {
        let Some(sock) = Self::current_socket(vars) else {
            return;
        };
        let Some(query) = vars.query.clone() else {
            return;
        };
        vars.flags.insert(StateFlags::SENDING);
        debug!("request {}: sending {} bytes", self.id, query.len());

        let weak = Arc::downgrade(self);
        sock.send_to(
            query,
            dest,
            self.dscp,
            &self.task,
            Box::new(move |result| {
                if let Some(request) = weak.upgrade() {
                    request.on_send_done(result);
                }
            }),
        );
    }

    /// Issue the TCP connect. Completion arrives at
    /// [`RequestInner::on_connect`]. Caller holds the shard lock and has set
    /// `CONNECTING | TCP`.
    pub(crate) fn issue_connect(self: &Arc<Self>, vars: &mut ReqVars) {
        let Some(sock) = Self::current_socket(vars) else {
            return;
        };
        debug!("request {}: connecting to {}", self.id, self.dest);

        let weak = Arc::downgrade(self);
        sock.connect(
            self.dest,
            &self.task,
            Box::new(move |result| {
                if let Some(request) = weak.upgrade() {
                    request.on_connect(result);
                }
            }),
        );
    }

    /// Stop the request: detach the timer, cancel outstanding socket I/O,
    /// drop the response slot, release the dispatch. After this no *new*
    /// completions arrive; ones already queued observe `CANCELED` and stay
    /// silent.
    pub(crate) fn req_cancel(vars: &mut ReqVars) {
        vars.flags.insert(StateFlags::CANCELED);

        if let Some(timer) = vars.timer.take() {
            timer.detach();
        }
        if vars
            .flags
            .intersects(StateFlags::CONNECTING | StateFlags::SENDING)
            && let Some(sock) = Self::current_socket(vars)
        {
            if vars.flags.contains(StateFlags::CONNECTING) {
                sock.cancel(SocketCancel::Connect);
            }
            if vars.flags.contains(StateFlags::SENDING) {
                sock.cancel(SocketCancel::Send);
            }
        }
        if let (Some(entry), Some(dispatch)) = (vars.entry.take(), vars.dispatch.as_ref())
        {
            dispatch.remove_response(entry.as_ref());
        }
        vars.dispatch = None;
    }

    /// Connect completion.
    pub(crate) fn on_connect(self: &Arc<Self>, result: io::Result<()>) {
        let _shard = self.shard.lock();
        let mut vars = self.vars.lock();
        debug!("request {}: connected ({:?})", self.id, result);
        vars.flags.remove(StateFlags::CONNECTING);

        if vars.flags.contains(StateFlags::CANCELED) {
            let result = Self::canceled_result(&vars);
            Self::propose(&mut vars, result);
        } else {
            match result {
                Ok(()) => {
                    if let Some(dispatch) = vars.dispatch.clone() {
                        dispatch.start_tcp();
                    }
                    self.issue_send(&mut vars, None);
                },
                Err(err) => {
                    warn!("request {}: connect failed: {err}", self.id);
                    Self::req_cancel(&mut vars);
                    Self::propose(&mut vars, Err(RequestError::Canceled));
                },
            }
        }
        self.send_if_done(&mut vars);
    }

    /// Send completion. On success there is nothing to do but wait for the
    /// dispatcher or the timer.
    pub(crate) fn on_send_done(self: &Arc<Self>, result: io::Result<()>) {
        let _shard = self.shard.lock();
        let mut vars = self.vars.lock();
        debug!("request {}: send done ({:?})", self.id, result);
        vars.flags.remove(StateFlags::SENDING);

        if vars.flags.contains(StateFlags::CANCELED) {
            let result = Self::canceled_result(&vars);
            Self::propose(&mut vars, result);
        } else if let Err(err) = result {
            warn!("request {}: send failed: {err}", self.id);
            Self::req_cancel(&mut vars);
            Self::propose(&mut vars, Err(RequestError::Canceled));
        }
        self.send_if_done(&mut vars);
    }

    /// A response (or a terminal dispatch error) for our message id.
    pub(crate) fn on_response(self: &Arc<Self>, result: Result<Bytes, DispatchError>) {
        let _shard = self.shard.lock();
        let mut vars = self.vars.lock();
        match result {
            Ok(answer) => {
                debug!("request {}: response of {} bytes", self.id, answer.len());
                vars.answer = Some(answer);
                Self::propose(&mut vars, Ok(()));
            },
            Err(err) => {
                debug!("request {}: response error: {err}", self.id);
                Self::propose(&mut vars, Err(err.into()));
            },
        }
        Self::req_cancel(&mut vars);
        self.send_if_done(&mut vars);
    }

    /// Timer event: either a UDP retransmission tick or the overall
    /// deadline. The retry counter decrements on every tick, including one
    /// that coincides with exhaustion; the deadline event leaves it alone.
    pub(crate) fn on_timer(self: &Arc<Self>, event: TimerEvent) {
        let _shard = self.shard.lock();
        let mut vars = self.vars.lock();
        debug!("request {}: timer {:?}", self.id, event);

        let mut resend = false;
        if event == TimerEvent::Tick {
            let prev = vars.udp_count;
            vars.udp_count = prev.wrapping_sub(1);
            resend = prev != 0;
        }

        if resend {
            if !vars.flags.contains(StateFlags::SENDING) {
                let dest = self.dest;
                self.issue_send(&mut vars, Some(dest));
            }
        } else {
            vars.flags.insert(StateFlags::TIMEDOUT);
            Self::req_cancel(&mut vars);
            Self::propose(&mut vars, Err(RequestError::TimedOut));
        }
        self.send_if_done(&mut vars);
    }

    /// The cancel control event, running in the caller's task like every
    /// other callback.
    fn do_cancel(self: &Arc<Self>) {
        let _shard = self.shard.lock();
        let mut vars = self.vars.lock();
        vars.canceling = false;
        if !vars.flags.contains(StateFlags::CANCELED) {
            Self::req_cancel(&mut vars);
        }
        Self::propose(&mut vars, Err(RequestError::Canceled));
        self.send_if_done(&mut vars);
    }

    /// Post the cancel control event unless one is already pending or the
    /// request is already canceled. Never blocks; idempotent.
    pub(crate) fn post_cancel(self: &Arc<Self>) {
        let _shard = self.shard.lock();
        let mut vars = self.vars.lock();
        if !vars.canceling && !vars.flags.contains(StateFlags::CANCELED) {
            debug!("request {}: cancel requested", self.id);
            vars.canceling = true;
            let this = self.clone();
            self.task.send(move || this.do_cancel());
        }
    }

    /// Unlink from the engine and drop the callback slot. A request that
    /// has not completed yet is torn down without ever firing its callback.
    fn release(self: &Arc<Self>) {
        debug!("request {}: destroy", self.id);
        let engine_ref = {
            let mut state = self.engine.state.lock();
            let _shard = self.shard.lock();
            let mut vars = self.vars.lock();
            state.requests.remove(&self.id);
            if vars.event.take().is_some()
                && !vars.flags.contains(StateFlags::CANCELED)
            {
                Self::req_cancel(&mut vars);
            }
            vars.engine_ref.take()
        };
        // The internal engine ref is dropped with no locks held: it may
        // complete shutdown.
        drop(engine_ref);
    }
}

/// A single in-flight DNS query.
///
/// Created by [`crate::engine::RequestEngine::create_raw`] or
/// [`crate::engine::RequestEngine::create_via`]. The completion callback
/// fires exactly once; afterwards the answer can be fetched through
/// [`Request::answer`] or parsed with [`Request::get_response`]. Dropping
/// the handle (or calling [`Request::destroy`]) releases the request; once
/// released, no further event referencing it is delivered.
pub struct Request {
    inner: Option<Arc<RequestInner>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.as_ref().map(|inner| inner.id))
            .finish()
    }
}

impl Request {
    pub(crate) fn new(inner: Arc<RequestInner>) -> Self {
        Self { inner: Some(inner) }
    }

    fn inner(&self) -> &Arc<RequestInner> {
        // `inner` is only vacated by destroy(), which consumes the handle.
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("request handle already destroyed"),
        }
    }

    /// Request cooperative cancellation. May be called any number of times
    /// and may lose the race against a response, a timeout, or an I/O
    /// failure; whichever event wins decides the terminal result, and the
    /// callback still fires exactly once.
    pub fn cancel(&self) {
        self.inner().post_cancel();
    }

    /// Whether the query went out over TCP.
    pub fn used_tcp(&self) -> bool {
        let inner = self.inner();
        let _shard = inner.shard.lock();
        let flags = inner.vars.lock().flags;
        flags.contains(StateFlags::TCP)
    }

    /// The raw answer, once a response has been received.
    pub fn answer(&self) -> Option<Bytes> {
        let inner = self.inner();
        let _shard = inner.shard.lock();
        inner.vars.lock().answer.clone()
    }

    /// Parse the received answer into `message`, replaying the query TSIG
    /// and key, and verify the response signature when a key was attached.
    pub fn get_response<M: ResponseMessage>(
        &self,
        message: &mut M,
        options: ParseOptions,
    ) -> Result<(), RequestError> {
        let inner = self.inner();
        let (answer, query_tsig, tsig_key) = {
            let _shard = inner.shard.lock();
            let vars = inner.vars.lock();
            let Some(answer) = vars.answer.clone() else {
                return Err(RequestError::NotReady);
            };
            (answer, vars.query_tsig.clone(), vars.tsig_key.clone())
        };

        // Codec calls run without any engine lock held.
        message.set_query_tsig(query_tsig.as_ref())?;
        message.set_tsig_key(tsig_key.as_ref())?;
        message.parse(&answer, options)?;
        if tsig_key.is_some() {
            message.verify_tsig(&answer)?;
        }
        Ok(())
    }

    /// Release the request. Equivalent to dropping the handle.
    pub fn destroy(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}
