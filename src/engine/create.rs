// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{BufMut, BytesMut};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    dispatch::{Dispatch, DispatchError, ResponseHandler},
    engine::{
        EngineRef, RequestEngine, RequestError, RequestFlags, RequestParams,
        ResponseCallback,
        request::{Request, RequestInner, StateFlags},
        task::Task,
        timer::TimerKind,
    },
    message::{QueryMessage, RenderOptions, TsigKey, wire},
};

impl RequestEngine {
    /// Send an already-rendered wire message.
    ///
    /// The message id is taken from the buffer when
    /// [`RequestFlags::FIXED_ID`] is set; otherwise the dispatch assigns a
    /// fresh one and the first two bytes of the buffer are overwritten with
    /// it. Transport is TCP when [`RequestFlags::TCP`] is set or the buffer
    /// exceeds the UDP payload limit.
    ///
    /// # Panics
    ///
    /// Panics if `params.timeout` is zero.
    pub fn create_raw(
        &self,
        query: &[u8],
        params: &RequestParams,
        task: &Task,
        callback: ResponseCallback,
    ) -> Result<Request, RequestError> {
        assert!(params.timeout > Duration::ZERO, "timeout must be non-zero");
        debug!("create_raw: {} bytes for {}", query.len(), params.destination);

        check_family(params.source, params.destination)?;
        if self.is_blackholed(&params.destination) {
            return Err(RequestError::Blackholed);
        }
        if query.len() < wire::HEADER_LEN || query.len() > wire::MAX_MESSAGE_LEN {
            return Err(RequestError::FormErr);
        }

        let tcp = params.flags.contains(RequestFlags::TCP)
            || query.len() > wire::MAX_UDP_PAYLOAD;
        let share = params.flags.contains(RequestFlags::SHARE);
        let fixed = params.flags.contains(RequestFlags::FIXED_ID);

        let inner = self.new_request(params, task, callback);

        let mut newtcp = false;
        let (connected, id) = loop {
            let (dispatch, connected) =
                match self.get_dispatch(tcp, newtcp, share, params) {
                    Ok(found) => found,
                    Err(err) => {
                        unwind(&inner);
                        return Err(err);
                    },
                };

            let want_id = if fixed { wire::message_id(query) } else { None };
            match dispatch.add_response(
                want_id,
                params.destination,
                task,
                response_handler(&inner),
            ) {
                Ok((id, entry)) => {
                    let mut vars = inner.vars.lock();
                    vars.dispatch = Some(dispatch);
                    vars.entry = Some(entry);
                    break (connected, id);
                },
                Err(DispatchError::IdInUse(id)) if fixed && !newtcp => {
                    // One retry over a fresh TCP connection.
                    debug!("create_raw: id {id:#06x} in use, retrying with new TCP");
                    newtcp = true;
                },
                Err(err) => {
                    unwind(&inner);
                    return Err(err.into());
                },
            }
        };

        // Frame the payload and stamp the message id behind the length
        // prefix, if any.
        let mut buf = BytesMut::with_capacity(query.len() + if tcp { 2 } else { 0 });
        if tcp {
            buf.put_u16(query.len() as u16);
        }
        buf.extend_from_slice(query);
        let offset = if tcp { 2 } else { 0 };
        wire::set_message_id(&mut buf[offset..], id);
        inner.vars.lock().query = Some(buf.freeze());

        self.admit(&inner)?;
        self.arm_timer(&inner, params, tcp);
        self.launch(&inner, tcp, connected);

        debug!("create_raw: request {}", inner.id);
        Ok(Request::new(inner))
    }

    /// Render and send a structured message, optionally TSIG-signed.
    ///
    /// If the rendered message is too large for UDP and TCP was not
    /// requested, the engine switches to TCP and re-renders.
    ///
    /// # Panics
    ///
    /// Panics if `params.timeout` is zero.
    pub fn create_via<M: QueryMessage>(
        &self,
        message: &mut M,
        tsig_key: Option<&TsigKey>,
        params: &RequestParams,
        task: &Task,
        callback: ResponseCallback,
    ) -> Result<Request, RequestError> {
        assert!(params.timeout > Duration::ZERO, "timeout must be non-zero");
        debug!("create_via: for {}", params.destination);

        check_family(params.source, params.destination)?;
        if self.is_blackholed(&params.destination) {
            return Err(RequestError::Blackholed);
        }

        let share = params.flags.contains(RequestFlags::SHARE);
        let render_options = RenderOptions {
            case_sensitive: params.flags.contains(RequestFlags::CASE_SENSITIVE),
        };

        let inner = self.new_request(params, task, callback);
        inner.vars.lock().tsig_key = tsig_key.cloned();

        let mut tcp = params.flags.contains(RequestFlags::TCP);
        let mut set_key = true;
        let connected = loop {
            let (dispatch, connected) = match self.get_dispatch(tcp, false, share, params)
            {
                Ok(found) => found,
                Err(err) => {
                    unwind(&inner);
                    return Err(err);
                },
            };

            let (id, entry) = match dispatch.add_response(
                None,
                params.destination,
                task,
                response_handler(&inner),
            ) {
                Ok(slot) => slot,
                Err(err) => {
                    unwind(&inner);
                    return Err(err.into());
                },
            };
            {
                let mut vars = inner.vars.lock();
                vars.dispatch = Some(dispatch);
                vars.entry = Some(entry);
            }

            message.set_id(id);
            if set_key {
                let key = inner.vars.lock().tsig_key.clone();
                if let Err(err) = message.set_tsig_key(key.as_ref()) {
                    unwind(&inner);
                    return Err(err.into());
                }
            }

            let rendered = match message.render(render_options) {
                Ok(rendered) => rendered,
                Err(err) => {
                    message.reset();
                    unwind(&inner);
                    return Err(err.into());
                },
            };

            if !tcp && rendered.len() > wire::MAX_UDP_PAYLOAD {
                // Too large for UDP: re-render for TCP over a fresh
                // dispatch. The key is already attached.
                debug!("create_via: {} bytes, promoting to TCP", rendered.len());
                message.reset();
                drop_slot(&inner);
                tcp = true;
                set_key = false;
                continue;
            }

            let mut vars = inner.vars.lock();
            vars.query_tsig = message.take_query_tsig();
            vars.query = Some(wire::frame_query(&rendered, tcp));
            break connected;
        };

        self.admit(&inner)?;
        self.arm_timer(&inner, params, tcp);
        self.launch(&inner, tcp, connected);

        debug!("create_via: request {}", inner.id);
        Ok(Request::new(inner))
    }

    fn new_request(
        &self,
        params: &RequestParams,
        task: &Task,
        callback: ResponseCallback,
    ) -> Arc<RequestInner> {
        let inner = RequestInner::new(
            self.inner.clone(),
            task.clone(),
            params.destination,
            params.dscp,
            params.udp_retries,
        );
        inner.vars.lock().event = Some(callback);
        inner
    }

    fn is_blackholed(&self, dest: &SocketAddr) -> bool {
        let blackholed = self
            .inner
            .dispatcher
            .blackhole()
            .is_some_and(|acl| acl.is_match(&dest.ip()));
        if blackholed {
            debug!("blackholed address {dest}");
        }
        blackholed
    }

    /// Pick the dispatch for this request: the engine default or a
    /// per-source UDP dispatch, or a shared/new TCP dispatch.
    fn get_dispatch(
        &self,
        tcp: bool,
        newtcp: bool,
        share: bool,
        params: &RequestParams,
    ) -> Result<(Arc<dyn Dispatch>, bool), RequestError> {
        if tcp {
            if !newtcp
                && share
                && let Some((dispatch, connected)) = self
                    .inner
                    .dispatcher
                    .get_tcp(params.destination, params.source)
            {
                debug!(
                    "attached to {} TCP connection to {}",
                    if connected { "existing" } else { "pending" },
                    params.destination
                );
                return Ok((dispatch, connected));
            }
            let dispatch = self.inner.dispatcher.create_tcp(
                params.source,
                params.destination,
                params.dscp,
            )?;
            return Ok((dispatch, false));
        }

        match params.source {
            Some(src) => Ok((self.inner.dispatcher.get_udp(src)?, false)),
            None => {
                let dispatch = if params.destination.is_ipv4() {
                    self.inner.dispatch_v4.clone()
                } else {
                    self.inner.dispatch_v6.clone()
                };
                dispatch
                    .map(|dispatch| (dispatch, false))
                    .ok_or(RequestError::FamilyNotSupported)
            },
        }
    }

    /// Admit the request: refuse when exiting, otherwise link it into the
    /// registry, pick up an internal engine ref and keep the shard for
    /// life.
    fn admit(&self, inner: &Arc<RequestInner>) -> Result<(), RequestError> {
        let mut state = self.inner.state.lock();
        if state.exiting {
            drop(state);
            unwind(inner);
            return Err(RequestError::ShuttingDown);
        }
        let engine_ref = EngineRef::attach_locked(&self.inner, &mut state);
        state.requests.insert(inner.id, inner.clone());
        let _shard = inner.shard.lock();
        inner.vars.lock().engine_ref = Some(engine_ref);
        Ok(())
    }

    /// One-shot at the overall deadline for TCP; limited periodic every
    /// retransmission interval until the deadline for UDP.
    fn arm_timer(&self, inner: &Arc<RequestInner>, params: &RequestParams, tcp: bool) {
        let expiry = Instant::now() + params.timeout;
        let interval = if tcp { None } else { udp_interval(params) };
        let kind = match interval {
            Some(interval) => TimerKind::Limited { expiry, interval },
            None => TimerKind::Once { expiry },
        };
        let _shard = inner.shard.lock();
        if let Some(timer) = &inner.vars.lock().timer {
            timer.reset(kind);
        }
    }

    /// First network action: connect for fresh TCP, send otherwise.
    fn launch(&self, inner: &Arc<RequestInner>, tcp: bool, connected: bool) {
        let _shard = inner.shard.lock();
        let mut vars = inner.vars.lock();
        if tcp && !connected {
            vars.flags.insert(StateFlags::CONNECTING | StateFlags::TCP);
            inner.issue_connect(&mut vars);
        } else {
            let dest = (!connected).then_some(inner.dest);
            inner.issue_send(&mut vars, dest);
        }
    }
}

/// The UDP retransmission period: the caller's, or the overall timeout
/// spread evenly over the initial send plus every retry.
fn udp_interval(params: &RequestParams) -> Option<Duration> {
    let interval = match params.udp_timeout {
        Some(interval) => interval,
        None if params.udp_retries > 0 => params.timeout / (params.udp_retries + 1),
        None => return None,
    };
    Some(interval.max(Duration::from_millis(1)))
}

fn check_family(
    source: Option<SocketAddr>,
    destination: SocketAddr,
) -> Result<(), RequestError> {
    match source {
        Some(src) if src.is_ipv4() != destination.is_ipv4() => {
            Err(RequestError::FamilyMismatch)
        },
        _ => Ok(()),
    }
}

fn response_handler(inner: &Arc<RequestInner>) -> ResponseHandler {
    let weak = Arc::downgrade(inner);
    Box::new(move |result| {
        if let Some(request) = weak.upgrade() {
            request.on_response(result);
        }
    })
}

/// Drop the response slot and its dispatch, if registered.
fn drop_slot(inner: &Arc<RequestInner>) {
    let mut vars = inner.vars.lock();
    if let (Some(entry), Some(dispatch)) = (vars.entry.take(), vars.dispatch.as_ref()) {
        dispatch.remove_response(entry.as_ref());
    }
    vars.dispatch = None;
}

/// Failure unwind for a request that was never admitted: silence the
/// callback and tear everything down.
fn unwind(inner: &Arc<RequestInner>) {
    let _shard = inner.shard.lock();
    let mut vars = inner.vars.lock();
    vars.event = None;
    RequestInner::req_cancel(&mut vars);
}
