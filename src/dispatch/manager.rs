// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    acl::{Acl, NetPrefixList},
    cfg::config::Config,
    dispatch::{
        Dispatch, DispatchError, DispatchManager, tcp::TcpDispatch, udp::UdpDispatch,
    },
};

type TcpKey = (SocketAddr, Option<SocketAddr>);

/// The production dispatch pool: caches UDP dispatches by source address
/// and TCP dispatches by peer, and owns the blackhole list.
pub struct DispatchPool {
    udp_cache: DashMap<SocketAddr, Weak<UdpDispatch>>,
    tcp_cache: DashMap<TcpKey, Weak<TcpDispatch>>,
    blackhole: Option<Arc<dyn Acl>>,
    recv_buffer: usize,
}

impl DispatchPool {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let blackhole = if cfg.dispatch.blackhole.is_empty() {
            None
        } else {
            let list = NetPrefixList::parse(&cfg.dispatch.blackhole)?;
            Some(Arc::new(list) as Arc<dyn Acl>)
        };
        Ok(Self {
            udp_cache: DashMap::new(),
            tcp_cache: DashMap::new(),
            blackhole,
            recv_buffer: cfg.dispatch.recv_buffer,
        })
    }

    /// A wildcard-bound UDP dispatch suitable as an engine default for the
    /// given family.
    pub fn create_default_udp(&self, v4: bool) -> Result<Arc<dyn Dispatch>, DispatchError> {
        let src = if v4 {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let dispatch: Arc<dyn Dispatch> = UdpDispatch::bind(src, self.recv_buffer)?;
        Ok(dispatch)
    }
}

impl DispatchManager for DispatchPool {
    fn get_udp(&self, src: SocketAddr) -> Result<Arc<dyn Dispatch>, DispatchError> {
        // An ephemeral source port names a fresh socket every time; only
        // pinned ports are shared.
        if src.port() != 0
            && let Some(cached) = self.udp_cache.get(&src)
            && let Some(dispatch) = cached.upgrade()
        {
            debug!("udp dispatch: reusing {src}");
            return Ok(dispatch);
        }
        let dispatch = UdpDispatch::bind(src, self.recv_buffer)?;
        if src.port() != 0 {
            self.udp_cache.insert(src, Arc::downgrade(&dispatch));
        }
        Ok(dispatch as Arc<dyn Dispatch>)
    }

    fn get_tcp(
        &self,
        dest: SocketAddr,
        src: Option<SocketAddr>,
    ) -> Option<(Arc<dyn Dispatch>, bool)> {
        let key = (dest, src);
        let cached = self.tcp_cache.get(&key)?.upgrade()?;
        if cached.is_closed() {
            self.tcp_cache.remove(&key);
            return None;
        }
        let connected = cached.is_connected();
        Some((cached as Arc<dyn Dispatch>, connected))
    }

    fn create_tcp(
        &self,
        src: Option<SocketAddr>,
        dest: SocketAddr,
        dscp: Option<u8>,
    ) -> Result<Arc<dyn Dispatch>, DispatchError> {
        let dispatch = TcpDispatch::create(src, dest, dscp)?;
        self.tcp_cache.insert((dest, src), Arc::downgrade(&dispatch));
        Ok(dispatch as Arc<dyn Dispatch>)
    }

    fn blackhole(&self) -> Option<Arc<dyn Acl>> {
        self.blackhole.clone()
    }
}
