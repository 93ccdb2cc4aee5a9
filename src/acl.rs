// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::IpAddr;

use thiserror::Error;

/// Address-match list consumed by the engine's blackhole check.
///
/// Policy evaluation lives outside the engine; only the yes/no answer is
/// consumed here.
pub trait Acl: Send + Sync {
    fn is_match(&self, addr: &IpAddr) -> bool;
}

#[derive(Debug, Error)]
#[error("invalid network prefix {0:?}")]
pub struct PrefixParseError(String);

/// A plain list of CIDR prefixes, enough to express a blackhole.
#[derive(Debug, Default, Clone)]
pub struct NetPrefixList {
    prefixes: Vec<(IpAddr, u8)>,
}

impl NetPrefixList {
    /// Parse entries of the form `10.0.0.0/8`, `192.0.2.1` (host prefix) or
    /// `2001:db8::/32`.
    pub fn parse(entries: &[String]) -> Result<Self, PrefixParseError> {
        let mut prefixes = Vec::with_capacity(entries.len());
        for entry in entries {
            let (addr, len) = match entry.split_once('/') {
                Some((addr, len)) => {
                    let addr: IpAddr = addr
                        .parse()
                        .map_err(|_| PrefixParseError(entry.clone()))?;
                    let len: u8 =
                        len.parse().map_err(|_| PrefixParseError(entry.clone()))?;
                    (addr, len)
                },
                None => {
                    let addr: IpAddr = entry
                        .parse()
                        .map_err(|_| PrefixParseError(entry.clone()))?;
                    (addr, max_prefix(&addr))
                },
            };
            if len > max_prefix(&addr) {
                return Err(PrefixParseError(entry.clone()));
            }
            prefixes.push((addr, len));
        }
        Ok(Self { prefixes })
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn prefix_matches(net: &IpAddr, len: u8, addr: &IpAddr) -> bool {
    fn leading_bits_equal(a: &[u8], b: &[u8], len: u8) -> bool {
        let whole = usize::from(len / 8);
        if a[..whole] != b[..whole] {
            return false;
        }
        let rest = len % 8;
        if rest == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rest);
        (a[whole] ^ b[whole]) & mask == 0
    }

    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            leading_bits_equal(&net.octets(), &addr.octets(), len)
        },
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            leading_bits_equal(&net.octets(), &addr.octets(), len)
        },
        _ => false,
    }
}

impl Acl for NetPrefixList {
    fn is_match(&self, addr: &IpAddr) -> bool {
        self.prefixes
            .iter()
            .any(|(net, len)| prefix_matches(net, *len, addr))
    }
}
