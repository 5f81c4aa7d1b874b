// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::models::error::{Error, Result};

pub const DLT_NULL: u16 = 0;
pub const DLT_EN10MB: u16 = 1;
pub const DLT_RAW_BSD: u16 = 12;
pub const DLT_RAW_OPENBSD: u16 = 14;
pub const DLT_RAW: u16 = 101;
pub const DLT_LOOP: u16 = 108;
pub const DLT_LINUX_SLL: u16 = 113;
pub const DLT_IPV4: u16 = 228;
pub const DLT_IPV6: u16 = 229;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

/// Link-layer stripper: locates the IP header behind the capture's link
/// framing, unwrapping VLAN tags up to `max_vlan_depth`.
#[derive(Debug, Clone)]
pub struct LinkLayer {
    max_vlan_depth: usize,
}

impl Default for LinkLayer {
    fn default() -> Self {
        // Two tags covers Q-in-Q.
        Self { max_vlan_depth: 2 }
    }
}

impl LinkLayer {
    pub fn with_vlan_depth(max_vlan_depth: usize) -> Self {
        Self { max_vlan_depth }
    }

    /// Returns `(offset_to_ip, ethertype)` for a captured frame.
    pub fn strip(&self, data: &[u8], link_type: u16) -> Result<(usize, u16)> {
        match link_type {
            DLT_EN10MB => self.strip_ethernet(data),
            DLT_LINUX_SLL => strip_linux_sll(data),
            DLT_NULL | DLT_LOOP => strip_null(data),
            DLT_RAW | DLT_RAW_BSD | DLT_RAW_OPENBSD | DLT_IPV4 | DLT_IPV6 => {
                strip_raw(data)
            },
            other => Err(Error::unsupported(
                "link-layer",
                format!("link type {other}"),
            )),
        }
    }

    fn strip_ethernet(&self, data: &[u8]) -> Result<(usize, u16)> {
        if data.len() < 14 {
            return Err(Error::truncated(14, data.len()));
        }

        let mut offset = 14usize;
        let mut eth_type = u16::from_be_bytes([data[12], data[13]]);

        let mut depth = 0usize;
        while eth_type == ETHERTYPE_VLAN || eth_type == ETHERTYPE_QINQ {
            if depth >= self.max_vlan_depth {
                return Err(Error::Sanity("VLAN nesting deeper than configured"));
            }
            if data.len() < offset + 4 {
                return Err(Error::truncated(offset + 4, data.len()));
            }
            // Tag layout: [TCI(2)][next EtherType(2)].
            eth_type = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            offset += 4;
            depth += 1;
        }

        Ok((offset, eth_type))
    }
}

fn strip_linux_sll(data: &[u8]) -> Result<(usize, u16)> {
    // SLL header: packet type (2), ARPHRD (2), address length (2),
    // address (8), protocol (2).
    if data.len() < 16 {
        return Err(Error::truncated(16, data.len()));
    }
    let eth_type = u16::from_be_bytes([data[14], data[15]]);
    Ok((16, eth_type))
}

/// BSD Null/Loop: a 4-byte address family in capture-host byte order.
fn strip_null(data: &[u8]) -> Result<(usize, u16)> {
    if data.len() < 4 {
        return Err(Error::truncated(4, data.len()));
    }

    let mut family = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    // The family fits in one byte; a larger value means the other order.
    if family > 0xFF {
        family = family.swap_bytes();
    }

    let eth_type = match family {
        2 => ETHERTYPE_IPV4,
        // AF_INET6 varies by platform.
        10 | 24 | 28 | 30 => ETHERTYPE_IPV6,
        _ => {
            // Fall back to the IP version nibble of the next byte.
            let version = data.get(4).map(|b| b >> 4);
            match version {
                Some(4) => ETHERTYPE_IPV4,
                Some(6) => ETHERTYPE_IPV6,
                _ => {
                    return Err(Error::malformed(
                        "link-layer",
                        format!("unknown null/loop family {family}"),
                    ));
                },
            }
        },
    };

    Ok((4, eth_type))
}

fn strip_raw(data: &[u8]) -> Result<(usize, u16)> {
    let version = data
        .first()
        .map(|b| b >> 4)
        .ok_or_else(|| Error::truncated(1, 0))?;
    match version {
        4 => Ok((0, ETHERTYPE_IPV4)),
        6 => Ok((0, ETHERTYPE_IPV6)),
        other => Err(Error::malformed(
            "link-layer",
            format!("raw frame with IP version {other}"),
        )),
    }
}
