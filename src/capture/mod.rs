// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod format;
pub mod interface;
pub mod link_layer;
pub mod pcap;
pub mod pcapng;
pub mod reader;
