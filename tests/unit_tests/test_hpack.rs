// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex::FromHex;
use telflow_rs::parsers::hpack::HpackDecoder;

fn from_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned = s.replace(|c: char| c.is_whitespace(), "");
    Ok(Vec::from_hex(cleaned)?)
}

#[test]
fn test_rfc_c4_huffman_requests() -> Result<()> {
    // RFC 7541 C.4: the same three requests as C.3, Huffman-coded.
    let mut dec = HpackDecoder::new();

    let first = from_hex("8286 8441 8cf1 e3c2 e5f2 3a6b a0ab 90f4 ff")?;
    let headers = dec.decode(&first)?;
    assert_eq!(headers.len(), 4);
    assert_eq!(headers[0].name, ":method");
    assert_eq!(headers[0].value, "GET");
    assert_eq!(headers[1].name, ":scheme");
    assert_eq!(headers[1].value, "http");
    assert_eq!(headers[2].name, ":path");
    assert_eq!(headers[2].value, "/");
    assert_eq!(headers[3].name, ":authority");
    assert_eq!(headers[3].value, "www.example.com");
    assert_eq!(dec.dynamic_table_len(), 1);

    let second = from_hex("8286 84be 5886 a8eb 1064 9cbf")?;
    let headers = dec.decode(&second)?;
    assert_eq!(headers[3].value, "www.example.com");
    assert_eq!(headers[4].name, "cache-control");
    assert_eq!(headers[4].value, "no-cache");
    assert_eq!(dec.dynamic_table_len(), 2);

    let third = from_hex("8287 85bf 4088 25a8 49e9 5ba9 7d7f 8925 a849 e95b b8e8 b4bf")?;
    let headers = dec.decode(&third)?;
    assert_eq!(headers[1].value, "https");
    assert_eq!(headers[4].name, "custom-key");
    assert_eq!(headers[4].value, "custom-value");
    assert_eq!(dec.dynamic_table_len(), 3);

    Ok(())
}

#[test]
fn test_rfc_c5_response_eviction() -> Result<()> {
    // RFC 7541 C.5: responses with a 256-octet table force evictions.
    let mut dec = HpackDecoder::new();
    dec.set_max_dynamic_table_size(256);

    let first = from_hex(
        "4803 3330 3258 0770 7269 7661 7465 611d 4d6f 6e2c 2032 3120 4f63 7420 \
         3230 3133 2032 303a 3133 3a32 3120 474d 546e 1768 7474 7073 3a2f 2f77 \
         7777 2e65 7861 6d70 6c65 2e63 6f6d",
    )?;
    let headers = dec.decode(&first)?;
    assert_eq!(headers[0].name, ":status");
    assert_eq!(headers[0].value, "302");
    assert_eq!(headers[3].name, "location");
    assert_eq!(headers[3].value, "https://www.example.com");
    assert_eq!(dec.dynamic_table_len(), 4);

    // Second response: ":status 307" evicts ":status 302".
    let second = from_hex("4803 3330 37c1 c0bf")?;
    let headers = dec.decode(&second)?;
    assert_eq!(headers[0].value, "307");
    assert_eq!(dec.dynamic_table_len(), 4);

    Ok(())
}

#[test]
fn test_decoder_is_per_direction_state() -> Result<()> {
    // Two decoders never share dynamic entries.
    let mut client = HpackDecoder::new();
    let mut server = HpackDecoder::new();

    let insert = from_hex("4188 25a8 49e9 5ba9 7d7f")?; // :authority custom-key(huffman)
    client.decode(&insert)?;
    assert_eq!(client.dynamic_table_len(), 1);
    assert_eq!(server.dynamic_table_len(), 0);

    // Index 62 resolves only where the entry exists.
    assert!(client.decode(&[0xBE]).is_ok());
    assert!(server.decode(&[0xBE]).is_err());
    Ok(())
}
