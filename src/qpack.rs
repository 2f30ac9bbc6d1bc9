//! QPACK (RFC 9204) in the same split as the HPACK module: a writer that
//! emits only literal field lines with verbatim bytes, and a conforming
//! reader for response field sections.
//!
//! The empty SETTINGS we send on the control stream leaves the peer's
//! encoder with a zero-capacity dynamic table, so the reader only has to
//! resolve static-table references and literals; any dynamic reference is
//! a protocol error.

use crate::headers::{Header, Headers};
use crate::hpack::{append_prefix_int, read_prefix_int};
use crate::huffman;

/// Encodes a field section: zeroed prefix (required insert count 0, base
/// 0) followed by one literal-field-line-with-literal-name per header, no
/// Huffman coding, bytes copied untouched.
pub fn encode_block(headers: &Headers) -> Vec<u8> {
    let mut buf = vec![0x00, 0x00];
    for h in headers {
        append_field_line(&mut buf, h);
    }
    buf
}

fn append_field_line(dst: &mut Vec<u8>, h: &Header) {
    // 001 N=0 H=0 + 3-bit name length prefix.
    let start = dst.len();
    append_prefix_int(dst, 3, h.name.len() as u64);
    dst[start] |= 0x20;
    dst.extend_from_slice(&h.name);
    append_prefix_int(dst, 7, h.value.len() as u64);
    dst.extend_from_slice(&h.value);
}

/// RFC 9204 appendix A; indices 0 through 98.
const STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

fn static_entry(index: u64) -> Result<(Vec<u8>, Vec<u8>), String> {
    let (n, v) = STATIC_TABLE
        .get(index as usize)
        .ok_or_else(|| format!("static index {} out of range", index))?;
    Ok((n.as_bytes().to_vec(), v.as_bytes().to_vec()))
}

fn read_string(input: &[u8], pos: &mut usize, prefix: u8, first_mask: u8) -> Result<Vec<u8>, String> {
    if *pos >= input.len() {
        return Err("truncated string".into());
    }
    let huffman_coded = input[*pos] & first_mask != 0;
    let len = read_prefix_int(input, pos, prefix)? as usize;
    if input.len() - *pos < len {
        return Err("truncated string".into());
    }
    let raw = &input[*pos..*pos + len];
    *pos += len;
    if huffman_coded {
        huffman::decode(raw)
    } else {
        Ok(raw.to_vec())
    }
}

/// Decodes a response field section, appending fields to `out` in wire
/// order.
pub fn decode_block(input: &[u8], out: &mut Headers) -> Result<(), String> {
    let mut pos = 0usize;

    // Encoded field section prefix: required insert count, then sign bit
    // and delta base. Anything but a zero insert count implies dynamic
    // table use, which we never allowed.
    let required_insert_count = read_prefix_int(input, &mut pos, 8)?;
    if required_insert_count != 0 {
        return Err("dynamic table required by peer".into());
    }
    read_prefix_int(input, &mut pos, 7)?;

    while pos < input.len() {
        let first = input[pos];
        if first & 0x80 != 0 {
            // Indexed field line; T bit selects the table.
            if first & 0x40 == 0 {
                return Err("dynamic table reference".into());
            }
            let index = read_prefix_int(input, &mut pos, 6)?;
            let (name, value) = static_entry(index)?;
            out.push(Header::new(name, value));
        } else if first & 0x40 != 0 {
            // Literal field line with name reference.
            if first & 0x10 == 0 {
                return Err("dynamic table reference".into());
            }
            let index = read_prefix_int(input, &mut pos, 4)?;
            let (name, _) = static_entry(index)?;
            let value = read_string(input, &mut pos, 7, 0x80)?;
            out.push(Header::new(name, value));
        } else if first & 0x20 != 0 {
            // Literal field line with literal name.
            let huffman_name = first & 0x08 != 0;
            let name_len = read_prefix_int(input, &mut pos, 3)? as usize;
            if input.len() - pos < name_len {
                return Err("truncated string".into());
            }
            let raw = &input[pos..pos + name_len];
            pos += name_len;
            let name = if huffman_name {
                huffman::decode(raw)?
            } else {
                raw.to_vec()
            };
            let value = read_string(input, &mut pos, 7, 0x80)?;
            out.push(Header::new(name, value));
        } else {
            // Post-base forms only exist with a non-empty dynamic table.
            return Err("dynamic table reference".into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_bytes() {
        let headers = Headers(vec![
            Header::new(":method", "POST"),
            Header::new("content-length\t", "-1"),
            Header::new("header", "val\r\ntransfer-encoding:chunked"),
            Header::new(&b"\x00\xff"[..], &b"\x85"[..]),
        ]);
        let block = encode_block(&headers);
        assert_eq!(&block[..2], &[0x00, 0x00]);
        let mut out = Headers::new();
        decode_block(&block, &mut out).unwrap();
        assert_eq!(out, headers);
    }

    #[test]
    fn field_line_wire_form() {
        let mut buf = Vec::new();
        append_field_line(&mut buf, &Header::new("ab", "c"));
        assert_eq!(buf, vec![0x22, b'a', b'b', 0x01, b'c']);
    }

    #[test]
    fn long_name_spills_into_continuation() {
        let name = vec![b'n'; 20];
        let headers = Headers(vec![Header::new(name.clone(), "v")]);
        let block = encode_block(&headers);
        // 3-bit prefix maxes at 7: first byte 0x27, continuation 13.
        assert_eq!(block[2], 0x27);
        assert_eq!(block[3], 13);
        let mut out = Headers::new();
        decode_block(&block, &mut out).unwrap();
        assert_eq!(out.0[0].name, name);
    }

    #[test]
    fn decodes_static_references() {
        // Indexed: :status 200 (index 25). Name-referenced literal:
        // content-length (index 4) with value "12".
        let block = vec![0x00, 0x00, 0x80 | 0x40 | 25, 0x40 | 0x10 | 4, 0x02, b'1', b'2'];
        let mut out = Headers::new();
        decode_block(&block, &mut out).unwrap();
        assert_eq!(out.get(b":status"), Some(&b"200"[..]));
        assert_eq!(out.get(b"content-length"), Some(&b"12"[..]));
    }

    #[test]
    fn rejects_dynamic_references() {
        let mut out = Headers::new();
        assert!(decode_block(&[0x00, 0x00, 0x80], &mut out).is_err());
        assert!(decode_block(&[0x01, 0x00], &mut out).is_err());
    }
}
