// Copyright (c) 2024, The h2smuggle Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! HTTP/2 wire engine.
//!
//! The transmit side serializes the whole request into one buffer
//! (client preface, SETTINGS, WINDOW_UPDATE, HEADERS, DATA frames,
//! SETTINGS-ACK) and then slices it at body-chunk boundaries so the
//! caller-requested delay can separate the chunks on the wire. The
//! receive side is a small frame loop feeding the HPACK decoder.
//!
//! TLS runs through rustls with ALPN `h2` and certificate verification
//! disabled: the targets of interest are misbehaving or misconfigured by
//! definition.

use crate::dns_cache::DnsCache;
use crate::error::{from_socket_error, RequestError};
use crate::hpack;
use crate::request::HttpMessage;
use lazy_static::lazy_static;
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;

/// Largest DATA payload emitted per frame when splitting body chunks.
const MAX_DATA_FRAME: usize = 65536;

/// Splits `host[:port]`, defaulting the port to 443. Bracketed and bare
/// IPv6 literals keep all their colons.
pub fn split_host_port(addr: &str) -> Result<(String, u16), RequestError> {
    let invalid = |reason: &str| RequestError::InvalidTarget {
        target: addr.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("unmatched bracket"))?;
        let host = rest[..end].to_string();
        let port = match &rest[end + 1..] {
            "" => 443,
            p => p
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| invalid("bad port"))?,
        };
        return Ok((host, port));
    }

    match addr.matches(':').count() {
        0 => Ok((addr.to_string(), 443)),
        1 => {
            let (host, port) = addr.split_once(':').unwrap();
            let port = port.parse().map_err(|_| invalid("bad port"))?;
            Ok((host.to_string(), port))
        }
        // A bare IPv6 literal.
        _ => Ok((addr.to_string(), 443)),
    }
}

/// Accepts any certificate chain. The probes target TLS endpoints whose
/// configuration is part of what is being tested.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

lazy_static! {
    static ref TLS_CONFIG: Arc<rustls::ClientConfig> = {
        let mut config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Arc::new(config)
    };
}

/// Sends one request and reads the stream-1 response.
pub fn send_request(
    connect_addr: &str,
    server_name: &str,
    request: &HttpMessage,
    timeout: Duration,
    body_parts_delay: Duration,
    skip_body_end_flag: bool,
    dns: &DnsCache,
) -> Result<HttpMessage, RequestError> {
    let (host, port) = split_host_port(connect_addr)?;
    let ip = dns.lookup(&host)?;
    let addr = SocketAddr::new(ip, port);

    let mut tcp = TcpStream::connect_timeout(&addr, timeout).map_err(from_socket_error)?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let sni = ServerName::try_from(server_name.to_string()).map_err(|e| {
        RequestError::InvalidTarget {
            target: server_name.to_string(),
            reason: e.to_string(),
        }
    })?;
    let mut tls = rustls::ClientConnection::new(TLS_CONFIG.clone(), sni)?;

    let parts = prepare_request_parts(request, skip_body_end_flag);
    for (idx, part) in parts.iter().enumerate() {
        // Deadline reset per slice: a delayed body must still get the
        // full timeout budget for each write.
        tcp.set_write_timeout(Some(timeout))?;
        let mut stream = rustls::Stream::new(&mut tls, &mut tcp);
        stream.write_all(part).map_err(from_socket_error)?;
        stream.flush().map_err(from_socket_error)?;
        if idx < parts.len() - 1 {
            std::thread::sleep(body_parts_delay);
        }
    }

    let deadline = Instant::now() + timeout;
    read_response(&mut tls, &mut tcp, deadline)
}

struct Frame {
    typ: u8,
    flags: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

fn read_response(
    tls: &mut rustls::ClientConnection,
    tcp: &mut TcpStream,
    deadline: Instant,
) -> Result<HttpMessage, RequestError> {
    let mut response = HttpMessage::default();
    let mut decoder = hpack::Decoder::new();

    let mut has_body = false;
    let mut body_read = false;
    let mut headers_done = false;

    while !headers_done || (has_body && !body_read) {
        let frame = read_frame(tls, tcp, deadline)?;

        if frame.typ == FRAME_GOAWAY {
            let code = frame
                .payload
                .get(4..8)
                .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
                .unwrap_or(0);
            return Err(RequestError::ConnDrop(format!(
                "received GOAWAY: error code {}",
                error_code_name(code)
            )));
        }

        if frame.stream_id != 1 {
            continue;
        }

        match frame.typ {
            FRAME_HEADERS => {
                let fragment = headers_fragment(&frame)?;
                decoder
                    .decode(fragment, &mut response.headers)
                    .map_err(RequestError::Protocol)?;
                headers_done = frame.flags & FLAG_END_HEADERS != 0;
                has_body = frame.flags & FLAG_END_STREAM == 0;
            }
            FRAME_CONTINUATION => {
                decoder
                    .decode(&frame.payload, &mut response.headers)
                    .map_err(RequestError::Protocol)?;
                headers_done = frame.flags & FLAG_END_HEADERS != 0;
            }
            FRAME_DATA => {
                response.body.push(data_payload(&frame)?.to_vec());
                body_read = frame.flags & FLAG_END_STREAM != 0;
            }
            FRAME_RST_STREAM => {
                let code = frame
                    .payload
                    .get(..4)
                    .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
                    .unwrap_or(0);
                return Err(RequestError::ConnDrop(format!(
                    "error code {}",
                    error_code_name(code)
                )));
            }
            other => debug!("ignoring frame type {:#x} on stream 1", other),
        }
    }

    Ok(response)
}

fn read_frame(
    tls: &mut rustls::ClientConnection,
    tcp: &mut TcpStream,
    deadline: Instant,
) -> Result<Frame, RequestError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
        .ok_or(RequestError::Timeout)?;
    tcp.set_read_timeout(Some(remaining))?;

    let mut stream = rustls::Stream::new(tls, tcp);
    let mut head = [0u8; 9];
    stream.read_exact(&mut head).map_err(from_socket_error)?;

    let length = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let typ = head[3];
    let flags = head[4];
    let stream_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).map_err(from_socket_error)?;

    Ok(Frame {
        typ,
        flags,
        stream_id,
        payload,
    })
}

/// Strips padding and priority from a HEADERS payload, leaving the block
/// fragment.
fn headers_fragment(frame: &Frame) -> Result<&[u8], RequestError> {
    let mut payload = frame.payload.as_slice();
    let mut pad = 0usize;
    if frame.flags & FLAG_PADDED != 0 {
        pad = *payload
            .first()
            .ok_or_else(|| RequestError::Protocol("short HEADERS frame".into()))?
            as usize;
        payload = &payload[1..];
    }
    if frame.flags & FLAG_PRIORITY != 0 {
        if payload.len() < 5 {
            return Err(RequestError::Protocol("short HEADERS frame".into()));
        }
        payload = &payload[5..];
    }
    if pad > payload.len() {
        return Err(RequestError::Protocol("bad HEADERS padding".into()));
    }
    Ok(&payload[..payload.len() - pad])
}

fn data_payload(frame: &Frame) -> Result<&[u8], RequestError> {
    let mut payload = frame.payload.as_slice();
    if frame.flags & FLAG_PADDED != 0 {
        let pad = *payload
            .first()
            .ok_or_else(|| RequestError::Protocol("short DATA frame".into()))?
            as usize;
        payload = &payload[1..];
        if pad > payload.len() {
            return Err(RequestError::Protocol("bad DATA padding".into()));
        }
        payload = &payload[..payload.len() - pad];
    }
    Ok(payload)
}

/// Serializes the request and slices it at body-chunk boundaries: the
/// connection prefix plus HEADERS first, then one slice per body chunk,
/// then the trailing SETTINGS-ACK.
pub fn prepare_request_parts(request: &HttpMessage, skip_body_end_flag: bool) -> Vec<Vec<u8>> {
    let block = hpack::encode_block(&request.headers);

    let mut buf = Vec::new();
    let mut boundaries = vec![0usize];

    buf.extend_from_slice(CLIENT_PREFACE);
    append_settings_initial_window(&mut buf, (1 << 30) - 1);
    append_window_update(&mut buf, 0, (1 << 30) - (1 << 16) - 1);

    let end_stream = request.body.is_empty() && !skip_body_end_flag;
    let headers_flags = FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 };
    append_frame(&mut buf, FRAME_HEADERS, headers_flags, 1, &block);

    for (i, chunk) in request.body.iter().enumerate() {
        boundaries.push(buf.len());
        let last_chunk = i == request.body.len() - 1;
        let mut start = 0usize;
        loop {
            let end = (start + MAX_DATA_FRAME).min(chunk.len());
            let body_end = !skip_body_end_flag && last_chunk && end == chunk.len();
            let flags = if body_end { FLAG_END_STREAM } else { 0 };
            append_frame(&mut buf, FRAME_DATA, flags, 1, &chunk[start..end]);
            start = end;
            if start >= chunk.len() {
                break;
            }
        }
    }

    if boundaries.len() > 1 {
        boundaries.push(buf.len());
    }
    append_frame(&mut buf, FRAME_SETTINGS, FLAG_ACK, 0, &[]);
    boundaries.push(buf.len());

    boundaries
        .windows(2)
        .map(|w| buf[w[0]..w[1]].to_vec())
        .collect()
}

fn append_frame(buf: &mut Vec<u8>, typ: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    let len = payload.len() as u32;
    buf.extend_from_slice(&len.to_be_bytes()[1..]);
    buf.push(typ);
    buf.push(flags);
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf.extend_from_slice(payload);
}

fn append_settings_initial_window(buf: &mut Vec<u8>, size: u32) {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
    payload.extend_from_slice(&size.to_be_bytes());
    append_frame(buf, FRAME_SETTINGS, 0, 0, &payload);
}

fn append_window_update(buf: &mut Vec<u8>, stream_id: u32, increment: u32) {
    append_frame(
        buf,
        FRAME_WINDOW_UPDATE,
        0,
        stream_id,
        &increment.to_be_bytes(),
    );
}

fn error_code_name(code: u32) -> String {
    match code {
        0x0 => "NO_ERROR",
        0x1 => "PROTOCOL_ERROR",
        0x2 => "INTERNAL_ERROR",
        0x3 => "FLOW_CONTROL_ERROR",
        0x4 => "SETTINGS_TIMEOUT",
        0x5 => "STREAM_CLOSED",
        0x6 => "FRAME_SIZE_ERROR",
        0x7 => "REFUSED_STREAM",
        0x8 => "CANCEL",
        0x9 => "COMPRESSION_ERROR",
        0xa => "CONNECT_ERROR",
        0xb => "ENHANCE_YOUR_CALM",
        0xc => "INADEQUATE_SECURITY",
        0xd => "HTTP_1_1_REQUIRED",
        other => return other.to_string(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{Header, Headers};

    fn message(headers: Vec<Header>, body: Vec<Vec<u8>>) -> HttpMessage {
        HttpMessage {
            headers: Headers(headers),
            body,
        }
    }

    #[test]
    fn empty_body_is_a_single_part() {
        let msg = message(vec![Header::new(":method", "GET")], vec![]);
        let parts = prepare_request_parts(&msg, false);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].starts_with(CLIENT_PREFACE));
        // SETTINGS-ACK is the last frame of the single part.
        let tail = &parts[0][parts[0].len() - 9..];
        assert_eq!(tail, &[0, 0, 0, FRAME_SETTINGS, FLAG_ACK, 0, 0, 0, 0]);
    }

    #[test]
    fn body_chunks_become_separate_parts() {
        let msg = message(
            vec![Header::new(":method", "POST")],
            vec![b"aaaa".to_vec(), b"bb".to_vec()],
        );
        let parts = prepare_request_parts(&msg, false);
        // prefix+HEADERS, chunk 1, chunk 2, SETTINGS-ACK.
        assert_eq!(parts.len(), 4);

        // Chunk parts are single DATA frames; END_STREAM only on the last.
        assert_eq!(parts[1][3], FRAME_DATA);
        assert_eq!(parts[1][4], 0);
        assert_eq!(parts[2][3], FRAME_DATA);
        assert_eq!(parts[2][4], FLAG_END_STREAM);
        assert_eq!(&parts[2][9..], b"bb");
    }

    #[test]
    fn skip_body_end_leaves_stream_open() {
        let msg = message(vec![Header::new(":method", "POST")], vec![b"x".to_vec()]);
        let parts = prepare_request_parts(&msg, true);
        for part in &parts {
            let mut at = 0;
            while at < part.len() {
                let len = u32::from_be_bytes([0, part[at], part[at + 1], part[at + 2]]) as usize;
                if part[at + 3] == FRAME_DATA || part[at + 3] == FRAME_HEADERS {
                    assert_eq!(part[at + 4] & FLAG_END_STREAM, 0);
                }
                at += 9 + len;
            }
        }
    }

    #[test]
    fn large_chunk_is_split_into_capped_data_frames() {
        let msg = message(
            vec![Header::new(":method", "POST")],
            vec![vec![0u8; MAX_DATA_FRAME + 1]],
        );
        let parts = prepare_request_parts(&msg, false);
        assert_eq!(parts.len(), 3);
        let chunk_part = &parts[1];
        let first_len =
            u32::from_be_bytes([0, chunk_part[0], chunk_part[1], chunk_part[2]]) as usize;
        assert_eq!(first_len, MAX_DATA_FRAME);
        assert_eq!(chunk_part[4] & FLAG_END_STREAM, 0);
        let second = &chunk_part[9 + first_len..];
        assert_eq!(u32::from_be_bytes([0, second[0], second[1], second[2]]), 1);
        assert_eq!(second[4] & FLAG_END_STREAM, FLAG_END_STREAM);
    }

    #[test]
    fn settings_and_window_update_values() {
        let msg = message(vec![Header::new(":method", "GET")], vec![]);
        let parts = prepare_request_parts(&msg, false);
        let buf = &parts[0][CLIENT_PREFACE.len()..];

        // SETTINGS: one entry, INITIAL_WINDOW_SIZE = 2^30 - 1.
        assert_eq!(buf[3], FRAME_SETTINGS);
        assert_eq!(&buf[9..11], &SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
        assert_eq!(
            u32::from_be_bytes(buf[11..15].try_into().unwrap()),
            (1 << 30) - 1
        );

        // WINDOW_UPDATE on stream 0 by 2^30 - 2^16 - 1.
        let wu = &buf[15..];
        assert_eq!(wu[3], FRAME_WINDOW_UPDATE);
        assert_eq!(
            u32::from_be_bytes(wu[9..13].try_into().unwrap()),
            (1 << 30) - (1 << 16) - 1
        );
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".into(), 443));
        assert_eq!(split_host_port("example.com:8443").unwrap(), ("example.com".into(), 8443));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1".into(), 80));
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".into(), 443));
        assert_eq!(split_host_port("::1").unwrap(), ("::1".into(), 443));
        assert!(split_host_port("host:bad").is_err());
    }
}
