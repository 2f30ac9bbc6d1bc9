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

//! HTTP/3 wire engine.
//!
//! quiche supplies the QUIC transport; the HTTP/3 layer on top is written
//! by hand so frame boundaries, FIN placement and QPACK payload bytes
//! stay under probe control. One unidirectional control stream carries
//! the minimum legal setup (`00 04 00`: stream type 0 for control, plus
//! an empty SETTINGS frame) and the request rides the first
//! bidirectional stream.

use crate::dns_cache::DnsCache;
use crate::error::{from_socket_error, RequestError};
use crate::http2::split_host_port;
use crate::qpack;
use crate::request::HttpMessage;
use log::debug;
use rand::RngCore;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

const FRAME_TYPE_DATA: u64 = 0x0;
const FRAME_TYPE_HEADERS: u64 = 0x1;

/// First client-initiated unidirectional stream.
const CONTROL_STREAM_ID: u64 = 2;
/// First client-initiated bidirectional stream.
const REQUEST_STREAM_ID: u64 = 0;

/// Control-stream type 0 followed by an empty SETTINGS frame.
const CONTROL_STREAM_PREAMBLE: &[u8] = &[0x00, 0x04, 0x00];

const H3_NO_ERROR: u64 = 0x100;

const MAX_DATAGRAM_SIZE: usize = 1350;

/// Sends one request over a fresh QUIC session and reads the response
/// from the request stream until FIN.
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
    let peer = SocketAddr::new(ip, port);

    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).map_err(from_socket_error)?;
    socket.connect(peer).map_err(from_socket_error)?;
    let local = socket.local_addr()?;

    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    config.set_application_protos(&[b"h3".as_slice(), b"h3-29".as_slice()])?;
    config.verify_peer(false);
    config.set_max_idle_timeout(timeout.as_millis() as u64);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_stream_data_uni(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);

    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    rand::thread_rng().fill_bytes(&mut scid);
    let scid = quiche::ConnectionId::from_ref(&scid);

    let conn = quiche::connect(Some(server_name), &scid, local, peer, &mut config)?;
    let mut session = Session {
        conn,
        socket,
        local,
        peer,
    };

    let deadline = Instant::now() + timeout;
    session.flush_egress()?;
    while !session.conn.is_established() {
        if session.conn.is_closed() {
            return Err(session.close_reason());
        }
        session.advance(deadline)?;
    }

    session.stream_send_all(CONTROL_STREAM_ID, CONTROL_STREAM_PREAMBLE, false, deadline)?;

    let frames = prepare_request_frames(request);
    for (idx, frame) in frames.iter().enumerate() {
        if idx > 0 {
            session.idle_pump(body_parts_delay)?;
        }
        // Deadline reset per frame, like the HTTP/2 path: delayed chunks
        // keep the full budget for each write.
        let write_deadline = Instant::now() + timeout;
        let last = idx == frames.len() - 1;
        let fin = last && !skip_body_end_flag;
        session.stream_send_all(REQUEST_STREAM_ID, frame, fin, write_deadline)?;
    }

    let deadline = Instant::now() + timeout;
    let response = session.read_response(deadline)?;

    let _ = session.conn.close(true, H3_NO_ERROR, b"");
    let _ = session.flush_egress();
    Ok(response)
}

struct Session {
    conn: quiche::Connection,
    socket: UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Session {
    fn flush_egress(&mut self) -> Result<(), RequestError> {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.conn.send(&mut out) {
                Ok((n, _)) => {
                    self.socket.send(&out[..n]).map_err(from_socket_error)?;
                }
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits for one datagram (or a quiche timer), feeds it to the
    /// connection and flushes whatever became sendable. Errors with
    /// [`RequestError::Timeout`] once `deadline` passes.
    fn advance(&mut self, deadline: Instant) -> Result<(), RequestError> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(RequestError::Timeout)?;
        self.recv_step(remaining)
    }

    /// Keeps the connection's timers and ACKs serviced for `delay`
    /// without treating the wait as progress toward any response.
    fn idle_pump(&mut self, delay: Duration) -> Result<(), RequestError> {
        let until = Instant::now() + delay;
        while let Some(left) = until.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
        {
            self.recv_step(left)?;
            if self.conn.is_closed() {
                return Err(self.close_reason());
            }
        }
        Ok(())
    }

    fn recv_step(&mut self, max_wait: Duration) -> Result<(), RequestError> {
        let mut wait = max_wait;
        if let Some(t) = self.conn.timeout() {
            wait = wait.min(t);
        }
        wait = wait.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(wait))?;

        let mut buf = [0u8; 65535];
        match self.socket.recv(&mut buf) {
            Ok(n) => {
                let info = quiche::RecvInfo {
                    from: self.peer,
                    to: self.local,
                };
                if let Err(e) = self.conn.recv(&mut buf[..n], info) {
                    if e != quiche::Error::Done {
                        return Err(e.into());
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                self.conn.on_timeout();
            }
            Err(e) => return Err(from_socket_error(e)),
        }
        self.flush_egress()
    }

    fn stream_send_all(
        &mut self,
        stream_id: u64,
        mut data: &[u8],
        fin: bool,
        deadline: Instant,
    ) -> Result<(), RequestError> {
        loop {
            match self.conn.stream_send(stream_id, data, fin) {
                Ok(n) if n == data.len() => {
                    self.flush_egress()?;
                    return Ok(());
                }
                Ok(n) => {
                    data = &data[n..];
                    self.flush_egress()?;
                    self.advance(deadline)?;
                }
                // Flow control is full; wait for credit.
                Err(quiche::Error::Done) => self.advance(deadline)?,
                Err(e) => return Err(e.into()),
            }
            if self.conn.is_closed() {
                return Err(self.close_reason());
            }
        }
    }

    fn read_response(&mut self, deadline: Instant) -> Result<HttpMessage, RequestError> {
        let mut response = HttpMessage::default();
        let mut stream_buf: Vec<u8> = Vec::new();
        let mut parse_pos = 0usize;
        let mut fin = false;

        loop {
            let readable: Vec<u64> = self.conn.readable().collect();
            for sid in readable {
                let mut buf = [0u8; 4096];
                loop {
                    match self.conn.stream_recv(sid, &mut buf) {
                        Ok((n, stream_fin)) => {
                            if sid == REQUEST_STREAM_ID {
                                stream_buf.extend_from_slice(&buf[..n]);
                                fin |= stream_fin;
                            }
                            if stream_fin {
                                break;
                            }
                        }
                        Err(quiche::Error::Done) => break,
                        Err(quiche::Error::StreamReset(code)) => {
                            if sid == REQUEST_STREAM_ID {
                                return Err(RequestError::ConnDrop(format!(
                                    "stream reset, error code {:#x}",
                                    code
                                )));
                            }
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            while let Some((typ, payload, consumed)) = parse_frame(&stream_buf[parse_pos..]) {
                parse_pos += consumed;
                match typ {
                    FRAME_TYPE_DATA => response.body.push(payload),
                    FRAME_TYPE_HEADERS => qpack::decode_block(&payload, &mut response.headers)
                        .map_err(RequestError::Protocol)?,
                    other => debug!("ignoring http3 frame type {:#x}", other),
                }
            }

            if fin {
                if parse_pos < stream_buf.len() {
                    return Err(RequestError::Protocol("truncated frame at end of stream".into()));
                }
                return Ok(response);
            }
            if self.conn.is_closed() {
                return Err(self.close_reason());
            }
            self.advance(deadline)?;
        }
    }

    fn close_reason(&self) -> RequestError {
        if let Some(err) = self.conn.peer_error() {
            if err.is_app {
                return RequestError::ConnDrop(format!("error code {:#x}", err.error_code));
            }
            return RequestError::Protocol(format!(
                "connection closed, transport error {:#x}",
                err.error_code
            ));
        }
        if self.conn.is_timed_out() {
            return RequestError::Timeout;
        }
        RequestError::Protocol("connection closed".into())
    }
}

/// One HEADERS frame, then one DATA frame per body chunk.
pub fn prepare_request_frames(request: &HttpMessage) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(1 + request.body.len());

    let block = qpack::encode_block(&request.headers);
    let mut headers_frame = Vec::with_capacity(block.len() + 4);
    write_varint(&mut headers_frame, FRAME_TYPE_HEADERS);
    write_varint(&mut headers_frame, block.len() as u64);
    headers_frame.extend_from_slice(&block);
    frames.push(headers_frame);

    for chunk in &request.body {
        let mut frame = Vec::with_capacity(chunk.len() + 4);
        write_varint(&mut frame, FRAME_TYPE_DATA);
        write_varint(&mut frame, chunk.len() as u64);
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }

    frames
}

fn parse_frame(buf: &[u8]) -> Option<(u64, Vec<u8>, usize)> {
    let mut pos = 0usize;
    let typ = read_varint(buf, &mut pos)?;
    let len = read_varint(buf, &mut pos)? as usize;
    if buf.len() - pos < len {
        return None;
    }
    let payload = buf[pos..pos + len].to_vec();
    Some((typ, payload, pos + len))
}

pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// QUIC variable-length integer (RFC 9000 §16): the top two bits of the
/// first byte select a 1/2/4/8-byte encoding. The smallest form that
/// fits is always used.
pub fn write_varint(buf: &mut Vec<u8>, v: u64) {
    if v <= 63 {
        buf.push(v as u8);
    } else if v <= 16383 {
        buf.extend_from_slice(&[(v >> 8) as u8 | 0x40, v as u8]);
    } else if v <= (1 << 30) - 1 {
        buf.extend_from_slice(&[
            (v >> 24) as u8 | 0x80,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]);
    } else if v <= MAX_VARINT {
        buf.extend_from_slice(&[
            (v >> 56) as u8 | 0xc0,
            (v >> 48) as u8,
            (v >> 40) as u8,
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]);
    } else {
        panic!("{:#x} doesn't fit into 62 bits", v);
    }
}

/// Reads one varint from `buf[*pos..]`; `None` when the bytes present do
/// not complete it.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    let len = 1usize << (first >> 6);
    if buf.len() - *pos < len {
        return None;
    }
    let mut val = (first & 0x3f) as u64;
    for i in 1..len {
        val = (val << 8) | buf[*pos + i] as u64;
    }
    *pos += len;
    Some(val)
}
