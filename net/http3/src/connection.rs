//! HTTP/3 connection layer (RFC 9114 §6).
//!
//! Owns one QUIC connection's control stream, QPACK encoder/decoder
//! stream pair and request streams. Each endpoint opens exactly one of
//! each critical stream; closure of any of them is a connection error.
//! The fetch layer drives this through [`H3Connection::send_request`] and
//! [`H3Connection::next_event`].

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use quantum_quic::{
    ConnectionError, ConnectionHandle, DriverEvent, Side, StreamId, StreamPriority,
};

use crate::error::{H3Error, H3ErrorCode};
use crate::frame::{FrameReader, H3Frame, Settings, StreamType};
use crate::headers::HeaderMap;
use crate::qpack::{DecodeOutcome, Decoder, Encoder};

/// Events surfaced to the request dispatcher.
#[derive(Debug)]
pub enum H3Event {
    /// Transport handshake finished.
    Connected { used_early_data: bool },
    /// 0-RTT was rejected; early requests were replayed automatically.
    ZeroRttRejected,
    /// A decoded field section (response head or trailers).
    Headers { stream: StreamId, fields: Vec<(String, String)>, fin: bool },
    /// Response body bytes.
    Data { stream: StreamId, data: Bytes, fin: bool },
    /// Peer reset the request stream.
    Reset { stream: StreamId, error_code: u64 },
    /// Peer is shutting down; streams above the ID will not be processed.
    GoAway { last_stream_id: u64 },
    /// Session ticket for the early-data store.
    SessionTicket { ticket: Vec<u8>, suite: quantum_quic::crypto::CipherSuite },
    /// Address-validation token for the next connection.
    NewToken(Vec<u8>),
    /// Fatal HTTP/3 error; the connection is being torn down.
    Error(H3Error),
    /// Transport-level close.
    Closed(ConnectionError),
}

enum UniState {
    AwaitType(BytesMut),
    Control,
    QpackEncoder,
    QpackDecoder,
    Ignored,
}

#[derive(Default)]
struct RequestStream {
    reader: FrameReader,
    headers_done: bool,
    /// Header section parked in the QPACK blocked queue.
    headers_blocked: bool,
    /// Body frames that arrived while the head was blocked.
    pending_body: Vec<Bytes>,
    fin_seen: bool,
}

/// Client side of one HTTP/3 connection.
pub struct H3Connection {
    quic: ConnectionHandle,
    events: mpsc::Receiver<DriverEvent>,
    qpack_encoder: Encoder,
    qpack_decoder: Decoder,
    control_stream: StreamId,
    encoder_stream: StreamId,
    decoder_stream: StreamId,
    peer_uni: HashMap<StreamId, UniState>,
    peer_control: Option<StreamId>,
    peer_encoder: Option<StreamId>,
    peer_decoder: Option<StreamId>,
    control_reader: FrameReader,
    encoder_instr_buf: BytesMut,
    decoder_instr_buf: BytesMut,
    requests: HashMap<StreamId, RequestStream>,
    settings_received: bool,
    peer_settings: Settings,
    goaway: Option<u64>,
    pending: VecDeque<H3Event>,
    failed: bool,
}

impl H3Connection {
    /// Set up the HTTP/3 layer over a connected (or 0-RTT-eligible) QUIC
    /// driver. Opens the control stream and QPACK stream pair and sends
    /// SETTINGS; with `early_data` the streams ride in the first flight.
    pub async fn new(
        quic: ConnectionHandle,
        mut events: mpsc::Receiver<DriverEvent>,
        early_data: bool,
    ) -> Result<H3Connection, H3Error> {
        let mut pending = VecDeque::new();
        if !early_data {
            // Wait for the transport before opening streams: stream
            // limits are not known until the peer's parameters arrive.
            loop {
                match events.recv().await {
                    Some(DriverEvent::Connected { used_early_data }) => {
                        pending.push_back(H3Event::Connected { used_early_data });
                        break;
                    }
                    Some(DriverEvent::Closed(error)) => {
                        return Err(H3Error::Connection(error));
                    }
                    Some(_) => continue,
                    None => {
                        return Err(H3Error::Connection(ConnectionError::LocallyClosed))
                    }
                }
            }
        }

        let critical = StreamPriority { class: 0, weight: 10.0 };
        let control = quic.open_stream(false, critical).await?;
        let encoder_stream = quic.open_stream(false, critical).await?;
        let decoder_stream = quic.open_stream(false, critical).await?;

        // Each uni stream leads with its type varint; the control stream
        // must immediately carry SETTINGS.
        let mut control_bytes = BytesMut::new();
        encode_varint(&mut control_bytes, StreamType::Control.value());
        H3Frame::Settings(Settings::local_default()).encode(&mut control_bytes);
        quic.send(control, control_bytes.freeze(), false).await?;
        quic.send(
            encoder_stream,
            Bytes::from(varint_bytes(StreamType::QpackEncoder.value())),
            false,
        )
        .await?;
        quic.send(
            decoder_stream,
            Bytes::from(varint_bytes(StreamType::QpackDecoder.value())),
            false,
        )
        .await?;
        debug!(?control, ?encoder_stream, ?decoder_stream, "h3 critical streams open");

        let local = Settings::local_default();
        Ok(H3Connection {
            quic,
            events,
            qpack_encoder: Encoder::new(),
            qpack_decoder: Decoder::new(
                local.qpack_max_table_capacity,
                local.qpack_blocked_streams as usize,
            ),
            control_stream: control,
            encoder_stream,
            decoder_stream,
            peer_uni: HashMap::new(),
            peer_control: None,
            peer_encoder: None,
            peer_decoder: None,
            control_reader: FrameReader::default(),
            encoder_instr_buf: BytesMut::new(),
            decoder_instr_buf: BytesMut::new(),
            requests: HashMap::new(),
            settings_received: false,
            peer_settings: Settings::default(),
            goaway: None,
            pending,
            failed: false,
        })
    }

    pub fn quic(&self) -> &ConnectionHandle {
        &self.quic
    }

    /// Whether new requests may still be issued.
    pub fn accepting_requests(&self) -> bool {
        self.goaway.is_none() && !self.failed && self.quic.is_alive()
    }

    /// Open a request stream and send the field section (+ optional body).
    pub async fn send_request(
        &mut self,
        fields: &[(String, String)],
        body: Option<Bytes>,
        priority: StreamPriority,
    ) -> Result<StreamId, H3Error> {
        if self.goaway.is_some() {
            return Err(H3Error::GoingAway);
        }
        let stream = self.quic.open_stream(true, priority).await?;
        let (section, instructions) = self.qpack_encoder.encode(stream.0, fields);
        if !instructions.is_empty() {
            self.quic
                .send(self.encoder_stream, Bytes::from(instructions), false)
                .await?;
        }

        let mut out = BytesMut::new();
        H3Frame::Headers(Bytes::from(section)).encode(&mut out);
        let has_body = body.as_ref().is_some_and(|b| !b.is_empty());
        if let Some(body) = body {
            if !body.is_empty() {
                H3Frame::Data(body).encode(&mut out);
            }
        }
        self.quic.send(stream, out.freeze(), true).await?;
        self.requests.insert(stream, RequestStream::default());
        trace!(?stream, has_body, "request sent");
        Ok(stream)
    }

    /// Cancel a request: reset our half, ask the peer to stop, and tell
    /// the QPACK peer the section will never be acknowledged.
    pub async fn cancel_request(&mut self, stream: StreamId) {
        self.quic
            .reset(stream, H3ErrorCode::RequestCancelled.code())
            .await;
        self.quic
            .stop_sending(stream, H3ErrorCode::RequestCancelled.code())
            .await;
        let instruction = self.qpack_decoder.cancel_stream(stream.0);
        let _ = self
            .quic
            .send(self.decoder_stream, Bytes::from(instruction), false)
            .await;
        self.requests.remove(&stream);
    }

    /// Next HTTP/3 event; `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<H3Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.failed {
                return None;
            }
            let event = self.events.recv().await?;
            if let Err(error) = self.process_transport_event(event).await {
                return Some(H3Event::Error(error));
            }
        }
    }

    /// Already-queued HTTP/3 event, without touching the transport.
    pub fn poll_pending_event(&mut self) -> Option<H3Event> {
        self.pending.pop_front()
    }

    /// Next raw transport event. Cancel-safe: nothing is processed here,
    /// so this may sit inside a `select!`.
    pub async fn recv_transport_event(&mut self) -> Option<DriverEvent> {
        if self.failed {
            return None;
        }
        self.events.recv().await
    }

    /// Apply one raw transport event; resulting HTTP/3 events queue up
    /// behind [`poll_pending_event`](H3Connection::poll_pending_event).
    pub async fn process_transport_event(&mut self, event: DriverEvent) -> Result<(), H3Error> {
        match self.on_driver_event(event).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.fail(&error).await;
                Err(error)
            }
        }
    }

    async fn fail(&mut self, error: &H3Error) {
        warn!(%error, "fatal http/3 error, closing connection");
        self.failed = true;
        self.quic
            .close(error.code().code(), "http/3 protocol error")
            .await;
    }

    async fn on_driver_event(&mut self, event: DriverEvent) -> Result<(), H3Error> {
        match event {
            DriverEvent::Connected { used_early_data } => {
                self.pending.push_back(H3Event::Connected { used_early_data });
            }
            DriverEvent::ZeroRttRejected => {
                self.pending.push_back(H3Event::ZeroRttRejected);
            }
            DriverEvent::StreamData { id, data, fin } => {
                self.on_stream_data(id, data, fin).await?;
            }
            DriverEvent::StreamReset { id, error_code } => {
                if self.is_critical(id) {
                    return Err(H3Error::ClosedCriticalStream);
                }
                self.requests.remove(&id);
                self.pending.push_back(H3Event::Reset { stream: id, error_code });
            }
            DriverEvent::StreamStopped { id, error_code } => {
                trace!(?id, error_code, "peer stopped reading request stream");
            }
            DriverEvent::NewToken(token) => {
                self.pending.push_back(H3Event::NewToken(token));
            }
            DriverEvent::SessionTicket { ticket, suite } => {
                self.pending.push_back(H3Event::SessionTicket { ticket, suite });
            }
            DriverEvent::Closed(error) => {
                self.failed = true;
                self.pending.push_back(H3Event::Closed(error));
            }
        }
        Ok(())
    }

    fn is_critical(&self, id: StreamId) -> bool {
        Some(id) == self.peer_control
            || Some(id) == self.peer_encoder
            || Some(id) == self.peer_decoder
            || id == self.control_stream
            || id == self.encoder_stream
            || id == self.decoder_stream
    }

    async fn on_stream_data(
        &mut self,
        id: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<(), H3Error> {
        if id.is_bidi() && id.initiator() == Side::Client {
            return self.on_request_data(id, &data, fin).await;
        }
        if id.is_bidi() {
            // Server-initiated bidi streams are not defined in HTTP/3.
            return Err(H3Error::Protocol("server-initiated bidirectional stream"));
        }
        self.on_uni_data(id, &data, fin).await
    }

    async fn on_uni_data(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<(), H3Error> {
        let state = self
            .peer_uni
            .entry(id)
            .or_insert_with(|| UniState::AwaitType(BytesMut::new()));

        if let UniState::AwaitType(buf) = state {
            buf.extend_from_slice(data);
            let mut peek = &buf[..];
            let Ok(type_value) = quantum_quic::varint::VarInt::decode(&mut peek) else {
                if fin {
                    self.peer_uni.insert(id, UniState::Ignored);
                }
                return Ok(());
            };
            let rest = peek.to_vec();
            let ty = StreamType::from_value(type_value.value());
            let next = match ty {
                StreamType::Control => {
                    if self.peer_control.is_some() {
                        return Err(H3Error::Protocol("second control stream"));
                    }
                    self.peer_control = Some(id);
                    UniState::Control
                }
                StreamType::QpackEncoder => {
                    if self.peer_encoder.is_some() {
                        return Err(H3Error::Protocol("second encoder stream"));
                    }
                    self.peer_encoder = Some(id);
                    UniState::QpackEncoder
                }
                StreamType::QpackDecoder => {
                    if self.peer_decoder.is_some() {
                        return Err(H3Error::Protocol("second decoder stream"));
                    }
                    self.peer_decoder = Some(id);
                    UniState::QpackDecoder
                }
                StreamType::Push | StreamType::Unknown(_) => {
                    // No MAX_PUSH_ID was issued and reserved types are
                    // ignored wholesale.
                    UniState::Ignored
                }
            };
            self.peer_uni.insert(id, next);
            return self.on_uni_payload(id, &rest, fin).await;
        }
        self.on_uni_payload(id, data, fin).await
    }

    async fn on_uni_payload(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(), H3Error> {
        let role = match self.peer_uni.get(&id) {
            Some(UniState::Control) => StreamType::Control,
            Some(UniState::QpackEncoder) => StreamType::QpackEncoder,
            Some(UniState::QpackDecoder) => StreamType::QpackDecoder,
            _ => return Ok(()),
        };
        if fin {
            return Err(H3Error::ClosedCriticalStream);
        }
        match role {
            StreamType::Control => {
                self.control_reader.push(data);
                while let Some(frame) = self.control_reader.next_frame()? {
                    self.on_control_frame(frame)?;
                }
            }
            StreamType::QpackEncoder => {
                self.encoder_instr_buf.extend_from_slice(data);
                let (consumed, ici) = self
                    .qpack_decoder
                    .on_encoder_instructions(&self.encoder_instr_buf)?;
                let _ = self.encoder_instr_buf.split_to(consumed);
                if !ici.is_empty() {
                    self.quic
                        .send(self.decoder_stream, Bytes::from(ici), false)
                        .await?;
                }
                // Inserts may have released blocked sections.
                let ready = self.qpack_decoder.take_unblocked();
                for (stream_id, section) in ready {
                    self.finish_headers(StreamId(stream_id), &section, true).await?;
                }
            }
            StreamType::QpackDecoder => {
                self.decoder_instr_buf.extend_from_slice(data);
                let consumed = self
                    .qpack_encoder
                    .on_decoder_instructions(&self.decoder_instr_buf)?;
                let _ = self.decoder_instr_buf.split_to(consumed);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_control_frame(&mut self, frame: H3Frame) -> Result<(), H3Error> {
        if !self.settings_received {
            let H3Frame::Settings(settings) = frame else {
                return Err(H3Error::MissingSettings);
            };
            self.settings_received = true;
            self.peer_settings = settings;
            self.qpack_encoder.apply_settings(
                settings.qpack_max_table_capacity,
                settings.qpack_blocked_streams,
            );
            debug!(?settings, "peer settings applied");
            return Ok(());
        }
        match frame {
            H3Frame::Settings(_) => Err(H3Error::FrameUnexpected("second SETTINGS")),
            H3Frame::GoAway(last_stream_id) => {
                self.goaway = Some(last_stream_id);
                self.pending.push_back(H3Event::GoAway { last_stream_id });
                Ok(())
            }
            H3Frame::CancelPush(_) | H3Frame::MaxPushId(_) => Ok(()),
            H3Frame::Unknown { .. } => Ok(()),
            H3Frame::Data(_) | H3Frame::Headers(_) | H3Frame::PushPromise { .. } => {
                Err(H3Error::FrameUnexpected("request frame on control stream"))
            }
        }
    }

    async fn on_request_data(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(), H3Error> {
        let frames = {
            let Some(request) = self.requests.get_mut(&id) else {
                trace!(?id, "data for unknown request stream dropped");
                return Ok(());
            };
            request.reader.push(data);
            if fin {
                request.fin_seen = true;
            }
            let mut frames = Vec::new();
            while let Some(frame) = request.reader.next_frame()? {
                frames.push(frame);
            }
            if fin && request.reader.buffered() > 0 {
                return Err(H3Error::Frame("stream ended mid-frame"));
            }
            frames
        };

        for frame in frames {
            // Processing may drop the request (fin after headers); late
            // frames for it are simply ignored.
            if !self.requests.contains_key(&id) {
                break;
            }
            match frame {
                H3Frame::Headers(section) => {
                    self.finish_headers(id, &section, false).await?;
                }
                H3Frame::Data(body) => {
                    let Some(request) = self.requests.get_mut(&id) else { break };
                    if request.headers_done {
                        self.pending
                            .push_back(H3Event::Data { stream: id, data: body, fin: false });
                    } else if request.headers_blocked {
                        request.pending_body.push(body);
                    } else {
                        return Err(H3Error::FrameUnexpected("DATA before HEADERS"));
                    }
                }
                H3Frame::Unknown { .. } => {}
                H3Frame::Settings(_) | H3Frame::GoAway(_) | H3Frame::CancelPush(_)
                | H3Frame::MaxPushId(_) => {
                    return Err(H3Error::FrameUnexpected("control frame on request stream"));
                }
                H3Frame::PushPromise { .. } => {
                    // We never raised MAX_PUSH_ID.
                    return Err(H3Error::FrameUnexpected("unsolicited push promise"));
                }
            }
        }

        // A clean FIN with everything parsed completes the response once
        // the head is out.
        if fin {
            if let Some(request) = self.requests.get(&id) {
                if request.headers_done {
                    self.pending.push_back(H3Event::Data {
                        stream: id,
                        data: Bytes::new(),
                        fin: true,
                    });
                    self.requests.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Decode a header section for a request stream.
    ///
    /// `flush` is set when called outside normal stream processing (a
    /// previously blocked section released by QPACK inserts), in which
    /// case a stored FIN is delivered here instead of by the caller.
    async fn finish_headers(
        &mut self,
        id: StreamId,
        section: &[u8],
        flush: bool,
    ) -> Result<(), H3Error> {
        match self.qpack_decoder.decode_section(id.0, section)? {
            DecodeOutcome::Fields { fields, ack } => {
                if !ack.is_empty() {
                    self.quic
                        .send(self.decoder_stream, Bytes::from(ack), false)
                        .await?;
                }
                let (already_done, pending_body, finished) = match self.requests.get_mut(&id) {
                    Some(request) => {
                        let already_done = request.headers_done;
                        request.headers_done = true;
                        request.headers_blocked = false;
                        let body = std::mem::take(&mut request.pending_body);
                        let finished = request.fin_seen && request.reader.buffered() == 0;
                        (already_done, body, finished)
                    }
                    None => return Ok(()),
                };
                if already_done {
                    // Trailer section: decoded for QPACK accounting only.
                    trace!(?id, "trailer section dropped");
                    return Ok(());
                }
                self.pending
                    .push_back(H3Event::Headers { stream: id, fields, fin: false });
                for body in pending_body {
                    self.pending
                        .push_back(H3Event::Data { stream: id, data: body, fin: false });
                }
                if flush && finished {
                    self.pending.push_back(H3Event::Data {
                        stream: id,
                        data: Bytes::new(),
                        fin: true,
                    });
                    self.requests.remove(&id);
                }
            }
            DecodeOutcome::Blocked => {
                if let Some(request) = self.requests.get_mut(&id) {
                    request.headers_blocked = true;
                }
                trace!(?id, "header section blocked on qpack inserts");
            }
        }
        Ok(())
    }
}

/// Build HTTP/3 request fields from parts, merging defaults.
pub fn build_request_fields(
    method: &str,
    scheme: &str,
    authority: &str,
    path: &str,
    headers: &HeaderMap,
) -> Result<Vec<(String, String)>, H3Error> {
    crate::headers::request_fields(method, scheme, authority, path, headers)
}

fn encode_varint<B: bytes::BufMut>(out: &mut B, value: u64) {
    quantum_quic::varint::VarInt::new(value.min(quantum_quic::varint::VarInt::MAX.value()))
        .unwrap_or(quantum_quic::varint::VarInt::MAX)
        .encode(out)
}

fn varint_bytes(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    encode_varint(&mut out, value);
    out
}
