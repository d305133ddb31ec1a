//! Scripted QUIC peer for exercising the client state machine.
//!
//! [`TestPeer`] plays the server role over plain byte buffers: it opens
//! client datagrams with real packet protection and emits hand-assembled
//! response datagrams. Combined with the mock TLS session it drives full
//! handshakes, 0-RTT acceptance/rejection and stream exchanges without a
//! socket.

use bytes::BytesMut;

use crate::crypto::{DirectionalKeys, PacketKeys};
use crate::frame::{self, Frame};
use crate::packet::{
    decrypt_packet, parse_header, ConnectionId, Epoch, PacketBuilder, PacketType,
};
use crate::params::TransportParameters;
use crate::tls::testing::mock_secrets;

/// Server-side counterpart for a client connection under test.
pub struct TestPeer {
    pub scid: ConnectionId,
    pub client_scid: Option<ConnectionId>,
    /// Key-phase bit stamped onto outgoing 1-RTT packets.
    pub key_phase: bool,
    initial_keys: Option<PacketKeys>,
    handshake_keys: PacketKeys,
    app_keys: PacketKeys,
    zero_rtt_open: DirectionalKeys,
    next_pn: [u64; Epoch::COUNT],
    largest: [Option<u64>; Epoch::COUNT],
}

impl Default for TestPeer {
    fn default() -> Self {
        TestPeer::new()
    }
}

impl TestPeer {
    pub fn new() -> Self {
        let hs = mock_secrets(0x11);
        let app = mock_secrets(0x22);
        let early = mock_secrets(0x33);
        TestPeer {
            scid: ConnectionId::random(8),
            client_scid: None,
            key_phase: false,
            initial_keys: None,
            // Server view: local = server secret.
            handshake_keys: PacketKeys::from_secrets(
                hs.suite,
                &hs.server_secret,
                &hs.client_secret,
            ),
            app_keys: PacketKeys::from_secrets(
                app.suite,
                &app.server_secret,
                &app.client_secret,
            ),
            zero_rtt_open: PacketKeys::from_secrets(
                early.suite,
                &early.client_secret,
                &early.server_secret,
            )
            .local,
            next_pn: [0; Epoch::COUNT],
            largest: [None; Epoch::COUNT],
        }
    }

    /// Transport parameters a well-behaved test server advertises.
    pub fn server_params() -> TransportParameters {
        TransportParameters {
            max_idle_timeout_ms: 60_000,
            initial_max_data: 1_000_000,
            initial_max_stream_data_bidi_local: 100_000,
            initial_max_stream_data_bidi_remote: 100_000,
            initial_max_stream_data_uni: 100_000,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            ..TransportParameters::default()
        }
    }

    /// Open every packet in a client datagram and return the frames.
    pub fn recv(&mut self, datagram: &[u8]) -> Vec<(PacketType, Vec<Frame>)> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < datagram.len() {
            let local_cid_len = self.scid.len();
            let Ok(parsed) = parse_header(datagram, offset, local_cid_len) else { break };
            let packet_start = offset;
            offset += parsed.packet_len.max(1);

            let ty = parsed.header.ty;
            if self.initial_keys.is_none() && ty == PacketType::Initial {
                // First flight: derive server initial keys from the
                // client-chosen DCID and remember the client's SCID.
                self.initial_keys =
                    Some(PacketKeys::initial(parsed.header.dcid.as_ref(), false));
                self.client_scid = parsed.header.scid;
            }

            let Some(epoch) = ty.epoch() else { continue };
            let keys: &DirectionalKeys = match ty {
                PacketType::Initial => {
                    let Some(keys) = &self.initial_keys else { continue };
                    &keys.remote
                }
                PacketType::Handshake => &self.handshake_keys.remote,
                PacketType::ZeroRtt => &self.zero_rtt_open,
                PacketType::OneRtt => &self.app_keys.remote,
                _ => continue,
            };
            let Ok(plain) =
                decrypt_packet(keys, &parsed, datagram, packet_start, self.largest[epoch as usize])
            else {
                continue;
            };
            let space = &mut self.largest[epoch as usize];
            *space = Some(space.map_or(plain.packet_number, |l| l.max(plain.packet_number)));
            if let Ok(frames) = frame::parse_payload(&plain.payload, ty) {
                out.push((ty, frames));
            }
        }
        out
    }

    /// Assemble a coalesced server datagram from (type, frames) parts.
    pub fn build(&mut self, parts: &[(PacketType, Vec<Frame>)]) -> Vec<u8> {
        let dcid = self.client_scid.unwrap_or(ConnectionId::random(8));
        let mut out = BytesMut::new();
        for (ty, frames) in parts {
            let epoch = match ty.epoch() {
                Some(e) => e,
                None => continue,
            };
            let mut payload = Vec::new();
            for f in frames {
                f.encode(&mut payload);
            }
            let pn = self.next_pn[epoch as usize];
            self.next_pn[epoch as usize] += 1;
            let keys: &DirectionalKeys = match ty {
                PacketType::Initial => {
                    let Some(keys) = &self.initial_keys else { continue };
                    &keys.local
                }
                PacketType::Handshake => &self.handshake_keys.local,
                PacketType::OneRtt => &self.app_keys.local,
                _ => continue,
            };
            let builder = PacketBuilder {
                ty: *ty,
                dcid,
                scid: self.scid,
                token: &[],
                packet_number: pn,
                largest_acked: None,
                key_phase: self.key_phase,
            };
            builder
                .finish(keys, payload, 0, &mut out)
                .expect("test peer packet build");
        }
        out.to_vec()
    }

    /// The standard server response to a ClientHello: Initial carrying an
    /// ACK plus ServerHello, coalesced with the Handshake flight. The
    /// flight embeds the early-data verdict and the server parameters the
    /// mock TLS session hands to the client.
    pub fn handshake_flight(&mut self, accept_early_data: bool) -> Vec<u8> {
        use crate::tls::testing::{MOCK_SERVER_FLIGHT_PREFIX, MOCK_SERVER_HELLO};
        let mut flight = MOCK_SERVER_FLIGHT_PREFIX.to_vec();
        flight.push(if accept_early_data { 1 } else { 0 });
        flight.extend_from_slice(&Self::server_params().encode());

        let initial_frames = vec![
            Frame::Ack { largest: 0, delay: 0, ranges: vec![(0, 0)], ecn: None },
            Frame::Crypto { offset: 0, data: MOCK_SERVER_HELLO.to_vec().into() },
        ];
        let hs_frames = vec![Frame::Crypto { offset: 0, data: flight.into() }];
        self.build(&[
            (PacketType::Initial, initial_frames),
            (PacketType::Handshake, hs_frames),
        ])
    }

    /// 1-RTT packet confirming the handshake.
    pub fn handshake_done(&mut self) -> Vec<u8> {
        self.build(&[(PacketType::OneRtt, vec![Frame::HandshakeDone])])
    }

    /// Advance the 1-RTT keys one generation and flip the phase bit,
    /// as a server initiating a key update would.
    pub fn update_app_keys(&mut self) {
        self.app_keys = self.app_keys.update();
        self.key_phase = !self.key_phase;
    }

    /// All STREAM frames observed for a given stream, concatenated in
    /// offset order, plus whether a FIN arrived.
    pub fn stream_data(
        received: &[(PacketType, Vec<Frame>)],
        stream_id: u64,
    ) -> (Vec<u8>, bool) {
        let mut chunks: Vec<(u64, &[u8], bool)> = Vec::new();
        for (_, frames) in received {
            for f in frames {
                if let Frame::Stream { stream_id: sid, offset, data, fin } = f {
                    if *sid == stream_id {
                        chunks.push((*offset, data.as_ref(), *fin));
                    }
                }
            }
        }
        chunks.sort_by_key(|&(off, _, _)| off);
        let mut out: Vec<u8> = Vec::new();
        let mut fin = false;
        for (off, data, f) in chunks {
            let off = off as usize;
            if off + data.len() > out.len() {
                let skip = out.len().saturating_sub(off);
                out.extend_from_slice(&data[skip..]);
            }
            fin |= f;
        }
        (out, fin)
    }
}
