//! Outbound frame pacing.
//!
//! Agent audio arrives in arbitrarily sized payloads; the telephony side
//! wants exactly 20 ms of μ-law per `media` record with monotonically
//! increasing sequencing fields. The pacer transcodes, cuts 160-byte
//! frames, and carries any incomplete tail into the next payload. It never
//! waits in wall-clock time; the telephony side buffers and plays at line
//! rate.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_codec::{bytes_to_pcm, downsample_16k_to_8k, mulaw_encode};
use bridge_protocol::telephony::OutboundEvent;
use bridge_protocol::{AudioFormat, FRAME_BYTES, FRAME_MS};

#[derive(Debug)]
pub struct FramePacer {
    seq: u64,
    chunk: u64,
    ts_ms: u64,
    carry: Vec<u8>,
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePacer {
    pub fn new() -> Self {
        Self {
            seq: 1,
            chunk: 1,
            ts_ms: 0,
            carry: Vec::new(),
        }
    }

    /// Media frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.seq - 1
    }

    /// Cut one agent payload into paced `media` + `mark` record pairs.
    pub fn push(
        &mut self,
        payload: &[u8],
        format: AudioFormat,
        stream_sid: &str,
    ) -> Vec<OutboundEvent> {
        match format {
            AudioFormat::Ulaw8000 => self.carry.extend_from_slice(payload),
            AudioFormat::Pcm16k => {
                let pcm = bytes_to_pcm(payload);
                self.carry.extend(mulaw_encode(&downsample_16k_to_8k(&pcm)));
            }
            AudioFormat::Pcm8k => {
                self.carry.extend(mulaw_encode(&bytes_to_pcm(payload)));
            }
        }

        let mut records = Vec::new();
        while self.carry.len() >= FRAME_BYTES {
            let frame: Vec<u8> = self.carry.drain(..FRAME_BYTES).collect();
            records.push(OutboundEvent::media(
                stream_sid,
                self.seq,
                self.chunk,
                self.ts_ms,
                BASE64.encode(&frame),
            ));
            records.push(OutboundEvent::mark(stream_sid, self.chunk));
            self.seq += 1;
            self.chunk += 1;
            self.ts_ms += FRAME_MS;
        }
        records
    }
}
