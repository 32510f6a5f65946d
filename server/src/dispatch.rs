//! Application packet dispatch.
//!
//! The runtime hands the dispatcher one complete packet at a time; replies
//! are queued into an [`Outbound`] sink and sent by the session after the
//! receive buffer has been returned.

use bytes::BytesMut;
use protocol_frame::encode_frame;

/// Message ids understood by the reference dispatcher. The engine itself
/// treats ids as opaque.
pub mod msg {
    pub const WELCOME: u16 = 1;
    pub const PLAYER_MOVE: u16 = 2;
    pub const CHAT: u16 = 3;
    pub const CHAT_ECHO: u16 = 103;
}

/// Prefix prepended to echoed chat payloads.
pub const ECHO_PREFIX: &[u8] = b"[Server echo]: ";

/// Upper bound on reply bytes queued per dispatch round. A dispatcher that
/// exceeds it has no way to apply backpressure mid-round, so the session is
/// closed instead of buffering without limit.
pub const MAX_OUTBOUND_BYTES: usize = 256 * 1024;

/// Reply sink for one dispatch round.
pub struct Outbound {
    frames: Vec<BytesMut>,
    bytes: usize,
    limit: usize,
    overflowed: bool,
}

impl Outbound {
    pub fn new() -> Self {
        Self::with_limit(MAX_OUTBOUND_BYTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Outbound {
            frames: Vec::new(),
            bytes: 0,
            limit,
            overflowed: false,
        }
    }

    /// Queue one reply frame. Oversized payloads and limit overruns mark
    /// the sink as overflowed; the session treats that as fatal.
    pub fn push(&mut self, id: u16, payload: &[u8]) {
        match encode_frame(id, payload) {
            Ok(frame) => {
                self.bytes += frame.len();
                if self.bytes > self.limit {
                    self.overflowed = true;
                } else {
                    self.frames.push(frame);
                }
            }
            Err(e) => {
                tracing::warn!("dropping unencodable reply frame: {e}");
                self.overflowed = true;
            }
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        self.frames.iter().map(|f| f.as_ref())
    }
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronous application-side packet handler.
pub trait Dispatch {
    fn dispatch(&self, id: u16, payload: &[u8], out: &mut Outbound);
}

/// The reference game dispatcher: welcome handshake, player movement, and
/// chat echo.
pub struct GameDispatch;

impl Dispatch for GameDispatch {
    fn dispatch(&self, id: u16, payload: &[u8], out: &mut Outbound) {
        match id {
            msg::WELCOME => {
                out.push(msg::WELCOME, &[]);
            }
            msg::PLAYER_MOVE => {
                // Movement is consumed server-side; no reply.
                tracing::debug!(len = payload.len(), "player move");
            }
            msg::CHAT => {
                let text = String::from_utf8_lossy(payload);
                tracing::debug!(%text, "chat message");

                let mut reply = Vec::with_capacity(ECHO_PREFIX.len() + payload.len());
                reply.extend_from_slice(ECHO_PREFIX);
                reply.extend_from_slice(payload);
                out.push(msg::CHAT_ECHO, &reply);
            }
            other => {
                tracing::debug!(id = other, len = payload.len(), "ignoring unknown packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_of(out: &Outbound) -> Vec<Vec<u8>> {
        out.frames().map(|f| f.to_vec()).collect()
    }

    #[test]
    fn welcome_replies_with_empty_welcome() {
        let mut out = Outbound::new();
        GameDispatch.dispatch(msg::WELCOME, &[], &mut out);
        assert_eq!(frames_of(&out), vec![vec![4, 0, 1, 0]]);
    }

    #[test]
    fn player_move_has_no_reply() {
        let mut out = Outbound::new();
        GameDispatch.dispatch(msg::PLAYER_MOVE, &[10, 20, 30, 40], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn chat_is_echoed_with_prefix() {
        let mut out = Outbound::new();
        GameDispatch.dispatch(msg::CHAT, b"hello world!", &mut out);

        let frames = frames_of(&out);
        assert_eq!(frames.len(), 1);

        let frame = &frames[0];
        let expected_payload = b"[Server echo]: hello world!";
        assert_eq!(frame.len(), 4 + expected_payload.len());
        assert_eq!(frame[..2], ((4 + expected_payload.len()) as u16).to_le_bytes());
        assert_eq!(frame[2..4], msg::CHAT_ECHO.to_le_bytes());
        assert_eq!(&frame[4..], expected_payload);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut out = Outbound::new();
        GameDispatch.dispatch(999, b"whatever", &mut out);
        assert!(out.is_empty());
        assert!(!out.overflowed());
    }

    #[test]
    fn outbound_overflow_is_flagged() {
        let mut out = Outbound::with_limit(16);
        out.push(1, &[0u8; 32]);
        assert!(out.overflowed());
    }
}
