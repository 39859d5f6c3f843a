//! Type-tagged payload envelope: `[u16 LE tag length][tag][body]`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::action::Action;
use crate::{ProtocolError, Result, MAX_TAG_LEN};

const TAG_PREFIX_SIZE: usize = 2;

/// Wrap an already-serialized body with its tag.
pub fn encode_payload(tag: &str, body: &[u8]) -> Result<Bytes> {
    if tag.len() > MAX_TAG_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "tag is {} bytes (max {MAX_TAG_LEN})",
            tag.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(TAG_PREFIX_SIZE + tag.len() + body.len());
    buf.put_u16_le(tag.len() as u16);
    buf.extend_from_slice(tag.as_bytes());
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Split a payload into its tag and body.
pub fn decode_payload(payload: &[u8]) -> Result<(&str, &[u8])> {
    if payload.len() < TAG_PREFIX_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "payload is {} bytes, shorter than the tag prefix",
            payload.len()
        )));
    }

    let tag_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let rest = &payload[TAG_PREFIX_SIZE..];
    if rest.len() < tag_len {
        return Err(ProtocolError::MalformedPayload(format!(
            "tag length {tag_len} exceeds remaining {} bytes",
            rest.len()
        )));
    }

    let (tag, body) = rest.split_at(tag_len);
    let tag = std::str::from_utf8(tag)
        .map_err(|e| ProtocolError::MalformedPayload(format!("tag is not utf-8: {e}")))?;
    Ok((tag, body))
}

/// Encode an action into a payload (no length prefix).
pub fn encode_action<C: ?Sized + 'static>(action: &dyn Action<C>) -> Result<Bytes> {
    let body = action.encode_body()?;
    encode_payload(action.tag(), &body)
}
