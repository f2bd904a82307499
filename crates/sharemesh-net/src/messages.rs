//! Wire messages carried inside frames
//!
//! Control messages are postcard-encoded. Anything carrying records is JSON,
//! the same encoding clients sign and the store persists.

use crate::framing::{Frame, FrameError, FrameType};
use serde::{Deserialize, Serialize};
use sharemesh_core::SharedRecord;
use std::net::IpAddr;

/// Logical channel a link opens on the remote node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Receive the remote's content and request its history (we are downstream of it)
    Subscribe,
    /// Push our content into the remote (it is our downstream)
    Deliver,
}

/// First frame of a gossip link
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub channel: Channel,
    /// Advertised host of the opener, for logging
    pub host: Option<String>,
}

/// Catch-up request: records created at or after `from`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHistory {
    pub request_id: u64,
    /// Unix seconds
    pub from: i64,
    pub limit: u32,
}

/// Catch-up response, oldest first
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub request_id: u64,
    pub records: Vec<SharedRecord>,
}

/// Reflection probe answer: the caller's address as seen by the peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedAddr {
    pub ip: IpAddr,
}

impl OpenChannel {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(FrameType::OpenChannel, postcard::to_allocvec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        frame.expect(FrameType::OpenChannel)?;
        Ok(postcard::from_bytes(&frame.payload)?)
    }
}

impl GetHistory {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(FrameType::GetHistory, postcard::to_allocvec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        frame.expect(FrameType::GetHistory)?;
        Ok(postcard::from_bytes(&frame.payload)?)
    }
}

impl History {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(FrameType::History, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        frame.expect(FrameType::History)?;
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

impl ReflectedAddr {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(FrameType::ReflectedAddr, postcard::to_allocvec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        frame.expect(FrameType::ReflectedAddr)?;
        Ok(postcard::from_bytes(&frame.payload)?)
    }
}

/// Encode a record as a `ShareContent` frame
pub fn share_content(record: &SharedRecord) -> Result<Frame, FrameError> {
    Ok(Frame::new(FrameType::ShareContent, serde_json::to_vec(record)?))
}

/// Decode a `ShareContent` frame
pub fn shared_record(frame: &Frame) -> Result<SharedRecord, FrameError> {
    frame.expect(FrameType::ShareContent)?;
    Ok(serde_json::from_slice(&frame.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoding_checks_frame_type() {
        let request = GetHistory { request_id: 1, from: 10, limit: 5 };
        let frame = request.to_frame().unwrap();

        assert_eq!(GetHistory::from_frame(&frame).unwrap(), request);
        assert!(matches!(
            OpenChannel::from_frame(&frame),
            Err(FrameError::Unexpected(FrameType::GetHistory))
        ));
    }

    #[test]
    fn test_share_content_is_json() {
        let mut record = SharedRecord::new("http://a", "text/html");
        record.id = Some("abc".into());
        record.created = Some(42);

        let frame = share_content(&record).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(json["content"]["mimeType"], "text/html");
        assert_eq!(shared_record(&frame).unwrap(), record);
    }
}
