//! Scripted in-memory transport that plays the device in tests

use async_trait::async_trait;
use dps_protocol::{FrameBuilder, FrameReader, ProtocolError, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays queued reply frames and records every frame sent
pub struct ScriptedTransport {
    replies: VecDeque<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Queue a raw reply
    pub fn reply(mut self, raw: Vec<u8>) -> Self {
        self.replies.push_back(raw);
        self
    }

    /// Queue a `[id|0x80][status]` reply followed by whatever `body` packs
    pub fn respond(self, command: u8, status: u8, body: impl FnOnce(&mut FrameBuilder)) -> Self {
        let mut f = FrameBuilder::new();
        f.pack8(command | 0x80).pack8(status);
        body(&mut f);
        self.reply(f.end().into_bytes())
    }

    /// Handle on the sent frames, valid after the transport is moved away
    pub fn sent(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.sent.clone()
    }
}

/// Payloads (CRC stripped) of the recorded frames
pub fn sent_payloads(sent: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<Vec<u8>> {
    sent.lock()
        .unwrap()
        .iter()
        .map(|raw| {
            FrameReader::from_received(raw)
                .unwrap()
                .remaining()
                .to_vec()
        })
        .collect()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::NotConnected);
        }
        self.replies.pop_front().ok_or(ProtocolError::DeviceTimeout)
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.closed = true;
        Ok(())
    }
}
