use std::collections::VecDeque;

use gcs_proto::{CommandLongData, Message, Payload};

/// Frames waiting for the transport, stamped with our ids and sequence.
#[derive(Debug)]
pub struct Outbox {
    system_id: u8,
    component_id: u8,
    sequence: u8,
    queue: VecDeque<Message>,
}

impl Outbox {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        Self { system_id, component_id, sequence: 0, queue: VecDeque::new() }
    }

    pub fn push(&mut self, payload: Payload) {
        let msg = Message {
            sequence: self.sequence,
            system_id: self.system_id,
            component_id: self.component_id,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.queue.push_back(msg);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    pub fn component_id(&self) -> u8 {
        self.component_id
    }

    /// Queued command transmissions, oldest first.
    pub fn commands(&self) -> impl Iterator<Item = &CommandLongData> {
        self.queue.iter().filter_map(|m| match &m.payload {
            Payload::CommandLong(c) => Some(c),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcs_proto::HeartbeatData;

    #[test]
    fn stamps_ids_and_wraps_sequence() {
        let mut out = Outbox::new(255, 190);
        for _ in 0..257 {
            out.push(Payload::Heartbeat(HeartbeatData::default()));
        }
        let msgs: Vec<_> = out.drain().collect();
        assert_eq!(msgs[0].sequence, 0);
        assert_eq!(msgs[255].sequence, 255);
        assert_eq!(msgs[256].sequence, 0);
        assert!(msgs.iter().all(|m| m.system_id == 255 && m.component_id == 190));
        assert!(out.is_empty());
    }
}
