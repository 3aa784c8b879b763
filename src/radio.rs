//! Radio driver capability consumed by the engine, plus an in-memory bus
//! double for hosts and tests without hardware.
//!
//! The contract mirrors short-packet transceivers in the nRF24 family: up to
//! five reading pipes addressed by 5-byte labels, one writing pipe, fixed
//! 32-byte payloads, and a hardware auto-ACK whose outcome is the return
//! value of [`Radio::write`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::identity::ADDR_LEN;
use crate::wire::FRAME_SIZE;

/// Transmit power setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaLevel {
    Min,
    Low,
    High,
    Max,
}

/// On-air data rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Kbps250,
    Mbps1,
    Mbps2,
}

/// Short-packet radio driver.
pub trait Radio {
    /// Power up the transceiver. Returns `false` when the hardware is absent
    /// or unresponsive.
    fn begin(&mut self) -> bool;
    fn set_channel(&mut self, channel: u8);
    fn set_pa_level(&mut self, level: PaLevel);
    fn set_data_rate(&mut self, rate: DataRate);
    /// Open reading pipe `pipe` (1..=5) on a 5-byte address.
    fn open_reading_pipe(&mut self, pipe: u8, addr: &[u8; ADDR_LEN]);
    fn open_writing_pipe(&mut self, addr: &[u8; ADDR_LEN]);
    fn start_listening(&mut self);
    fn stop_listening(&mut self);
    /// Pipe number of the next pending frame, if any.
    fn available(&mut self) -> Option<u8>;
    /// Pop the next pending frame into `buf`. Returns the byte count.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Transmit one frame. `true` iff the hardware auto-ACK came back.
    fn write(&mut self, frame: &[u8]) -> bool;
    fn payload_size(&self) -> u8;
}

/// One frame observed on the mock bus.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub from: usize,
    pub channel: u8,
    pub target: [u8; ADDR_LEN],
    pub frame: [u8; FRAME_SIZE],
    pub delivered: bool,
}

#[derive(Default)]
struct NodeState {
    channel: u8,
    listening: bool,
    reading: [Option<[u8; ADDR_LEN]>; 6],
    writing: Option<[u8; ADDR_LEN]>,
    rx: VecDeque<(u8, [u8; FRAME_SIZE])>,
}

#[derive(Default)]
struct BusInner {
    nodes: Vec<NodeState>,
    log: Vec<SentFrame>,
}

/// Shared in-memory medium connecting [`MockRadio`] endpoints.
///
/// A write is delivered (and acknowledged) iff some other node on the same
/// channel is listening on a reading pipe whose address matches the writer's
/// writing pipe, which reproduces the auto-ACK dynamics pairing relies on.
/// Every transmitted frame is recorded in a log for inspection.
#[derive(Clone, Default)]
pub struct MockBus {
    inner: Rc<RefCell<BusInner>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a radio endpoint attached to this bus.
    pub fn attach(&self) -> MockRadio {
        let mut inner = self.inner.borrow_mut();
        inner.nodes.push(NodeState::default());
        MockRadio {
            id: inner.nodes.len() - 1,
            bus: Rc::clone(&self.inner),
        }
    }

    /// Snapshot of every frame written so far.
    pub fn frames(&self) -> Vec<SentFrame> {
        self.inner.borrow().log.clone()
    }

    /// Force a frame into a node's receive queue, bypassing the medium.
    pub fn inject(&self, node: usize, pipe: u8, frame: [u8; FRAME_SIZE]) {
        self.inner.borrow_mut().nodes[node].rx.push_back((pipe, frame));
    }
}

/// Radio endpoint on a [`MockBus`].
pub struct MockRadio {
    id: usize,
    bus: Rc<RefCell<BusInner>>,
}

impl MockRadio {
    /// Index of this endpoint on its bus, in attach order.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Radio for MockRadio {
    fn begin(&mut self) -> bool {
        true
    }

    fn set_channel(&mut self, channel: u8) {
        self.bus.borrow_mut().nodes[self.id].channel = channel;
    }

    fn set_pa_level(&mut self, _level: PaLevel) {}

    fn set_data_rate(&mut self, _rate: DataRate) {}

    fn open_reading_pipe(&mut self, pipe: u8, addr: &[u8; ADDR_LEN]) {
        if let Some(entry) = self.bus.borrow_mut().nodes[self.id]
            .reading
            .get_mut(pipe as usize)
        {
            *entry = Some(*addr);
        }
    }

    fn open_writing_pipe(&mut self, addr: &[u8; ADDR_LEN]) {
        self.bus.borrow_mut().nodes[self.id].writing = Some(*addr);
    }

    fn start_listening(&mut self) {
        self.bus.borrow_mut().nodes[self.id].listening = true;
    }

    fn stop_listening(&mut self) {
        self.bus.borrow_mut().nodes[self.id].listening = false;
    }

    fn available(&mut self) -> Option<u8> {
        self.bus.borrow().nodes[self.id].rx.front().map(|(pipe, _)| *pipe)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.bus.borrow_mut().nodes[self.id].rx.pop_front() {
            Some((_, frame)) => {
                let n = buf.len().min(frame.len());
                buf[..n].copy_from_slice(&frame[..n]);
                n
            }
            None => 0,
        }
    }

    fn write(&mut self, frame: &[u8]) -> bool {
        let mut inner = self.bus.borrow_mut();
        let (channel, target) = {
            let node = &inner.nodes[self.id];
            (node.channel, node.writing)
        };
        let Some(target) = target else {
            return false;
        };
        let mut padded = [0u8; FRAME_SIZE];
        let n = frame.len().min(FRAME_SIZE);
        padded[..n].copy_from_slice(&frame[..n]);

        let mut delivered = false;
        let sender = self.id;
        for (id, node) in inner.nodes.iter_mut().enumerate() {
            if id == sender || !node.listening || node.channel != channel {
                continue;
            }
            if let Some(pipe) = node.reading.iter().position(|a| *a == Some(target)) {
                node.rx.push_back((pipe as u8, padded));
                delivered = true;
                break;
            }
        }
        inner.log.push(SentFrame {
            from: sender,
            channel,
            target,
            frame: padded,
            delivered,
        });
        delivered
    }

    fn payload_size(&self) -> u8 {
        FRAME_SIZE as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_requires_matching_listener() {
        let bus = MockBus::new();
        let mut tx = bus.attach();
        let mut rx = bus.attach();

        tx.set_channel(108);
        rx.set_channel(108);
        tx.open_writing_pipe(b"1AAAA");

        // Nobody listening yet: no auto-ACK.
        assert!(!tx.write(&[1u8; FRAME_SIZE]));

        rx.open_reading_pipe(1, b"1AAAA");
        rx.start_listening();
        assert!(tx.write(&[2u8; FRAME_SIZE]));

        assert_eq!(rx.available(), Some(1));
        let mut buf = [0u8; FRAME_SIZE];
        assert_eq!(rx.read(&mut buf), FRAME_SIZE);
        assert_eq!(buf[0], 2);
        assert_eq!(rx.available(), None);
    }

    #[test]
    fn channels_are_isolated() {
        let bus = MockBus::new();
        let mut tx = bus.attach();
        let mut rx = bus.attach();

        tx.set_channel(109);
        rx.set_channel(108);
        rx.open_reading_pipe(1, b"1AAAA");
        rx.start_listening();
        tx.open_writing_pipe(b"1AAAA");
        assert!(!tx.write(&[0u8; FRAME_SIZE]));
    }

    #[test]
    fn log_records_every_write() {
        let bus = MockBus::new();
        let mut tx = bus.attach();
        tx.set_channel(108);
        tx.open_writing_pipe(b"2BBBB");
        tx.write(&[3u8; 10]);
        let frames = bus.frames();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].delivered);
        assert_eq!(frames[0].target, *b"2BBBB");
        // Short writes appear zero-padded to the PHY size.
        assert_eq!(frames[0].frame[10..], [0u8; FRAME_SIZE - 10]);
    }
}
