//! Outbound frame scheduler.
//!
//! All frames leaving a demux funnel through one writer task draining this
//! queue. Priority: control frames, then credit acks, then data; within
//! data, round-robin over fibers so one busy fiber cannot starve the rest.
//!
//! Data frames are credit-gated before they are enqueued, so each
//! per-fiber queue is bounded by the peer's receive window; the queue as a
//! whole is therefore bounded too.

use std::collections::{HashMap, VecDeque};

use ssf_proto::FiberFrame;

/// Fiber identity inside one demux: (local port, remote port).
pub(crate) type FiberKey = (u32, u32);

#[derive(Default, Debug)]
pub(crate) struct Outbound {
    control: VecDeque<FiberFrame>,
    acks: VecDeque<FiberFrame>,
    ring: VecDeque<FiberKey>,
    data: HashMap<FiberKey, VecDeque<FiberFrame>>,
    pub(crate) closed: bool,
}

impl Outbound {
    pub(crate) fn push_control(&mut self, frame: FiberFrame) {
        if !self.closed {
            self.control.push_back(frame);
        }
    }

    pub(crate) fn push_ack(&mut self, frame: FiberFrame) {
        if !self.closed {
            self.acks.push_back(frame);
        }
    }

    pub(crate) fn push_data(&mut self, key: FiberKey, frame: FiberFrame) {
        if self.closed {
            return;
        }
        let queue = self.data.entry(key).or_default();
        if queue.is_empty() {
            self.ring.push_back(key);
        }
        queue.push_back(frame);
    }

    /// Next frame to put on the wire, honoring priority and fairness.
    pub(crate) fn pop(&mut self) -> Option<FiberFrame> {
        if let Some(frame) = self.control.pop_front() {
            return Some(frame);
        }
        if let Some(frame) = self.acks.pop_front() {
            return Some(frame);
        }

        while let Some(key) = self.ring.pop_front() {
            let Some(queue) = self.data.get_mut(&key) else { continue };
            let Some(frame) = queue.pop_front() else {
                self.data.remove(&key);
                continue;
            };
            if queue.is_empty() {
                self.data.remove(&key);
            } else {
                // Back of the ring: next fiber gets its turn first.
                self.ring.push_back(key);
            }
            return Some(frame);
        }

        None
    }

    /// Enqueue a datagram. Datagrams are uncredited, so the per-port queue
    /// is capped instead: when the writer falls behind, excess datagrams
    /// are dropped rather than buffered without bound.
    pub(crate) fn push_dgram(&mut self, key: FiberKey, frame: FiberFrame) {
        const DGRAM_QUEUE_CAP: usize = 64;
        if self.closed {
            return;
        }
        let queue = self.data.entry(key).or_default();
        if queue.len() >= DGRAM_QUEUE_CAP {
            return;
        }
        if queue.is_empty() {
            self.ring.push_back(key);
        }
        queue.push_back(frame);
    }

    /// Drop a closing fiber's queued data; its control frames (FIN/RST)
    /// stay queued.
    pub(crate) fn drop_fiber(&mut self, key: FiberKey) {
        self.data.remove(&key);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.control.is_empty() && self.acks.is_empty() && self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ssf_proto::{FrameHeader, FrameType};

    use super::*;

    fn data_frame(src: u32, tag: u8) -> FiberFrame {
        FiberFrame::new(FrameHeader::new(FrameType::StreamData, src, 1), vec![tag])
    }

    #[test]
    fn control_preempts_acks_preempts_data() {
        let mut outbound = Outbound::default();
        outbound.push_data((10, 1), data_frame(10, 0));
        outbound.push_ack(FiberFrame::control(FrameType::StreamAck, 10, 1));
        outbound.push_control(FiberFrame::control(FrameType::StreamSyn, 11, 1));

        assert_eq!(outbound.pop().unwrap().frame_type(), Some(FrameType::StreamSyn));
        assert_eq!(outbound.pop().unwrap().frame_type(), Some(FrameType::StreamAck));
        assert_eq!(outbound.pop().unwrap().frame_type(), Some(FrameType::StreamData));
        assert!(outbound.pop().is_none());
        assert!(outbound.is_empty());
    }

    #[test]
    fn data_round_robins_across_fibers() {
        let mut outbound = Outbound::default();
        for tag in 0..3 {
            outbound.push_data((10, 1), data_frame(10, tag));
        }
        outbound.push_data((20, 1), data_frame(20, 100));

        let order: Vec<u32> = std::iter::from_fn(|| outbound.pop())
            .map(|f| f.header.src_port())
            .collect();
        // Fiber 10 enqueued first but fiber 20 is interleaved, not starved.
        assert_eq!(order, vec![10, 20, 10, 10]);
    }

    #[test]
    fn dropped_fiber_data_is_discarded() {
        let mut outbound = Outbound::default();
        outbound.push_data((10, 1), data_frame(10, 0));
        outbound.drop_fiber((10, 1));
        assert!(outbound.pop().is_none());
    }

    #[test]
    fn closed_queue_rejects_frames() {
        let mut outbound = Outbound::default();
        outbound.closed = true;
        outbound.push_control(FiberFrame::control(FrameType::StreamSyn, 1, 2));
        outbound.push_data((1, 2), data_frame(1, 0));
        assert!(outbound.pop().is_none());
    }
}
