//! In-memory [`crate::types::CanDriver`] used by unit and integration tests.

use std::collections::VecDeque;

use crate::error::Result;
use crate::frame::RawFrame;
use crate::types::CanDriver;

/// A driver backed by two in-memory queues: frames pushed with [`MockDriver::inject`] are
/// returned by `poll_frame`, frames sent with `send_frame` accumulate in `sent()` for assertions.
#[derive(Debug, Default)]
pub struct MockDriver {
    inbound: VecDeque<RawFrame>,
    sent: Vec<RawFrame>,
    valid: bool,
}

impl MockDriver {
    /// Create a driver with an empty inbound queue.
    pub fn new() -> Self {
        Self {
            inbound: VecDeque::new(),
            sent: Vec::new(),
            valid: true,
        }
    }

    /// Queue a frame to be returned by the next `poll_frame` call, FIFO.
    pub fn inject(&mut self, raw: RawFrame) {
        self.inbound.push_back(raw);
    }

    /// All frames handed to `send_frame` so far, in send order.
    pub fn sent(&self) -> &[RawFrame] {
        &self.sent
    }

    /// Make the driver report itself as invalid (bus fault simulation).
    pub fn fail(&mut self) {
        self.valid = false;
    }
}

impl CanDriver for MockDriver {
    fn send_frame(&mut self, raw_id: u32, data: &[u8]) -> Result<()> {
        self.sent.push(RawFrame {
            id: raw_id,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn poll_frame(&mut self) -> Option<RawFrame> {
        self.inbound.pop_front()
    }

    fn valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_frames_poll_out_fifo() {
        let mut driver = MockDriver::new();
        driver.inject(RawFrame { id: 1, data: vec![1] });
        driver.inject(RawFrame { id: 2, data: vec![2] });
        assert_eq!(driver.poll_frame().unwrap().id, 1);
        assert_eq!(driver.poll_frame().unwrap().id, 2);
        assert!(driver.poll_frame().is_none());
    }

    #[test]
    fn sent_frames_are_recorded() {
        let mut driver = MockDriver::new();
        driver.send_frame(0x18EA00FE, &[1, 2, 3]).unwrap();
        assert_eq!(driver.sent().len(), 1);
        assert_eq!(driver.sent()[0].id, 0x18EA00FE);
    }
}
