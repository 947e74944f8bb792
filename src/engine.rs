//! The stream-engine seam.
//!
//! Once a connection is ESTABLISHED, application bytes and network segments
//! meet in a [`StreamEngine`]: bytes in, segments out on the send side;
//! segments in, bytes out on the receive side. Retransmission, cumulative
//! acknowledgement, flow control and the teardown handshake all live behind
//! this interface and outside this crate.
//!
//! [`PassthroughEngine`] is the shipped implementation: it keeps the
//! sequence numbers honest and moves payload straight through, with no
//! retransmission and a constant advertised window.

use crate::error::Error;

use std::collections::VecDeque;

use bytes::Bytes;
use codec::frame::{Control, Header, MAX_PAYLOAD};

/// One parsed network segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: Header,
    pub payload: Bytes,
}

pub trait StreamEngine: Send {
    /// Feed application bytes into the send side. Returns how many bytes
    /// were ingested.
    fn ingest_stream(&mut self, bytes: &[u8]) -> usize;

    /// Feed one network segment into the receive side.
    fn ingest_segment(&mut self, segment: Segment) -> Result<(), Error>;

    /// Next segment ready to go out on the wire, if any.
    fn next_segment(&mut self) -> Option<Segment>;

    /// Bytes ready to be written to the application channel, if any.
    fn take_stream(&mut self) -> Option<Bytes>;

    /// The receive window to advertise.
    fn window(&self) -> u16;
}

pub struct PassthroughEngine {
    seq_num: u32,
    ack_num: u32,
    window: u16,
    outbound: VecDeque<Segment>,
    inbound: VecDeque<Bytes>,
}

impl PassthroughEngine {
    pub fn new(seq_num: u32, ack_num: u32, window: u16) -> Self {
        Self {
            seq_num,
            ack_num,
            window,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
        }
    }

    fn header(&self, control: Control) -> Header {
        Header {
            seq_num: self.seq_num,
            ack_num: self.ack_num,
            control,
            window: self.window,
        }
    }
}

impl StreamEngine for PassthroughEngine {
    fn ingest_stream(&mut self, bytes: &[u8]) -> usize {
        for chunk in bytes.chunks(MAX_PAYLOAD) {
            let header = self.header(Control::DATA | Control::ACK);
            self.seq_num = self.seq_num.wrapping_add(chunk.len() as u32);

            self.outbound.push_back(Segment {
                header,
                payload: Bytes::copy_from_slice(chunk),
            });
        }

        bytes.len()
    }

    fn ingest_segment(&mut self, segment: Segment) -> Result<(), Error> {
        let control = segment.header.control;

        if control.contains(Control::DATA) {
            self.ack_num = segment
                .header
                .seq_num
                .wrapping_add(segment.payload.len() as u32);

            if !segment.payload.is_empty() {
                self.inbound.push_back(segment.payload);
            }

            return Ok(());
        }

        if control.contains(Control::KPALIVE) {
            // A keepalive is acknowledged with its own sequence number,
            // not plus one.
            self.ack_num = segment.header.seq_num;
            self.outbound.push_back(Segment {
                header: self.header(Control::ACK),
                payload: Bytes::new(),
            });

            return Ok(());
        }

        if control.contains(Control::ACK) {
            // Nothing is retransmitted here, so a bare acknowledgement
            // carries no obligation.
            return Ok(());
        }

        Err(Error::Inval)
    }

    fn next_segment(&mut self) -> Option<Segment> {
        self.outbound.pop_front()
    }

    fn take_stream(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }

    fn window(&self) -> u16 {
        self.window
    }
}
