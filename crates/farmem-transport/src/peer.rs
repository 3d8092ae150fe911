//! Peer-side page server (variant A).
//!
//! A peer owns one buffer of negotiated size and serves it to the
//! master: `PUT_OFFSET · PUT_DATA` writes a page, `GET` reads one back
//! as a `RESPONSE`, `TERMINATE` ends the loop. Anything else is a fatal
//! protocol error.
//!
//! While waiting for work the peer either strokes its buffer one OS
//! page at a time (discouraging the kernel from reclaiming pages it has
//! not seen accessed recently) or, when the buffer was successfully
//! RAM-locked, parks on a blocking receive.

use farmem_error::{FarmemError, Result};
use farmem_types::PeerRank;
use tracing::{debug, trace};

use crate::fabric::{Fabric, Message};
use crate::wire::{check_page_body, OffsetCodec, Tag};

/// How a peer keeps its buffer in RAM while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepResident {
    /// Touch buffer pages round-robin while polling for messages.
    BusyTouch,
    /// The buffer is mlocked; block on the fabric instead.
    Locked,
}

/// One peer's page server.
pub struct PeerServer<F: Fabric> {
    fabric: F,
    buffer: Vec<u8>,
    codec: OffsetCodec,
    page_size: usize,
    os_page_size: usize,
    keep_resident: KeepResident,
    next_touch: usize,
}

impl<F: Fabric> PeerServer<F> {
    #[must_use]
    pub fn new(
        fabric: F,
        buffer: Vec<u8>,
        page_size: usize,
        os_page_size: usize,
        codec: OffsetCodec,
        keep_resident: KeepResident,
    ) -> Self {
        Self {
            fabric,
            buffer,
            codec,
            page_size,
            os_page_size,
            keep_resident,
            next_touch: 0,
        }
    }

    /// Serve until a `TERMINATE` arrives. Returns the buffer so the
    /// caller can inspect it in tests.
    pub fn run(mut self) -> Result<Vec<u8>> {
        let rank = self.fabric.rank();
        debug!(%rank, bytes = self.buffer.len(), "peer event loop starting");
        loop {
            let msg = self.wait_for_message()?;
            Self::check_sender(&msg)?;
            match Tag::try_from(msg.tag)? {
                Tag::PutOffset => self.serve_put(&msg)?,
                Tag::Get => self.serve_get(&msg)?,
                Tag::Terminate => break,
                Tag::PutData => {
                    // Handled only as the second half of a put.
                    return Err(FarmemError::ProtocolSequence {
                        expected: Tag::PutOffset.raw(),
                        actual: Tag::PutData.raw(),
                    });
                }
                Tag::Response => {
                    return Err(FarmemError::ProtocolSequence {
                        expected: Tag::PutOffset.raw(),
                        actual: Tag::Response.raw(),
                    });
                }
            }
        }
        debug!(%rank, "peer terminating");
        Ok(self.buffer)
    }

    fn check_sender(msg: &Message) -> Result<()> {
        if msg.from.is_master() {
            Ok(())
        } else {
            Err(FarmemError::internal(format!(
                "page-server message from non-master rank {}",
                msg.from
            )))
        }
    }

    fn wait_for_message(&mut self) -> Result<Message> {
        match self.keep_resident {
            KeepResident::Locked => self.fabric.recv(),
            KeepResident::BusyTouch => loop {
                if let Some(msg) = self.fabric.try_recv()? {
                    return Ok(msg);
                }
                self.touch_next_page();
            },
        }
    }

    /// Read one OS page of the buffer, advancing a cursor that wraps.
    fn touch_next_page(&mut self) {
        if self.buffer.is_empty() {
            std::thread::yield_now();
            return;
        }
        std::hint::black_box(self.buffer[self.next_touch]);
        self.next_touch += self.os_page_size;
        if self.next_touch >= self.buffer.len() {
            self.next_touch = 0;
        }
    }

    /// Bounds-check an offset naming a full page in the buffer.
    fn page_range(&self, tag: Tag, offset: u64) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| FarmemError::WireLength {
            tag: tag.raw(),
            expected: self.buffer.len(),
            actual: usize::MAX,
        })?;
        let end = start.checked_add(self.page_size).filter(|&e| e <= self.buffer.len());
        match end {
            Some(end) => Ok(start..end),
            None => Err(FarmemError::internal(format!(
                "offset {offset} is outside this peer's {}-byte buffer",
                self.buffer.len()
            ))),
        }
    }

    /// `PUT_OFFSET` then `PUT_DATA`: write one page into the buffer.
    fn serve_put(&mut self, offset_msg: &Message) -> Result<()> {
        let offset = self.codec.decode(Tag::PutOffset, &offset_msg.body)?;
        let range = self.page_range(Tag::PutOffset, offset)?;
        trace!(offset, "serving put");

        let data_msg = self.fabric.recv()?;
        Self::check_sender(&data_msg)?;
        match Tag::try_from(data_msg.tag)? {
            Tag::PutData => {
                check_page_body(Tag::PutData, &data_msg.body, self.page_size)?;
                self.buffer[range].copy_from_slice(&data_msg.body);
                Ok(())
            }
            // A terminate may race the second half of a put during
            // shutdown; honor it by reporting it to the caller.
            Tag::Terminate => Err(FarmemError::ProtocolSequence {
                expected: Tag::PutData.raw(),
                actual: Tag::Terminate.raw(),
            }),
            other => Err(FarmemError::ProtocolSequence {
                expected: Tag::PutData.raw(),
                actual: other.raw(),
            }),
        }
    }

    /// `GET`: send one page back at the `RESPONSE` tag.
    fn serve_get(&mut self, msg: &Message) -> Result<()> {
        let offset = self.codec.decode(Tag::Get, &msg.body)?;
        let range = self.page_range(Tag::Get, offset)?;
        trace!(offset, "serving get");
        let page = self.buffer[range].to_vec();
        self.fabric.send(PeerRank::MASTER, Tag::Response.raw(), page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::ChannelFabric;

    const PAGE: usize = 128;

    fn spawn_peer(buffer_pages: usize) -> (ChannelFabric, std::thread::JoinHandle<Result<Vec<u8>>>) {
        let mut ranks = ChannelFabric::cluster(2);
        let peer_fabric = ranks.pop().unwrap();
        let master = ranks.pop().unwrap();
        let server = PeerServer::new(
            peer_fabric,
            vec![0u8; buffer_pages * PAGE],
            PAGE,
            64,
            OffsetCodec::new(false),
            KeepResident::BusyTouch,
        );
        (master, std::thread::spawn(move || server.run()))
    }

    #[test]
    fn put_then_get_round_trips() {
        let (master, handle) = spawn_peer(4);
        let codec = OffsetCodec::new(false);
        let peer = PeerRank::new(1);

        master
            .send(peer, Tag::PutOffset.raw(), codec.encode(PAGE as u64).to_vec())
            .unwrap();
        master
            .send(peer, Tag::PutData.raw(), vec![0xAB; PAGE])
            .unwrap();
        master
            .send(peer, Tag::Get.raw(), codec.encode(PAGE as u64).to_vec())
            .unwrap();

        let resp = master.recv().unwrap();
        assert_eq!(resp.tag, Tag::Response.raw());
        assert_eq!(resp.body, vec![0xAB; PAGE]);

        master.send(peer, Tag::Terminate.raw(), Vec::new()).unwrap();
        let buffer = handle.join().unwrap().unwrap();
        assert_eq!(&buffer[PAGE..2 * PAGE], vec![0xAB; PAGE].as_slice());
    }

    #[test]
    fn bare_put_data_is_a_protocol_error() {
        let (master, handle) = spawn_peer(1);
        master
            .send(PeerRank::new(1), Tag::PutData.raw(), vec![0u8; PAGE])
            .unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, FarmemError::ProtocolSequence { .. }));
    }

    #[test]
    fn out_of_bounds_get_is_fatal() {
        let (master, handle) = spawn_peer(1);
        let codec = OffsetCodec::new(false);
        master
            .send(
                PeerRank::new(1),
                Tag::Get.raw(),
                codec.encode(10 * PAGE as u64).to_vec(),
            )
            .unwrap();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let (master, handle) = spawn_peer(1);
        master.send(PeerRank::new(1), 17, Vec::new()).unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, FarmemError::UnknownTag { tag: 17 }));
    }
}
