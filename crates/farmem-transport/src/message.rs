//! Message-passing transport (variant A), master side.
//!
//! A fetch posts the expectation of a `RESPONSE` from the holder and
//! sends a `GET` naming the buffer offset. An eviction sends the
//! `PUT_OFFSET · PUT_DATA` pair. Responses from one holder arrive in
//! request order (the fabric is FIFO per sender and the peer serves
//! requests sequentially), so completion matching is a per-holder queue.

use std::collections::VecDeque;

use farmem_error::{FarmemError, Result};
use farmem_types::{PeerRank, RemoteRef};
use tracing::{debug, trace};

use crate::fabric::Fabric;
use crate::wire::{check_page_body, OffsetCodec, Tag};
use crate::{EvictTicket, FetchTicket, PageTransport, MAX_PENDING_EVICTIONS, MAX_PENDING_FETCHES};

#[derive(Debug, Default)]
struct FetchState {
    /// Holder the GET went to; `None` when the slot is free.
    holder: Option<PeerRank>,
    /// Arrived page, parked until `fetch_end` collects it.
    data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct EvictState {
    in_use: bool,
}

/// Master-side transport over a [`Fabric`].
pub struct MessageTransport<F: Fabric> {
    fabric: F,
    codec: OffsetCodec,
    page_size: usize,
    fetches: [FetchState; MAX_PENDING_FETCHES],
    evicts: [EvictState; MAX_PENDING_EVICTIONS],
    /// Outstanding fetch slots per holder, in request order.
    awaiting: Vec<VecDeque<usize>>,
}

impl<F: Fabric> MessageTransport<F> {
    /// Wrap a master-rank fabric endpoint.
    #[must_use]
    pub fn new(fabric: F, page_size: usize, codec: OffsetCodec) -> Self {
        let num_ranks = fabric.num_ranks() as usize;
        Self {
            fabric,
            codec,
            page_size,
            fetches: Default::default(),
            evicts: Default::default(),
            awaiting: (0..num_ranks).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Receive one message and route it to the fetch slot awaiting it.
    fn pump_inbound(&mut self) -> Result<()> {
        let msg = self.fabric.recv()?;
        let tag = Tag::try_from(msg.tag)?;
        if tag != Tag::Response {
            return Err(FarmemError::ProtocolSequence {
                expected: Tag::Response.raw(),
                actual: msg.tag,
            });
        }
        check_page_body(Tag::Response, &msg.body, self.page_size)?;
        let queue = self
            .awaiting
            .get_mut(msg.from.get() as usize)
            .ok_or_else(|| FarmemError::internal(format!("response from unknown rank {}", msg.from)))?;
        let slot = queue
            .pop_front()
            .ok_or_else(|| FarmemError::internal(format!("unsolicited response from rank {}", msg.from)))?;
        self.fetches[slot].data = Some(msg.body);
        Ok(())
    }
}

impl<F: Fabric> PageTransport for MessageTransport<F> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch_begin(&mut self, src: RemoteRef) -> Result<FetchTicket> {
        let slot = self
            .fetches
            .iter()
            .position(|s| s.holder.is_none())
            .ok_or(FarmemError::SlotBusy { kind: "fetch" })?;
        trace!(holder = %src.holder, offset = src.offset, "fetch begin");
        self.fetches[slot].holder = Some(src.holder);
        self.fetches[slot].data = None;
        self.awaiting[src.holder.get() as usize].push_back(slot);
        self.fabric.send(
            src.holder,
            Tag::Get.raw(),
            self.codec.encode(src.offset).to_vec(),
        )?;
        Ok(FetchTicket(slot))
    }

    fn fetch_end(&mut self, ticket: FetchTicket, dst: &mut [u8]) -> Result<()> {
        let slot = ticket.0;
        if self.fetches[slot].holder.is_none() {
            return Err(FarmemError::internal("fetch_end on an idle slot"));
        }
        while self.fetches[slot].data.is_none() {
            self.pump_inbound()?;
        }
        let data = self.fetches[slot].data.take().unwrap();
        dst.copy_from_slice(&data);
        self.fetches[slot].holder = None;
        Ok(())
    }

    fn evict_begin(&mut self, dst: RemoteRef, data: &[u8]) -> Result<EvictTicket> {
        check_page_body(Tag::PutData, data, self.page_size)?;
        let slot = self
            .evicts
            .iter()
            .position(|s| !s.in_use)
            .ok_or(FarmemError::SlotBusy { kind: "evict" })?;
        trace!(holder = %dst.holder, offset = dst.offset, "evict begin");
        self.evicts[slot].in_use = true;
        self.fabric.send(
            dst.holder,
            Tag::PutOffset.raw(),
            self.codec.encode(dst.offset).to_vec(),
        )?;
        self.fabric
            .send(dst.holder, Tag::PutData.raw(), data.to_vec())?;
        Ok(EvictTicket(slot))
    }

    fn evict_end(&mut self, ticket: EvictTicket) -> Result<()> {
        // The fabric accepted both messages at evict_begin; delivery is
        // ordered and reliable, so completion only releases the slot.
        if !self.evicts[ticket.0].in_use {
            return Err(FarmemError::internal("evict_end on an idle slot"));
        }
        self.evicts[ticket.0].in_use = false;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        debug!("broadcasting terminate to all peers");
        for rank in 1..self.fabric.num_ranks() {
            self.fabric
                .send(PeerRank::new(rank), Tag::Terminate.raw(), Vec::new())?;
        }
        Ok(())
    }
}
