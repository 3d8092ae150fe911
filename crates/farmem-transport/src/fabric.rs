//! Ordered, tagged, point-to-point messaging between ranks.
//!
//! [`Fabric`] is the seam between the paging engine and whatever
//! carries bytes between hosts. It guarantees per-sender FIFO order and
//! nonblocking send. [`ChannelFabric`] implements it over in-process
//! channels: that is the single-node deployment and the test double at
//! once, the same way an in-memory backend stands in for the POSIX one
//! elsewhere in this workspace.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use farmem_error::{FarmemError, Result};
use farmem_types::PeerRank;

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Sending rank.
    pub from: PeerRank,
    /// Raw tag byte. Values `0..=4` are the page-server protocol
    /// ([`crate::wire::Tag`]); higher values are reserved for cluster
    /// setup.
    pub tag: u8,
    /// Message body.
    pub body: Vec<u8>,
}

/// Reliable ordered messaging with tag demultiplexing left to the
/// receiver.
pub trait Fabric: Send {
    /// This endpoint's rank.
    fn rank(&self) -> PeerRank;

    /// Total ranks in the deployment (master included).
    fn num_ranks(&self) -> u32;

    /// Enqueue a message for `to` without blocking.
    fn send(&self, to: PeerRank, tag: u8, body: Vec<u8>) -> Result<()>;

    /// Take the next inbound message if one is ready.
    fn try_recv(&self) -> Result<Option<Message>>;

    /// Block until a message arrives.
    fn recv(&self) -> Result<Message>;
}

/// In-process fabric over crossbeam channels, one inbox per rank.
pub struct ChannelFabric {
    rank: PeerRank,
    inbox: Receiver<Message>,
    outboxes: Vec<Sender<Message>>,
}

impl ChannelFabric {
    /// Build a fully connected cluster of `num_ranks` endpoints.
    /// Element `i` of the result is rank `i`'s endpoint.
    #[must_use]
    pub fn cluster(num_ranks: u32) -> Vec<Self> {
        let mut inboxes = Vec::with_capacity(num_ranks as usize);
        let mut senders = Vec::with_capacity(num_ranks as usize);
        for _ in 0..num_ranks {
            let (tx, rx) = unbounded();
            senders.push(tx);
            inboxes.push(rx);
        }
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank: PeerRank::new(rank as u32),
                inbox,
                outboxes: senders.clone(),
            })
            .collect()
    }

    fn outbox(&self, to: PeerRank) -> Result<&Sender<Message>> {
        self.outboxes
            .get(to.get() as usize)
            .ok_or_else(|| FarmemError::Transport {
                detail: format!("rank {to} does not exist"),
            })
    }
}

impl Fabric for ChannelFabric {
    fn rank(&self) -> PeerRank {
        self.rank
    }

    fn num_ranks(&self) -> u32 {
        self.outboxes.len() as u32
    }

    fn send(&self, to: PeerRank, tag: u8, body: Vec<u8>) -> Result<()> {
        let msg = Message {
            from: self.rank,
            tag,
            body,
        };
        self.outbox(to)?
            .send(msg)
            .map_err(|_| FarmemError::Transport {
                detail: format!("rank {to} is gone"),
            })
    }

    fn try_recv(&self) -> Result<Option<Message>> {
        match self.inbox.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(FarmemError::Transport {
                detail: "all senders disconnected".into(),
            }),
        }
    }

    fn recv(&self) -> Result<Message> {
        self.inbox.recv().map_err(|_| FarmemError::Transport {
            detail: "all senders disconnected".into(),
        })
    }
}
