use crate::message::Message;
use crate::vclock::VectorClock;

/// An outstanding node program at the coordinator: created on dispatch,
/// moved to the done table on the shard reply, reclaimed in batches.
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentProg {
    pub req_id: u64,
    pub client: u64,
    pub clock: VectorClock,
}

impl CurrentProg {
    pub fn new(req_id: u64, client: u64, clock: VectorClock) -> Self {
        CurrentProg { req_id, client, clock }
    }
}

/// A program request parked while a promoted backup is still restoring.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockedProg {
    pub client: u64,
    pub msg: Message,
}

impl BlockedProg {
    pub fn new(client: u64, msg: Message) -> Self {
        BlockedProg { client, msg }
    }
}
