//! The vector-timestamper coordinator: clock generation, transaction
//! admission and fan-out, periodic no-ops and clock gossip, node-program
//! dispatch and the done-program GC protocol.

pub mod current;
pub mod stub;
pub mod timestamper;

pub use current::{BlockedProg, CurrentProg};
pub use stub::{CoordStub, VtMeta};
pub use timestamper::Timestamper;
