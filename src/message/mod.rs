//! Message chunking (send side) and reassembly (receive side).

mod chunker;
mod reassembly;

pub use chunker::MessageChunker;
pub use reassembly::{MessageReassembly, ReassemblyError, MAX_MESSAGE_LENGTH};
