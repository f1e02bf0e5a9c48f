//! Worker responses: the tagged records workers send back to the driver.

use bincode::{Decode, Encode};

use crate::address::MacAddr;

/// One reply frame from a worker.
#[derive(Debug, Clone, Encode, Decode)]
pub enum WorkerResponse {
    /// Reply to [`crate::pipeline::order::WorkOrder::Ping`].
    Pong,
    /// The preceding order failed; `code` is the crate's internal error
    /// discriminant (see [`crate::pipeline::wire::error_code`]), not
    /// necessarily an OS errno.
    Error {
        /// Error code.
        code: i32,
    },
    /// A chunk of a worker's log line; accumulated until `LogEnd`.
    LogChunk {
        /// Raw UTF-8 bytes; may split a line mid-character at a chunk
        /// boundary, so chunks are concatenated before decoding.
        bytes: Vec<u8>,
    },
    /// Flush the accumulated log chunk as one line.
    LogEnd,
    /// Reply to `GetEdgeRemoteMac`/`GetEdgeLocalMac`.
    GotMac {
        /// Resolved address.
        mac: MacAddr,
    },
    /// Reply to `AddEdgeInterface`.
    AddedEdgeInterface {
        /// Assigned (or reused) OVS port number.
        port: u32,
    },
}
