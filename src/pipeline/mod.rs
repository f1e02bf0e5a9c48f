//! Order/response work pipeline: the driver-side half of the protocol
//! connecting the builder to a pool of worker processes.

mod order;
mod pipeline;
mod response;
mod wire;
mod workplace;

pub use order::{LogLevel, TopologyLink, TopologyNode, WorkOrder};
pub use pipeline::Pipeline;
pub use response::WorkerResponse;
pub use wire::{error_code, read_frame, write_frame};
