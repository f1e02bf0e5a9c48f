//! A single worker's process handle and pipe endpoints.

use std::process::{Child, ChildStdin};
use std::sync::Mutex;

/// One spawned worker process and the write end of its stdin pipe. The
/// handle is behind a mutex because both this worker's send task and
/// [`crate::pipeline::Pipeline::broadcast`] write to it; the read end
/// (stdout) is moved into the worker's dedicated response thread instead of
/// living here, since only that thread ever touches it.
pub struct Workplace {
    /// Index into the pipeline's worker vector, used to tag forwarded log
    /// lines (`[worker 3] ...`).
    pub index: usize,
    child: Child,
    pub(crate) stdin: Mutex<ChildStdin>,
}

impl Workplace {
    pub(crate) fn new(index: usize, child: Child, stdin: ChildStdin) -> Self {
        Self {
            index,
            child,
            stdin: Mutex::new(stdin),
        }
    }

    /// Wait for the worker process to exit, consuming it.
    pub fn wait(mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait()
    }
}
