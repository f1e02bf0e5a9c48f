//! The work pipeline: an order/response protocol fanning out to a pool of
//! worker processes, each single-threaded and bound to its own active
//! network namespace.

use std::collections::VecDeque;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

use super::order::WorkOrder;
use super::response::WorkerResponse;
use super::wire::{read_frame, write_frame};
use super::workplace::Workplace;

struct Shared {
    queue: Mutex<VecDeque<WorkOrder>>,
    queue_cv: Condvar,
    unsent: Mutex<usize>,
    unsent_cv: Condvar,
    pongs_expected: Mutex<usize>,
    pongs_cv: Condvar,
    error: Mutex<Option<Error>>,
    mailbox: Mutex<Option<WorkerResponse>>,
    mailbox_cv: Condvar,
}

impl Shared {
    fn latch_error(&self, error: Error) {
        let mut slot = self.error.lock().expect("error mutex poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        // Unblock every waiter: a latched error must make submit, join, and
        // mailbox waits return immediately.
        self.queue_cv.notify_all();
        self.unsent_cv.notify_all();
        self.pongs_cv.notify_all();
        self.mailbox_cv.notify_all();
    }

    fn latched(&self) -> Option<Error> {
        self.error.lock().expect("error mutex poisoned").clone()
    }
}

/// The driver side of the order/response protocol, owning `P` worker
/// processes.
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Vec<Arc<Workplace>>,
    send_handles: Vec<JoinHandle<()>>,
    response_handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn `worker_count` copies of `worker_exe worker_args...` (each
    /// expected to immediately enter the worker body's order loop on its
    /// stdin/stdout), then start their send and response tasks.
    ///
    /// Per the forking invariant, every child is spawned before any thread
    /// is created.
    pub fn spawn(worker_count: usize, worker_exe: &str, worker_args: &[&str]) -> Result<Self> {
        let mut children: Vec<Child> = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let child = Command::new(worker_exe)
                .args(worker_args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| Error::kernel(format!("failed to spawn worker: {e}")))?;
            children.push(child);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            unsent: Mutex::new(0),
            unsent_cv: Condvar::new(),
            pongs_expected: Mutex::new(0),
            pongs_cv: Condvar::new(),
            error: Mutex::new(None),
            mailbox: Mutex::new(None),
            mailbox_cv: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        let mut stdouts = Vec::with_capacity(worker_count);
        for (index, mut child) in children.into_iter().enumerate() {
            let stdin = child
                .stdin
                .take()
                .expect("spawned with Stdio::piped() stdin");
            let stdout = child
                .stdout
                .take()
                .expect("spawned with Stdio::piped() stdout");
            workers.push(Arc::new(Workplace::new(index, child, stdin)));
            stdouts.push(stdout);
        }

        let mut send_handles = Vec::with_capacity(worker_count);
        let mut response_handles = Vec::with_capacity(worker_count);
        for (workplace, stdout) in workers.iter().cloned().zip(stdouts.into_iter()) {
            let shared_send = Arc::clone(&shared);
            let workplace_send = Arc::clone(&workplace);
            send_handles.push(thread::spawn(move || send_task(shared_send, workplace_send)));

            let shared_resp = Arc::clone(&shared);
            let index = workplace.index;
            response_handles.push(thread::spawn(move || response_task(shared_resp, index, stdout)));
        }

        Ok(Self {
            shared,
            workers,
            send_handles,
            response_handles,
        })
    }

    /// Return the latched error, if any, without clearing it.
    fn check_error(&self) -> Result<()> {
        match self.shared.latched() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Enqueue `order` for delivery by whichever send task dequeues it
    /// first. Short-circuits if an error is already latched.
    pub fn submit(&self, order: WorkOrder) -> Result<()> {
        self.check_error()?;
        {
            let mut queue = self.shared.queue.lock().expect("queue mutex poisoned");
            queue.push_back(order);
        }
        {
            let mut unsent = self.shared.unsent.lock().expect("unsent mutex poisoned");
            *unsent += 1;
        }
        self.shared.queue_cv.notify_one();
        Ok(())
    }

    /// Block until the order queue is fully drained (`unsent_orders == 0`),
    /// then write `order` directly to every worker's pipe.
    pub fn broadcast(&self, order: WorkOrder) -> Result<()> {
        self.wait_drained()?;
        self.check_error()?;
        for workplace in &self.workers {
            let mut stdin = workplace.stdin.lock().expect("stdin mutex poisoned");
            write_frame(&mut *stdin, &order)?;
        }
        Ok(())
    }

    fn wait_drained(&self) -> Result<()> {
        let mut unsent = self.shared.unsent.lock().expect("unsent mutex poisoned");
        while *unsent > 0 && self.shared.latched().is_none() {
            unsent = self
                .shared
                .unsent_cv
                .wait(unsent)
                .expect("unsent mutex poisoned");
        }
        Ok(())
    }

    /// Drain the queue, ping every worker, and wait for all pongs (or a
    /// latched error). `reset_error` clears a latched error after observing
    /// it, so the caller can proceed with cleanup/rollback.
    pub fn join(&self, reset_error: bool) -> Result<()> {
        self.wait_drained()?;
        if let Some(e) = self.shared.latched() {
            if reset_error {
                *self.shared.error.lock().expect("error mutex poisoned") = None;
            }
            return Err(e);
        }

        {
            let mut pongs = self.shared.pongs_expected.lock().expect("pongs mutex poisoned");
            *pongs = self.workers.len();
        }
        self.broadcast(WorkOrder::Ping)?;

        let mut pongs = self.shared.pongs_expected.lock().expect("pongs mutex poisoned");
        while *pongs > 0 && self.shared.latched().is_none() {
            pongs = self
                .shared
                .pongs_cv
                .wait(pongs)
                .expect("pongs mutex poisoned");
        }
        drop(pongs);

        if let Some(e) = self.shared.latched() {
            if reset_error {
                *self.shared.error.lock().expect("error mutex poisoned") = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Wait for, and consume, the next single-slot data response (`GotMac`,
    /// `AddedEdgeInterface`). Callers must `join` before issuing the
    /// data-returning order that produces this response, since only one may
    /// be in flight at a time.
    pub fn recv_data(&self) -> Result<WorkerResponse> {
        let mut slot = self.shared.mailbox.lock().expect("mailbox mutex poisoned");
        while slot.is_none() && self.shared.latched().is_none() {
            slot = self
                .shared
                .mailbox_cv
                .wait(slot)
                .expect("mailbox mutex poisoned");
        }
        if let Some(response) = slot.take() {
            return Ok(response);
        }
        Err(self
            .shared
            .latched()
            .expect("loop only exits with a response or a latched error"))
    }

    /// Inject one `Terminate` per send task, wait for every task to exit,
    /// then reap the worker processes.
    pub fn cleanup(mut self) -> Result<()> {
        let had_error = self.shared.latched();
        for _ in &self.workers {
            let mut queue = self.shared.queue.lock().expect("queue mutex poisoned");
            queue.push_back(WorkOrder::Terminate);
            self.shared.queue_cv.notify_one();
        }
        for handle in self.send_handles.drain(..) {
            let _ = handle.join();
        }
        for handle in self.response_handles.drain(..) {
            let _ = handle.join();
        }
        for workplace in self.workers.drain(..) {
            if let Ok(workplace) = Arc::try_unwrap(workplace) {
                let _ = workplace.wait();
            }
        }
        match had_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of worker processes in this pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn send_task(shared: Arc<Shared>, workplace: Arc<Workplace>) {
    loop {
        let order = {
            let mut queue = shared.queue.lock().expect("queue mutex poisoned");
            while queue.is_empty() {
                queue = shared.queue_cv.wait(queue).expect("queue mutex poisoned");
            }
            queue.pop_front().expect("just checked non-empty")
        };
        let terminate = matches!(order, WorkOrder::Terminate);
        {
            let mut stdin = workplace.stdin.lock().expect("stdin mutex poisoned");
            if let Err(e) = write_frame(&mut *stdin, &order) {
                drop(stdin);
                shared.latch_error(e);
            }
        }
        if terminate {
            return;
        }
        let mut unsent = shared.unsent.lock().expect("unsent mutex poisoned");
        *unsent = unsent.saturating_sub(1);
        let done = *unsent == 0;
        drop(unsent);
        if done {
            shared.unsent_cv.notify_all();
        }
    }
}

fn response_task(shared: Arc<Shared>, index: usize, mut stdout: impl std::io::Read) {
    let mut log_buf: Vec<u8> = Vec::new();
    loop {
        let response: Option<WorkerResponse> = match read_frame(&mut stdout) {
            Ok(r) => r,
            Err(e) => {
                shared.latch_error(e);
                return;
            }
        };
        let Some(response) = response else {
            return;
        };
        match response {
            WorkerResponse::Pong => {
                let mut pongs = shared.pongs_expected.lock().expect("pongs mutex poisoned");
                *pongs = pongs.saturating_sub(1);
                let done = *pongs == 0;
                drop(pongs);
                if done {
                    shared.pongs_cv.notify_all();
                }
            }
            WorkerResponse::Error { code } => {
                shared.latch_error(Error::kernel_code(code, "worker reported an error"));
            }
            WorkerResponse::LogChunk { bytes } => {
                log_buf.extend_from_slice(&bytes);
            }
            WorkerResponse::LogEnd => {
                let line = String::from_utf8_lossy(&log_buf);
                log::info!("[worker {index}] {line}");
                log_buf.clear();
            }
            data @ (WorkerResponse::GotMac { .. } | WorkerResponse::AddedEdgeInterface { .. }) => {
                let mut slot = shared.mailbox.lock().expect("mailbox mutex poisoned");
                *slot = Some(data);
                drop(slot);
                shared.mailbox_cv.notify_all();
            }
        }
    }
}
