//! Concurrent block fetching with ordered delivery.
//!
//! `BlockSourceBase` owns a single event-loop thread that schedules requests,
//! launches one worker thread per outstanding request, verifies completed
//! payloads, and releases responses to the consumer strictly in ascending
//! start-block order. Implementing a new kind of source only requires a
//! [`BlockSourceRequester`]; everything else is handled here.
//!
//! The loop is the sole owner of its scheduling state. Everything crossing a
//! thread boundary rides a channel: intake and close signals in, worker
//! completions in, responses and the terminal error out. Select arms that are
//! conditionally disabled are pointed at a channel that can never become
//! ready, which is the typed equivalent of selecting on a nil channel.

pub mod file;
pub mod http;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::patcher::{BlockResponse, BlockSource, MissingBlockSpan};
use crate::{BlockSyncError, Result};

/// Performs the blocking transfer of one byte range. Called from multiple
/// worker threads at once; implementations must support simultaneous
/// requests.
pub trait BlockSourceRequester: Send + Sync + 'static {
    /// Fetch the bytes `[start_offset, end_offset)`.
    fn do_request(&self, start_offset: u64, end_offset: u64) -> Result<Vec<u8>>;

    /// Whether an error from [`do_request`](Self::do_request) should bring
    /// the source down. Non-fatal errors get the request re-dispatched.
    fn is_fatal(&self, err: &BlockSyncError) -> bool {
        let _ = err;
        true
    }
}

/// Maps block ids to byte offsets and decides how a span of blocks is carved
/// into individual requests.
pub trait BlockSourceOffsetResolver: Send + Sync + 'static {
    fn block_start_offset(&self, block_id: u32) -> u64;
    fn block_end_offset(&self, block_id: u32) -> u64;
    fn split_block_range(&self, start_block: u32, end_block: u32) -> Vec<QueuedRequest>;
}

/// Checks a delivered range against expected block checksums.
pub trait BlockVerifier: Send + Sync + 'static {
    fn verify_block_range(&self, start_block: u32, data: &[u8]) -> bool;
}

/// A resolved, not yet dispatched request for a contiguous block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedRequest {
    pub start_block: u32,
    pub end_block: u32,
}

enum SourceEvent {
    Request(MissingBlockSpan),
    Close,
}

struct WorkerResult {
    request: QueuedRequest,
    result: Result<Vec<u8>>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum LoopState {
    Running,
    Exiting,
}

/// Block source with bounded concurrency, per-range verification, and
/// in-order result delivery. See the module docs for the threading model.
pub struct BlockSourceBase {
    event_tx: Sender<SourceEvent>,
    response_rx: Receiver<BlockResponse>,
    error_rx: Receiver<BlockSyncError>,
    bytes_requested: Arc<AtomicU64>,
    closed: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BlockSourceBase {
    pub fn new<Req, Res>(
        requester: Req,
        resolver: Res,
        verifier: Option<Box<dyn BlockVerifier>>,
        concurrent_requests: usize,
        concurrent_bytes: u64,
    ) -> Self
    where
        Req: BlockSourceRequester,
        Res: BlockSourceOffsetResolver,
    {
        assert!(concurrent_requests > 0, "need at least one request slot");

        let (event_tx, event_rx) = bounded(concurrent_requests * 2);
        let (response_tx, response_rx) = bounded(0);
        let (error_tx, error_rx) = bounded(1);
        let (worker_tx, worker_rx) = bounded(concurrent_requests);
        let bytes_requested = Arc::new(AtomicU64::new(0));

        let ctx = LoopContext {
            requester: Arc::new(requester),
            resolver: Arc::new(resolver),
            verifier,
            concurrent_requests,
            concurrent_bytes,
            event_rx,
            worker_tx,
            worker_rx,
            response_tx,
            error_tx,
            bytes_requested: Arc::clone(&bytes_requested),
        };

        let loop_handle = thread::spawn(move || ctx.run());

        Self {
            event_tx,
            response_rx,
            error_rx,
            bytes_requested,
            closed: AtomicBool::new(false),
            loop_handle: Mutex::new(Some(loop_handle)),
        }
    }

    /// Queue a span of missing blocks for fetching.
    pub fn request_blocks(&self, span: MissingBlockSpan) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BlockSyncError::AlreadyClosed);
        }

        self.event_tx
            .send(SourceEvent::Request(span))
            .map_err(|_| BlockSyncError::AlreadyClosed)
    }

    /// Responses, in strictly ascending start-block order.
    pub fn results(&self) -> &Receiver<BlockResponse> {
        &self.response_rx
    }

    /// Carries at most one terminal error; the source shuts down after it.
    pub fn errors(&self) -> &Receiver<BlockSyncError> {
        &self.error_rx
    }

    /// Total payload bytes received from the requester so far.
    pub fn bytes_requested(&self) -> u64 {
        self.bytes_requested.load(Ordering::Relaxed)
    }

    /// Stop accepting requests, discard undelivered results, and wait for
    /// the event loop and every worker to finish. A second call returns
    /// `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BlockSyncError::AlreadyClosed);
        }

        let _ = self.event_tx.send(SourceEvent::Close);
        if let Some(handle) = self.loop_handle.lock().expect("loop handle poisoned").take() {
            let _ = handle.join();
        }

        Ok(())
    }
}

impl Drop for BlockSourceBase {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(SourceEvent::Close);
            if let Some(handle) = self.loop_handle.lock().expect("loop handle poisoned").take() {
                let _ = handle.join();
            }
        }
    }
}

impl BlockSource for BlockSourceBase {
    fn request_blocks(&self, span: MissingBlockSpan) -> Result<()> {
        BlockSourceBase::request_blocks(self, span)
    }

    fn results(&self) -> &Receiver<BlockResponse> {
        BlockSourceBase::results(self)
    }

    fn errors(&self) -> &Receiver<BlockSyncError> {
        BlockSourceBase::errors(self)
    }
}

struct LoopContext {
    requester: Arc<dyn BlockSourceRequester>,
    resolver: Arc<dyn BlockSourceOffsetResolver>,
    verifier: Option<Box<dyn BlockVerifier>>,
    concurrent_requests: usize,
    concurrent_bytes: u64,
    event_rx: Receiver<SourceEvent>,
    worker_tx: Sender<WorkerResult>,
    worker_rx: Receiver<WorkerResult>,
    response_tx: Sender<BlockResponse>,
    error_tx: Sender<BlockSyncError>,
    bytes_requested: Arc<AtomicU64>,
}

impl LoopContext {
    fn request_estimate(&self, request: QueuedRequest) -> u64 {
        self.resolver
            .block_end_offset(request.end_block)
            .saturating_sub(self.resolver.block_start_offset(request.start_block))
    }

    fn spawn_worker(&self, request: QueuedRequest, workers: &mut Vec<JoinHandle<()>>) {
        let requester = Arc::clone(&self.requester);
        let start_offset = self.resolver.block_start_offset(request.start_block);
        let end_offset = self.resolver.block_end_offset(request.end_block);
        let tx = self.worker_tx.clone();

        workers.push(thread::spawn(move || {
            let result = requester.do_request(start_offset, end_offset);
            let _ = tx.send(WorkerResult { request, result });
        }));
    }

    fn run(self) {
        // send arms park on these when they have nothing to send; the held
        // receivers are never read, so the sends can never complete
        let (dead_response_tx, _hold_response) = bounded::<BlockResponse>(0);
        let (dead_error_tx, _hold_error) = bounded::<BlockSyncError>(0);

        let event_rx = self.event_rx.clone();
        let worker_rx = self.worker_rx.clone();

        let mut state = LoopState::Running;
        let mut inflight: usize = 0;
        let mut inflight_bytes: u64 = 0;
        let mut pending_error: Option<BlockSyncError> = None;
        let mut pending_response: Option<BlockResponse> = None;

        // pending requests, descending by start block: the next to dispatch
        // pops off the end
        let mut request_queue: Vec<QueuedRequest> = Vec::new();
        // start blocks of dispatched, undelivered requests, descending; the
        // last entry gates which response may be emitted
        let mut request_ordering: Vec<u32> = Vec::new();
        // completed, unemitted responses, descending by start block
        let mut response_ordering: Vec<BlockResponse> = Vec::new();

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while state == LoopState::Running || inflight > 0 || pending_error.is_some() {
            // launch whatever the caps allow
            while state == LoopState::Running
                && inflight < self.concurrent_requests
                && !request_queue.is_empty()
            {
                let next = *request_queue.last().expect("queue checked non-empty");
                let estimate = self.request_estimate(next);
                if inflight > 0
                    && self.concurrent_bytes > 0
                    && inflight_bytes + estimate > self.concurrent_bytes
                {
                    break;
                }

                request_queue.pop();
                request_ordering.push(next.start_block);
                request_ordering.sort_unstable_by(|a, b| b.cmp(a));
                inflight += 1;
                inflight_bytes += estimate;
                self.spawn_worker(next, &mut workers);
            }

            let response_arm = if pending_response.is_some() {
                self.response_tx.clone()
            } else {
                dead_response_tx.clone()
            };
            let error_arm = if pending_error.is_some() {
                self.error_tx.clone()
            } else {
                dead_error_tx.clone()
            };
            let emitted_len = pending_response
                .as_ref()
                .map(|r| r.data.len() as u64)
                .unwrap_or(0);

            crossbeam_channel::select! {
                recv(event_rx) -> event => match event {
                    Ok(SourceEvent::Request(span)) => {
                        if state == LoopState::Running {
                            request_queue.extend(
                                self.resolver.split_block_range(span.start_block, span.end_block),
                            );
                            request_queue
                                .sort_unstable_by(|a, b| b.start_block.cmp(&a.start_block));
                        }
                    }
                    Ok(SourceEvent::Close) | Err(_) => {
                        // nothing may be delivered after a close
                        state = LoopState::Exiting;
                        request_queue.clear();
                        request_ordering.clear();
                        response_ordering.clear();
                        pending_response = None;
                        pending_error = None;
                    }
                },

                recv(worker_rx) -> completion => {
                    let completion = completion.expect("loop holds a worker sender");
                    inflight -= 1;

                    match completion.result {
                        Err(err) => {
                            inflight_bytes =
                                inflight_bytes.saturating_sub(self.request_estimate(completion.request));

                            if state == LoopState::Exiting {
                                debug!("discarding failed request while draining: {}", err);
                            } else if !self.requester.is_fatal(&err) {
                                warn!(
                                    "retrying blocks {}-{}: {}",
                                    completion.request.start_block,
                                    completion.request.end_block,
                                    err,
                                );
                                // retry in place; the ordering entry stays
                                inflight += 1;
                                inflight_bytes += self.request_estimate(completion.request);
                                self.spawn_worker(completion.request, &mut workers);
                            } else {
                                if pending_error.is_none() {
                                    pending_error = Some(err);
                                }
                                pending_response = None;
                                response_ordering.clear();
                                request_queue.clear();
                                state = LoopState::Exiting;
                            }
                        }
                        Ok(data) => {
                            self.bytes_requested
                                .fetch_add(data.len() as u64, Ordering::Relaxed);

                            if state == LoopState::Exiting {
                                inflight_bytes = inflight_bytes
                                    .saturating_sub(self.request_estimate(completion.request));
                            } else if !self.verify(completion.request.start_block, &data) {
                                if pending_error.is_none() {
                                    pending_error = Some(BlockSyncError::VerificationFailed {
                                        start_block: completion.request.start_block,
                                        end_block: completion.request.end_block,
                                    });
                                }
                                pending_response = None;
                                response_ordering.clear();
                                request_queue.clear();
                                state = LoopState::Exiting;
                            } else {
                                let response = BlockResponse {
                                    start_block: completion.request.start_block,
                                    data,
                                };
                                let at = response_ordering
                                    .partition_point(|r| r.start_block > response.start_block);
                                response_ordering.insert(at, response);

                                // release only the response for the lowest
                                // outstanding request; anything else waits
                                if request_ordering.last()
                                    == Some(&response_ordering.last().expect("just inserted").start_block)
                                {
                                    debug_assert!(pending_response.is_none());
                                    pending_response = response_ordering.pop();
                                }
                            }
                        }
                    }
                },

                send(response_arm, pending_response.take().expect("response arm armed")) -> outcome => {
                    match outcome {
                        Ok(()) => {
                            request_ordering.pop();
                            inflight_bytes = inflight_bytes.saturating_sub(emitted_len);

                            // the next buffered response may now be eligible
                            if let (Some(next), Some(&lowest)) =
                                (response_ordering.last(), request_ordering.last())
                            {
                                if next.start_block == lowest {
                                    pending_response = response_ordering.pop();
                                }
                            }
                        }
                        Err(_) => {
                            // consumer dropped the results channel
                            state = LoopState::Exiting;
                            request_queue.clear();
                            response_ordering.clear();
                        }
                    }
                },

                send(error_arm, pending_error.take().expect("error arm armed")) -> _outcome => {
                    // delivered, or the consumer is gone; either way done
                },
            }
        }

        for worker in workers {
            let _ = worker.join();
        }
    }

    fn verify(&self, start_block: u32, data: &[u8]) -> bool {
        match &self.verifier {
            Some(verifier) => verifier.verify_block_range(start_block, data),
            None => true,
        }
    }
}
