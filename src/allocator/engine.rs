//! The rebalancing control loop.

use crate::allocator::placement::{compute_plan, AllocationState};
use crate::allocator::{DistributionDiscoverer, ShardRelocator, SplitBrainResolver};
use crate::config::AllocatorConfig;
use crate::error::Result;
use crate::queue::{ConstrainedQueue, NodeConcurrencyPolicy};
use crate::types::{Distribution, Relocation};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct PassHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner<N, S> {
    state: Mutex<AllocationState<N, S>>,
    discoverer: Arc<dyn DistributionDiscoverer<N, S>>,
    relocator: Arc<dyn ShardRelocator<N, S>>,
    resolver: Arc<dyn SplitBrainResolver<N, S>>,
    max_per_node: usize,
    relocation_grace: Duration,
    /// The single active-pass slot. Scheduling swaps a fresh handle in and
    /// cancels whatever was there; fixed-point publication takes this lock
    /// too, so a superseded pass can never report the engine idle.
    pass: Mutex<Option<PassHandle>>,
    /// True once a pass computed zero moves and nothing newer is running.
    balanced: watch::Sender<bool>,
    closed: AtomicBool,
}

/// Rebalancing engine converging shard ownership toward a balanced,
/// conflict-free distribution.
///
/// Each notification replaces the corresponding universe wholesale and
/// supersedes any in-flight pass. Passes run on one sequential control
/// task; relocations within a pass run on a bounded worker pool throttled
/// per node by a [`NodeConcurrencyPolicy`].
///
/// Cloning is cheap and shares the engine.
pub struct ShardAllocator<N, S> {
    inner: Arc<Inner<N, S>>,
}

impl<N, S> Clone for ShardAllocator<N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N, S> ShardAllocator<N, S>
where
    N: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create an engine and schedule its initial pass.
    ///
    /// Fails synchronously on an invalid configuration; no partially-built
    /// engine is observable. Must be called within a tokio runtime.
    pub fn new(
        config: AllocatorConfig<N, S>,
        discoverer: Arc<dyn DistributionDiscoverer<N, S>>,
        relocator: Arc<dyn ShardRelocator<N, S>>,
        resolver: Arc<dyn SplitBrainResolver<N, S>>,
    ) -> Result<Self> {
        config.validate()?;
        let (balanced, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(AllocationState {
                nodes: config.nodes,
                shards: config.shards,
                distribution: config.initial_distribution.unwrap_or_default(),
            }),
            discoverer,
            relocator,
            resolver,
            max_per_node: config.max_relocations_per_node,
            relocation_grace: config.relocation_grace,
            pass: Mutex::new(None),
            balanced,
            closed: AtomicBool::new(false),
        });
        let allocator = Self { inner };
        allocator.schedule();
        Ok(allocator)
    }

    /// Replace the node universe and schedule a pass.
    pub fn notify_nodes_change(&self, nodes: HashSet<N>) {
        if self.is_closed("notify_nodes_change") {
            return;
        }
        self.inner.state.lock().nodes = nodes;
        self.schedule();
    }

    /// Replace the shard universe and schedule a pass.
    pub fn notify_shards_change(&self, shards: HashSet<S>) {
        if self.is_closed("notify_shards_change") {
            return;
        }
        self.inner.state.lock().shards = shards;
        self.schedule();
    }

    /// Replace the cached distribution and schedule a pass.
    pub fn notify_distribution_change(&self, distribution: Distribution<N, S>) {
        if self.is_closed("notify_distribution_change") {
            return;
        }
        self.inner.state.lock().distribution = distribution;
        self.schedule();
    }

    /// Wait until the engine reaches a fixed point: a pass computed zero
    /// moves and no pass is running.
    ///
    /// Fails with [`Error::Closed`](crate::error::Error::Closed) once the
    /// allocator has been closed; pending waiters are woken and fail too.
    pub async fn await_rebalance(&self) -> Result<()> {
        let mut rx = self.inner.balanced.subscribe();
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(crate::error::Error::Closed);
            }
            if *rx.borrow_and_update() {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| crate::error::Error::Closed)?;
        }
    }

    /// Cancel any in-flight pass and shut the engine down.
    ///
    /// Best-effort: already-issued physical relocations are not rolled
    /// back. Further notifications are ignored and `await_rebalance`
    /// callers fail with [`Error::Closed`](crate::error::Error::Closed).
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Wake pending waiters so they observe the closed flag.
        self.inner.balanced.send_replace(false);
        let previous = self.inner.pass.lock().take();
        if let Some(previous) = previous {
            previous.token.cancel();
            if previous.handle.await.is_err() {
                debug!("rebalance pass aborted during close");
            }
        }
        info!("shard allocator closed");
    }

    fn is_closed(&self, operation: &str) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!(operation, "ignoring notification on closed allocator");
            true
        } else {
            false
        }
    }

    /// Supersede whatever pass is running and start a fresh one.
    ///
    /// The new task joins the cancelled predecessor before touching state,
    /// keeping pass execution strictly sequential.
    fn schedule(&self) {
        let mut slot = self.inner.pass.lock();
        let predecessor = slot.take().map(|previous| {
            previous.token.cancel();
            previous.handle
        });
        self.inner.balanced.send_replace(false);

        let token = CancellationToken::new();
        let task_token = token.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            if let Some(predecessor) = predecessor {
                if predecessor.await.is_err() {
                    debug!("superseded rebalance pass aborted");
                }
            }
            run_pass(inner, task_token).await;
        });
        *slot = Some(PassHandle { token, handle });
    }
}

impl<N, S> Debug for ShardAllocator<N, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardAllocator")
            .field("balanced", &*self.inner.balanced.borrow())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// One full rebalance: plan, execute, re-discover, repeat until a pass
/// computes zero moves. Observes cancellation at every blocking point.
async fn run_pass<N, S>(inner: Arc<Inner<N, S>>, token: CancellationToken)
where
    N: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    loop {
        if token.is_cancelled() {
            return;
        }

        let plan = {
            let mut state = inner.state.lock();
            compute_plan(&mut state, &*inner.resolver)
        };
        if plan.relocations.is_empty() {
            if plan.conflicts > 0 {
                // The resolver chose to leave the dispute in place; there
                // is nothing further to execute.
                warn!(
                    conflicts = plan.conflicts,
                    "split-brain conflicts left unresolved at fixed point"
                );
            }
            // Publish the fixed point unless a newer pass superseded us
            // while we were planning.
            let _slot = inner.pass.lock();
            if !token.is_cancelled() {
                debug!("rebalance reached fixed point");
                inner.balanced.send_replace(true);
            }
            return;
        }

        info!(
            moves = plan.relocations.len(),
            conflicts = plan.conflicts,
            "executing rebalance batch"
        );
        let submitted = execute_batch(&inner, plan.relocations, &token).await;

        // Ground truth beats local bookkeeping after every executed batch,
        // including a truncated one: moves already issued must not leave
        // the cached distribution stale for the successor pass. A batch
        // that submitted nothing skips discovery, so a cancellation cannot
        // clobber a freshly notified distribution.
        if submitted > 0 {
            let discovered = inner.discoverer.discover_distribution().await;
            inner.state.lock().distribution = discovered;
        }
        if token.is_cancelled() {
            return;
        }
    }
}

/// Drain one batch of relocations through an admission-controlled queue,
/// invoking the relocator from a bounded worker pool. Returns how many
/// relocations were handed to workers before the batch ended.
async fn execute_batch<N, S>(
    inner: &Arc<Inner<N, S>>,
    relocations: Vec<Relocation<N, S>>,
    token: &CancellationToken,
) -> usize
where
    N: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let queue = Arc::new(ConstrainedQueue::new(
        NodeConcurrencyPolicy::new(inner.max_per_node),
        usize::MAX,
    ));
    for relocation in relocations {
        if queue.put(relocation).await.is_err() {
            break;
        }
    }

    let node_count = inner.state.lock().nodes.len().max(1);
    let pool = Arc::new(Semaphore::new(node_count * inner.max_per_node));
    let failed = Arc::new(AtomicBool::new(false));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while !queue.is_empty() && !failed.load(Ordering::Acquire) {
        let relocation = tokio::select! {
            _ = token.cancelled() => break,
            relocation = queue.take() => relocation,
        };
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = pool.clone().acquire_owned() => {
                permit.expect("worker pool semaphore is never closed")
            }
        };

        let queue = queue.clone();
        let relocator = inner.relocator.clone();
        let failed = failed.clone();
        workers.push(tokio::spawn(async move {
            if let Err(error) = relocator.relocate(&relocation).await {
                warn!(relocation = ?relocation, %error, "relocation failed, truncating batch");
                failed.store(true, Ordering::Release);
            }
            queue.forget(&relocation);
            drop(permit);
        }));
    }

    let submitted = workers.len();
    if failed.load(Ordering::Acquire) {
        // Give outstanding relocations a bounded window to finish, then
        // move on to re-discovery regardless.
        let deadline = tokio::time::Instant::now() + inner.relocation_grace;
        for worker in workers {
            if tokio::time::timeout_at(deadline, worker).await.is_err() {
                warn!("relocation still outstanding after grace period");
                break;
            }
        }
    } else {
        for worker in workers {
            if worker.await.is_err() {
                warn!("relocation worker panicked");
            }
        }
    }
    queue.close().await;
    submitted
}
