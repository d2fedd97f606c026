//! The kernel pool: a bounded set of live kernels, handed out one at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kernel_admin::KernelAdmin;
use crate::{wire, Config, Error};

/// The state a kernel record can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum KernelState {
    /// Idle and eligible to be acquired.
    Healthy,
    /// Currently assigned to an execution.
    Busy,
    /// Failed its most recent health probe.
    Unresponsive,
    /// Released after a session failure; still counts toward its failure
    /// total until evicted.
    Failed,
    /// Held by a placeholder record reserving a pool slot while a new kernel
    /// is being created, so a concurrent `acquire` can't also observe room
    /// under `max_kernels` and create a second one (see `Pool::acquire`).
    Restarting,
}

/// Bookkeeping the pool keeps about one kernel.
#[derive(Debug, Clone)]
pub struct KernelRecord {
    pub kernel_id: String,
    pub state: KernelState,
    pub last_used: OffsetDateTime,
    pub last_health_check: OffsetDateTime,
    pub failure_count: u32,
}

impl KernelRecord {
    fn new(kernel_id: String) -> Self {
        let now = OffsetDateTime::now_utc();
        KernelRecord {
            kernel_id,
            state: KernelState::Healthy,
            last_used: now,
            last_health_check: now,
            failure_count: 0,
        }
    }
}

struct PoolState {
    kernels: HashMap<String, KernelRecord>,
    busy: HashSet<String>,
    initialized: bool,
}

impl PoolState {
    fn check_invariants(&self, max_kernels: usize) {
        debug_assert!(self.busy.iter().all(|id| self.kernels.contains_key(id)));
        debug_assert!(self
            .busy
            .iter()
            .all(|id| self.kernels[id].state == KernelState::Busy));
        debug_assert!(self.kernels.len() <= max_kernels);
    }
}

/// Owns the set of kernels and their states; serves `acquire`/`release`,
/// maintains `min_kernels`/`max_kernels`, and runs a background health-check
/// loop.
///
/// The map and busy set are protected by a single mutex held only for
/// bookkeeping — never across an admin HTTP call, a channel open, an
/// envelope read/write, or a health probe (`SPEC_FULL.md` §5).
pub struct Pool<A: KernelAdmin + 'static> {
    admin: Arc<A>,
    config: Config,
    state: Arc<Mutex<PoolState>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_signal: CancellationToken,
}

impl<A: KernelAdmin + 'static> Pool<A> {
    /// Construct a pool that is not yet initialized; call [`Pool::initialize`]
    /// before acquiring kernels (the execution engine does this
    /// automatically).
    pub fn new(admin: A, config: Config) -> Arc<Self> {
        Arc::new(Pool {
            admin: Arc::new(admin),
            config,
            state: Arc::new(Mutex::new(PoolState {
                kernels: HashMap::new(),
                busy: HashSet::new(),
                initialized: false,
            })),
            health_task: Mutex::new(None),
            shutdown_signal: CancellationToken::new(),
        })
    }

    /// Open a fresh message channel to an already-acquired kernel. A thin
    /// forward to the admin client that keeps its concrete type out of the
    /// execution engine.
    pub async fn open_channel(
        &self,
        kernel_id: &str,
    ) -> Result<Box<dyn crate::kernel_admin::KernelChannel>, Error> {
        self.admin.open_channel(kernel_id).await
    }

    /// How many kernels are currently tracked by the pool (for tests and
    /// diagnostics).
    pub async fn len(&self) -> usize {
        self.state.lock().await.kernels.len()
    }

    /// Whether the pool currently tracks no kernels.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// A snapshot of one kernel's record, if tracked.
    pub async fn kernel_state(&self, kernel_id: &str) -> Option<KernelState> {
        self.state
            .lock()
            .await
            .kernels
            .get(kernel_id)
            .map(|r| r.state)
    }

    /// Idempotently bring the pool up to `min_kernels`, adopting a
    /// pre-existing kernel if one is discoverable, then start the
    /// background health-check loop. Calling this more than once is a no-op.
    pub async fn initialize(self: &Arc<Self>) {
        {
            let state = self.state.lock().await;
            if state.initialized {
                return;
            }
        }

        info!("initializing kernel pool");

        // Discovery and creation both make network calls; do them without
        // holding the lock, then take it only to record results.
        if let Some(existing) = self
            .admin
            .discover_existing(&self.config.discover_existing_path, self.config.probe_timeout)
            .await
        {
            let mut state = self.state.lock().await;
            if !state.initialized {
                info!(kernel_id = %existing, "adopted pre-existing kernel");
                state.kernels.insert(existing.clone(), KernelRecord::new(existing));
            }
        }

        loop {
            let current_len = self.state.lock().await.kernels.len();
            if current_len >= self.config.min_kernels {
                break;
            }
            match self.admin.create_kernel(&self.config.kernel_spec_name).await {
                Ok(kernel_id) => {
                    let mut state = self.state.lock().await;
                    state.kernels.insert(kernel_id.clone(), KernelRecord::new(kernel_id));
                }
                Err(err) => {
                    warn!(%err, "failed to create minimum number of kernels");
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.initialized {
            return;
        }
        state.initialized = true;
        let kernel_count = state.kernels.len();
        drop(state);

        info!(kernel_count, "kernel pool initialized");
        self.spawn_health_loop().await;
    }

    async fn spawn_health_loop(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let signal = self.shutdown_signal.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.health_check_interval) => {}
                    _ = signal.cancelled() => break,
                }
                pool.run_health_check_round().await;
            }
        });

        // `initialize` is guarded by the `initialized` flag so this only
        // ever runs once per pool.
        *self.health_task.lock().await = Some(handle);
    }

    async fn run_health_check_round(self: &Arc<Self>) {
        let candidates: Vec<String> = {
            let state = self.state.lock().await;
            state
                .kernels
                .values()
                .filter(|record| {
                    record.state != KernelState::Busy
                        && record.state != KernelState::Restarting
                        && (OffsetDateTime::now_utc() - record.last_health_check).as_seconds_f64()
                            >= self.config.health_check_interval.as_secs_f64()
                })
                .map(|record| record.kernel_id.clone())
                .collect()
        };

        let mut unresponsive = Vec::new();
        for kernel_id in candidates {
            let healthy = self.admin.probe(&kernel_id, self.config.probe_timeout).await;
            let mut state = self.state.lock().await;

            // The probe ran outside the mutex, so a concurrent `acquire` may
            // have picked up this kernel while it was in flight. Don't let a
            // stale probe result evict or otherwise touch a kernel that is
            // now actively driving an execution (I2).
            if state.busy.contains(&kernel_id) {
                continue;
            }

            if let Some(record) = state.kernels.get_mut(&kernel_id) {
                if healthy {
                    record.state = KernelState::Healthy;
                    record.last_health_check = OffsetDateTime::now_utc();
                } else {
                    record.state = KernelState::Unresponsive;
                    unresponsive.push(kernel_id);
                }
            }
        }

        for kernel_id in &unresponsive {
            warn!(kernel_id, "evicting unresponsive kernel");
            let _ = self.admin.delete_kernel(kernel_id).await;
            self.state.lock().await.kernels.remove(kernel_id);
        }

        loop {
            let current_len = self.state.lock().await.kernels.len();
            if current_len >= self.config.min_kernels {
                break;
            }
            match self.admin.create_kernel(&self.config.kernel_spec_name).await {
                Ok(kernel_id) => {
                    let mut state = self.state.lock().await;
                    state.kernels.insert(kernel_id.clone(), KernelRecord::new(kernel_id));
                }
                Err(_) => break,
            }
        }
    }

    /// Return the id of a healthy, idle kernel, marking it Busy, or `None`
    /// if no kernel is available and the pool is already at `max_kernels`.
    /// Never blocks waiting for a busy kernel to free up.
    pub async fn acquire(&self) -> Option<String> {
        let mut state = self.state.lock().await;

        let found = state
            .kernels
            .values()
            .find(|record| record.state == KernelState::Healthy && !state.busy.contains(&record.kernel_id))
            .map(|record| record.kernel_id.clone());

        if let Some(kernel_id) = found {
            state.busy.insert(kernel_id.clone());
            if let Some(record) = state.kernels.get_mut(&kernel_id) {
                record.state = KernelState::Busy;
                record.last_used = OffsetDateTime::now_utc();
            }
            state.check_invariants(self.config.max_kernels);
            info!(kernel_id, "assigned kernel to execution");
            return Some(kernel_id);
        }

        if state.kernels.len() >= self.config.max_kernels {
            return None;
        }

        // Reserve the slot under the lock before releasing it across the
        // admin network call. Without this, two concurrent acquires can both
        // observe `len < max_kernels`, both create a kernel, and both insert
        // — pushing the map above `max_kernels` (I3). The placeholder is
        // removed once the real kernel id (or a creation failure) is known.
        let reservation_id = format!("__reservation__{}", wire::new_hex_id());
        let mut placeholder = KernelRecord::new(reservation_id.clone());
        placeholder.state = KernelState::Restarting;
        state.kernels.insert(reservation_id.clone(), placeholder);
        state.check_invariants(self.config.max_kernels);
        drop(state);

        let created = self.admin.create_kernel(&self.config.kernel_spec_name).await;

        let mut state = self.state.lock().await;
        state.kernels.remove(&reservation_id);

        match created {
            Ok(kernel_id) => {
                let mut record = KernelRecord::new(kernel_id.clone());
                record.state = KernelState::Busy;
                state.kernels.insert(kernel_id.clone(), record);
                state.busy.insert(kernel_id.clone());
                state.check_invariants(self.config.max_kernels);
                info!(kernel_id, "created and assigned new kernel");
                Some(kernel_id)
            }
            Err(_) => None,
        }
    }

    /// Return a kernel to the pool. If `failed` is true, its failure count
    /// is incremented and the kernel is marked Failed; once the count
    /// reaches `max_retry_attempts`, the kernel is evicted and a best-effort
    /// replacement is created.
    pub async fn release(self: &Arc<Self>, kernel_id: &str, failed: bool) {
        let should_evict = {
            let mut state = self.state.lock().await;
            state.busy.remove(kernel_id);

            let Some(record) = state.kernels.get_mut(kernel_id) else {
                return;
            };

            if failed {
                record.failure_count += 1;
                record.state = KernelState::Failed;
                warn!(
                    kernel_id,
                    failure_count = record.failure_count,
                    "kernel marked failed"
                );
                record.failure_count >= self.config.max_retry_attempts
            } else {
                record.state = KernelState::Healthy;
                info!(kernel_id, "released kernel back to pool");
                false
            }
        };

        if should_evict {
            warn!(kernel_id, "evicting kernel after repeated failures");
            let _ = self.admin.delete_kernel(kernel_id).await;
            self.state.lock().await.kernels.remove(kernel_id);

            if let Ok(replacement) = self.admin.create_kernel(&self.config.kernel_spec_name).await {
                let mut state = self.state.lock().await;
                state
                    .kernels
                    .insert(replacement.clone(), KernelRecord::new(replacement));
            }
        }
    }

    /// Cancel the background health-check task and best-effort delete every
    /// kernel still tracked by the pool. Additive lifecycle completeness
    /// beyond the distilled spec (`SPEC_FULL.md` §4.4, §9).
    pub async fn shutdown(&self) {
        self.shutdown_signal.cancel();
        if let Some(handle) = self.health_task.lock().await.take() {
            let _ = handle.await;
        }

        let ids: Vec<String> = self.state.lock().await.kernels.keys().cloned().collect();
        for kernel_id in ids {
            let _ = self.admin.delete_kernel(&kernel_id).await;
        }
        self.state.lock().await.kernels.clear();
    }
}
