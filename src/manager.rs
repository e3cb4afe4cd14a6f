//! Process-wide pool singleton.
//!
//! [`PoolManager::get`] lazily builds one global [`ThreadPool<Priority>`]
//! and hands out references to it for the lifetime of the process. Settings
//! are resolved with first-call-wins precedence: an explicit
//! [`PoolManager::configure`] beats the environment, which beats the
//! defaults. Once the pool exists its configuration is frozen; the manager
//! never mutates a constructed pool.
//!
//! Recognized environment variables:
//!
//! - `WORKPOOL_THREADS` initial worker count
//! - `WORKPOOL_MAX_THREADS` upper bound on the worker set
//! - `WORKPOOL_TICK_NS` adaptive tick in nanoseconds (0 disables sizing)

use std::env;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::error::ManagerError;
use crate::mode::Priority;
use crate::pool::ThreadPool;

/// Settings applied when the global pool is first built.
///
/// Unset fields fall back to the environment, then to the pool defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Initial worker count.
    pub workers: Option<usize>,
    /// Upper bound on the worker set.
    pub max_workers: Option<usize>,
    /// Adaptive tick; `Duration::ZERO` disables sizing.
    pub tick: Option<Duration>,
}

static POOL: OnceLock<ThreadPool<Priority>> = OnceLock::new();
static PENDING: Mutex<Option<ManagerConfig>> = Mutex::new(None);

/// Access point for the process-wide pool.
#[derive(Debug)]
pub struct PoolManager;

impl PoolManager {
    /// Records the configuration the global pool will be built with.
    ///
    /// Fails with [`ManagerError::AlreadyInitialized`] once the pool exists
    /// and with [`ManagerError::AlreadyConfigured`] if an earlier call
    /// already recorded settings.
    pub fn configure(config: ManagerConfig) -> Result<(), ManagerError> {
        let mut pending = PENDING.lock().unwrap();

        if POOL.get().is_some() {
            return Err(ManagerError::AlreadyInitialized);
        }
        if pending.is_some() {
            return Err(ManagerError::AlreadyConfigured);
        }

        *pending = Some(config);
        Ok(())
    }

    /// Returns the global pool, building it on first use.
    ///
    /// The pool lives until process exit; it is never drained or dropped by
    /// the manager.
    pub fn get() -> &'static ThreadPool<Priority> {
        POOL.get_or_init(|| {
            let config = PENDING.lock().unwrap().take().unwrap_or_default();

            let workers = config.workers.or_else(|| env_value("WORKPOOL_THREADS"));
            let max_workers = config
                .max_workers
                .or_else(|| env_value("WORKPOOL_MAX_THREADS"));
            let tick = config
                .tick
                .or_else(|| env_value::<u64>("WORKPOOL_TICK_NS").map(Duration::from_nanos));

            let mut builder = ThreadPool::<Priority>::builder().name_prefix("workpool-global-");
            if let Some(max_workers) = max_workers {
                builder = builder.max_workers(max_workers);
            }
            if let Some(workers) = workers {
                builder = builder.workers(workers);
            }
            if let Some(tick) = tick {
                builder = builder.adaptive_tick(tick);
            }

            builder.build()
        })
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}
