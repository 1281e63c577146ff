//! The execution engine handed to thread pools and sockets.
//!
//! The engine carries the sizing parameters every worker set is built from, and optionally
//! turns on the Prometheus exporter for the counters the rest of the crate records. It does
//! not own threads itself: pools and the socket reactor spin up their own workers from
//! [`ExecutionEngine::worker_count`].

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{PalError, Result};
use crate::sync::CallOnce;

/// Default number of worker threads when nothing else is configured.
pub const DEFAULT_MIN_THREAD_COUNT: u32 = 4;

/// Upper bound applied when `max_thread_count` is left unbounded.
pub const WORKER_COUNT_CEILING: u32 = 10;

static METRICS_EXPORTER: CallOnce = CallOnce::new();

/// Sizing and observability knobs for an [`ExecutionEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionEngineParameters {
    /// Minimum number of worker threads. `0` means "use the available parallelism".
    pub min_thread_count: u32,
    /// Maximum number of worker threads. `0` means unbounded.
    pub max_thread_count: u32,
    /// When set, a Prometheus exporter listens on `127.0.0.1:<port>`.
    pub metrics_port: Option<u16>,
}

impl Default for ExecutionEngineParameters {
    fn default() -> Self {
        Self {
            min_thread_count: DEFAULT_MIN_THREAD_COUNT,
            max_thread_count: 0,
            metrics_port: None,
        }
    }
}

impl ExecutionEngineParameters {
    fn validate(&self) -> Result<()> {
        if self.max_thread_count != 0 && self.max_thread_count < self.min_thread_count {
            return Err(PalError::InvalidArgument(
                "max_thread_count must be 0 or at least min_thread_count",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EngineInner {
    parameters: ExecutionEngineParameters,
    worker_count: usize,
}

/// Reference-counted engine handle. Cloning acquires a reference, dropping releases it.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Creates an engine from `parameters`.
    ///
    /// # Errors
    ///
    /// Returns [`PalError::InvalidArgument`] for inconsistent thread counts, and
    /// [`PalError::Metrics`] if a metrics port was requested but the exporter could not be
    /// installed.
    ///
    /// # Examples
    ///
    /// ```
    /// use yot_pal::{ExecutionEngine, ExecutionEngineParameters};
    ///
    /// let engine = ExecutionEngine::new(ExecutionEngineParameters {
    ///     min_thread_count: 2,
    ///     max_thread_count: 4,
    ///     metrics_port: None,
    /// })?;
    /// assert_eq!(engine.worker_count(), 2);
    /// # Ok::<(), yot_pal::PalError>(())
    /// ```
    pub fn new(parameters: ExecutionEngineParameters) -> Result<Self> {
        parameters.validate()?;

        if let Some(port) = parameters.metrics_port {
            install_metrics_exporter(([127, 0, 0, 1], port).into())?;
        }

        let worker_count = resolve_worker_count(&parameters);
        log::debug!("execution engine created with {worker_count} workers ({parameters:?})");

        Ok(Self {
            inner: Arc::new(EngineInner {
                parameters,
                worker_count,
            }),
        })
    }

    pub fn parameters(&self) -> &ExecutionEngineParameters {
        &self.inner.parameters
    }

    /// Number of worker threads a pool or reactor built on this engine should run.
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }
}

fn resolve_worker_count(parameters: &ExecutionEngineParameters) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let wanted = if parameters.min_thread_count == 0 {
        available
    } else {
        parameters.min_thread_count
    };
    let ceiling = if parameters.max_thread_count == 0 {
        wanted.min(WORKER_COUNT_CEILING).max(parameters.min_thread_count)
    } else {
        parameters.max_thread_count
    };
    wanted.min(ceiling).max(1) as usize
}

/// Starts the Prometheus exporter once per process.
///
/// Later calls are no-ops once one succeeded; a failed attempt may be retried.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    METRICS_EXPORTER.call(|| {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| PalError::Metrics(e.to_string()))?;
        log::info!("metrics enabled at http://{addr}/metrics");
        Ok(())
    })
}
