//! Query driver: planning, dispatch, per-geo-chunk barriers, recombination.
//!
//! Chunk tasks run on a dedicated rayon pool and report back over a channel.
//! The orchestrator thread owns all bookkeeping and is the only place that
//! touches query state, so workers share nothing but the scratch directory.

use crate::config::EngineConfig;
use crate::core::chunk_planner::{ChunkPlanner, ChunkingParams, GeoChunk, TimeChunk};
use crate::core::chunk_worker::ChunkWorker;
use crate::core::compositor::{CompositeAlgorithm, Compositor};
use crate::core::geo_recombine::{GeoRecombiner, QueryOutput};
use crate::core::time_recombine::{GeoChunkResult, TimeRecombiner};
use crate::io::{CancellationFlag, DataSource, LoadRequest, ScratchStore, StatusReporter};
use crate::types::{CubeError, CubeResult, SpatialExtent, TimeRange};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// A compositing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub extent: SpatialExtent,
    pub time_range: TimeRange,
    pub product: String,
    pub platform: String,
    pub bands: Vec<String>,
    pub algorithm: CompositeAlgorithm,
    /// Falls back to the algorithm's default when unset
    pub reverse_time: Option<bool>,
    pub chunking: ChunkingParams,
}

impl Query {
    pub fn new(
        extent: SpatialExtent,
        time_range: TimeRange,
        product: impl Into<String>,
        platform: impl Into<String>,
        bands: Vec<String>,
        algorithm: CompositeAlgorithm,
    ) -> Self {
        Self {
            extent,
            time_range,
            product: product.into(),
            platform: platform.into(),
            bands,
            algorithm,
            reverse_time: None,
            chunking: ChunkingParams::default(),
        }
    }

    pub fn with_reverse_time(mut self, reverse_time: bool) -> Self {
        self.reverse_time = Some(reverse_time);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingParams) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn reverse_time(&self) -> bool {
        self.reverse_time
            .unwrap_or_else(|| self.algorithm.default_reverse_time())
    }

    pub fn validate(&self) -> CubeResult<()> {
        self.extent.validate()?;
        if self.time_range.start > self.time_range.end {
            return Err(CubeError::InvalidQuery("time range start is after end".to_string()));
        }
        if self.bands.is_empty() {
            return Err(CubeError::InvalidQuery("query names no bands".to_string()));
        }
        Ok(())
    }

    fn load_request(&self) -> LoadRequest {
        LoadRequest {
            product: self.product.clone(),
            platform: self.platform.clone(),
            bands: self.bands.clone(),
            extent: self.extent,
            time_range: self.time_range,
        }
    }
}

/// Lifecycle of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    Planning,
    Dispatched,
    TimeReducing,
    GeoReducing,
    Finalized,
    Cancelled,
    Error,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Finalized | QueryState::Cancelled | QueryState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// One geo chunk x time chunk unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub geo_chunk_id: usize,
    pub time_chunk_id: usize,
    pub status: TaskStatus,
}

/// How a query ended when it did not fail
#[derive(Debug)]
pub enum QueryOutcome {
    Finalized(QueryOutput),
    Cancelled,
}

enum TaskEvent {
    Started {
        geo: usize,
        time: usize,
    },
    /// Picked up after cancellation; never ran
    Revoked {
        geo: usize,
        time: usize,
    },
    Finished {
        geo: usize,
        time: usize,
        result: CubeResult<bool>,
    },
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one query end to end
pub struct TaskOrchestrator {
    query: Query,
    config: EngineConfig,
    source: Arc<dyn DataSource>,
    status: Arc<dyn StatusReporter>,
    cancel: CancellationFlag,
    state: QueryState,
    history: Vec<QueryState>,
    tasks: Vec<ChunkTask>,
    time_chunk_count: usize,
}

impl TaskOrchestrator {
    pub fn new(
        query: Query,
        config: EngineConfig,
        source: Arc<dyn DataSource>,
        status: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            query,
            config,
            source,
            status,
            cancel: CancellationFlag::new(),
            state: QueryState::Planning,
            history: vec![QueryState::Planning],
            tasks: Vec::new(),
            time_chunk_count: 0,
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Every state the query has been in, in order
    pub fn history(&self) -> &[QueryState] {
        &self.history
    }

    pub fn tasks(&self) -> &[ChunkTask] {
        &self.tasks
    }

    /// Run the query to a terminal state and report it on the status channel
    pub fn run(&mut self) -> CubeResult<QueryOutcome> {
        if self.state.is_terminal() {
            return Err(CubeError::InvalidQuery(format!(
                "query already finished in state {:?}",
                self.state
            )));
        }

        match self.execute() {
            Ok(QueryOutcome::Finalized(output)) => {
                self.transition(QueryState::Finalized);
                self.status.report_complete();
                log::info!("Query finalized with {} acquisitions", output.metadata.len());
                Ok(QueryOutcome::Finalized(output))
            }
            Ok(QueryOutcome::Cancelled) => {
                self.transition(QueryState::Cancelled);
                self.status.report_cancelled();
                log::info!("Query cancelled");
                Ok(QueryOutcome::Cancelled)
            }
            Err(e) => {
                self.transition(QueryState::Error);
                log::error!("Query failed: {}", e);
                self.status.report_error(&e.to_string());
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: QueryState) {
        if self.state != next {
            log::debug!("Query state {:?} -> {:?}", self.state, next);
            self.state = next;
            self.history.push(next);
        }
    }

    fn cancel_requested(&self) -> bool {
        if !self.cancel.is_cancelled() && self.status.poll_cancelled() {
            self.cancel.cancel();
        }
        self.cancel.is_cancelled()
    }

    fn set_task_status(&mut self, geo: usize, time: usize, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(geo * self.time_chunk_count + time) {
            task.status = status;
        }
    }

    fn execute(&mut self) -> CubeResult<QueryOutcome> {
        self.config.validate()?;
        self.query.validate()?;

        if self.cancel_requested() {
            return Ok(QueryOutcome::Cancelled);
        }

        // Planning
        let reverse = self.query.reverse_time();
        let compositor = self.query.algorithm.build(reverse, &self.config);
        compositor.check_bands(&self.query.bands)?;
        let rule = self.config.clean_mask.resolve_rule(&self.query.platform)?;

        let request = self.query.load_request();
        let acquisitions = self
            .source
            .list_acquisitions(&request)
            .map_err(|e| CubeError::Compute(format!("listing acquisitions failed: {:#}", e)))?;
        let plan = ChunkPlanner::new(self.query.chunking.clone()).plan(&self.query.extent, &acquisitions, reverse)?;

        if self.cancel_requested() {
            return Ok(QueryOutcome::Cancelled);
        }

        let scratch = Arc::new(ScratchStore::new(&self.config.scratch_root())?);
        let worker = Arc::new(ChunkWorker::new(
            request,
            self.config.clean_mask.clone(),
            rule,
            self.cancel.clone(),
        ));

        let result = self.dispatch_and_reduce(plan.geo_chunks, plan.time_chunks, compositor, worker, &scratch);
        scratch.clear();
        result
    }

    fn dispatch_and_reduce(
        &mut self,
        geo_chunks: Vec<GeoChunk>,
        time_chunks: Vec<TimeChunk>,
        compositor: Arc<dyn Compositor>,
        worker: Arc<ChunkWorker>,
        scratch: &Arc<ScratchStore>,
    ) -> CubeResult<QueryOutcome> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("chunk-worker-{}", i))
            .build()
            .map_err(|e| CubeError::Config(format!("failed to build worker pool: {}", e)))?;

        self.time_chunk_count = time_chunks.len();
        self.tasks = geo_chunks
            .iter()
            .flat_map(|g| {
                time_chunks.iter().map(move |t| ChunkTask {
                    geo_chunk_id: g.index,
                    time_chunk_id: t.index,
                    status: TaskStatus::Pending,
                })
            })
            .collect();
        self.status.report_total(geo_chunks.len());
        self.transition(QueryState::Dispatched);

        let (tx, rx) = mpsc::channel::<TaskEvent>();
        for geo in &geo_chunks {
            for time in &time_chunks {
                let tx = tx.clone();
                let (geo, time) = (geo.clone(), time.clone());
                let worker = Arc::clone(&worker);
                let compositor = Arc::clone(&compositor);
                let source = Arc::clone(&self.source);
                let scratch = Arc::clone(scratch);
                let cancel = self.cancel.clone();
                pool.spawn(move || {
                    let (g, t) = (geo.index, time.index);
                    if cancel.is_cancelled() {
                        let _ = tx.send(TaskEvent::Revoked { geo: g, time: t });
                        return;
                    }
                    let _ = tx.send(TaskEvent::Started { geo: g, time: t });
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        worker.process_and_store(&geo, &time, source.as_ref(), compositor.as_ref(), &scratch)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(CubeError::Compute(format!(
                            "chunk g{} t{} panicked: {}",
                            g,
                            t,
                            panic_message(payload)
                        )))
                    });
                    let _ = tx.send(TaskEvent::Finished { geo: g, time: t, result });
                });
            }
        }
        drop(tx);

        log::info!(
            "Dispatched {} chunk tasks on {} workers",
            self.tasks.len(),
            self.config.workers
        );

        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut outstanding = self.tasks.len();
        let mut remaining = vec![time_chunks.len(); geo_chunks.len()];
        let mut reduced: Vec<GeoChunkResult> = Vec::with_capacity(geo_chunks.len());
        let mut failure: Option<CubeError> = None;

        // Runs until every dispatched task has reported, even after a failure or
        // cancellation, so nothing is still writing to scratch when it is cleared.
        while outstanding > 0 {
            // Raising the shared flag revokes every task that has not started yet
            self.cancel_requested();

            let event = match rx.recv_timeout(poll) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if failure.is_none() {
                        failure = Some(CubeError::Compute("worker pool hung up".to_string()));
                    }
                    break;
                }
            };

            match event {
                TaskEvent::Started { geo, time } => self.set_task_status(geo, time, TaskStatus::Running),
                TaskEvent::Revoked { geo, time } => {
                    outstanding -= 1;
                    self.set_task_status(geo, time, TaskStatus::Cancelled);
                }
                TaskEvent::Finished { geo, time, result } => {
                    outstanding -= 1;
                    match result {
                        Ok(_) => {
                            self.set_task_status(geo, time, TaskStatus::Done);
                            remaining[geo] -= 1;
                            if remaining[geo] == 0 && failure.is_none() && !self.cancel_requested() {
                                match self.reduce_geo_chunk(geo, compositor.as_ref(), scratch) {
                                    Ok(result) => reduced.push(result),
                                    Err(e) => {
                                        self.cancel.cancel();
                                        failure = Some(e);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            self.set_task_status(geo, time, TaskStatus::Failed);
                            if failure.is_none() {
                                log::error!("Chunk g{} t{} failed: {}", geo, time, e);
                                self.cancel.cancel();
                                failure = Some(e);
                            }
                        }
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if self.cancel_requested() {
            return Ok(QueryOutcome::Cancelled);
        }

        self.transition(QueryState::GeoReducing);
        let output = GeoRecombiner::new(compositor.as_ref()).recombine(self.query.extent, reduced)?;
        Ok(QueryOutcome::Finalized(output))
    }

    fn reduce_geo_chunk(
        &mut self,
        geo: usize,
        compositor: &dyn Compositor,
        scratch: &ScratchStore,
    ) -> CubeResult<GeoChunkResult> {
        self.transition(QueryState::TimeReducing);
        let result = TimeRecombiner::new(compositor).recombine_from_store(geo, self.time_chunk_count, scratch)?;
        log::info!(
            "Geo chunk {} reduced ({} acquisitions)",
            geo,
            result.metadata.len()
        );
        self.status.report_progress(1);
        Ok(result)
    }
}
