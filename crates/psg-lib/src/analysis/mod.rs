pub mod baseline;
pub mod cancel;
pub mod chunking;
pub mod dedup;

pub use baseline::compute_global_baseline;
pub use cancel::CancelToken;
pub use chunking::{fetch_window, ChunkPlan, ChunkWindow};
pub use dedup::{deduplicate, join_chunk_edges};

use crate::{
    config::AnalysisConfig,
    detectors::{detect_chunk_events, ChunkEvents, ChunkSignals, EventCandidate, GlobalBaseline},
    error::{ErrorReport, PsgError, PsgResult},
    io::{edf::EdfRecording, RecordingSource},
    metrics::ahi::{compute_ahi, AhiResult},
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the collector wakes to check cancellation while workers run.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long shutdown waits for workers before detaching them.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Parameters an analysis actually ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParameters {
    pub flow_channel: String,
    pub spo2_channel: String,
    pub chunk_duration_minutes: f64,
    pub overlap_minutes: f64,
    pub num_chunks: usize,
    pub chunks_analyzed: usize,
    pub chunks_skipped: usize,
    pub apnea_threshold: f64,
    pub hypopnea_threshold: f64,
    pub spo2_drop_threshold: f64,
    pub min_event_duration: f64,
    pub analysis_rate_hz: f64,
    pub global_baseline: f64,
}

/// A non-fatal problem met during an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWarning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(flatten)]
    pub report: ErrorReport,
}

/// Full AHI analysis output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AhiAnalysis {
    pub ahi_analysis: AhiResult,
    pub apnea_events: Vec<EventCandidate>,
    pub hypopnea_events: Vec<EventCandidate>,
    /// Apneas and hypopneas merged and sorted by start time.
    pub all_events: Vec<EventCandidate>,
    pub analysis_parameters: AnalysisParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<AnalysisWarning>,
}

/// Everything a chunk needs besides its window. Copied into every worker.
#[derive(Debug, Clone, Copy)]
struct ChunkContext {
    flow: usize,
    spo2: usize,
    baseline: GlobalBaseline,
    config: AnalysisConfig,
}

type ChunkOutcome = (usize, PsgResult<ChunkEvents>);

fn process_chunk<S: RecordingSource + ?Sized>(
    source: &S,
    ctx: &ChunkContext,
    window: &ChunkWindow,
) -> PsgResult<ChunkEvents> {
    let rate = ctx.config.analysis_rate_hz;
    let signals = ChunkSignals {
        index: window.index,
        flow: fetch_window(source, ctx.flow, window.start_s, window.end_s, rate)?,
        spo2: fetch_window(source, ctx.spo2, window.start_s, window.end_s, rate)?,
        next_start: window.next_start_s,
    };
    let events = detect_chunk_events(&signals, ctx.baseline, &ctx.config);
    debug!(
        "chunk {} ({:.0}-{:.0}s): {} apneas, {} hypopneas",
        window.index,
        window.start_s,
        window.end_s,
        events.apneas.len(),
        events.hypopneas.len()
    );
    Ok(events)
}

enum WorkerEvent {
    Started {
        worker: usize,
        index: usize,
        at: Instant,
    },
    Finished { worker: usize, outcome: ChunkOutcome },
}

struct Worker {
    handle: JoinHandle<()>,
    /// Raised once the worker's chunk has expired. The worker drops that
    /// chunk's result and exits as soon as its read returns.
    retired: CancelToken,
    current: Option<(usize, Instant)>,
}

/// Chunk workers sharing one job queue.
struct ChunkPool<S> {
    source: Arc<S>,
    ctx: ChunkContext,
    jobs: Receiver<ChunkWindow>,
    events: Sender<WorkerEvent>,
    cancel: CancelToken,
    stop: CancelToken,
    workers: Vec<Worker>,
}

impl<S> ChunkPool<S>
where
    S: RecordingSource + Send + Sync + 'static,
{
    fn spawn(&mut self) {
        let id = self.workers.len();
        let retired = CancelToken::new();
        let source = Arc::clone(&self.source);
        let ctx = self.ctx;
        let jobs = self.jobs.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let stop = self.stop.clone();
        let quit = retired.clone();
        let handle = thread::spawn(move || {
            while !(cancel.is_cancelled() || stop.is_cancelled() || quit.is_cancelled()) {
                let Ok(window) = jobs.recv() else { break };
                let started = WorkerEvent::Started {
                    worker: id,
                    index: window.index,
                    at: Instant::now(),
                };
                if events.send(started).is_err() {
                    break;
                }
                let outcome = process_chunk(&*source, &ctx, &window);
                if quit.is_cancelled() {
                    break;
                }
                let finished = WorkerEvent::Finished {
                    worker: id,
                    outcome: (window.index, outcome),
                };
                if events.send(finished).is_err() {
                    break;
                }
            }
        });
        debug!("chunk worker {} started", id);
        self.workers.push(Worker {
            handle,
            retired,
            current: None,
        });
    }

    /// Stop handing out chunks and join every worker that finishes within
    /// `ABORT_GRACE`. The rest are detached; each holds the source only until
    /// its current read returns.
    fn shutdown(self) {
        self.stop.cancel();
        let give_up = Instant::now() + ABORT_GRACE;
        while Instant::now() < give_up
            && self
                .workers
                .iter()
                .any(|w| !w.retired.is_cancelled() && !w.handle.is_finished())
        {
            thread::sleep(Duration::from_millis(10));
        }
        let mut detached = 0;
        for worker in self.workers {
            if !worker.handle.is_finished() {
                detached += 1;
            } else if worker.handle.join().is_err() {
                warn!("chunk worker panicked");
            }
        }
        if detached > 0 {
            warn!(
                "detached {} chunk worker(s) still blocked in a read",
                detached
            );
        }
    }
}

/// Record `outcome` unless its chunk already has one.
fn settle(slots: &mut [Option<PsgResult<ChunkEvents>>], (index, outcome): ChunkOutcome) {
    if let Some(slot) = slots.get_mut(index) {
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }
}

/// Chunked apnea/hypopnea analysis over one recording.
#[derive(Debug, Clone)]
pub struct AhiAnalyzer {
    config: AnalysisConfig,
    cancel: CancelToken,
}

impl AhiAnalyzer {
    pub fn new(config: AnalysisConfig) -> PsgResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn analyze<S>(
        &self,
        source: Arc<S>,
        flow_channel: &str,
        spo2_channel: &str,
    ) -> PsgResult<AhiAnalysis>
    where
        S: RecordingSource + Send + Sync + 'static,
    {
        let started = Instant::now();
        self.cancel.check()?;
        let cfg = self.config;
        let flow = source.resolve(flow_channel)?;
        let spo2 = source.resolve(spo2_channel)?;
        let duration_s = source.info().duration_s;
        let plan = ChunkPlan::new(duration_s, &cfg)?;
        info!(
            "AHI analysis over {:.1}h: {} chunks of {:.0}s (overlap {:.0}s), {} worker(s)",
            duration_s / 3600.0,
            plan.len(),
            cfg.chunk_duration_s,
            cfg.overlap_s,
            cfg.max_workers
        );

        let baseline = compute_global_baseline(&*source, flow, &cfg)?;
        let ctx = ChunkContext {
            flow,
            spo2,
            baseline,
            config: cfg,
        };

        let mut outcomes = self.run_pool(source, ctx, &plan, started)?;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut apneas = Vec::new();
        let mut hypopneas = Vec::new();
        let mut warnings = Vec::new();
        let mut analyzed = 0;
        let mut first_failure = None;
        for (index, outcome) in outcomes {
            match outcome {
                Ok(events) => {
                    analyzed += 1;
                    apneas.extend(events.apneas);
                    hypopneas.extend(events.hypopneas);
                }
                Err(err) => {
                    warn!("skipping chunk {}: {}", index, err);
                    warnings.push(AnalysisWarning {
                        chunk_index: Some(index),
                        report: err.report(),
                    });
                    first_failure.get_or_insert(err);
                }
            }
        }
        if analyzed == 0 && !plan.is_empty() {
            let detail = first_failure.map_or_else(String::new, |err| err.to_string());
            return Err(PsgError::upstream("every analysis chunk failed", detail));
        }

        let raw_events = apneas.len() + hypopneas.len();
        let apnea_events = deduplicate(join_chunk_edges(apneas), cfg.dedup_overlap_ratio);
        let hypopnea_events = deduplicate(join_chunk_edges(hypopneas), cfg.dedup_overlap_ratio);
        let mut all_events: Vec<EventCandidate> = apnea_events
            .iter()
            .chain(hypopnea_events.iter())
            .cloned()
            .collect();
        all_events.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        let ahi = compute_ahi(&apnea_events, &hypopnea_events, duration_s / 3600.0);
        info!(
            "AHI {:.1} ({:?}): {} apneas, {} hypopneas ({} candidates before merging)",
            ahi.ahi_score,
            ahi.severity,
            apnea_events.len(),
            hypopnea_events.len(),
            raw_events
        );

        Ok(AhiAnalysis {
            ahi_analysis: ahi,
            apnea_events,
            hypopnea_events,
            all_events,
            analysis_parameters: AnalysisParameters {
                flow_channel: flow_channel.to_string(),
                spo2_channel: spo2_channel.to_string(),
                chunk_duration_minutes: cfg.chunk_duration_s / 60.0,
                overlap_minutes: cfg.overlap_s / 60.0,
                num_chunks: plan.len(),
                chunks_analyzed: analyzed,
                chunks_skipped: plan.len() - analyzed,
                apnea_threshold: cfg.apnea_threshold,
                hypopnea_threshold: cfg.hypopnea_threshold,
                spo2_drop_threshold: cfg.spo2_drop_threshold,
                min_event_duration: cfg.min_event_duration_s,
                analysis_rate_hz: cfg.analysis_rate_hz,
                global_baseline: baseline.value(),
            },
            warnings,
        })
    }

    fn checkpoint(&self, started: Instant) -> PsgResult<()> {
        self.cancel.check()?;
        if started.elapsed().as_secs_f64() > self.config.analysis_timeout_s {
            return Err(PsgError::Timeout(self.config.analysis_timeout_s));
        }
        Ok(())
    }

    /// Fan chunks out to `max_workers` threads and collect their outcomes.
    ///
    /// A chunk still running after `chunk_timeout_s` is recorded as timed out
    /// and its worker is replaced while chunks remain queued.
    fn run_pool<S>(
        &self,
        source: Arc<S>,
        ctx: ChunkContext,
        plan: &ChunkPlan,
        started: Instant,
    ) -> PsgResult<Vec<ChunkOutcome>>
    where
        S: RecordingSource + Send + Sync + 'static,
    {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let (job_tx, job_rx) = bounded::<ChunkWindow>(plan.len());
        for window in &plan.windows {
            job_tx
                .send(*window)
                .map_err(|_| PsgError::Internal("chunk queue closed early".into()))?;
        }
        drop(job_tx);

        let (event_tx, event_rx) = unbounded::<WorkerEvent>();
        let mut pool = ChunkPool {
            source,
            ctx,
            jobs: job_rx,
            events: event_tx,
            cancel: self.cancel.clone(),
            stop: CancelToken::new(),
            workers: Vec::new(),
        };
        for _ in 0..self.config.max_workers.min(plan.len()) {
            pool.spawn();
        }

        let chunk_budget = Duration::from_secs_f64(self.config.chunk_timeout_s);
        let deadline = started + Duration::from_secs_f64(self.config.analysis_timeout_s);
        let mut slots: Vec<Option<PsgResult<ChunkEvents>>> =
            plan.windows.iter().map(|_| None).collect();

        loop {
            if let Err(err) = self.checkpoint(started) {
                pool.shutdown();
                return Err(err);
            }
            // Snapshot before draining so every message a finished worker
            // sent is seen below.
            let finished: Vec<bool> = pool
                .workers
                .iter()
                .map(|w| w.handle.is_finished())
                .collect();
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);
            let first = event_rx.recv_timeout(wait).ok();
            for event in first.into_iter().chain(event_rx.try_iter()) {
                match event {
                    WorkerEvent::Started { worker, index, at } => {
                        pool.workers[worker].current = Some((index, at));
                    }
                    WorkerEvent::Finished { worker, outcome } => {
                        pool.workers[worker].current = None;
                        settle(&mut slots, outcome);
                    }
                }
            }

            for id in 0..pool.workers.len() {
                let Some((index, since)) = pool.workers[id].current else {
                    continue;
                };
                if finished.get(id).copied().unwrap_or(false) {
                    pool.workers[id].current = None;
                    let err = PsgError::Internal(format!("worker died on chunk {}", index));
                    settle(&mut slots, (index, Err(err)));
                } else if since.elapsed() > chunk_budget {
                    warn!(
                        "chunk {} exceeded {:.1}s; abandoning it",
                        index, self.config.chunk_timeout_s
                    );
                    pool.workers[id].current = None;
                    pool.workers[id].retired.cancel();
                    settle(
                        &mut slots,
                        (index, Err(PsgError::Timeout(self.config.chunk_timeout_s))),
                    );
                    if !pool.jobs.is_empty() {
                        pool.spawn();
                    }
                }
            }

            let idle = pool.workers.iter().enumerate().all(|(id, w)| {
                w.retired.is_cancelled() || finished.get(id).copied().unwrap_or(false)
            });
            if idle || slots.iter().all(Option::is_some) {
                break;
            }
        }
        pool.shutdown();
        self.cancel.check()?;

        // A window no worker reported on is an internal failure.
        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let outcome = slot.unwrap_or_else(|| {
                    Err(PsgError::Internal(format!(
                        "chunk {} was never reported",
                        index
                    )))
                });
                (index, outcome)
            })
            .collect();
        Ok(outcomes)
    }
}

/// Open `path` and run a chunked AHI analysis with `config`.
pub fn run_ahi_analysis(
    path: &Path,
    flow_channel: &str,
    spo2_channel: &str,
    config: &AnalysisConfig,
) -> PsgResult<AhiAnalysis> {
    let analyzer = AhiAnalyzer::new(*config)?;
    let recording = Arc::new(EdfRecording::open(path)?);
    analyzer.analyze(recording, flow_channel, spo2_channel)
}
