// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::{
    capture::reader::{CaptureReader, PacketRecord},
    cfg::config::Config,
    correlation::correlator::SessionCorrelator,
    correlation::tunnel::manager::TunnelManager,
    export::exporter::EventExporter,
    models::{
        JobInfo, JobStatus,
        error::{Error, Result},
    },
    pipeline::{
        job::{EVENT_PROGRESS, EVENT_STATUS, EVENT_WARNING, EventCallback, JobTask,
              ProgressCallback},
        processor::PacketProcessor,
        queue::BlockingQueue,
    },
    utils::generate_job_id,
};

/// Capacity of the job queue itself; jobs are small.
const JOB_QUEUE_CAPACITY: usize = 1024;

/// Worker-pool job runner and the Job facade.
///
/// One worker carries a job end-to-end, so per-flow state stays
/// sequentially consistent; a per-job producer thread does the file I/O
/// and feeds the bounded packet queue.
pub struct JobRunner {
    config: Config,
    running: Arc<AtomicBool>,
    job_queue: Arc<BlockingQueue<JobTask>>,
    jobs: Arc<DashMap<String, Arc<Mutex<JobInfo>>>>,
    results: Arc<DashMap<String, Arc<Vec<Value>>>>,
    workers: Vec<JoinHandle<()>>,
    progress_callback: Arc<RwLock<Option<ProgressCallback>>>,
    event_callback: Arc<RwLock<Option<EventCallback>>>,
}

impl JobRunner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            job_queue: Arc::new(BlockingQueue::new(JOB_QUEUE_CAPACITY)),
            jobs: Arc::new(DashMap::new()),
            results: Arc::new(DashMap::new()),
            workers: Vec::new(),
            progress_callback: Arc::new(RwLock::new(None)),
            event_callback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        if let Ok(mut slot) = self.progress_callback.write() {
            *slot = Some(callback);
        }
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        if let Ok(mut slot) = self.event_callback.write() {
            *slot = Some(callback);
        }
    }

    /// Spawns the worker pool.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("job runner already running");
            return;
        }
        info!(
            "starting job runner with {} workers",
            self.config.processing.worker_threads
        );

        for worker_index in 0..self.config.processing.worker_threads {
            let context = WorkerContext {
                config: self.config.clone(),
                running: Arc::clone(&self.running),
                job_queue: Arc::clone(&self.job_queue),
                jobs: Arc::clone(&self.jobs),
                results: Arc::clone(&self.results),
                progress_callback: Arc::clone(&self.progress_callback),
                event_callback: Arc::clone(&self.event_callback),
            };
            self.workers.push(
                std::thread::Builder::new()
                    .name(format!("pcap-worker-{worker_index}"))
                    .spawn(move || worker_loop(context))
                    .expect("spawn worker thread"),
            );
        }
    }

    /// Stops accepting work and joins the pool. Workers finish their
    /// current packet, then exit.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping job runner");
        self.job_queue.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Queues a capture file for processing.
    pub fn submit<P: AsRef<Path>>(
        &self,
        input_path: P,
        output_path: Option<PathBuf>,
    ) -> Result<String> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let job_id = generate_job_id();
        let output_path = output_path.unwrap_or_else(|| {
            self.config
                .output
                .output_dir
                .join(format!("job-{job_id}.json"))
        });

        let info = JobInfo::new(
            job_id.clone(),
            input_path.as_ref().to_path_buf(),
            output_path.clone(),
        );
        self.jobs
            .insert(job_id.clone(), Arc::new(Mutex::new(info)));

        let task = JobTask {
            job_id: job_id.clone(),
            input_path: input_path.as_ref().to_path_buf(),
            output_path,
        };
        if self.job_queue.push(task).is_err() {
            self.jobs.remove(&job_id);
            return Err(Error::Cancelled);
        }

        info!("job {job_id} submitted: {:?}", input_path.as_ref());
        Ok(job_id)
    }

    /// Published state snapshot for one job.
    pub fn status(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs
            .get(job_id)
            .and_then(|entry| entry.lock().ok().map(|info| info.clone()))
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .filter_map(|entry| entry.value().lock().ok().map(|info| info.clone()))
            .collect()
    }

    /// Exported master-session records for a finished job.
    pub fn sessions(&self, job_id: &str) -> Option<Arc<Vec<Value>>> {
        self.results.get(job_id).map(|entry| Arc::clone(&entry))
    }

    /// Removes a job and its output. Running jobs are refused.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        let Some(entry) = self.jobs.get(job_id) else {
            return Err(Error::StateViolation(format!("unknown job {job_id}")));
        };
        let (status, output_path) = match entry.lock() {
            Ok(info) => (info.status, info.output_path.clone()),
            Err(_) => return Err(Error::StateViolation("job lock poisoned".into())),
        };
        drop(entry);

        if status == JobStatus::Running {
            return Err(Error::Resource("job is running"));
        }

        if output_path.exists() {
            let _ = std::fs::remove_file(&output_path);
        }
        self.jobs.remove(job_id);
        self.results.remove(job_id);
        info!("job {job_id} deleted");
        Ok(())
    }

    /// Evicts completed/failed jobs older than the retention window.
    pub fn cleanup_old_jobs(&self) {
        let retention = Duration::hours(i64::from(self.config.output.retention_hours));
        let now = Utc::now();

        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter_map(|entry| {
                let info = entry.value().lock().ok()?;
                let done = matches!(
                    info.status,
                    JobStatus::Completed | JobStatus::Failed
                );
                let completed_at = info.completed_at?;
                (done && now - completed_at > retention)
                    .then(|| info.job_id.clone())
            })
            .collect();

        for job_id in expired {
            info!("retention cleanup of job {job_id}");
            let _ = self.delete(&job_id);
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerContext {
    config: Config,
    running: Arc<AtomicBool>,
    job_queue: Arc<BlockingQueue<JobTask>>,
    jobs: Arc<DashMap<String, Arc<Mutex<JobInfo>>>>,
    results: Arc<DashMap<String, Arc<Vec<Value>>>>,
    progress_callback: Arc<RwLock<Option<ProgressCallback>>>,
    event_callback: Arc<RwLock<Option<EventCallback>>>,
}

impl WorkerContext {
    fn update_job(&self, job_id: &str, update: impl FnOnce(&mut JobInfo)) {
        if let Some(entry) = self.jobs.get(job_id)
            && let Ok(mut info) = entry.lock()
        {
            update(&mut info);
        }
    }

    fn progress(&self, job_id: &str, progress: u8, message: &str) {
        self.update_job(job_id, |info| info.progress = progress);
        if let Ok(slot) = self.progress_callback.read()
            && let Some(callback) = slot.as_ref()
        {
            callback(job_id, progress, message);
        }
    }

    fn event(&self, job_id: &str, event_type: &str, payload: &Value) {
        if let Ok(slot) = self.event_callback.read()
            && let Some(callback) = slot.as_ref()
        {
            callback(job_id, event_type, payload);
        }
    }
}

fn worker_loop(context: WorkerContext) {
    debug!("worker started");
    while context.running.load(Ordering::SeqCst) {
        let Some(task) = context.job_queue.pop() else {
            break;
        };

        let job_id = task.job_id.clone();
        match run_job(&context, task) {
            Ok(()) => {},
            Err(Error::Cancelled) => {
                context.update_job(&job_id, |info| {
                    info.status = JobStatus::Failed;
                    info.error = Some("cancelled".to_string());
                    info.completed_at = Some(Utc::now());
                });
                break;
            },
            Err(err) => {
                error!("job {job_id} failed: {err}");
                context.update_job(&job_id, |info| {
                    info.status = JobStatus::Failed;
                    info.error = Some(err.to_string());
                    info.completed_at = Some(Utc::now());
                });
                context.event(
                    &job_id,
                    EVENT_STATUS,
                    &json!({ "status": "failed", "error": err.to_string() }),
                );
            },
        }
    }
    debug!("worker stopped");
}

fn run_job(context: &WorkerContext, task: JobTask) -> Result<()> {
    let job_id = task.job_id.clone();
    info!("processing job {job_id}");

    context.update_job(&job_id, |info| {
        info.status = JobStatus::Running;
        info.started_at = Some(Utc::now());
    });
    context.event(&job_id, EVENT_STATUS, &json!({ "status": "running" }));
    context.progress(&job_id, 0, "opening capture");

    let mut reader = CaptureReader::open(&task.input_path)?;

    // Shared, internally synchronized collaborators.
    let correlator = Arc::new(Mutex::new(SessionCorrelator::new(&context.config)));
    let tunnels = Arc::new(Mutex::new(TunnelManager::new(&context.config)));
    let mut processor = PacketProcessor::new(
        &context.config,
        Arc::clone(&correlator),
        Arc::clone(&tunnels),
    );

    // Pull the first record so every interface block preceding it is
    // known before classification starts.
    let primed = reader.next_record()?;
    processor.register_interfaces(reader.interfaces());

    context.progress(&job_id, 5, "capture opened");

    // Producer thread: file I/O into the bounded packet queue.
    let packet_queue: Arc<BlockingQueue<PacketRecord>> = Arc::new(BlockingQueue::new(
        context.config.processing.max_packet_queue_size,
    ));
    let reader_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let reader_warnings: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let producer = {
        let queue = Arc::clone(&packet_queue);
        let running = Arc::clone(&context.running);
        let reader_error = Arc::clone(&reader_error);
        let reader_warnings = Arc::clone(&reader_warnings);
        std::thread::Builder::new()
            .name("pcap-producer".to_string())
            .spawn(move || {
                if let Some(record) = primed {
                    if queue.push(record).is_err() {
                        queue.close();
                        return;
                    }
                }
                loop {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    match reader.next_record() {
                        Ok(Some(record)) => {
                            if queue.push(record).is_err() {
                                break;
                            }
                        },
                        Ok(None) => break,
                        Err(err) if err.is_recoverable() => {
                            // A damaged record usually desynchronizes the
                            // stream; stop producing but keep the job.
                            if let Ok(mut warnings) = reader_warnings.lock() {
                                warnings.push(err.to_string());
                            }
                            break;
                        },
                        Err(err) => {
                            if let Ok(mut slot) = reader_error.lock() {
                                *slot = Some(err);
                            }
                            break;
                        },
                    }
                }
                queue.close();
            })
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    };

    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;

    while let Some(record) = packet_queue.pop() {
        if !context.running.load(Ordering::SeqCst) {
            packet_queue.close();
            let _ = producer.join();
            return Err(Error::Cancelled);
        }

        bytes += u64::from(record.original_length);
        processor.process_record(&record);
        packets += 1;

        if packets % 1_000 == 0 {
            // End is unknown while streaming; scale into a 5..90 band.
            let progress = (5 + (packets / 1_000) % 85) as u8;
            context.progress(&job_id, progress, &format!("{packets} packets"));
        }
        if packets % 100 == 0 {
            context.event(
                &job_id,
                EVENT_PROGRESS,
                &json!({ "packets": packets, "bytes": bytes }),
            );
            for warning in processor.take_warnings() {
                context.event(&job_id, EVENT_WARNING, &json!({ "cause": warning }));
            }
        }
    }

    let _ = producer.join();

    if let Ok(mut slot) = reader_error.lock()
        && let Some(err) = slot.take()
    {
        return Err(err);
    }
    if let Ok(mut warnings) = reader_warnings.lock() {
        for warning in warnings.drain(..) {
            warn!("job {job_id}: capture truncated: {warning}");
            context.event(&job_id, EVENT_WARNING, &json!({ "cause": warning }));
        }
    }

    context.progress(&job_id, 90, "finalizing sessions");
    processor.finalize();
    for warning in processor.take_warnings() {
        context.event(&job_id, EVENT_WARNING, &json!({ "cause": warning }));
    }

    context.progress(&job_id, 95, "exporting results");
    let records = {
        let correlator = correlator
            .lock()
            .map_err(|_| Error::StateViolation("correlator lock poisoned".into()))?;
        let tunnels = tunnels
            .lock()
            .map_err(|_| Error::StateViolation("tunnel manager lock poisoned".into()))?;
        EventExporter::session_records(&correlator, &tunnels)
    };
    EventExporter::export_to_file(&task.output_path, &records)?;

    let counters = processor.counters();
    let session_count = records.len();
    context
        .results
        .insert(job_id.clone(), Arc::new(records));

    context.progress(&job_id, 100, "completed");
    context.update_job(&job_id, |info| {
        info.status = JobStatus::Completed;
        info.progress = 100;
        info.completed_at = Some(Utc::now());
        info.total_packets = packets;
        info.total_bytes = bytes;
        info.warning_count = counters.warnings;
        info.session_count = session_count;
    });
    context.event(
        &job_id,
        EVENT_STATUS,
        &json!({
            "status": "completed",
            "sessions": session_count,
            "packets": packets,
            "bytes": bytes,
            "warnings": counters.warnings,
        }),
    );

    info!("job {job_id} completed: {packets} packets, {session_count} sessions");
    Ok(())
}
