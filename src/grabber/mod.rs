//! Grabber Pool
//!
//! Turns a bursty supply of raw capture buffers into an ordered,
//! back-pressured stream of decoded frames. A fixed set of workers
//! claims buffers through per-worker busy flags; buffers arriving while
//! every worker is busy are dropped and counted. Completions are
//! reassembled into sequence order before leaving the pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::decode::hdr::{HdrDetector, ToneMappingRequest};
use crate::decode::lut::{P010Tables, ToneMapLut};
use crate::decode::{decode_frame, FrameSpec, HdrMode, PixelFormat};
use crate::engine::clock;
use crate::image::{buffer_pool, Image};

/// Decode parameters shared with the workers; replaced atomically on
/// settings or tone-mapping changes.
#[derive(Clone, Default)]
pub struct DecodeParams {
    pub lut: Option<Arc<ToneMapLut>>,
    pub hdr_mode: HdrMode,
    pub p010: Option<Arc<P010Tables>>,
}

/// One in-order pool emission.
pub enum PoolOutput {
    Frame {
        worker: usize,
        image: Image,
        seq: u64,
        start_ts_ms: i64,
    },
    Error {
        worker: usize,
        error: String,
        seq: u64,
    },
}

impl PoolOutput {
    fn seq(&self) -> u64 {
        match self {
            PoolOutput::Frame { seq, .. } | PoolOutput::Error { seq, .. } => *seq,
        }
    }
}

struct Job {
    data: Vec<u8>,
    spec: FrameSpec,
    seq: u64,
    start_ts_ms: i64,
}

/// Reassembles worker completions into strict sequence order.
struct Reorderer {
    next_seq: u64,
    pending: BTreeMap<u64, PoolOutput>,
}

impl Reorderer {
    fn new() -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
        }
    }

    fn push(&mut self, output: PoolOutput) -> Vec<PoolOutput> {
        self.pending.insert(output.seq(), output);
        let mut ready = Vec::new();
        while let Some(out) = self.pending.remove(&self.next_seq) {
            ready.push(out);
            self.next_seq += 1;
        }
        ready
    }
}

/// Number of decode workers for this machine.
pub fn worker_count() -> usize {
    let ideal = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    ideal.saturating_sub(1).clamp(1, 4)
}

pub struct GrabberPool {
    job_txs: Vec<Sender<Job>>,
    busy: Arc<Vec<AtomicBool>>,
    active: Arc<AtomicBool>,
    next_seq: u64,
    dropped: Arc<AtomicU64>,
    decoded: Arc<AtomicU64>,
    workers: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<()>>,
}

impl GrabberPool {
    /// Spawn the pool. Decoded frames arrive on the returned receiver
    /// in sequence order; tone-mapping requests from the HDR detector
    /// go to `hdr_tx`.
    pub fn new(
        params: Arc<RwLock<DecodeParams>>,
        detector: Arc<Mutex<HdrDetector>>,
        hdr_tx: Sender<ToneMappingRequest>,
    ) -> (Self, Receiver<PoolOutput>) {
        let count = worker_count();
        let active = Arc::new(AtomicBool::new(true));
        let busy: Arc<Vec<AtomicBool>> =
            Arc::new((0..count).map(|_| AtomicBool::new(false)).collect());
        let decoded = Arc::new(AtomicU64::new(0));

        let (raw_tx, raw_rx) = mpsc::channel::<PoolOutput>();
        let (out_tx, out_rx) = mpsc::channel::<PoolOutput>();

        let mut job_txs = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (job_tx, job_rx) = mpsc::channel::<Job>();
            job_txs.push(job_tx);
            let worker = WorkerState {
                index,
                params: params.clone(),
                detector: detector.clone(),
                hdr_tx: hdr_tx.clone(),
                busy: busy.clone(),
                active: active.clone(),
                results: raw_tx.clone(),
                decoded: decoded.clone(),
            };
            workers.push(
                thread::Builder::new()
                    .name(format!("grabber-worker-{index}"))
                    .spawn(move || worker.run(job_rx))
                    .expect("spawn grabber worker"),
            );
        }
        drop(raw_tx);

        let aggregator = thread::Builder::new()
            .name("grabber-order".to_string())
            .spawn(move || {
                let mut reorder = Reorderer::new();
                while let Ok(output) = raw_rx.recv() {
                    for ready in reorder.push(output) {
                        if out_tx.send(ready).is_err() {
                            return;
                        }
                    }
                }
            })
            .expect("spawn grabber aggregator");

        info!("grabber pool started with {} workers", count);

        (
            Self {
                job_txs,
                busy,
                active,
                next_seq: 0,
                dropped: Arc::new(AtomicU64::new(0)),
                decoded,
                workers,
                aggregator: Some(aggregator),
            },
            out_rx,
        )
    }

    /// Hand one raw buffer to an idle worker. Returns false (and counts
    /// the drop) when the pool is saturated.
    pub fn dispatch(&mut self, data: Vec<u8>, spec: FrameSpec, start_ts_ms: i64) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        for (index, flag) in self.busy.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let job = Job {
                    data,
                    spec,
                    seq: self.next_seq,
                    start_ts_ms,
                };
                self.next_seq += 1;
                // A worker never drops its receiver while active.
                let _ = self.job_txs[index].send(job);
                return true;
            }
        }
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        crate::perf::global().record_dropped("grabber_pool", 1);
        if dropped % 100 == 1 {
            warn!("grabber pool saturated; {} frames dropped so far", dropped);
        }
        buffer_pool().put(data);
        false
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn decoded_frames(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Stop accepting work and join the workers. In-flight jobs run to
    /// completion.
    pub fn stop(mut self) {
        self.active.store(false, Ordering::Release);
        self.job_txs.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.aggregator.take() {
            let _ = handle.join();
        }
        debug!("grabber pool stopped");
    }
}

struct WorkerState {
    index: usize,
    params: Arc<RwLock<DecodeParams>>,
    detector: Arc<Mutex<HdrDetector>>,
    hdr_tx: Sender<ToneMappingRequest>,
    busy: Arc<Vec<AtomicBool>>,
    active: Arc<AtomicBool>,
    results: Sender<PoolOutput>,
    decoded: Arc<AtomicU64>,
}

impl WorkerState {
    fn run(&self, jobs: Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            if self.active.load(Ordering::Acquire) {
                self.process(job);
            }
            self.busy[self.index].store(false, Ordering::Release);
        }
    }

    fn process(&self, job: Job) {
        self.scan_hdr(&job);

        let params = self.params.read().clone();
        let result = decode_frame(
            &job.data,
            &job.spec,
            params.lut.as_deref(),
            params.hdr_mode,
            params.p010.as_deref(),
        );
        buffer_pool().put(job.data);

        let output = match result {
            Ok(image) => {
                self.decoded.fetch_add(1, Ordering::Relaxed);
                crate::perf::global().record_written("grabber_pool");
                PoolOutput::Frame {
                    worker: self.index,
                    image,
                    seq: job.seq,
                    start_ts_ms: job.start_ts_ms,
                }
            }
            Err(err) => PoolOutput::Error {
                worker: self.index,
                error: err.to_string(),
                seq: job.seq,
            },
        };
        let _ = self.results.send(output);
    }

    /// Feed the raw buffer to the HDR detector, then fold the frame
    /// verdict. Runs before decode so the scan sees original samples.
    fn scan_hdr(&self, job: &Job) {
        let mut detector = self.detector.lock();
        if !detector.enabled() {
            return;
        }

        let spec = &job.spec;
        let stride = spec.stride as usize;
        let height = spec.height as usize;
        let width = spec.width as usize;
        let data = &job.data;

        match spec.format {
            PixelFormat::Yuyv | PixelFormat::Uyvy => {
                if data.len() >= stride * height {
                    for y in 0..height {
                        let row = &data[y * stride..][..(width * 2).min(stride)];
                        detector.scan_yuyv(row);
                    }
                }
            }
            PixelFormat::Nv12 | PixelFormat::I420 => {
                let y_plane = stride * height;
                if data.len() >= y_plane + y_plane / 2 {
                    for y in 0..height {
                        let y_row = &data[y * stride..][..width.min(stride)];
                        let uv_off = y_plane + (y / 2) * stride;
                        let uv_row = &data[uv_off..][..width.min(stride)];
                        detector.scan_y_uv8(y_row, uv_row);
                    }
                }
            }
            PixelFormat::P010 => {
                let y_plane = stride * height;
                if data.len() >= y_plane + y_plane / 2 {
                    for y in 0..height {
                        let y_row = &data[y * stride..][..(width * 2).min(stride)];
                        let uv_off = y_plane + (y / 2) * stride;
                        let uv_row = &data[uv_off..][..(width * 2).min(stride)];
                        detector.scan_y_uv16(y_row, uv_row);
                    }
                }
            }
            PixelFormat::Rgb24 | PixelFormat::Xrgb | PixelFormat::Mjpeg => {}
        }

        if let Some(request) = detector.finalize(clock::now_ms()) {
            let _ = self.hdr_tx.send(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Crop;

    fn rgb_spec(w: u32, h: u32) -> FrameSpec {
        FrameSpec {
            width: w,
            height: h,
            stride: w * 3,
            format: PixelFormat::Rgb24,
            crop: Crop::default(),
            quarter: false,
        }
    }

    #[test]
    fn reorderer_restores_sequence_order() {
        let mut r = Reorderer::new();
        let out = |seq| PoolOutput::Error {
            worker: 0,
            error: String::new(),
            seq,
        };

        assert!(r.push(out(2)).is_empty());
        assert!(r.push(out(1)).is_empty());
        let ready = r.push(out(0));
        assert_eq!(ready.iter().map(|o| o.seq()).collect::<Vec<_>>(), [0, 1, 2]);
        let ready = r.push(out(3));
        assert_eq!(ready.iter().map(|o| o.seq()).collect::<Vec<_>>(), [3]);
    }

    #[test]
    fn worker_count_is_bounded() {
        let n = worker_count();
        assert!((1..=4).contains(&n));
    }

    #[test]
    fn frames_come_out_in_order() {
        let params = Arc::new(RwLock::new(DecodeParams::default()));
        let detector = Arc::new(Mutex::new(HdrDetector::new()));
        let (hdr_tx, _hdr_rx) = mpsc::channel();
        let (mut pool, rx) = GrabberPool::new(params, detector, hdr_tx);

        let mut accepted = 0;
        for _ in 0..20 {
            if pool.dispatch(vec![0u8; 4 * 4 * 3], rgb_spec(4, 4), 0) {
                accepted += 1;
            } else {
                // Saturated: wait for the pool to drain a little.
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }

        let mut seqs = Vec::new();
        for _ in 0..accepted {
            match rx.recv_timeout(std::time::Duration::from_secs(5)) {
                Ok(out) => seqs.push(out.seq()),
                Err(_) => break,
            }
        }
        let sorted: Vec<u64> = (0..seqs.len() as u64).collect();
        assert_eq!(seqs, sorted);

        pool.stop();
    }

    #[test]
    fn decode_errors_flow_through_as_errors() {
        let params = Arc::new(RwLock::new(DecodeParams::default()));
        let detector = Arc::new(Mutex::new(HdrDetector::new()));
        let (hdr_tx, _hdr_rx) = mpsc::channel();
        let (mut pool, rx) = GrabberPool::new(params, detector, hdr_tx);

        // Buffer far too small for the claimed dimensions.
        assert!(pool.dispatch(vec![0u8; 4], rgb_spec(64, 64), 0));
        match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
            PoolOutput::Error { seq, .. } => assert_eq!(seq, 0),
            PoolOutput::Frame { .. } => panic!("expected a decode error"),
        }

        pool.stop();
    }
}
