//! Step-segmented acquisition reader.

use crate::datafile::{event_words, BlockReader, MappedFileReader, DEFAULT_BLOCK_BYTES};
use crate::header::FileHeader;
use crate::index::{read_index, rebuild_index, StepDescriptor};
use crate::{Error, Result};
use petstream_core::{
    EventBuffer, EventSink, RawHit, SequenceReorder, UnorderedHandler, CLOCKS_PER_FRAME,
};
use petstream_raw::{
    AcquisitionConfig, ChannelModeTable, DecodeStats, Decoder, FrameClock, TimeReference,
    UndecodedHit,
};
use rayon::prelude::*;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;

/// Data file extension.
pub const DATA_EXTENSION: &str = "rawf";

/// Index file extension.
pub const INDEX_EXTENSION: &str = "idxf";

/// Path of the data file for an acquisition prefix.
#[must_use]
pub fn data_path<P: AsRef<Path>>(prefix: P) -> PathBuf {
    with_extension(prefix.as_ref(), DATA_EXTENSION)
}

/// Path of the index file for an acquisition prefix.
#[must_use]
pub fn index_path<P: AsRef<Path>>(prefix: P) -> PathBuf {
    with_extension(prefix.as_ref(), INDEX_EXTENSION)
}

fn with_extension(prefix: &Path, extension: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

/// Reader pipeline tuning.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Events per raw buffer handed to the decoder.
    pub buffer_capacity: usize,
    /// Size of one file read block in bytes.
    pub read_block_bytes: usize,
    /// Bounded queue depth between pipeline threads.
    pub queue_depth: usize,
    /// Optional number of decoder threads. Defaults to the width of the
    /// global rayon pool when unset.
    pub parallelism: Option<usize>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 1 << 16,
            read_block_bytes: DEFAULT_BLOCK_BYTES,
            queue_depth: 4,
            parallelism: None,
        }
    }
}

impl ReaderOptions {
    /// Set the number of events per raw buffer.
    ///
    /// Values less than 1 are clamped to 1.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Set the read block size in bytes.
    ///
    /// Values below one frame header are clamped up.
    #[must_use]
    pub fn with_read_block_bytes(mut self, bytes: usize) -> Self {
        self.read_block_bytes = bytes.max(petstream_raw::FrameHeader::BYTES);
        self
    }

    /// Set the bounded queue depth between pipeline threads.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_queue_depth`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Set the number of decoder threads.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_parallelism`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = Some(threads.max(1));
        self
    }

    /// Fallible variant of [`Self::with_buffer_capacity`].
    ///
    /// # Errors
    /// Returns an error if `capacity` is 0.
    pub fn try_with_buffer_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidFormat(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        self.buffer_capacity = capacity;
        Ok(self)
    }

    /// Fallible variant of [`Self::with_queue_depth`].
    ///
    /// # Errors
    /// Returns an error if `depth` is 0.
    pub fn try_with_queue_depth(mut self, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidFormat(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        self.queue_depth = depth;
        Ok(self)
    }

    /// Fallible variant of [`Self::with_parallelism`].
    ///
    /// # Errors
    /// Returns an error if `threads` is 0.
    pub fn try_with_parallelism(mut self, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::InvalidFormat(
                "parallelism must be at least 1".to_string(),
            ));
        }
        self.parallelism = Some(threads);
        Ok(self)
    }

    /// Return the configured queue depth, clamped to at least 1.
    #[must_use]
    pub fn effective_queue_depth(&self) -> usize {
        self.queue_depth.max(1)
    }

    /// Return the number of decoder threads, clamped to at least 1.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    }

    /// Return the configured buffer capacity, clamped to at least 1.
    #[must_use]
    pub fn effective_buffer_capacity(&self) -> usize {
        self.buffer_capacity.max(1)
    }
}

/// Reader lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Opened, or between steps.
    Ready,
    /// A step has been selected and not processed yet.
    StepActive,
    /// Every step of the index has been consumed.
    Exhausted,
}

/// Counters for one processed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Frames read from the step's byte range.
    pub frames: u64,
    /// Frames flagged as lost by the front-end.
    pub frames_lost: u64,
    /// Frames outside the step's frame range.
    pub skipped_frames: u64,
    /// Event words read from frames inside the step.
    pub events: u64,
    /// Hits delivered by the decoder.
    pub hits: u64,
    /// Records rejected by the decoder.
    pub decode_errors: u64,
    /// Raw buffers handed to the decoder.
    pub buffers: u64,
}

/// Reads an acquisition step by step and decodes it in parallel.
///
/// The calling thread does all file I/O and fills raw buffers. A decoder
/// thread fans them out on a thread pool owned by the reader, and a delivery
/// thread restores sequence order and feeds the sink.
pub struct RawReader {
    data_path: PathBuf,
    header: FileHeader,
    config: AcquisitionConfig,
    options: ReaderOptions,
    modes: Arc<ChannelModeTable>,
    steps: Vec<StepDescriptor>,
    index_is_temp: bool,
    cursor: usize,
    current: Option<StepDescriptor>,
    state: ReaderState,
    next_seq: u64,
    pool: rayon::ThreadPool,
}

impl RawReader {
    /// Opens the acquisition `<prefix>.rawf` / `<prefix>.idxf`.
    ///
    /// A missing index is rebuilt from the data file as a single step and
    /// flagged temporary.
    ///
    /// # Errors
    /// Returns an error if the data file is missing or malformed, the index
    /// is malformed, or the configuration is inconsistent with the file.
    pub fn open<P: AsRef<Path>>(
        prefix: P,
        config: AcquisitionConfig,
        options: ReaderOptions,
    ) -> Result<Self> {
        config.validate()?;

        let data_path = data_path(&prefix);
        let header = FileHeader::read(&mut BufReader::new(File::open(&data_path)?))?;

        let limit = config.effective_channel_limit(header.channel_limit);
        let mut modes = header.mode_table(limit);
        config.apply_to(&mut modes)?;

        let index_path = index_path(&prefix);
        let header_len = header.encoded_len();
        let (steps, index_is_temp) = if index_path.exists() {
            let steps = read_index(BufReader::new(File::open(&index_path)?))?;
            (steps, false)
        } else {
            log::warn!(
                "{} not found, rebuilding a temporary index from the data file",
                index_path.display()
            );
            let mapped = MappedFileReader::open(&data_path)?;
            (rebuild_index(&mapped, header_len), true)
        };

        if let Some((line, step)) = steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.begin < header_len)
        {
            return Err(Error::InvalidIndex {
                line: line + 1,
                reason: format!("step begins at {} inside the file header", step.begin),
            });
        }

        // Decoder workers block on the pipeline channels; they must never
        // share a pool with rayon work done by the sink.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.effective_parallelism())
            .thread_name(|i| format!("petstream-decode-{i}"))
            .build()?;

        log::info!(
            "opened {}: {} step(s), {} Hz, channel limit {}, time reference {}",
            data_path.display(),
            steps.len(),
            header.frequency,
            modes.limit(),
            config.time_reference
        );

        Ok(Self {
            data_path,
            header,
            config,
            options,
            modes: Arc::new(modes),
            steps,
            index_is_temp,
            cursor: 0,
            current: None,
            state: ReaderState::Ready,
            next_seq: 0,
            pool,
        })
    }

    /// Opens an acquisition with default configuration and options.
    ///
    /// # Errors
    /// See [`Self::open`].
    pub fn open_default<P: AsRef<Path>>(prefix: P) -> Result<Self> {
        Self::open(prefix, AcquisitionConfig::default(), ReaderOptions::default())
    }

    /// Advances to the next step of the index.
    ///
    /// Returns `false` once every step has been consumed.
    ///
    /// # Errors
    /// Currently infallible; reserved for index sources that read lazily.
    pub fn next_step(&mut self) -> Result<bool> {
        match self.steps.get(self.cursor) {
            Some(step) => {
                self.current = Some(*step);
                self.cursor += 1;
                self.state = ReaderState::StepActive;
                log::debug!("step {} of {}: {step}", self.cursor, self.steps.len());
                Ok(true)
            }
            None => {
                self.current = None;
                self.state = ReaderState::Exhausted;
                Ok(false)
            }
        }
    }

    /// Scan values of the current step.
    #[must_use]
    pub fn step_values(&self) -> Option<(f32, f32)> {
        self.current.map(|step| step.values())
    }

    /// Descriptor of the current step.
    #[must_use]
    pub fn step(&self) -> Option<&StepDescriptor> {
        self.current.as_ref()
    }

    /// Reads, decodes and delivers the current step into `sink`.
    ///
    /// Buffers reach the sink in sequence order and `sink.finish()` is called
    /// once the step is complete, including when reading fails part way; in
    /// that case the buffers read before the failure are still delivered.
    ///
    /// # Errors
    /// Returns [`Error::NoActiveStep`] without a selected step,
    /// [`Error::Truncated`] if the data ends inside a frame, or
    /// [`Error::TooManyDecodeErrors`] if the configured threshold is exceeded.
    pub fn process_step<S>(&mut self, sink: &mut S) -> Result<StepReport>
    where
        S: EventSink<RawHit>,
    {
        if self.state != ReaderState::StepActive {
            return Err(Error::NoActiveStep);
        }
        let step = self.current.ok_or(Error::NoActiveStep)?;
        self.state = ReaderState::Ready;

        let clock = FrameClock::resolve(
            &self.config.time_reference,
            self.header.file_creation_daq_time,
            step.first_frame,
        );
        let stats = Arc::new(DecodeStats::default());
        let decoder = Decoder::with_stats(Arc::clone(&self.modes), clock.clone(), Arc::clone(&stats));
        let segmenter = Segmenter {
            step,
            clock,
            capacity: self.options.effective_buffer_capacity(),
            max_errors: self.config.max_decode_errors,
            stats: stats.as_ref(),
        };

        let file = File::open(&self.data_path)?;
        let mut blocks = BlockReader::new(file, step.begin, step.end, self.options.read_block_bytes)?;

        let depth = self.options.effective_queue_depth();
        let (raw_tx, raw_rx) = sync_channel::<EventBuffer<UndecodedHit>>(depth);
        let (out_tx, out_rx) = sync_channel::<(u64, Option<EventBuffer<RawHit>>)>(depth);
        let first_seq = self.next_seq;
        let next_seq = &mut self.next_seq;
        let pool = &self.pool;

        let read_result = std::thread::scope(|scope| {
            let decoder = &decoder;
            scope.spawn(move || {
                pool.install(move || {
                    raw_rx
                        .into_iter()
                        .par_bridge()
                        .for_each_with(out_tx, |tx, buffer| {
                            let seq_n = buffer.seq_n();
                            // The delivery thread only goes away if the sink panicked.
                            let _ = tx.send((seq_n, decoder.handle_events(buffer)));
                        });
                });
            });

            scope.spawn(move || {
                let mut reorder = SequenceReorder::starting_at(first_seq, &mut *sink);
                for (seq_n, buffer) in out_rx {
                    if let Err(err) = reorder.offer(seq_n, buffer) {
                        log::error!("dropping decoded buffer: {err}");
                    }
                }
                reorder.finish();
            });

            let result = segmenter.run(&mut blocks, next_seq, |buffer| raw_tx.send(buffer).is_ok());
            drop(raw_tx);
            result
        });

        let mut report = read_result?;
        let decoded = stats.snapshot();
        report.hits = decoded.hits;
        report.decode_errors = decoded.errors;
        if let Some(limit) = self.config.max_decode_errors {
            if decoded.errors > limit {
                return Err(Error::TooManyDecodeErrors {
                    errors: decoded.errors,
                    limit,
                });
            }
        }

        if report.frames_lost > 0 {
            log::warn!("{} frame(s) flagged as lost in this step", report.frames_lost);
        }
        if report.skipped_frames > 0 {
            log::warn!(
                "{} frame(s) outside frames {}..{} skipped",
                report.skipped_frames,
                step.first_frame,
                step.end_frame
            );
        }
        log::info!(
            "step ({}, {}): {} frames, {} events, {} hits, {} decode errors, {} buffers",
            step.value1,
            step.value2,
            report.frames,
            report.events,
            report.hits,
            report.decode_errors,
            report.buffers
        );
        Ok(report)
    }

    /// Processes every remaining step, creating one sink per step.
    ///
    /// # Errors
    /// Stops at the first failing step and returns its error.
    pub fn process_all<F, S>(&mut self, mut make_sink: F) -> Result<Vec<(StepDescriptor, S, StepReport)>>
    where
        F: FnMut(&StepDescriptor) -> S,
        S: EventSink<RawHit>,
    {
        let mut results = Vec::new();
        while self.next_step()? {
            let step = self.current.ok_or(Error::NoActiveStep)?;
            let mut sink = make_sink(&step);
            let report = self.process_step(&mut sink)?;
            results.push((step, sink, report));
        }
        Ok(results)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Returns true if `channel_id` is in charge-integration mode.
    #[must_use]
    pub fn is_qdc(&self, channel_id: u32) -> bool {
        self.modes.is_qdc(channel_id)
    }

    /// Returns true if any channel is in time-over-threshold mode.
    #[must_use]
    pub fn is_tot(&self) -> bool {
        self.modes.any_tot()
    }

    /// System clock frequency in Hz.
    #[must_use]
    pub fn frequency(&self) -> u32 {
        self.header.frequency
    }

    /// Trigger id, when the acquisition was triggered.
    #[must_use]
    pub fn trigger_id(&self) -> Option<u16> {
        self.header.trigger_id
    }

    /// Synchronization epoch in seconds since the Unix epoch.
    #[must_use]
    pub fn sync_epoch(&self) -> f64 {
        self.header.sync_epoch
    }

    /// Time reference used for decoded timestamps.
    #[must_use]
    pub fn time_reference(&self) -> &TimeReference {
        &self.config.time_reference
    }

    /// Returns true if the index was rebuilt because the index file was missing.
    #[must_use]
    pub fn index_is_temp(&self) -> bool {
        self.index_is_temp
    }

    /// All steps of the index.
    #[must_use]
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    /// Data file header.
    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Channel mode table after configuration overrides.
    #[must_use]
    pub fn channel_modes(&self) -> &ChannelModeTable {
        &self.modes
    }

    /// Path of the data file.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

/// Splits one step's frames into raw buffers.
struct Segmenter<'a> {
    step: StepDescriptor,
    clock: FrameClock,
    capacity: usize,
    max_errors: Option<u64>,
    stats: &'a DecodeStats,
}

impl Segmenter<'_> {
    /// Reads every frame of the step and hands full buffers to `send`.
    /// Stops early when `send` reports the consumer gone or the decode
    /// error threshold is crossed.
    fn run<R, F>(&self, blocks: &mut BlockReader<R>, next_seq: &mut u64, mut send: F) -> Result<StepReport>
    where
        R: std::io::Read,
        F: FnMut(EventBuffer<UndecodedHit>) -> bool,
    {
        let mut report = StepReport::default();
        let mut current: Option<EventBuffer<UndecodedHit>> = None;
        let mut last_frame = self.step.first_frame;

        loop {
            let (header, events) = match blocks.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    if let Some(partial) = current.take() {
                        self.close(partial, last_frame, &mut report, &mut send)?;
                    }
                    return Err(err);
                }
            };
            report.frames += 1;
            if !self.step.contains_frame(header.frame_id) {
                report.skipped_frames += 1;
                log::debug!(
                    "frame {} outside step frames {}..{}",
                    header.frame_id,
                    self.step.first_frame,
                    self.step.end_frame
                );
                continue;
            }
            if header.frame_lost {
                report.frames_lost += 1;
            }
            last_frame = header.frame_id;

            for word in event_words(events) {
                let buffer = current.get_or_insert_with(|| {
                    let seq_n = *next_seq;
                    *next_seq += 1;
                    EventBuffer::new(self.capacity, seq_n, self.clock.frame_start(header.frame_id))
                });
                buffer.push(UndecodedHit::new(header.frame_id, word));
                report.events += 1;

                if buffer.len() >= self.capacity {
                    if let Some(full) = current.take() {
                        if !self.close(full, last_frame, &mut report, &mut send)? {
                            return Ok(report);
                        }
                    }
                }
            }
        }

        if let Some(partial) = current.take() {
            self.close(partial, last_frame, &mut report, &mut send)?;
        }
        Ok(report)
    }

    fn close<F>(
        &self,
        mut buffer: EventBuffer<UndecodedHit>,
        last_frame: u64,
        report: &mut StepReport,
        send: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(EventBuffer<UndecodedHit>) -> bool,
    {
        buffer.set_t_max(self.clock.frame_start(last_frame) + CLOCKS_PER_FRAME)?;
        log::debug!(
            "raw buffer {}: {} event(s), t {}..{:?}",
            buffer.seq_n(),
            buffer.len(),
            buffer.t_min(),
            buffer.t_max()
        );
        report.buffers += 1;
        if !send(buffer) {
            return Ok(false);
        }
        if let Some(limit) = self.max_errors {
            let errors = self.stats.errors();
            if errors > limit {
                return Err(Error::TooManyDecodeErrors { errors, limit });
            }
        }
        Ok(true)
    }
}
