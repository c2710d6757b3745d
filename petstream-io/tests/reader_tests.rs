#![allow(
    clippy::cast_possible_truncation,
    clippy::float_cmp,
    clippy::unreadable_literal
)]
use approx::assert_relative_eq;
use petstream_core::{
    ChannelMode, CollectSink, EventBuffer, Measurement, NullSink, RawHit, UnorderedHandler,
    UnorderedStage,
};
use petstream_io::{
    index_path, write_index, AcquisitionWriter, Error, FileHeader, RawReader, ReaderOptions,
    ReaderState, StepDescriptor,
};
use petstream_raw::{AcquisitionConfig, EventWord, TimeReference, UserClock};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;
use tempfile::TempDir;

fn header() -> FileHeader {
    FileHeader {
        frequency: 200_000_000,
        default_mode: ChannelMode::Tot,
        sync_epoch: 1_700_000_000.5,
        trigger_id: Some(3),
        file_creation_daq_time: 2048,
        channel_limit: 64,
        channel_modes: vec![(1, ChannelMode::Qdc)],
    }
}

// channel, t_coarse, e_coarse, e_fine
fn event(channel: u32, t_coarse: u16, e_coarse: u16, e_fine: u16) -> EventWord {
    EventWord::from_fields(channel, 0, t_coarse, e_coarse, 5, e_fine)
}

fn pair() -> [EventWord; 2] {
    [event(0, 7, 27, 0), event(1, 9, 40, 333)]
}

fn overwrite_index(prefix: &Path, steps: &[StepDescriptor]) {
    let mut file = File::create(index_path(prefix)).unwrap();
    write_index(&mut file, steps).unwrap();
}

/// Two steps of four frames with two events each. A stray frame (id 10)
/// sits inside the first step's byte range.
fn two_step_acquisition(dir: &TempDir) -> (PathBuf, Vec<StepDescriptor>) {
    let prefix = dir.path().join("scan");
    let mut writer = AcquisitionWriter::create(&prefix, &header()).unwrap();

    writer.begin_step(0.5, 1.0);
    for frame in 0..4 {
        writer.write_frame(frame, false, &pair()).unwrap();
    }
    writer.write_frame(10, false, &[event(2, 0, 0, 0)]).unwrap();
    writer.begin_step(1.5, 1.0);
    for frame in 4..8 {
        writer.write_frame(frame, frame == 5, &pair()).unwrap();
    }
    let mut steps = writer.finish().unwrap();

    steps[0].end_frame = 4;
    overwrite_index(&prefix, &steps);
    (prefix, steps)
}

fn small_buffers() -> ReaderOptions {
    ReaderOptions::default()
        .with_buffer_capacity(3)
        .with_parallelism(2)
        .with_queue_depth(1)
        .with_read_block_bytes(32)
}

#[test]
fn test_two_step_segmentation() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, steps) = two_step_acquisition(&dir);
    let mut reader = RawReader::open(&prefix, AcquisitionConfig::default(), small_buffers()).unwrap();

    assert!(!reader.index_is_temp());
    assert_eq!(reader.steps(), &steps[..]);
    assert_eq!(reader.state(), ReaderState::Ready);

    assert!(reader.next_step().unwrap());
    assert_eq!(reader.step_values(), Some((0.5, 1.0)));
    let mut first = CollectSink::<RawHit>::new();
    let report = reader.process_step(&mut first).unwrap();
    assert_eq!(report.frames, 5);
    assert_eq!(report.skipped_frames, 1);
    assert_eq!(report.frames_lost, 0);
    assert_eq!(report.events, 8);
    assert_eq!(report.hits, 8);
    assert_eq!(report.decode_errors, 0);
    assert_eq!(report.buffers, 3);
    assert!(first.is_finished());
    assert_eq!(first.sequence(), vec![0, 1, 2]);
    assert!(first.records().iter().all(|hit| hit.frame_id < 4));
    assert_eq!(reader.state(), ReaderState::Ready);

    assert!(reader.next_step().unwrap());
    assert_eq!(reader.step_values(), Some((1.5, 1.0)));
    let mut second = CollectSink::<RawHit>::new();
    let report = reader.process_step(&mut second).unwrap();
    assert_eq!(report.frames, 4);
    assert_eq!(report.frames_lost, 1);
    assert_eq!(report.events, 8);
    assert_eq!(second.sequence(), vec![3, 4, 5]);
    let hits: Vec<RawHit> = second.records();
    assert!(hits.iter().all(|hit| (4..8).contains(&hit.frame_id)));
    let frames: Vec<u64> = hits.iter().map(|hit| hit.frame_id).collect();
    assert_eq!(frames, vec![4, 4, 5, 5, 6, 6, 7, 7]);

    assert!(!reader.next_step().unwrap());
    assert_eq!(reader.state(), ReaderState::Exhausted);
    assert!(reader.step().is_none());
}

#[test]
fn test_decoded_values_and_modes() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, _) = two_step_acquisition(&dir);
    let mut reader = RawReader::open_default(&prefix).unwrap();

    assert_eq!(reader.frequency(), 200_000_000);
    assert_eq!(reader.trigger_id(), Some(3));
    assert_relative_eq!(reader.sync_epoch(), 1_700_000_000.5);
    assert!(matches!(reader.time_reference(), TimeReference::Sync));
    assert!(reader.is_qdc(1));
    assert!(!reader.is_qdc(0));
    assert!(reader.is_tot());

    reader.next_step().unwrap();
    let mut sink = CollectSink::<RawHit>::new();
    reader.process_step(&mut sink).unwrap();
    let hits = sink.records();

    let tot = hits[2];
    assert_eq!((tot.channel_id, tot.frame_id), (0, 1));
    assert_eq!(tot.time, 1024 + 7);
    assert_eq!(tot.measurement(), Measurement::Width(20));

    let qdc = hits[3];
    assert_eq!(qdc.channel_id, 1);
    assert_eq!(qdc.mode, ChannelMode::Qdc);
    assert_eq!(qdc.measurement(), Measurement::Charge(333));
}

#[test]
fn test_time_references() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, _) = two_step_acquisition(&dir);

    let first_time = |reference: TimeReference| {
        let config = AcquisitionConfig::default().with_time_reference(reference);
        let mut reader = RawReader::open(&prefix, config, ReaderOptions::default()).unwrap();
        reader.next_step().unwrap();
        reader.process_step(&mut NullSink::default()).unwrap();
        reader.next_step().unwrap();
        let mut sink = CollectSink::<RawHit>::new();
        reader.process_step(&mut sink).unwrap();
        sink.records()[0].time
    };

    // First hit of the second step: frame 4, t_coarse 7.
    assert_eq!(first_time(TimeReference::Sync), 4 * 1024 + 7);
    assert_eq!(first_time(TimeReference::Wall), 4 * 1024 + 7 - 2048);
    assert_eq!(first_time(TimeReference::Step), 7);
    let user = UserClock::new(|frame| i64::try_from(frame).unwrap() * 100);
    assert_eq!(first_time(TimeReference::User(user)), 400 + 7);
}

#[test]
fn test_channel_limit_override() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, _) = two_step_acquisition(&dir);

    // Channel 1 becomes invalid, channel 0 stays valid.
    let config = AcquisitionConfig::default().with_channel_limit(1);
    let mut reader = RawReader::open(&prefix, config, small_buffers()).unwrap();
    reader.next_step().unwrap();
    let mut sink = CollectSink::<RawHit>::new();
    let report = reader.process_step(&mut sink).unwrap();
    assert_eq!(report.events, 8);
    assert_eq!(report.hits, 4);
    assert_eq!(report.decode_errors, 4);
    assert!(sink.records().iter().all(|hit| hit.channel_id == 0));

    let config = AcquisitionConfig::default()
        .with_channel_limit(1)
        .with_max_decode_errors(2);
    let mut reader = RawReader::open(&prefix, config, small_buffers()).unwrap();
    reader.next_step().unwrap();
    let result = reader.process_step(&mut NullSink::default());
    assert!(matches!(
        result,
        Err(Error::TooManyDecodeErrors { limit: 2, .. })
    ));
    assert_eq!(reader.state(), ReaderState::Ready);
}

#[test]
fn test_mode_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, _) = two_step_acquisition(&dir);
    let config = AcquisitionConfig::default()
        .with_qdc_channels([0])
        .with_tot_channels([1]);
    let reader = RawReader::open(&prefix, config, ReaderOptions::default()).unwrap();
    assert!(reader.is_qdc(0));
    assert!(!reader.is_qdc(1));

    let config = AcquisitionConfig::default().with_qdc_channels([64]);
    assert!(matches!(
        RawReader::open(&prefix, config, ReaderOptions::default()),
        Err(Error::Raw(_))
    ));
}

#[test]
fn test_truncated_step() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("cut");
    let mut writer = AcquisitionWriter::create(&prefix, &header()).unwrap();
    writer.begin_step(0.0, 0.0);
    writer.write_frame(0, false, &pair()).unwrap();
    let cut_at = writer.offset();
    // Frame header announcing 4 events followed by a single event word.
    writer.write_raw(&1u64.to_le_bytes()).unwrap();
    writer.write_raw(&4u64.to_le_bytes()).unwrap();
    writer.write_raw(&event(0, 1, 1, 1).raw().to_le_bytes()).unwrap();
    writer.finish().unwrap();

    let mut reader = RawReader::open(&prefix, AcquisitionConfig::default(), small_buffers()).unwrap();
    reader.next_step().unwrap();
    let mut sink = CollectSink::<RawHit>::new();
    match reader.process_step(&mut sink) {
        Err(Error::Truncated {
            offset,
            needed,
            available,
        }) => {
            assert_eq!(offset, cut_at);
            assert_eq!(needed, 48);
            assert_eq!(available, 24);
        }
        other => panic!("expected truncation, got {other:?}"),
    }
    // Events read before the cut were still delivered.
    assert!(sink.is_finished());
    assert_eq!(sink.total_records(), 2);
}

#[test]
fn test_index_past_end_of_file() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, mut steps) = two_step_acquisition(&dir);
    steps[1].end += 8;
    overwrite_index(&prefix, &steps);

    let mut reader = RawReader::open_default(&prefix).unwrap();
    reader.next_step().unwrap();
    reader.process_step(&mut NullSink::default()).unwrap();
    reader.next_step().unwrap();
    assert!(matches!(
        reader.process_step(&mut NullSink::default()),
        Err(Error::Truncated { needed: 16, available: 0, .. })
    ));
}

#[test]
fn test_missing_index_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("noindex");
    let mut writer = AcquisitionWriter::create(&prefix, &header()).unwrap();
    for frame in 20..25 {
        writer.write_frame(frame, false, &pair()).unwrap();
    }
    writer.finish_without_index().unwrap();

    let mut reader = RawReader::open_default(&prefix).unwrap();
    assert!(reader.index_is_temp());
    assert_eq!(reader.steps().len(), 1);
    let step = reader.steps()[0];
    assert_eq!(step.begin, header().encoded_len());
    assert_eq!((step.first_frame, step.end_frame), (20, 25));
    assert_eq!(step.values(), (0.0, 0.0));

    let results = reader.process_all(|_| CollectSink::<RawHit>::new()).unwrap();
    assert_eq!(results.len(), 1);
    let (_, sink, report) = &results[0];
    assert_eq!(report.hits, 10);
    assert_eq!(sink.total_records(), 10);
}

#[test]
fn test_process_without_step() {
    let dir = tempfile::tempdir().unwrap();
    let (prefix, _) = two_step_acquisition(&dir);
    let mut reader = RawReader::open_default(&prefix).unwrap();
    assert!(matches!(
        reader.process_step(&mut NullSink::default()),
        Err(Error::NoActiveStep)
    ));

    reader.next_step().unwrap();
    reader.process_step(&mut NullSink::default()).unwrap();
    assert!(matches!(
        reader.process_step(&mut NullSink::default()),
        Err(Error::NoActiveStep)
    ));
}

#[test]
fn test_open_errors() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        RawReader::open_default(dir.path().join("absent")),
        Err(Error::Io(_))
    ));

    let prefix = dir.path().join("garbage");
    std::fs::write(dir.path().join("garbage.rawf"), b"not a data file at all").unwrap();
    assert!(matches!(
        RawReader::open_default(&prefix),
        Err(Error::InvalidFormat(_))
    ));

    let (prefix, _) = two_step_acquisition(&dir);
    std::fs::write(index_path(&prefix), "0\t100\t0\t4\t1\t1\n").unwrap();
    assert!(matches!(
        RawReader::open_default(&prefix),
        Err(Error::InvalidIndex { line: 1, .. })
    ));

    std::fs::write(index_path(&prefix), "64 oops\n").unwrap();
    assert!(matches!(
        RawReader::open_default(&prefix),
        Err(Error::InvalidIndex { .. })
    ));
}

/// Forwards buffers unchanged.
struct PassThrough;

impl UnorderedHandler<RawHit, RawHit> for PassThrough {
    fn handle_events(&self, input: EventBuffer<RawHit>) -> Option<EventBuffer<RawHit>> {
        Some(input)
    }
}

#[test]
fn test_step_into_parallel_stage() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("staged");
    let mut writer = AcquisitionWriter::create(&prefix, &header()).unwrap();
    writer.begin_step(0.0, 0.0);
    for frame in 0..2000 {
        writer.write_frame(frame, false, &[event(0, 3, 9, 0)]).unwrap();
    }
    writer.finish().unwrap();

    // The sink runs its own rayon work while the reader decodes; the
    // whole step must still complete.
    let (done_tx, done_rx) = channel();
    std::thread::spawn(move || {
        let options = ReaderOptions::default()
            .with_buffer_capacity(1)
            .with_queue_depth(1);
        let mut reader = RawReader::open(&prefix, AcquisitionConfig::default(), options).unwrap();
        reader.next_step().unwrap();
        let mut stage: UnorderedStage<RawHit, RawHit, PassThrough, CollectSink<RawHit>> =
            UnorderedStage::with_batch_size(0, PassThrough, CollectSink::new(), 2);
        let report = reader.process_step(&mut stage).unwrap();
        done_tx.send((report, stage.into_inner())).unwrap();
    });

    let (report, sink) = done_rx
        .recv_timeout(Duration::from_secs(120))
        .expect("step did not complete");
    assert_eq!(report.buffers, 2000);
    assert_eq!(report.hits, 2000);
    assert!(sink.is_finished());
    assert_eq!(sink.sequence(), (0..2000).collect::<Vec<u64>>());
    let frames: Vec<u64> = sink.records().iter().map(|hit| hit.frame_id).collect();
    assert_eq!(frames, (0..2000).collect::<Vec<u64>>());
}
