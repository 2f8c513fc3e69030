mod common;

use chrono::{Local, TimeZone};
use pullscale::analysis::{derivatives, dominant_excursion};
use pullscale::{
    load_buffer, AttrValue, DriverError, HorizonPolicy, JsonFileStore, MetadataForm, Sample,
    SampleBuffer, SessionConfig, SessionMetadata, SessionRecorder, SessionStore, StreamDelay,
    StreamSession,
};

use common::FakeDevice;

fn metadata() -> SessionMetadata {
    let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
    let mut meta = SessionMetadata::new(at);
    meta.sample_interval_ms = 100;
    meta.attributes.insert("hold".into(), "20mm edge".into());
    meta
}

fn buffer() -> SampleBuffer {
    SampleBuffer::from_samples(
        HorizonPolicy::default(),
        [
            Sample::new(0, 0.0),
            Sample::new(100, 1.0),
            Sample::new(200, 5.0),
            Sample::new(300, 2.0),
        ],
    )
    .unwrap()
}

#[test]
fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");

    let mut store = JsonFileStore::open(&path).unwrap();
    let key = SessionRecorder::default()
        .persist(&buffer(), &metadata(), &mut store)
        .unwrap();
    assert_eq!(key.to_string(), "2024-03-09/14:05:07");
    drop(store);

    let store = JsonFileStore::open(&path).unwrap();
    assert_eq!(store.session_keys(), vec!["2024-03-09/14:05:07".to_string()]);
    let group = store.group("2024-03-09/14:05:07").unwrap();
    assert_eq!(
        group.attributes.get("hold"),
        Some(&AttrValue::Text("20mm edge".into()))
    );
    assert_eq!(
        group.attributes.get("sample_interval_ms"),
        Some(&AttrValue::Int(100))
    );

    let loaded = load_buffer(&store, &key.to_string(), HorizonPolicy::default()).unwrap();
    assert_eq!(loaded.samples(), buffer().samples());
    assert_eq!(loaded.value_bound(), 6.0);
}

#[test]
fn second_session_with_same_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");
    let recorder = SessionRecorder::default();

    let mut store = JsonFileStore::open(&path).unwrap();
    recorder.persist(&buffer(), &metadata(), &mut store).unwrap();

    let mut reopened = JsonFileStore::open(&path).unwrap();
    let err = recorder
        .persist(&buffer(), &metadata(), &mut reopened)
        .unwrap_err();
    assert!(matches!(err, DriverError::DuplicateSession(_)));
    assert_eq!(reopened.session_keys().len(), 1);
}

#[test]
fn missing_session_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path().join("none.json")).unwrap();
    assert!(store.session_keys().is_empty());
    assert!(matches!(
        load_buffer(&store, "2024-01-01/00:00:00", HorizonPolicy::default()),
        Err(DriverError::Store(_))
    ));
}

#[test]
fn corrupt_store_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, b"not json").unwrap();
    assert!(matches!(
        JsonFileStore::open(&path),
        Err(DriverError::Store(_))
    ));
}

#[test]
fn acquired_session_records_and_analyzes() {
    let dev = FakeDevice::new();
    dev.push_lines(&[
        b"0,0.0\n",
        b"100,1.0\n",
        b"200,5.0\n",
        b"300,2.0\n",
    ]);
    let mut session = StreamSession::new(
        dev.link(),
        SessionConfig::default(),
        HorizonPolicy::default(),
    )
    .with_attribute("subject", "alex");
    session.acquire(4, StreamDelay::from_millis(100)).unwrap();
    let finished = session.finish();

    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonFileStore::open(dir.path().join("s.json")).unwrap();
    let key = SessionRecorder::default()
        .persist_finished(&finished, &mut store)
        .unwrap();

    let loaded = load_buffer(&store, &key.to_string(), HorizonPolicy::default()).unwrap();
    let series = derivatives(&loaded);
    assert_eq!(series.first.len(), 3);
    assert_eq!(series.second.len(), 2);

    let ex = dominant_excursion(&series.first).unwrap();
    assert_eq!(ex.max_index, 1);
    assert_eq!(ex.min_index, 2);
    assert_eq!(ex.ordered_range(), Some(1..2));
}

#[test]
fn caller_cannot_shadow_tare_flag() {
    let dev = FakeDevice::new();
    dev.push_line(b"0,1.0\n");
    let mut link = dev.link();
    link.tare().unwrap();
    let mut session =
        StreamSession::new(link, SessionConfig::default(), HorizonPolicy::default())
            .with_attribute("tare_applied", "no");
    session.acquire(1, StreamDelay::from_millis(10)).unwrap();
    let mut finished = session.finish();

    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonFileStore::open(dir.path().join("s.json")).unwrap();
    let recorder = SessionRecorder::default();
    let err = recorder.persist_finished(&finished, &mut store).unwrap_err();
    assert!(matches!(err, DriverError::Store(_)));
    assert!(store.session_keys().is_empty());

    // renamed, the session records with the real flag
    finished.metadata.attributes.remove("tare_applied");
    finished.set_attribute("tare_note", "no");
    let key = recorder.persist_finished(&finished, &mut store).unwrap();
    let group = store.group(&key.to_string()).unwrap();
    assert_eq!(group.attributes.get("tare_applied"), Some(&AttrValue::Bool(true)));
    assert_eq!(
        group.attributes.get("tare_note"),
        Some(&AttrValue::Text("no".into()))
    );
}

#[test]
fn dataset_named_attribute_leaves_store_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.json");
    let recorder = SessionRecorder::new(MetadataForm::Datasets);

    let mut meta = metadata();
    meta.attributes.insert("value".into(), "peak".into());
    let mut store = JsonFileStore::open(&path).unwrap();
    assert!(matches!(
        recorder.persist(&buffer(), &meta, &mut store),
        Err(DriverError::Store(_))
    ));
    assert!(store.session_keys().is_empty());

    meta.attributes.remove("value");
    let key = recorder.persist(&buffer(), &meta, &mut store).unwrap();
    assert_eq!(store.session_keys(), vec![key.to_string()]);
}

#[test]
fn failed_flush_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("not-yet");
    let path = nested.join("s.json");
    let recorder = SessionRecorder::default();

    let mut store = JsonFileStore::open(&path).unwrap();
    let err = recorder
        .persist(&buffer(), &metadata(), &mut store)
        .unwrap_err();
    assert!(matches!(err, DriverError::Io(_)));
    assert!(store.session_keys().is_empty());

    std::fs::create_dir(&nested).unwrap();
    let key = recorder
        .persist(&buffer(), &metadata(), &mut store)
        .unwrap();
    assert!(path.exists());

    let reopened = JsonFileStore::open(&path).unwrap();
    assert_eq!(reopened.session_keys(), vec![key.to_string()]);
}
