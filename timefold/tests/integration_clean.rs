//! Integration tests for retention.
//!
//! A raw tree consumed by an aggregator and an archiver is cleaned only up
//! to what both have processed.

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use timefold::sink::{CopySink, UpdateRule};
use timefold::{
    AggregatorConfig, Archiver, ArchiverConfig, Cleaner, CleanerConfig, Fields, FixedClock,
    IntervalAggregator, JobsConfig, Record, TimeIndexedStore, WatermarkSource,
};

fn fill(store: &TimeIndexedStore, timestamps: impl IntoIterator<Item = i64>) {
    for timestamp in timestamps {
        let mut fields = Fields::new();
        fields.insert("temp".into(), json!(1));
        store.write_record(&Record::new(timestamp, fields)).unwrap();
    }
}

#[test]
fn test_clean_up_to_slowest_consumer() {
    let dir = tempdir().unwrap();
    let raw_root = dir.path().join("raw");
    let raw = TimeIndexedStore::open(&raw_root);
    fill(&raw, (101..=160).step_by(10));

    let aggregator_config: AggregatorConfig = serde_json::from_value(json!({
        "name": "ten",
        "source": &raw_root,
        "output": dir.path().join("agg"),
        "period": 10,
        "fields": [{"name": "temp", "type": "direct", "reducer": "sum"}]
    }))
    .unwrap();
    let archiver_config = ArchiverConfig {
        name: "backup".to_string(),
        source: raw_root.clone(),
        status: dir.path().join("status").join("backup"),
        max_files: 2,
        max_bytes: 0,
        extensions: Vec::new(),
        remove_source_after_archive: false,
    };
    let cleaner_config = CleanerConfig {
        name: "raw".to_string(),
        root: raw_root.clone(),
        consumers: vec![
            WatermarkSource::Aggregator {
                output: aggregator_config.output.clone(),
            },
            WatermarkSource::Archive {
                status: archiver_config.status.clone(),
            },
        ],
    };
    let cleaner = Cleaner::new(&cleaner_config).unwrap();

    // Nobody has progressed: nothing goes.
    let report = cleaner.run().unwrap();
    assert_eq!(report.watermark, None);
    assert_eq!(report.deleted, 0);

    IntervalAggregator::with_clock(aggregator_config, Arc::new(FixedClock::new(1_000)))
        .unwrap()
        .run()
        .unwrap();
    // Archiver still behind.
    assert_eq!(cleaner.run().unwrap().deleted, 0);

    let archiver = Archiver::new(archiver_config).unwrap();
    let mut sink = CopySink::new("copy", dir.path().join("copy"), UpdateRule::Overwrite);
    archiver.run(&mut sink).unwrap();

    // Archive cursor at 111, aggregator output ends at 140.
    let report = cleaner.run().unwrap();
    assert_eq!(report.watermark, Some(111));
    assert_eq!(report.deleted, 1);
    let left: Vec<i64> = raw.build_index(true).keys().copied().collect();
    assert_eq!(left, vec![111, 121, 131, 141, 151]);

    for _ in 0..3 {
        archiver.run(&mut sink).unwrap();
    }
    let report = cleaner.run().unwrap();
    assert_eq!(report.watermark, Some(140));
    let left: Vec<i64> = raw.build_index(true).keys().copied().collect();
    assert_eq!(left, vec![141, 151]);
}

#[test]
fn test_cleaner_from_job_file() {
    let dir = tempdir().unwrap();
    let jobs_path = dir.path().join("jobs.json");
    let jobs = json!({
        "cleaners": [{
            "name": "raw",
            "root": dir.path().join("raw"),
            "consumers": [{"kind": "persist", "status": dir.path().join("status")}]
        }]
    });
    std::fs::write(&jobs_path, jobs.to_string()).unwrap();

    let jobs = JobsConfig::load(&jobs_path).unwrap();
    let cleaner = Cleaner::new(&jobs.cleaners[0]).unwrap();
    assert_eq!(cleaner.name(), "raw");
    assert_eq!(cleaner.watermark(), None);
}
