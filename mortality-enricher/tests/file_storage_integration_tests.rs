use std::fs;
use std::path::Path;

use bytes::Bytes;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use mortality_enricher::event::EnrichedRecord;
use mortality_enricher::ingest::memory::MemoryLog;
use mortality_enricher::sink::commit_log::{commit_file_name, data_file_name};
use mortality_enricher::sink::parquet::{decode_batch, encode_batch};
use mortality_enricher::sink::{CommitRecord, ParquetFileStorage};

mod common;
use common::{load_references, memory_pipeline, TOPIC};

fn read_parquet(path: &Path) -> Vec<EnrichedRecord> {
    decode_batch(Bytes::from(fs::read(path).unwrap())).unwrap()
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_restart_resumes_from_committed_cursor_on_disk() {
    let refs_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let references = load_references(refs_dir.path()).await;
    let root = out_dir.path().join(TOPIC).join("partition=0");

    let log = MemoryLog::new(TOPIC);
    log.append(0, "Jan-24,ER,A,Fraser Health,Burnaby Hospital,10");
    log.append(0, "Feb-24,ER,B,Interior Health,Kelowna General,3");
    log.close();

    let storage = ParquetFileStorage::new(&root, 10);
    let summary = memory_pipeline(&log, 0, storage.clone(), references.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.records_written, 2);

    let first = read_parquet(&storage.data_dir().join(data_file_name(1)));
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].total_count, 15);
    assert_eq!(first[1].total_count, 8);

    let record = CommitRecord::from_json_bytes(
        &fs::read(storage.commits_dir().join(commit_file_name(1))).unwrap(),
    )
    .unwrap();
    assert_eq!(record.topic, TOPIC);
    assert_eq!(record.record_count, 2);
    assert_eq!(record.cursor().next_offset(0), Some(2));

    // a fresh process over the same directory picks up where the last one stopped
    log.append(0, "Mar-24,ER,A,Fraser Health,Burnaby Hospital,6");
    let restarted = ParquetFileStorage::new(&root, 10);
    let summary = memory_pipeline(&log, 0, restarted, references)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.cursor.next_offset(0), Some(3));
    assert_eq!(
        file_names(&storage.data_dir()),
        vec![data_file_name(1), data_file_name(2)]
    );
    let second = read_parquet(&storage.data_dir().join(data_file_name(2)));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].count1, 6);
}

#[tokio::test]
async fn test_uncommitted_data_file_is_replaced_on_restart() {
    let refs_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let references = load_references(refs_dir.path()).await;

    let log = MemoryLog::new(TOPIC);
    log.append(0, "Jan-24,ER,A,Fraser Health,Burnaby Hospital,10");
    log.close();

    let storage = ParquetFileStorage::new(out_dir.path(), 10);

    // leftover of a process that died between the data write and its commit record
    fs::create_dir_all(storage.data_dir()).unwrap();
    let stale = encode_batch(&[]).unwrap();
    fs::write(storage.data_dir().join(data_file_name(1)), &stale).unwrap();
    fs::write(
        storage
            .data_dir()
            .join(format!("{}.tmp", data_file_name(2))),
        b"partial",
    )
    .unwrap();

    let summary = memory_pipeline(&log, 0, storage.clone(), references)
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.records_written, 1);

    assert_eq!(file_names(&storage.data_dir()), vec![data_file_name(1)]);
    let written = read_parquet(&storage.data_dir().join(data_file_name(1)));
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].total_count, 15);
    assert_eq!(
        file_names(&storage.commits_dir()),
        vec![commit_file_name(1)]
    );
}
