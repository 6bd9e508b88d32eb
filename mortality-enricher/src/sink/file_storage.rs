use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::event::EnrichedRecord;
use crate::metrics_consts::SINK_ORPHANS_REMOVED;
use crate::sink::commit_log::{
    commit_file_name, data_file_name, parse_commit_file_name, parse_data_file_name, CommitRecord,
    COMMITS_DIR, DATA_DIR, TMP_SUFFIX,
};
use crate::sink::parquet::encode_batch;
use crate::sink::storage::{BatchStorage, CommitRequest, RestoredState, StorageError};

/// Parquet files plus JSON commit records in a local directory.
///
/// Layout under `root`:
///
/// ```text
/// data/part-<sequence>.parquet
/// commits/<sequence>.json
/// ```
///
/// A batch is committed once its commit record has been renamed into place.
/// Data files without a commit record are leftovers of a crash and are
/// removed by [`BatchStorage::restore`].
#[derive(Debug, Clone)]
pub struct ParquetFileStorage {
    root: PathBuf,
    max_commit_records: usize,
}

impl ParquetFileStorage {
    pub fn new(root: impl Into<PathBuf>, max_commit_records: usize) -> Self {
        Self {
            root: root.into(),
            max_commit_records: max_commit_records.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn commits_dir(&self) -> PathBuf {
        self.root.join(COMMITS_DIR)
    }

    fn restore_blocking(&self, topic: &str) -> Result<Option<RestoredState>, StorageError> {
        let data_dir = self.data_dir();
        let commits_dir = self.commits_dir();
        create_dir(&data_dir)?;
        create_dir(&commits_dir)?;

        let mut commit_sequences = Vec::new();
        for name in list_dir(&commits_dir)? {
            if name.ends_with(TMP_SUFFIX) {
                remove_file(&commits_dir.join(&name))?;
            } else if let Some(sequence) = parse_commit_file_name(&name) {
                commit_sequences.push(sequence);
            }
        }

        let restored = match commit_sequences.iter().max() {
            Some(&sequence) => {
                let path = commits_dir.join(commit_file_name(sequence));
                let bytes = fs::read(&path)
                    .map_err(|e| StorageError::from_io(format!("reading {}", path.display()), e))?;
                let record = CommitRecord::from_json_bytes(&bytes).map_err(|source| {
                    StorageError::CorruptCommitRecord {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                if record.topic != topic {
                    return Err(StorageError::TopicMismatch {
                        expected: topic.to_string(),
                        found: record.topic,
                    });
                }
                Some(RestoredState {
                    sequence: record.sequence,
                    cursor: record.cursor(),
                })
            }
            None => None,
        };

        let committed = restored.as_ref().map_or(0, |r| r.sequence);
        let mut orphans = 0u64;
        for name in list_dir(&data_dir)? {
            let is_orphan = name.ends_with(TMP_SUFFIX)
                || parse_data_file_name(&name).is_some_and(|sequence| sequence > committed);
            if is_orphan {
                warn!(
                    path = %data_dir.join(&name).display(),
                    committed_sequence = committed,
                    "Removing uncommitted output file"
                );
                remove_file(&data_dir.join(&name))?;
                orphans += 1;
            }
        }
        if orphans > 0 {
            sync_dir(&data_dir)?;
            metrics::counter!(SINK_ORPHANS_REMOVED).increment(orphans);
        }

        match &restored {
            Some(state) => info!(
                root = %self.root.display(),
                sequence = state.sequence,
                offsets = ?state.cursor.offsets(),
                "Restored sink from commit record"
            ),
            None => info!(root = %self.root.display(), "No commit record found, starting fresh"),
        }
        Ok(restored)
    }

    fn commit_blocking(
        &self,
        sequence: u64,
        records: &[EnrichedRecord],
        record: CommitRecord,
    ) -> Result<(), StorageError> {
        let data_dir = self.data_dir();
        let commits_dir = self.commits_dir();
        create_dir(&data_dir)?;
        create_dir(&commits_dir)?;

        let bytes = encode_batch(records)?;
        write_atomic(&data_dir.join(data_file_name(sequence)), &bytes)?;
        sync_dir(&data_dir)?;

        let json = record
            .to_json()
            .map_err(|e| StorageError::Schema(format!("{e:#}")))?;
        write_atomic(&commits_dir.join(commit_file_name(sequence)), &json)?;
        sync_dir(&commits_dir)?;

        debug!(
            sequence = sequence,
            records = records.len(),
            "Committed batch to parquet storage"
        );
        self.prune_commit_records(&commits_dir)
    }

    fn prune_commit_records(&self, commits_dir: &Path) -> Result<(), StorageError> {
        let mut sequences: Vec<u64> = list_dir(commits_dir)?
            .iter()
            .filter_map(|name| parse_commit_file_name(name))
            .collect();
        if sequences.len() <= self.max_commit_records {
            return Ok(());
        }

        sequences.sort_unstable();
        let excess = sequences.len() - self.max_commit_records;
        for sequence in &sequences[..excess] {
            remove_file(&commits_dir.join(commit_file_name(*sequence)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchStorage for ParquetFileStorage {
    async fn restore(&mut self, topic: &str) -> Result<Option<RestoredState>, StorageError> {
        let storage = self.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || storage.restore_blocking(&topic))
            .await
            .map_err(|e| StorageError::Fatal {
                context: "restore task failed".to_string(),
                source: e.into(),
            })?
    }

    async fn commit(&mut self, request: CommitRequest<'_>) -> Result<(), StorageError> {
        let storage = self.clone();
        let sequence = request.sequence;
        let records = request.records.to_vec();
        let record = CommitRecord::new(
            sequence,
            request.cursor,
            vec![format!("{DATA_DIR}/{}", data_file_name(sequence))],
            records.len(),
        );
        tokio::task::spawn_blocking(move || storage.commit_blocking(sequence, &records, record))
            .await
            .map_err(|e| StorageError::Fatal {
                context: "commit task failed".to_string(),
                source: e.into(),
            })?
    }
}

// Write to a sibling temp file, fsync, then rename over the final name.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);

    let context = || format!("writing {}", tmp_path.display());
    let mut file = File::create(&tmp_path).map_err(|e| StorageError::from_io(context(), e))?;
    file.write_all(bytes)
        .map_err(|e| StorageError::from_io(context(), e))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(context(), e))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .map_err(|e| StorageError::from_io(format!("renaming into {}", path.display()), e))
}

fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::from_io(format!("syncing {}", dir.display()), e))
}

fn create_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir)
        .map_err(|e| StorageError::from_io(format!("creating {}", dir.display()), e))
}

fn remove_file(path: &Path) -> Result<(), StorageError> {
    fs::remove_file(path)
        .map_err(|e| StorageError::from_io(format!("removing {}", path.display()), e))
}

fn list_dir(dir: &Path) -> Result<Vec<String>, StorageError> {
    let context = || format!("listing {}", dir.display());
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StorageError::from_io(context(), e))? {
        let entry = entry.map_err(|e| StorageError::from_io(context(), e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cursor::Cursor;
    use crate::date::NormalizedDate;
    use crate::sink::parquet::decode_batch;

    const TOPIC: &str = "hospital_trends";

    fn record(count1: i64) -> EnrichedRecord {
        EnrichedRecord {
            date: NormalizedDate::new(2024, 1).unwrap(),
            setting: "ER".to_string(),
            category: "A".to_string(),
            system: "S".to_string(),
            facility_name: "F".to_string(),
            count1,
            count2: None,
            count3: None,
            total_count: count1,
        }
    }

    fn cursor(next: i64) -> Cursor {
        Cursor::with_offsets(TOPIC, [(0, next)].into_iter().collect())
    }

    async fn commit(storage: &mut ParquetFileStorage, sequence: u64, records: &[EnrichedRecord], next: i64) {
        storage
            .commit(CommitRequest {
                sequence,
                records,
                cursor: &cursor(next),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_directory_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = ParquetFileStorage::new(dir.path(), 10);
        assert_eq!(storage.restore(TOPIC).await.unwrap(), None);
        assert!(storage.data_dir().is_dir());
        assert!(storage.commits_dir().is_dir());
    }

    #[tokio::test]
    async fn test_commit_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = ParquetFileStorage::new(dir.path(), 10);
        storage.restore(TOPIC).await.unwrap();

        commit(&mut storage, 1, &[record(1), record(2)], 2).await;
        commit(&mut storage, 2, &[record(3)], 3).await;

        let restored = ParquetFileStorage::new(dir.path(), 10)
            .restore(TOPIC)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.sequence, 2);
        assert_eq!(restored.cursor, cursor(3));

        let bytes = fs::read(storage.data_dir().join(data_file_name(1))).unwrap();
        assert_eq!(decode_batch(Bytes::from(bytes)).unwrap(), vec![record(1), record(2)]);
    }

    #[tokio::test]
    async fn test_restore_removes_uncommitted_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = ParquetFileStorage::new(dir.path(), 10);
        storage.restore(TOPIC).await.unwrap();
        commit(&mut storage, 1, &[record(1)], 1).await;

        // a crash between the data write and the commit record of batch 2
        let orphan = storage.data_dir().join(data_file_name(2));
        fs::write(&orphan, encode_batch(&[record(2)]).unwrap()).unwrap();
        let partial = storage.commits_dir().join(format!("{}{TMP_SUFFIX}", commit_file_name(2)));
        fs::write(&partial, b"{\"sequ").unwrap();

        let restored = storage.restore(TOPIC).await.unwrap().unwrap();
        assert_eq!(restored.sequence, 1);
        assert!(!orphan.exists());
        assert!(!partial.exists());
        assert!(storage.data_dir().join(data_file_name(1)).exists());
    }

    #[tokio::test]
    async fn test_commit_records_are_pruned_but_data_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = ParquetFileStorage::new(dir.path(), 2);
        storage.restore(TOPIC).await.unwrap();
        for sequence in 1..=4 {
            commit(&mut storage, sequence, &[record(1)], i64::try_from(sequence).unwrap()).await;
        }

        let mut commits = list_dir(&storage.commits_dir()).unwrap();
        commits.sort();
        assert_eq!(commits, vec![commit_file_name(3), commit_file_name(4)]);
        assert_eq!(list_dir(&storage.data_dir()).unwrap().len(), 4);

        let restored = storage.restore(TOPIC).await.unwrap().unwrap();
        assert_eq!(restored.sequence, 4);
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_topic_and_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = ParquetFileStorage::new(dir.path(), 10);
        storage.restore(TOPIC).await.unwrap();
        commit(&mut storage, 1, &[record(1)], 1).await;

        let err = storage.restore("other_topic").await.unwrap_err();
        assert_eq!(err.error_type(), "topic_mismatch");

        fs::write(storage.commits_dir().join(commit_file_name(2)), b"not json").unwrap();
        let err = storage.restore(TOPIC).await.unwrap_err();
        assert_eq!(err.error_type(), "corrupt_commit_record");
    }
}
