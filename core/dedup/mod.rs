//! # Datum Dedup
//!
//! Remembers the output of every datum a pipeline processed successfully, keyed by datum id.
//! Since ids only depend on input content, a datum whose files come back unchanged in a later
//! commit is skipped and its recorded output reused.
//!
//! The cache is partitioned by a salt that pipelines carry. Updating a pipeline with
//! `reprocess` picks a new salt, which makes every datum miss.
//!
//! NOTE: ids only depend on content, so a file that is deleted and later re-added with the same
//! bytes is skipped, even though the commits in between did not have it.
//!

use crate::model::{DatumId, FileTree, JobId, JobStats};
use dashmap::DashMap;
use tracing::*;

/// What a successful datum left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumRecord {
    pub job: JobId,
    pub output: FileTree,
    pub stats: JobStats,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    pipeline: String,
    salt: String,
}

#[derive(Default, Debug)]
pub struct DedupCache {
    records: DashMap<CacheKey, DashMap<DatumId, DatumRecord>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(pipeline: &str, salt: &str) -> CacheKey {
        CacheKey {
            pipeline: pipeline.to_string(),
            salt: salt.to_string(),
        }
    }

    pub fn lookup(&self, pipeline: &str, salt: &str, datum: &DatumId) -> Option<DatumRecord> {
        self.records
            .get(&Self::key(pipeline, salt))
            .and_then(|records| records.get(datum).map(|r| r.clone()))
    }

    #[instrument(name = "DedupCache::record", skip(self, record))]
    pub fn record(&self, pipeline: &str, salt: &str, datum: DatumId, record: DatumRecord) {
        self.records
            .entry(Self::key(pipeline, salt))
            .or_default()
            .insert(datum, record);
    }

    /// Forget a datum under every salt, so the next job reprocesses it.
    pub fn evict(&self, pipeline: &str, datum: &DatumId) -> bool {
        let mut evicted = false;
        for records in self.records.iter() {
            if records.key().pipeline == pipeline && records.value().remove(datum).is_some() {
                evicted = true;
            }
        }
        evicted
    }

    /// Forget everything the pipeline recorded.
    pub fn forget_pipeline(&self, pipeline: &str) {
        self.records.retain(|key, _| key.pipeline != pipeline);
    }

    /// Drop records produced by jobs that no longer count, like jobs whose output commit was
    /// deleted.
    pub fn forget_jobs(&self, jobs: &[JobId]) {
        for records in self.records.iter() {
            records.value().retain(|_, record| !jobs.contains(&record.job));
        }
    }

    pub fn len(&self, pipeline: &str, salt: &str) -> usize {
        self.records
            .get(&Self::key(pipeline, salt))
            .map(|r| r.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, pipeline: &str, salt: &str) -> bool {
        self.len(pipeline, salt) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentHash;

    fn datum(content: &str) -> DatumId {
        DatumId::from_files([("in/file", &ContentHash::of(content.as_bytes()))])
    }

    fn record(job: JobId) -> DatumRecord {
        DatumRecord {
            job,
            output: FileTree::new(),
            stats: JobStats::default(),
        }
    }

    #[test]
    fn recorded_datums_are_found_under_the_same_salt() {
        let cache = DedupCache::new();
        let job = JobId::next();
        cache.record("p", "s1", datum("foo"), record(job));
        assert_eq!(cache.lookup("p", "s1", &datum("foo")).unwrap().job, job);
        assert!(cache.lookup("p", "s2", &datum("foo")).is_none());
        assert!(cache.lookup("q", "s1", &datum("foo")).is_none());
        assert!(cache.lookup("p", "s1", &datum("bar")).is_none());
    }

    #[test]
    fn eviction_forgets_a_datum_under_every_salt() {
        let cache = DedupCache::new();
        cache.record("p", "s1", datum("foo"), record(JobId::next()));
        cache.record("p", "s2", datum("foo"), record(JobId::next()));
        assert!(cache.evict("p", &datum("foo")));
        assert!(cache.is_empty("p", "s1"));
        assert!(cache.is_empty("p", "s2"));
        assert!(!cache.evict("p", &datum("foo")));
    }

    #[test]
    fn forgetting_a_job_drops_only_its_records() {
        let cache = DedupCache::new();
        let (a, b) = (JobId::next(), JobId::next());
        cache.record("p", "s", datum("foo"), record(a));
        cache.record("p", "s", datum("bar"), record(b));
        cache.forget_jobs(&[a]);
        assert_eq!(cache.len("p", "s"), 1);
        assert!(cache.lookup("p", "s", &datum("bar")).is_some());
    }
}
