use super::{CommitId, DatumId, FileEntry, JobId, JobStats};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatumState {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for DatumState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatumState::Pending => "pending",
            DatumState::Success => "success",
            DatumState::Failed => "failed",
            DatumState::Skipped => "skipped",
        };
        s.fmt(f)
    }
}

/// One input file of a datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumFile {
    /// The name of the input this file was read through.
    pub input: String,
    pub repo: String,
    pub commit: CommitId,
    /// The path of the file within its repo.
    pub path: String,
    pub entry: FileEntry,
}

impl DatumFile {
    /// The path the datum id is computed over: the input name followed by the file's path.
    pub fn logical_path(&self) -> String {
        format!("{}{}", self.input, self.path)
    }
}

/// A unit of work: a set of input files that user code processes in isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub id: DatumId,
    pub files: Vec<DatumFile>,
}

impl Datum {
    /// Build an atom datum and hash its files.
    pub fn from_files(files: Vec<DatumFile>) -> Self {
        let paths: Vec<(String, _)> = files
            .iter()
            .map(|f| (f.logical_path(), f.entry.hash()))
            .collect();
        let id = DatumId::from_files(paths.iter().map(|(p, h)| (p.as_str(), h)));
        Self { id, files }
    }

    /// Combine datums into the datum of a cross product.
    pub fn cross(parts: &[&Datum]) -> Self {
        let id = DatumId::combine(parts.iter().map(|d| &d.id));
        let files = parts.iter().flat_map(|d| d.files.iter().cloned()).collect();
        Self { id, files }
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.entry.size()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumInfo {
    pub id: DatumId,
    pub job: JobId,
    /// Position of this datum in the job's plan.
    pub index: usize,
    pub state: DatumState,
    pub files: Vec<DatumFile>,
    pub stats: JobStats,
    /// How many attempts it took, zero for skipped datums.
    pub attempts: u32,
    pub error: Option<String>,
    /// What user code printed, only kept for pipelines with stats enabled.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl DatumInfo {
    pub fn pending(job: JobId, index: usize, datum: &Datum) -> Self {
        Self {
            id: datum.id.clone(),
            job,
            index,
            state: DatumState::Pending,
            files: datum.files.clone(),
            stats: JobStats::default(),
            attempts: 0,
            error: None,
            logs: vec![],
        }
    }
}
