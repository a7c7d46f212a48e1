use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Starting,
    Active,
    Complete,
    Error,
    Stopped,
}

impl JobState {
    /// Terminal states never transition again; they only wait for the sweep.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Error | JobState::Stopped)
    }
}

/// One tracked transfer. Inserted before the worker task spawns, mutated only
/// through [`JobTable`] methods afterwards.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub dest_dir: PathBuf,
    pub state: JobState,
    /// Final on-disk name once resolved. `None` until the worker knows it.
    pub file_name: Option<String>,
    /// Whether `file_name` came from an explicit hint. Unconfident guesses may
    /// still be overridden by the download response headers.
    pub name_confident: bool,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    /// Bytes per second over the current session, updated per chunk.
    pub speed_bps: u64,
    pub error_message: Option<String>,
    pub completed_at: Option<Instant>,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(
        id: Uuid,
        url: String,
        dest_dir: PathBuf,
        file_name: Option<String>,
        name_confident: bool,
    ) -> Self {
        Self {
            id,
            url,
            dest_dir,
            state: JobState::Starting,
            file_name,
            name_confident,
            total_bytes: None,
            downloaded_bytes: 0,
            speed_bps: 0,
            error_message: None,
            completed_at: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Final destination path, once the file name is known.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file_name.as_ref().map(|name| self.dest_dir.join(name))
    }

    /// In-progress sibling of [`Job::file_path`] with a `.part` suffix.
    pub fn part_path(&self) -> Option<PathBuf> {
        self.file_name
            .as_ref()
            .map(|name| self.dest_dir.join(format!("{name}.part")))
    }
}

/// Lock-guarded table of in-flight and recently finished jobs. All access goes
/// through here so the lock is held only for short map operations, never
/// across I/O.
pub struct JobTable {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// Transition a job, filling `completed_at` when the new state is terminal.
    /// Returns the updated record, or `None` if the job has been swept.
    pub fn set_state(
        &self,
        id: &Uuid,
        state: JobState,
        error_message: Option<String>,
    ) -> Option<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id)?;
        if state.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(Instant::now());
        }
        job.state = state;
        job.error_message = error_message;
        Some(job.clone())
    }

    /// Record byte counters from the worker. Counters never move backwards.
    pub fn record_progress(
        &self,
        id: &Uuid,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed_bps: u64,
    ) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(id) {
            Some(job) => {
                job.downloaded_bytes = job.downloaded_bytes.max(downloaded_bytes);
                if total_bytes.is_some() {
                    job.total_bytes = total_bytes;
                }
                job.speed_bps = speed_bps;
                true
            }
            None => false,
        }
    }

    pub fn set_file_name(&self, id: &Uuid, file_name: String) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(id) {
            job.file_name = Some(file_name);
        }
    }

    /// Remove terminal jobs older than `max_age` and return them so callers
    /// can clean up leftover partial files.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let expired: Vec<Uuid> = jobs
            .values()
            .filter(|job| {
                job.state.is_terminal()
                    && job
                        .completed_at
                        .map(|at| at.elapsed() >= max_age)
                        .unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        expired
            .iter()
            .filter_map(|id| jobs.remove(id))
            .collect()
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}
