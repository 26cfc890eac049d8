//! Throughput accounting for one sync run
//!
//! Counters are owned by the coordinating task and fed from the workers' stats channel, so no
//! synchronization is needed here.

#[derive(Debug)]
pub struct Progress {
    pub jobs_total: u64,
    pub jobs_synced: u64,
    pub bytes_synced: u64,
    pub jobs_skipped: u64,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new(jobs_total: usize) -> Self {
        Self {
            jobs_total: jobs_total as u64,
            jobs_synced: 0,
            bytes_synced: 0,
            jobs_skipped: 0,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

pub struct ProgressPrinter {
    last_synced: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl ProgressPrinter {
    pub fn new(progress: &Progress) -> Self {
        Self {
            last_synced: progress.jobs_synced,
            last_bytes: progress.bytes_synced,
            last_update: std::time::Instant::now(),
        }
    }

    /// One rate line; `queued` and `failed` are sampled by the caller
    pub fn print(&mut self, progress: &Progress, queued: usize, failed: usize) -> String {
        let time_now = std::time::Instant::now();
        let total_duration_secs = progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update)
            .as_secs_f64()
            .max(f64::EPSILON);
        let average_rate = progress.jobs_synced as f64 / total_duration_secs;
        let current_rate = (progress.jobs_synced - self.last_synced) as f64 / curr_duration_secs;
        let average_bytes_rate = progress.bytes_synced as f64 / total_duration_secs;
        let current_bytes_rate =
            (progress.bytes_synced - self.last_bytes) as f64 / curr_duration_secs;
        self.last_synced = progress.jobs_synced;
        self.last_bytes = progress.bytes_synced;
        self.last_update = time_now;
        format!(
            "synced {}/{} (queued: {}, skipped: {}, failed: {}) \
            average: {:.2} items/s {}/s, current: {:.2} items/s {}/s, total: {}",
            progress.jobs_synced,
            progress.jobs_total,
            queued,
            progress.jobs_skipped,
            failed,
            average_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            current_rate,
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(progress.bytes_synced),
        )
    }
}
