//! Three stage queues with per-stage concurrency caps.
//!
//! Each stage holds a priority-FIFO waiting list and an in-flight set. A
//! task id lives in at most one stage (waiting or in-flight) at any time;
//! `complete_*` moves a task to the next stage's waiting list atomically.
//! Every mutation publishes the per-stage counts on a watch channel.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;

use vconv_models::{Stage, Task};

/// Per-stage concurrency caps.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub download_slots: usize,
    pub convert_slots: usize,
    pub upload_slots: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_slots: 1,
            convert_slots: 1,
            upload_slots: 1,
        }
    }
}

/// Waiting and in-flight counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub waiting: usize,
    pub in_flight: usize,
}

/// Snapshot of all three stages, published after every mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub download: StageCounts,
    pub convert: StageCounts,
    pub upload: StageCounts,
}

#[derive(Debug)]
struct Queued {
    task: Task,
    seq: u64,
}

#[derive(Debug)]
struct Lane {
    waiting: Vec<Queued>,
    in_flight: HashSet<String>,
    slots: usize,
}

impl Lane {
    fn new(slots: usize) -> Self {
        Self {
            waiting: Vec::new(),
            in_flight: HashSet::new(),
            slots,
        }
    }

    fn contains(&self, task_id: &str) -> bool {
        self.in_flight.contains(task_id) || self.waiting.iter().any(|q| q.task.id == task_id)
    }

    fn counts(&self) -> StageCounts {
        StageCounts {
            waiting: self.waiting.len(),
            in_flight: self.in_flight.len(),
        }
    }

    /// Pop the highest-priority waiting task (FIFO within a priority) if a
    /// slot is free, moving it into the in-flight set.
    fn pop_next(&mut self) -> Option<Task> {
        if self.in_flight.len() >= self.slots || self.waiting.is_empty() {
            return None;
        }

        let best = self
            .waiting
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.task
                    .priority
                    .cmp(&b.task.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(index, _)| index)?;

        let queued = self.waiting.remove(best);
        self.in_flight.insert(queued.task.id.clone());
        Some(queued.task)
    }
}

#[derive(Debug)]
struct Inner {
    download: Lane,
    convert: Lane,
    upload: Lane,
    seq: u64,
}

impl Inner {
    fn lane_mut(&mut self, stage: Stage) -> &mut Lane {
        match stage {
            Stage::Download => &mut self.download,
            Stage::Convert => &mut self.convert,
            Stage::Upload => &mut self.upload,
        }
    }

    fn holds(&self, task_id: &str) -> bool {
        self.download.contains(task_id)
            || self.convert.contains(task_id)
            || self.upload.contains(task_id)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            download: self.download.counts(),
            convert: self.convert.counts(),
            upload: self.upload.counts(),
        }
    }
}

/// The multi-stage task queue.
#[derive(Debug)]
pub struct StageQueues {
    inner: Mutex<Inner>,
    events: watch::Sender<QueueStats>,
}

impl StageQueues {
    pub fn new(config: QueueConfig) -> Self {
        let inner = Inner {
            download: Lane::new(config.download_slots),
            convert: Lane::new(config.convert_slots),
            upload: Lane::new(config.upload_slots),
            seq: 0,
        };
        let (events, _) = watch::channel(inner.stats());
        Self {
            inner: Mutex::new(inner),
            events,
        }
    }

    /// Observe waiting/in-flight counts as they change.
    pub fn subscribe(&self) -> watch::Receiver<QueueStats> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }

    /// Insert into the download queue iff the task id is in no stage.
    /// Returns whether the task was accepted.
    pub fn add(&self, task: Task) -> bool {
        let mut inner = self.lock();
        if inner.holds(&task.id) {
            debug!(task_id = %task.id, "Task already queued, ignoring add");
            return false;
        }

        inner.seq += 1;
        let seq = inner.seq;
        inner.download.waiting.push(Queued { task, seq });
        self.publish(&inner);
        true
    }

    /// Spare acquisition capacity: the poll loop only fetches new work
    /// while the download stage has room for it.
    pub fn has_download_capacity(&self) -> bool {
        let inner = self.lock();
        inner.download.waiting.len() + inner.download.in_flight.len() < inner.download.slots
    }

    pub fn next_download(&self) -> Option<Task> {
        self.pop(Stage::Download)
    }

    pub fn next_convert(&self) -> Option<Task> {
        self.pop(Stage::Convert)
    }

    pub fn next_upload(&self) -> Option<Task> {
        self.pop(Stage::Upload)
    }

    fn pop(&self, stage: Stage) -> Option<Task> {
        let mut inner = self.lock();
        let task = inner.lane_mut(stage).pop_next();
        if task.is_some() {
            self.publish(&inner);
        }
        task
    }

    /// Atomically move a task out of download in-flight and onto the tail
    /// of the convert waiting list.
    pub fn complete_download(&self, task: Task) -> bool {
        self.advance(Stage::Download, Stage::Convert, task)
    }

    /// Atomically move a task out of convert in-flight and onto the tail
    /// of the upload waiting list.
    pub fn complete_convert(&self, task: Task) -> bool {
        self.advance(Stage::Convert, Stage::Upload, task)
    }

    fn advance(&self, from: Stage, to: Stage, task: Task) -> bool {
        let mut inner = self.lock();
        if !inner.lane_mut(from).in_flight.remove(&task.id) {
            debug!(task_id = %task.id, stage = %from, "Task not in-flight, ignoring completion");
            return false;
        }

        inner.seq += 1;
        let seq = inner.seq;
        inner.lane_mut(to).waiting.push(Queued { task, seq });
        self.publish(&inner);
        true
    }

    /// Remove a task from upload in-flight on terminal success.
    pub fn complete_upload(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.upload.in_flight.remove(task_id);
        if removed {
            self.publish(&inner);
        }
        removed
    }

    /// Remove a task from its stage's in-flight set on terminal failure.
    pub fn fail(&self, task_id: &str, stage: Stage) -> bool {
        let mut inner = self.lock();
        let removed = inner.lane_mut(stage).in_flight.remove(task_id);
        if removed {
            self.publish(&inner);
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("stage queues poisoned")
    }

    fn publish(&self, inner: &Inner) {
        let _ = self.events.send(inner.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: i64) -> Task {
        Task::new(id, format!("http://src/{}.mp4", id)).with_priority(priority)
    }

    fn queues() -> StageQueues {
        StageQueues::new(QueueConfig::default())
    }

    #[test]
    fn test_add_then_next_returns_the_task() {
        let q = queues();
        assert!(q.add(task("t1", 0)));
        let popped = q.next_download().unwrap();
        assert_eq!(popped.id, "t1");
    }

    #[test]
    fn test_duplicate_add_is_a_noop() {
        let q = queues();
        assert!(q.add(task("t1", 0)));
        assert!(!q.add(task("t1", 5)));

        let stats = q.stats();
        assert_eq!(stats.download.waiting, 1);

        // Still a no-op while in-flight.
        q.next_download().unwrap();
        assert!(!q.add(task("t1", 0)));
    }

    #[test]
    fn test_priority_wins_then_fifo() {
        let q = queues();
        q.add(task("lo", 0));
        q.add(task("hi", 100));
        q.add(task("lo2", 0));

        assert_eq!(q.next_download().unwrap().id, "hi");
        let t = q.next_download();
        assert!(t.is_none(), "cap of one blocks the second pop");

        let hi = task("hi", 100);
        q.complete_download(hi);
        assert_eq!(q.next_download().unwrap().id, "lo");
    }

    #[test]
    fn test_capacity_cap_is_enforced() {
        let q = StageQueues::new(QueueConfig {
            download_slots: 2,
            ..Default::default()
        });
        q.add(task("a", 0));
        q.add(task("b", 0));
        q.add(task("c", 0));

        assert!(q.next_download().is_some());
        assert!(q.next_download().is_some());
        assert!(q.next_download().is_none());
        assert_eq!(q.stats().download.in_flight, 2);
    }

    #[test]
    fn test_complete_download_moves_to_convert_tail() {
        let q = queues();
        q.add(task("t1", 0));
        let t = q.next_download().unwrap();

        assert!(q.complete_download(t));

        let stats = q.stats();
        assert_eq!(stats.download.in_flight, 0);
        assert_eq!(stats.convert.waiting, 1);
        assert_eq!(q.next_convert().unwrap().id, "t1");
    }

    #[test]
    fn test_task_in_one_stage_at_a_time() {
        let q = queues();
        q.add(task("t1", 0));
        let t = q.next_download().unwrap();
        q.complete_download(t);

        // Moved to convert; re-adding must be rejected.
        assert!(!q.add(task("t1", 0)));
        let t = q.next_convert().unwrap();
        q.complete_convert(t);
        assert!(!q.add(task("t1", 0)));

        let stats = q.stats();
        assert_eq!(stats.download.waiting + stats.download.in_flight, 0);
        assert_eq!(stats.convert.waiting + stats.convert.in_flight, 0);
        assert_eq!(stats.upload.waiting, 1);
    }

    #[test]
    fn test_terminal_removal_frees_the_queue() {
        let q = queues();
        q.add(task("t1", 0));
        let t = q.next_download().unwrap();
        q.complete_download(t);
        let t = q.next_convert().unwrap();
        q.complete_convert(t);
        q.next_upload().unwrap();

        assert!(q.complete_upload("t1"));

        let stats = q.stats();
        assert_eq!(stats, QueueStats::default());
        // A finished task can be resubmitted only by an explicit add.
        assert!(q.add(task("t2", 0)));
    }

    #[test]
    fn test_fail_removes_from_stage_in_flight() {
        let q = queues();
        q.add(task("t1", 0));
        q.next_download().unwrap();

        assert!(q.fail("t1", Stage::Download));
        assert_eq!(q.stats().download.in_flight, 0);
        assert!(!q.fail("t1", Stage::Download));
    }

    #[test]
    fn test_acquisition_capacity_counts_waiting_and_in_flight() {
        let q = queues();
        assert!(q.has_download_capacity());
        q.add(task("t1", 0));
        assert!(!q.has_download_capacity());
        q.next_download().unwrap();
        assert!(!q.has_download_capacity());
        q.fail("t1", Stage::Download);
        assert!(q.has_download_capacity());
    }

    #[test]
    fn test_updated_event_carries_counts() {
        let q = queues();
        let rx = q.subscribe();
        q.add(task("t1", 0));
        assert_eq!(rx.borrow().download.waiting, 1);
        q.next_download().unwrap();
        assert_eq!(rx.borrow().download.in_flight, 1);
    }
}
