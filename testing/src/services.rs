//! Mock blob store, task scheduler and notifier.

use crate::mocks::epoch;
use maprelay_core::providers::{
    BlobStore, EventKind, EventNotifier, Notification, ObjectLocation, ObjectMetadata,
    PresignedUpload, TaskHandle, TaskRequest, TaskScheduler,
};
use maprelay_core::{RelayError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct BlobState {
    objects: HashMap<ObjectLocation, ObjectMetadata>,
    presigned: Vec<(ObjectLocation, BTreeMap<String, String>)>,
    failing_calls: usize,
}

/// Blob store that signs fake URLs and serves injected objects.
///
/// Expiry times are computed from [`epoch`](crate::mocks::epoch).
#[derive(Debug, Clone, Default)]
pub struct MockBlobStore {
    state: Arc<Mutex<BlobState>>,
}

impl MockBlobStore {
    /// Create an empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an object was uploaded.
    pub fn put_object(&self, location: ObjectLocation, metadata: ObjectMetadata) {
        lock(&self.state).objects.insert(location, metadata);
    }

    /// Fail the next `n` calls.
    pub fn fail_next_calls(&self, n: usize) {
        lock(&self.state).failing_calls = n;
    }

    /// Every upload presigned so far, with its metadata.
    #[must_use]
    pub fn presigned(&self) -> Vec<(ObjectLocation, BTreeMap<String, String>)> {
        lock(&self.state).presigned.clone()
    }

    fn injected_failure(state: &mut BlobState) -> Result<()> {
        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(RelayError::dependency("blob-store", "injected failure"));
        }
        Ok(())
    }
}

impl BlobStore for MockBlobStore {
    async fn presign_upload(
        &self,
        location: &ObjectLocation,
        metadata: &BTreeMap<String, String>,
        expires_in: Duration,
    ) -> Result<PresignedUpload> {
        let mut state = lock(&self.state);
        Self::injected_failure(&mut state)?;
        state.presigned.push((location.clone(), metadata.clone()));

        let expires_at = chrono::Duration::from_std(expires_in)
            .ok()
            .and_then(|delta| epoch().checked_add_signed(delta))
            .unwrap_or_else(epoch);
        Ok(PresignedUpload {
            url: format!(
                "https://{}.blob.test/{}?expires={}",
                location.bucket,
                location.key,
                expires_in.as_secs()
            ),
            location: location.clone(),
            expires_at,
        })
    }

    async fn head_object(&self, location: &ObjectLocation) -> Result<Option<ObjectMetadata>> {
        let mut state = lock(&self.state);
        Self::injected_failure(&mut state)?;
        Ok(state.objects.get(location).cloned())
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    requests: Vec<TaskRequest>,
    failing_calls: usize,
    always_fail: bool,
    yield_before_launch: bool,
}

/// Scheduler that records launches and hands out sequential task ids.
#[derive(Debug, Clone, Default)]
pub struct MockScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl MockScheduler {
    /// Create a scheduler that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` launches.
    pub fn fail_next_calls(&self, n: usize) {
        lock(&self.state).failing_calls = n;
    }

    /// Fail every launch until turned off.
    pub fn set_always_fail(&self, always_fail: bool) {
        lock(&self.state).always_fail = always_fail;
    }

    /// Yield to the runtime before each launch so concurrent callers interleave.
    pub fn set_yield_before_launch(&self, yield_before_launch: bool) {
        lock(&self.state).yield_before_launch = yield_before_launch;
    }

    /// Successful launches so far.
    #[must_use]
    pub fn requests(&self) -> Vec<TaskRequest> {
        lock(&self.state).requests.clone()
    }
}

impl TaskScheduler for MockScheduler {
    async fn run_task(&self, request: &TaskRequest) -> Result<TaskHandle> {
        let yield_first = lock(&self.state).yield_before_launch;
        if yield_first {
            tokio::task::yield_now().await;
        }
        let mut state = lock(&self.state);
        if state.always_fail {
            return Err(RelayError::dependency("task-scheduler", "no capacity"));
        }
        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(RelayError::dependency("task-scheduler", "injected failure"));
        }
        state.requests.push(request.clone());
        Ok(TaskHandle {
            task_id: format!("task-{}", state.requests.len()),
        })
    }
}

/// Notifier that keeps every notification for assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received, in order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }

    /// Event kinds received, in order.
    #[must_use]
    pub fn events(&self) -> Vec<EventKind> {
        lock(&self.notifications).iter().map(|n| n.event).collect()
    }
}

impl EventNotifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        lock(&self.notifications).push(notification);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request() -> TaskRequest {
        TaskRequest {
            job_id: "JobId-1".into(),
            map_id: "map_1".into(),
            map_name: "1_123456.zip".into(),
            input: ObjectLocation::new("in", "input/JobId-1/1_123456.zip"),
            output_bucket: "out".into(),
            maps_table: "maps".into(),
            jobs_table: "jobs".into(),
        }
    }

    #[tokio::test]
    async fn scheduler_assigns_sequential_ids_and_fails_on_demand() {
        let scheduler = MockScheduler::new();
        assert_eq!(scheduler.run_task(&request()).await.unwrap().task_id, "task-1");

        scheduler.fail_next_calls(1);
        assert!(scheduler.run_task(&request()).await.is_err());
        assert_eq!(scheduler.run_task(&request()).await.unwrap().task_id, "task-2");
        assert_eq!(scheduler.requests().len(), 2);
    }

    #[tokio::test]
    async fn presign_records_location_and_metadata() {
        let blobs = MockBlobStore::new();
        let location = ObjectLocation::new("in", "input/JobId-1/a.zip");
        let metadata = BTreeMap::from([("jobId".to_string(), "JobId-1".to_string())]);
        let upload = blobs
            .presign_upload(&location, &metadata, Duration::from_secs(900))
            .await
            .unwrap();

        assert!(upload.url.starts_with("https://in.blob.test/input/JobId-1/a.zip"));
        assert_eq!(upload.expires_at, epoch() + chrono::Duration::seconds(900));
        assert_eq!(blobs.presigned(), vec![(location, metadata)]);
    }
}
