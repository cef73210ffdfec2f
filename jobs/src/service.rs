//! Job/Map orchestration.
//!
//! Every status write is a conditional update on the status the service just
//! read, so two callbacks racing on the same Map cannot both apply. Job status
//! is never written: [`JobService::job_view`] derives it from the Maps.

use crate::config::JobsConfig;
use crate::dedup::{self, Deduplicator};
use crate::environment::JobEnvironment;
use crate::filename::{self, MapFileName};
use crate::lifecycle::{JobStatus, MapStatus, StatusCounts};
use crate::records::{JobRecord, MapRecord, MapSource, truncate_error};
use maprelay_core::item::{Condition, Item, Key, attr, from_item, to_item};
use maprelay_core::providers::{
    BlobStore, EventKind, EventNotifier, KeyValueStore, Notification, ObjectLocation,
    PresignedUpload, TaskRequest, TaskScheduler,
};
use maprelay_core::{ContentHash, JobId, MapId, MapKey, RelayError, Result};
use maprelay_runtime::breakers::Dependency;
use maprelay_runtime::metrics::names;
use maprelay_runtime::retry::RetryPolicy;
use maprelay_store::{BatchExecutor, BatchOutcome, ProtectedStore};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// One file of a batch submission.
///
/// The archive itself goes straight to the blob store; only its name, digest
/// and size pass through here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedFile {
    /// Client file name, sanitized before use
    pub file_name: String,
    /// SHA-256 of the archive
    pub content_hash: ContentHash,
    /// Archive size
    pub size_bytes: u64,
}

impl SubmittedFile {
    /// Describe a file from its bytes.
    #[must_use]
    pub fn from_bytes(file_name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            content_hash: ContentHash::of(bytes),
            size_bytes: bytes.len() as u64,
        }
    }
}

/// A file that became a Map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedMap {
    /// Content-derived id
    pub map_id: MapId,
    /// Sanitized name
    pub map_name: String,
    /// Parsed sheet number
    pub sheet_number: String,
    /// Where the client uploads the archive
    pub upload: PresignedUpload,
}

/// A file that was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedFile {
    /// Name as submitted
    pub file_name: String,
    /// Why
    pub reason: String,
    /// Id of the existing Map, for duplicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_id: Option<MapId>,
}

/// Result of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Job grouping the accepted Maps
    pub job_id: JobId,
    /// New Maps, each with an upload target
    pub accepted: Vec<AcceptedMap>,
    /// Files that did not become Maps
    pub rejected: Vec<RejectedFile>,
}

/// A Job with its Maps and derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    /// Job metadata
    pub job: JobRecord,
    /// Derived from `maps`
    pub status: JobStatus,
    /// Maps per status
    pub counts: StatusCounts,
    /// Maps, ordered by name
    pub maps: Vec<MapRecord>,
}

/// Outcome of dispatching one Map of a Job.
pub type DispatchOutcome = (MapKey, Result<MapRecord>);

/// Job/Map state machine over the protected dependencies.
#[derive(Clone)]
pub struct JobService<S, B, T, N> {
    env: JobEnvironment<S, B, T, N>,
    config: JobsConfig,
    batch: BatchExecutor<ProtectedStore<S>>,
}

impl<S, B, T, N> std::fmt::Debug for JobService<S, B, T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, B, T, N> JobService<S, B, T, N>
where
    S: KeyValueStore + Clone,
    B: BlobStore,
    T: TaskScheduler,
    N: EventNotifier,
{
    /// Build the service; batch writes retry `config.batch_max_retries` times.
    pub fn new(env: JobEnvironment<S, B, T, N>, config: JobsConfig) -> Self {
        let policy = RetryPolicy::default().with_max_retries(config.batch_max_retries);
        Self::with_batch_policy(env, config, policy)
    }

    /// Build the service with an explicit batch retry policy.
    pub fn with_batch_policy(
        env: JobEnvironment<S, B, T, N>,
        config: JobsConfig,
        policy: RetryPolicy,
    ) -> Self {
        let batch = BatchExecutor::with_policy(env.store.clone(), policy);
        Self { env, config, batch }
    }

    /// Active configuration.
    pub const fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Injected dependencies.
    pub const fn environment(&self) -> &JobEnvironment<S, B, T, N> {
        &self.env
    }

    // ═══════════════════════════════════════════════════════════
    // Submission
    // ═══════════════════════════════════════════════════════════

    /// Create one Job and one QUEUED Map per acceptable file.
    ///
    /// Invalid names, empty or oversized files and duplicates are reported in
    /// [`SubmitResponse::rejected`]; the rest get presigned upload targets. If
    /// nothing is acceptable no records are written.
    ///
    /// # Errors
    ///
    /// - `RelayError::Validation` for an empty or oversized submission
    /// - `RelayError::Unavailable` if a dependency's breaker is open
    /// - `RelayError::Dependency` if a dependency fails or records could not be written
    pub async fn submit_batch(&self, owner_id: &str, files: Vec<SubmittedFile>) -> Result<SubmitResponse> {
        if files.is_empty() {
            return Err(RelayError::Validation("submission contains no files".into()));
        }
        if files.len() > self.config.max_files_per_job {
            return Err(RelayError::Validation(format!(
                "submission contains {} files, at most {} are allowed",
                files.len(),
                self.config.max_files_per_job
            )));
        }

        let job_id = JobId::generate();
        let mut dedup = Deduplicator::new(&self.env.store, &self.config.maps_table);
        let mut candidates = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();

        for file in files {
            match self.screen(&mut dedup, &file).await {
                Ok((name, key)) => candidates.push((file, name, key)),
                Err(err) if err.is_user_error() => {
                    tracing::info!(job_id = %job_id, file = %file.file_name, reason = %err, "File rejected");
                    let map_id = match &err {
                        RelayError::Duplicate { map_id, .. } => Some(MapId::new(map_id.clone())),
                        _ => None,
                    };
                    rejected.push(RejectedFile {
                        file_name: file.file_name,
                        reason: err.to_string(),
                        map_id,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        if candidates.is_empty() {
            tracing::warn!(job_id = %job_id, rejected = rejected.len(), "No files accepted, nothing written");
            return Ok(SubmitResponse {
                job_id,
                accepted: Vec::new(),
                rejected,
            });
        }

        let now = self.env.clock.now();
        let batch_size = candidates.len();
        let mut accepted = Vec::with_capacity(batch_size);
        let mut writes = Vec::with_capacity(batch_size + 1);

        let job = JobRecord {
            job_id: job_id.clone(),
            submitted_by: owner_id.to_string(),
            created_at: now,
            batch_size,
            map_source: MapSource::UserUpload,
        };
        writes.push((self.config.jobs_table.clone(), to_item(&job)?));

        for (file, name, key) in candidates {
            let upload = self
                .presign(&job_id, owner_id, &key, batch_size)
                .await?;
            let record = MapRecord {
                map_id: key.map_id.clone(),
                map_name: name.name.clone(),
                job_id: job_id.clone(),
                owner_id: owner_id.to_string(),
                content_hash: file.content_hash.to_string(),
                size_bytes: file.size_bytes,
                sheet_number: name.sheet_number.clone(),
                status: MapStatus::Queued,
                retry_count: 0,
                created_at: now,
                updated_at: now,
                task_id: None,
                task_started_at: None,
                task_stopped_at: None,
                processed_at: None,
                error_message: None,
                output: None,
            };
            writes.push((self.config.maps_table.clone(), record.to_item()?));
            accepted.push(AcceptedMap {
                map_id: key.map_id,
                map_name: name.name,
                sheet_number: name.sheet_number,
                upload,
            });
        }

        let total = writes.len();
        let outcome = self.batch.batch_write(writes).await?;
        if !outcome.is_complete() {
            tracing::error!(
                job_id = %job_id,
                failed = outcome.failed,
                total,
                "Submission records were not fully written"
            );
            return Err(RelayError::dependency(
                Dependency::KeyValueStore.as_str(),
                format!("{} of {total} submission records were not written", outcome.failed),
            ));
        }

        metrics::counter!(names::MAP_TRANSITIONS, "to" => MapStatus::Queued.as_str())
            .increment(accepted.len() as u64);
        tracing::info!(
            job_id = %job_id,
            owner_id,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "Job submitted"
        );

        Ok(SubmitResponse {
            job_id,
            accepted,
            rejected,
        })
    }

    /// Validate one file and claim its identity.
    async fn screen(
        &self,
        dedup: &mut Deduplicator<'_, ProtectedStore<S>>,
        file: &SubmittedFile,
    ) -> Result<(MapFileName, MapKey)> {
        let name = filename::validate(&file.file_name)?;
        if file.size_bytes == 0 {
            return Err(RelayError::Validation(format!("'{}' is empty", name.name)));
        }
        if file.size_bytes > self.config.max_file_bytes {
            return Err(RelayError::Validation(format!(
                "'{}' is {} bytes, the limit is {}",
                name.name, file.size_bytes, self.config.max_file_bytes
            )));
        }
        let key = dedup::map_key(&file.content_hash, &name.name);
        dedup.claim(&key).await?;
        Ok((name, key))
    }

    async fn presign(
        &self,
        job_id: &JobId,
        owner_id: &str,
        key: &MapKey,
        batch_size: usize,
    ) -> Result<PresignedUpload> {
        let location = self.input_location(job_id, &key.map_name);
        let metadata = BTreeMap::from([
            ("jobId".to_string(), job_id.to_string()),
            ("mapId".to_string(), key.map_id.to_string()),
            ("submittedBy".to_string(), owner_id.to_string()),
            ("batchSize".to_string(), batch_size.to_string()),
        ]);
        self.env
            .blobs
            .presign_upload(&location, &metadata, self.config.upload_url_ttl)
            .await
    }

    fn input_location(&self, job_id: &JobId, map_name: &str) -> ObjectLocation {
        ObjectLocation::new(
            self.config.input_bucket.clone(),
            format!("input/{job_id}/{map_name}"),
        )
    }

    // ═══════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════

    /// Hand a QUEUED Map to the scheduler: QUEUED → DISPATCHED.
    ///
    /// The archive must have been uploaded. The Map is claimed as DISPATCHED
    /// before the scheduler is called, so concurrent dispatches of one Map
    /// launch at most one task. If the launch fails the claim is released
    /// and the Map is QUEUED again.
    ///
    /// # Errors
    ///
    /// - `RelayError::NotFound` if the Map or its upload is missing
    /// - `RelayError::InvalidTransition` if the Map is not QUEUED or another
    ///   dispatch claimed it first
    /// - `RelayError::Unavailable` / `RelayError::Dependency` from the scheduler
    pub async fn dispatch_map(&self, key: &MapKey) -> Result<MapRecord> {
        let record = self.load_map(key).await?;
        record.status.transition(MapStatus::Dispatched)?;

        let input = self.input_location(&record.job_id, &record.map_name);
        if self.env.blobs.head_object(&input).await?.is_none() {
            return Err(RelayError::NotFound {
                resource: "upload",
                id: input.to_string(),
            });
        }

        let claimed = self.apply(&record, MapStatus::Dispatched, Item::new()).await?;
        let request = TaskRequest {
            job_id: claimed.job_id.to_string(),
            map_id: claimed.map_id.to_string(),
            map_name: claimed.map_name.clone(),
            input,
            output_bucket: self.config.output_bucket.clone(),
            maps_table: self.config.maps_table.clone(),
            jobs_table: self.config.jobs_table.clone(),
        };
        match self.env.scheduler.run_task(&request).await {
            Ok(handle) => self.record_task(&claimed, handle.task_id).await,
            Err(err) => {
                tracing::warn!(map_id = %claimed.map_id, job_id = %claimed.job_id, error = %err, "Dispatch failed, map stays queued");
                self.release_claim(&claimed).await;
                Err(err)
            }
        }
    }

    /// Dispatch every QUEUED Map of a Job, one outcome per Map.
    ///
    /// A failure on one Map does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotFound` for an unknown Job, or the store's error
    /// when the Maps cannot be listed.
    pub async fn dispatch_job(&self, job_id: &JobId) -> Result<Vec<DispatchOutcome>> {
        self.load_job(job_id).await?;
        let mut outcomes = Vec::new();
        for map in self.maps_of(job_id).await? {
            if map.status != MapStatus::Queued {
                continue;
            }
            let key = map.map_key();
            let outcome = self.dispatch_map(&key).await;
            outcomes.push((key, outcome));
        }
        let dispatched = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
        tracing::info!(job_id = %job_id, dispatched, total = outcomes.len(), "Job dispatched");
        Ok(outcomes)
    }

    // ═══════════════════════════════════════════════════════════
    // Task callbacks
    // ═══════════════════════════════════════════════════════════

    /// The task started: DISPATCHED → PROCESSING.
    ///
    /// # Errors
    ///
    /// `RelayError::NotFound` or `RelayError::InvalidTransition`.
    pub async fn mark_processing(&self, key: &MapKey, task_id: &str) -> Result<MapRecord> {
        let record = self.load_map(key).await?;
        let mut changes = Item::new();
        changes.insert("taskId".into(), Value::String(task_id.to_string()));
        changes.insert("taskStartedAt".into(), self.now_value()?);
        self.apply(&record, MapStatus::Processing, changes).await
    }

    /// The task wrote its output: PROCESSING → COMPLETED.
    ///
    /// Returns after the `map.completed` (and any `job.completed`)
    /// notification has settled. With a webhook notifier and default delivery
    /// options, an unreachable subscriber holds the callback for up to three
    /// 10 s timeouts plus 6 s of backoff; the transition is already stored by
    /// then and delivery outcome never changes it.
    ///
    /// # Errors
    ///
    /// `RelayError::NotFound` or `RelayError::InvalidTransition`.
    pub async fn complete_map(&self, key: &MapKey, output: ObjectLocation) -> Result<MapRecord> {
        let record = self.load_map(key).await?;
        let now = self.now_value()?;
        let mut changes = Item::new();
        changes.insert("processedAt".into(), now.clone());
        changes.insert("taskStoppedAt".into(), now);
        changes.insert("output".into(), serde_json::to_value(&output)?);

        let updated = self.apply(&record, MapStatus::Completed, changes).await?;
        self.announce(&updated, EventKind::MapCompleted).await;
        Ok(updated)
    }

    /// The task or its launch failed: DISPATCHED | PROCESSING → FAILED.
    ///
    /// Like [`Self::complete_map`], returns once the failure notifications
    /// have settled.
    ///
    /// # Errors
    ///
    /// `RelayError::NotFound` or `RelayError::InvalidTransition`.
    pub async fn fail_map(&self, key: &MapKey, error: &str) -> Result<MapRecord> {
        let record = self.load_map(key).await?;
        let mut changes = Item::new();
        changes.insert("errorMessage".into(), Value::String(truncate_error(error)));
        changes.insert("taskStoppedAt".into(), self.now_value()?);

        let updated = self.apply(&record, MapStatus::Failed, changes).await?;
        self.announce(&updated, EventKind::MapFailed).await;
        Ok(updated)
    }

    /// Operator retry: FAILED → QUEUED with `retryCount + 1`, then dispatch.
    ///
    /// Returns the Map as DISPATCHED, or as QUEUED if dispatch did not go
    /// through; a failed dispatch does not undo the retry.
    ///
    /// # Errors
    ///
    /// `RelayError::NotFound` or `RelayError::InvalidTransition`.
    pub async fn retry_map(&self, key: &MapKey) -> Result<MapRecord> {
        let record = self.load_map(key).await?;
        let mut changes = Item::new();
        changes.insert("retryCount".into(), json!(record.retry_count.saturating_add(1)));
        for cleared in ["errorMessage", "taskId", "taskStartedAt", "taskStoppedAt", "processedAt", "output"] {
            changes.insert(cleared.into(), Value::Null);
        }
        let queued = self.apply(&record, MapStatus::Queued, changes).await?;
        tracing::info!(map_id = %queued.map_id, retry_count = queued.retry_count, "Map re-queued");

        match self.dispatch_map(key).await {
            Ok(dispatched) => Ok(dispatched),
            Err(err) => {
                tracing::warn!(map_id = %queued.map_id, error = %err, "Retried map left queued");
                Ok(queued)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Queries and cleanup
    // ═══════════════════════════════════════════════════════════

    /// Job metadata, its Maps and the derived status.
    ///
    /// # Errors
    ///
    /// `RelayError::NotFound` for an unknown Job, or the store's error.
    pub async fn job_view(&self, job_id: &JobId) -> Result<JobView> {
        let job = self.load_job(job_id).await?;
        let maps = self.maps_of(job_id).await?;
        let counts = StatusCounts::tally(maps.iter().map(|m| m.status));
        Ok(JobView {
            job,
            status: counts.job_status(),
            counts,
            maps,
        })
    }

    /// Remove a Job and all its Maps in batches.
    ///
    /// # Errors
    ///
    /// `RelayError::NotFound` for an unknown Job, or the store's error while
    /// listing. Undeleted records are reported in the outcome.
    pub async fn delete_job(&self, job_id: &JobId) -> Result<BatchOutcome> {
        let job = self.load_job(job_id).await?;
        let mut keys = vec![(self.config.jobs_table.clone(), job.key())];
        keys.extend(
            self.maps_of(job_id)
                .await?
                .iter()
                .map(|map| (self.config.maps_table.clone(), map.key())),
        );

        let outcome = self.batch.batch_delete(keys).await?;
        if outcome.is_complete() {
            tracing::info!(job_id = %job_id, deleted = outcome.successful, "Job deleted");
        } else {
            tracing::error!(job_id = %job_id, failed = outcome.failed, "Job only partially deleted");
        }
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════

    async fn load_map(&self, key: &MapKey) -> Result<MapRecord> {
        let item = self
            .env
            .store
            .get_item(&self.config.maps_table, &Key::map(key))
            .await?
            .ok_or_else(|| RelayError::NotFound {
                resource: "map",
                id: key.to_string(),
            })?;
        MapRecord::from_item(item)
    }

    async fn load_job(&self, job_id: &JobId) -> Result<JobRecord> {
        let item = self
            .env
            .store
            .get_item(&self.config.jobs_table, &Key::job(job_id))
            .await?
            .ok_or_else(|| RelayError::NotFound {
                resource: "job",
                id: job_id.to_string(),
            })?;
        from_item(item)
    }

    async fn maps_of(&self, job_id: &JobId) -> Result<Vec<MapRecord>> {
        let mut maps = self
            .env
            .store
            .query(&self.config.maps_table, attr::JOB_ID, job_id.as_str())
            .await?
            .into_iter()
            .map(MapRecord::from_item)
            .collect::<Result<Vec<_>>>()?;
        maps.sort_by(|a, b| {
            a.map_name
                .cmp(&b.map_name)
                .then_with(|| a.map_id.cmp(&b.map_id))
        });
        Ok(maps)
    }

    fn now_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.env.clock.now())?)
    }

    /// Write `to` if the Map is still in the status it was read in.
    async fn apply(&self, current: &MapRecord, to: MapStatus, mut changes: Item) -> Result<MapRecord> {
        current.status.transition(to)?;
        changes.insert(attr::STATUS.into(), Value::String(to.as_str().into()));
        changes.insert("updatedAt".into(), self.now_value()?);

        let updated = self
            .env
            .store
            .update_item(
                &self.config.maps_table,
                &current.key(),
                changes,
                Some(Condition::equals(attr::STATUS, current.status.as_str())),
            )
            .await
            .map_err(|err| match err {
                RelayError::ConditionFailed => RelayError::InvalidTransition {
                    from: current.status.as_str().to_string(),
                    to: to.as_str().to_string(),
                },
                other => other,
            })?
            .ok_or_else(|| RelayError::NotFound {
                resource: "map",
                id: current.map_key().to_string(),
            })?;

        metrics::counter!(names::MAP_TRANSITIONS, "to" => to.as_str()).increment(1);
        tracing::info!(
            map_id = %current.map_id,
            job_id = %current.job_id,
            from = current.status.as_str(),
            to = to.as_str(),
            "Map transitioned"
        );
        MapRecord::from_item(updated)
    }

    /// Store the launched task id on a claimed Map.
    ///
    /// A task can report in before this write lands; its callback already
    /// carries the task id, so the newer record wins.
    async fn record_task(&self, claimed: &MapRecord, task_id: String) -> Result<MapRecord> {
        let mut changes = Item::new();
        changes.insert("taskId".into(), Value::String(task_id));
        let written = self
            .env
            .store
            .update_item(
                &self.config.maps_table,
                &claimed.key(),
                changes,
                Some(Condition::equals(attr::STATUS, MapStatus::Dispatched.as_str())),
            )
            .await;
        match written {
            Ok(Some(item)) => MapRecord::from_item(item),
            Ok(None) | Err(RelayError::ConditionFailed) => self.load_map(&claimed.map_key()).await,
            Err(other) => Err(other),
        }
    }

    /// Put a claimed Map back to QUEUED after its launch failed.
    async fn release_claim(&self, claimed: &MapRecord) {
        let mut changes = Item::new();
        changes.insert(attr::STATUS.into(), Value::String(MapStatus::Queued.as_str().into()));
        if let Ok(now) = self.now_value() {
            changes.insert("updatedAt".into(), now);
        }
        let released = self
            .env
            .store
            .update_item(
                &self.config.maps_table,
                &claimed.key(),
                changes,
                Some(Condition::equals(attr::STATUS, MapStatus::Dispatched.as_str())),
            )
            .await;
        if let Err(err) = released {
            tracing::error!(map_id = %claimed.map_id, job_id = %claimed.job_id, error = %err, "Could not release dispatch claim");
        }
    }

    /// Publish the Map event, then the Job event if the Job just settled.
    async fn announce(&self, map: &MapRecord, event: EventKind) {
        let data = serde_json::to_value(map).unwrap_or(Value::Null);
        self.env
            .notifier
            .notify(Notification {
                event,
                owner_id: map.owner_id.clone(),
                data,
            })
            .await;

        let maps = match self.maps_of(&map.job_id).await {
            Ok(maps) => maps,
            Err(err) => {
                tracing::warn!(job_id = %map.job_id, error = %err, "Could not derive job status for notification");
                return;
            }
        };
        let counts = StatusCounts::tally(maps.iter().map(|m| m.status));
        let job_event = match counts.job_status() {
            JobStatus::Completed => EventKind::JobCompleted,
            JobStatus::Failed => EventKind::JobFailed,
            JobStatus::Queued | JobStatus::InProgress => return,
        };
        self.env
            .notifier
            .notify(Notification {
                event: job_event,
                owner_id: map.owner_id.clone(),
                data: json!({
                    "jobId": map.job_id,
                    "status": counts.job_status(),
                    "counts": counts,
                }),
            })
            .await;
    }
}
