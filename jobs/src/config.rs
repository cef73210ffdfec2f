//! Job service configuration.

use maprelay_core::{RelayError, Result};
use std::time::Duration;

/// Table, bucket and limit settings of the job service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Map records, keyed by `(mapId, mapName)`
    pub maps_table: String,
    /// Job metadata records, keyed by `jobId`
    pub jobs_table: String,
    /// Bucket archives are uploaded to
    pub input_bucket: String,
    /// Bucket tasks write results to
    pub output_bucket: String,
    /// Validity of presigned upload URLs.
    ///
    /// Default: 15 minutes
    pub upload_url_ttl: Duration,
    /// Resubmissions per physical batch.
    ///
    /// Default: 3
    pub batch_max_retries: usize,
    /// Files accepted in one submission.
    ///
    /// Default: 50
    pub max_files_per_job: usize,
    /// Largest accepted archive.
    ///
    /// Default: 500 MiB
    pub max_file_bytes: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            maps_table: "maprelay-maps".to_string(),
            jobs_table: "maprelay-jobs".to_string(),
            input_bucket: "maprelay-input".to_string(),
            output_bucket: "maprelay-output".to_string(),
            upload_url_ttl: Duration::from_secs(15 * 60),
            batch_max_retries: 3,
            max_files_per_job: 50,
            max_file_bytes: 500 * 1024 * 1024,
        }
    }
}

impl JobsConfig {
    /// Read overrides from `MAPRELAY_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Configuration` if a numeric variable does not parse
    /// or a limit is zero.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let text = |name: &str, target: &mut String| {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *target = value.trim().to_string();
            }
        };
        text("MAPRELAY_MAPS_TABLE", &mut config.maps_table);
        text("MAPRELAY_JOBS_TABLE", &mut config.jobs_table);
        text("MAPRELAY_INPUT_BUCKET", &mut config.input_bucket);
        text("MAPRELAY_OUTPUT_BUCKET", &mut config.output_bucket);

        if let Some(secs) = number(&lookup, "MAPRELAY_UPLOAD_URL_TTL_SECS")? {
            config.upload_url_ttl = Duration::from_secs(secs);
        }
        if let Some(retries) = number(&lookup, "MAPRELAY_BATCH_MAX_RETRIES")? {
            config.batch_max_retries = to_usize("MAPRELAY_BATCH_MAX_RETRIES", retries)?;
        }
        if let Some(files) = number(&lookup, "MAPRELAY_MAX_FILES_PER_JOB")? {
            config.max_files_per_job = to_usize("MAPRELAY_MAX_FILES_PER_JOB", files)?;
        }
        if let Some(bytes) = number(&lookup, "MAPRELAY_MAX_FILE_BYTES")? {
            config.max_file_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every submission fail.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Configuration` naming the bad setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_files_per_job == 0 {
            return Err(RelayError::Configuration(
                "MAPRELAY_MAX_FILES_PER_JOB must be at least 1".into(),
            ));
        }
        if self.max_file_bytes == 0 {
            return Err(RelayError::Configuration(
                "MAPRELAY_MAX_FILE_BYTES must be at least 1".into(),
            ));
        }
        if self.upload_url_ttl.is_zero() {
            return Err(RelayError::Configuration(
                "MAPRELAY_UPLOAD_URL_TTL_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| RelayError::Configuration(format!("{name}='{raw}': {e}")))
        })
        .transpose()
}

fn to_usize(name: &str, value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|e| RelayError::Configuration(format!("{name}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(JobsConfig::from_lookup(lookup(&[])).unwrap(), JobsConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = JobsConfig::from_lookup(lookup(&[
            ("MAPRELAY_MAPS_TABLE", "maps-prod"),
            ("MAPRELAY_UPLOAD_URL_TTL_SECS", "300"),
            ("MAPRELAY_MAX_FILES_PER_JOB", " 10 "),
            ("MAPRELAY_INPUT_BUCKET", "   "),
        ]))
        .unwrap();
        assert_eq!(config.maps_table, "maps-prod");
        assert_eq!(config.upload_url_ttl, Duration::from_secs(300));
        assert_eq!(config.max_files_per_job, 10);
        assert_eq!(config.input_bucket, "maprelay-input");
    }

    #[test]
    fn bad_numbers_are_configuration_errors() {
        let err = JobsConfig::from_lookup(lookup(&[("MAPRELAY_BATCH_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(msg) if msg.contains("MAPRELAY_BATCH_MAX_RETRIES")));

        let err = JobsConfig::from_lookup(lookup(&[("MAPRELAY_MAX_FILES_PER_JOB", "0")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }
}
