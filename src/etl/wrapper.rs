//! Runtime companion of a [`Configuration`]: the unit exchanged between the
//! reconciler and the scheduler. Carries the last completed run so that a
//! reload of an unchanged configuration keeps its scheduling history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

use super::Configuration;
use crate::error::{EtlError, Result};

#[derive(Debug)]
pub struct ConfigurationWrapper {
    configuration: RwLock<Arc<Configuration>>,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl ConfigurationWrapper {
    pub fn new(configuration: Arc<Configuration>) -> Self {
        Self {
            configuration: RwLock::new(configuration),
            last_run: RwLock::new(None),
        }
    }

    pub fn configuration(&self) -> Arc<Configuration> {
        self.configuration.read().clone()
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read()
    }

    /// Advance the last-run marker. Returns `false` when `at` is not newer than
    /// the current value; the marker never moves backwards and is never cleared.
    pub fn record_run(&self, at: DateTime<Utc>) -> bool {
        let mut last_run = self.last_run.write();
        match *last_run {
            Some(current) if current >= at => false,
            _ => {
                *last_run = Some(at);
                true
            }
        }
    }

    /// Swap in a re-read copy of the same configuration (auxiliary fields only).
    pub fn update(&self, configuration: Arc<Configuration>) -> Result<()> {
        let mut current = self.configuration.write();
        if **current != *configuration {
            return Err(EtlError::InvalidState(format!(
                "cannot update wrapper of {} with different configuration {}",
                current.fingerprint(),
                configuration.fingerprint()
            )));
        }
        *current = configuration;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn configuration(interval_ms: u64) -> Arc<Configuration> {
        Arc::new(Configuration::new(Duration::from_millis(interval_ms)))
    }

    #[test]
    fn test_last_run_only_advances() {
        let wrapper = ConfigurationWrapper::new(configuration(100));
        assert!(wrapper.last_run().is_none());

        let now = Utc::now();
        assert!(wrapper.record_run(now));
        assert!(!wrapper.record_run(now - ChronoDuration::seconds(5)));
        assert!(!wrapper.record_run(now));
        assert_eq!(wrapper.last_run(), Some(now));

        let later = now + ChronoDuration::seconds(1);
        assert!(wrapper.record_run(later));
        assert_eq!(wrapper.last_run(), Some(later));
    }

    #[test]
    fn test_update_swaps_auxiliary_fields() {
        let wrapper = ConfigurationWrapper::new(configuration(100));
        let now = Utc::now();
        wrapper.record_run(now);

        let reread = Arc::new(Configuration::new(Duration::from_millis(100)).with_source("/new.json"));
        wrapper.update(reread).unwrap();

        assert_eq!(
            wrapper.configuration().source(),
            Some(std::path::Path::new("/new.json"))
        );
        assert_eq!(wrapper.last_run(), Some(now));
    }

    #[test]
    fn test_update_rejects_identity_change() {
        let wrapper = ConfigurationWrapper::new(configuration(100));
        let err = wrapper.update(configuration(200)).unwrap_err();
        assert!(matches!(err, EtlError::InvalidState(_)));
        assert_eq!(wrapper.configuration().repeat_interval(), Duration::from_millis(100));
    }
}
