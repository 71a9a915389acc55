use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{Detector, DetectorSettings};
use super::backends::{ReplayDetector, SyntheticDetector};
use crate::error::VisionError;

type DetectorFactory = Arc<dyn Fn(&DetectorSettings) -> Result<Box<dyn Detector>> + Send + Sync>;

/// Registry of detector backends.
///
/// Stores factories rather than instances: every camera gets its own detector
/// so processing workers never contend on a shared lock.
pub struct DetectorRegistry {
    factories: HashMap<String, DetectorFactory>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in backends. `synthetic` is the default.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("synthetic", |settings| {
            Ok(Box::new(SyntheticDetector::new(settings)) as Box<dyn Detector>)
        });
        registry.register("replay", |settings| {
            let path = settings.replay_path.as_ref().ok_or_else(|| {
                VisionError::config("replay detector requires detector.replay_path")
            })?;
            Ok(Box::new(ReplayDetector::from_path(path, settings)?)
                as Box<dyn Detector>)
        });
        registry
    }

    /// Register a backend factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorSettings) -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("detector backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a fresh detector for one camera.
    pub fn create(&self, settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
        let name = if settings.backend.is_empty() {
            self.default_name
                .clone()
                .ok_or_else(|| VisionError::config("no detector backends registered"))?
        } else {
            settings.backend.clone()
        };
        let factory = self.factories.get(&name).ok_or_else(|| {
            VisionError::config(format!("detector backend '{}' not registered", name))
        })?;
        let mut detector = factory(settings)?;
        detector.warm_up()?;
        log::debug!("detector backend {} ready", detector.name());
        Ok(detector)
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_first_registered() -> Result<()> {
        let registry = DetectorRegistry::with_defaults();
        assert_eq!(registry.list(), vec!["replay", "synthetic"]);
        let detector = registry.create(&DetectorSettings::default())?;
        assert_eq!(detector.name(), "synthetic");
        Ok(())
    }

    #[test]
    fn unknown_backend_and_missing_replay_path_are_config_errors() {
        let registry = DetectorRegistry::with_defaults();
        for backend in ["yolo-gpu", "replay"] {
            let settings = DetectorSettings {
                backend: backend.to_string(),
                ..DetectorSettings::default()
            };
            let err = match registry.create(&settings) {
                Ok(_) => panic!("{} should not be constructible", backend),
                Err(err) => err,
            };
            assert!(matches!(
                crate::error::classify(&err),
                Some(VisionError::Configuration(_))
            ));
        }
    }

    #[test]
    fn set_default_requires_registration() {
        let mut registry = DetectorRegistry::with_defaults();
        assert!(registry.set_default("replay").is_ok());
        assert!(registry.set_default("missing").is_err());
    }
}
