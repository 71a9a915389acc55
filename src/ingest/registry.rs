use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::image_dir::ImageDirSource;
use super::reconnect::{ReconnectPolicy, ReconnectingSource};
use super::synthetic::SyntheticSource;
use super::FrameProducer;
use crate::error::VisionError;

/// What to open: a URI/path plus the declared source type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub uri: String,
    pub kind: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Pacing for sources that are not naturally rate-limited. 0 = unpaced.
    pub target_fps: u32,
    pub reconnect: ReconnectPolicy,
}

impl SourceSpec {
    pub fn new(uri: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            kind: kind.into(),
            width: None,
            height: None,
            target_fps: 0,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Builds one kind of source.
pub trait SourceFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, spec: &SourceSpec) -> bool;

    fn create(&self, spec: &SourceSpec) -> Result<Box<dyn FrameProducer>>;

    /// Live sources are wrapped in `ReconnectingSource`.
    fn is_live(&self, _spec: &SourceSpec) -> bool {
        false
    }
}

/// Registry of source factories.
///
/// Constructed once at startup and handed to the orchestrator; nothing reaches
/// it through global state. Factories are consulted in registration order.
pub struct SourceRegistry {
    factories: Vec<Arc<dyn SourceFactory>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registry with the built-in factories (synthetic streams, image directories).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SyntheticFactory);
        registry.register(ImageDirFactory);
        registry
    }

    pub fn register<F: SourceFactory + 'static>(&mut self, factory: F) {
        self.factories.push(Arc::new(factory));
    }

    pub fn list(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Open a source. Unknown kinds are configuration errors; open failures are
    /// source errors.
    pub fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameProducer>> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.can_handle(spec))
            .cloned()
            .ok_or_else(|| {
                VisionError::config(format!(
                    "no source factory handles '{}' (type {})",
                    spec.uri, spec.kind
                ))
            })?;

        if factory.is_live(spec) {
            let first = factory.create(spec)?;
            let reopen_spec = spec.clone();
            let reopen_factory = factory.clone();
            log::info!(
                "source {} opened via {} (live, reconnect enabled)",
                spec.uri,
                factory.name()
            );
            return Ok(Box::new(ReconnectingSource::with_initial(
                spec.uri.clone(),
                first,
                spec.reconnect.clone(),
                move || reopen_factory.create(&reopen_spec),
            )));
        }

        let source = factory.create(spec)?;
        log::info!("source {} opened via {}", spec.uri, factory.name());
        Ok(source)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct SyntheticFactory;

impl SourceFactory for SyntheticFactory {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn can_handle(&self, spec: &SourceSpec) -> bool {
        spec.uri.starts_with("stub://") || spec.kind == "synthetic"
    }

    fn create(&self, spec: &SourceSpec) -> Result<Box<dyn FrameProducer>> {
        Ok(Box::new(SyntheticSource::from_spec(spec)?))
    }

    fn is_live(&self, spec: &SourceSpec) -> bool {
        spec.kind == "stream"
    }
}

struct ImageDirFactory;

impl SourceFactory for ImageDirFactory {
    fn name(&self) -> &'static str {
        "images"
    }

    fn can_handle(&self, spec: &SourceSpec) -> bool {
        matches!(spec.kind.as_str(), "images" | "file") && !spec.uri.contains("://")
    }

    fn create(&self, spec: &SourceSpec) -> Result<Box<dyn FrameProducer>> {
        Ok(Box::new(ImageDirSource::open(spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn opens_stub_sources_and_rejects_unknown_kinds() -> Result<()> {
        let registry = SourceRegistry::with_defaults();
        assert_eq!(registry.list(), vec!["synthetic", "images"]);

        let mut spec = SourceSpec::new("stub://front?frames=2", "synthetic");
        spec.width = Some(32);
        spec.height = Some(24);
        let mut source = registry.open(&spec)?;
        assert_eq!(source.next_frame()?.map(|f| f.id), Some(0));

        let err = match registry.open(&SourceSpec::new("rtsp://cam", "youtube")) {
            Ok(_) => panic!("youtube sources are not registered"),
            Err(err) => err,
        };
        assert!(matches!(
            classify(&err),
            Some(VisionError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn stream_kind_is_wrapped_for_reconnect() -> Result<()> {
        let registry = SourceRegistry::with_defaults();
        let mut spec = SourceSpec::new("stub://live?frames=1", "stream");
        spec.width = Some(16);
        spec.height = Some(16);
        spec.reconnect.max_attempts = 1;
        spec.reconnect.initial_backoff_ms = 1;
        let mut source = registry.open(&spec)?;
        assert!(source.cancel_token().is_some());
        // The finite stub ends after one frame; the wrapper reopens it and keeps ids increasing.
        let a = source.next_frame()?.map(|f| f.id);
        let b = source.next_frame()?.map(|f| f.id);
        assert_eq!(a, Some(0));
        assert_eq!(b, Some(1));
        source.release();
        Ok(())
    }
}
