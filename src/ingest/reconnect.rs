//! Bounded-backoff reconnection for live sources.
//!
//! A live stream that errors or ends is released and reopened. Frame ids are
//! reassigned by the wrapper so they keep increasing across reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{cancellable_sleep, FrameProducer};
use crate::error::VisionError;
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed reopen attempts before giving up.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

type Opener = Box<dyn FnMut() -> Result<Box<dyn FrameProducer>> + Send>;

pub struct ReconnectingSource {
    uri: String,
    inner: Option<Box<dyn FrameProducer>>,
    opener: Opener,
    policy: ReconnectPolicy,
    next_id: u64,
    reconnects: u64,
    released: bool,
    cancel: Arc<AtomicBool>,
}

impl ReconnectingSource {
    /// Wrapper that opens lazily on the first `next_frame`.
    pub fn new<F>(uri: impl Into<String>, policy: ReconnectPolicy, opener: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn FrameProducer>> + Send + 'static,
    {
        Self {
            uri: uri.into(),
            inner: None,
            opener: Box::new(opener),
            policy,
            next_id: 0,
            reconnects: 0,
            released: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_initial<F>(
        uri: impl Into<String>,
        initial: Box<dyn FrameProducer>,
        policy: ReconnectPolicy,
        opener: F,
    ) -> Self
    where
        F: FnMut() -> Result<Box<dyn FrameProducer>> + Send + 'static,
    {
        let mut source = Self::new(uri, policy, opener);
        source.inner = Some(initial);
        source
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    fn drop_inner(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.release();
        }
    }

    fn reopen(&mut self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(VisionError::acquisition(format!("{}: cancelled", self.uri)).into());
            }
            match (self.opener)() {
                Ok(inner) => {
                    self.inner = Some(inner);
                    self.reconnects += 1;
                    log::info!("{}: reconnected (attempt {})", self.uri, attempt + 1);
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(VisionError::acquisition(format!(
                            "{}: giving up after {} reconnect attempts: {:#}",
                            self.uri, attempt, err
                        ))
                        .into());
                    }
                    let wait = self.policy.backoff(attempt);
                    log::warn!(
                        "{}: reconnect attempt {} failed ({:#}); retrying in {:?}",
                        self.uri,
                        attempt,
                        err,
                        wait
                    );
                    cancellable_sleep(wait, &self.cancel);
                }
            }
        }
    }
}

impl FrameProducer for ReconnectingSource {
    fn describe(&self) -> String {
        self.uri.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Err(VisionError::acquisition(format!("{} already released", self.uri)).into());
        }
        loop {
            if self.inner.is_none() {
                if self.next_id > 0 {
                    cancellable_sleep(self.policy.backoff(1), &self.cancel);
                }
                self.reopen()?;
            }
            let Some(inner) = self.inner.as_mut() else {
                continue;
            };
            match inner.next_frame() {
                Ok(Some(mut frame)) => {
                    frame.id = self.next_id;
                    self.next_id += 1;
                    return Ok(Some(frame));
                }
                Ok(None) => {
                    log::warn!("{}: stream ended, reconnecting", self.uri);
                    self.drop_inner();
                }
                Err(err) => {
                    log::warn!("{}: read failed ({:#}), reconnecting", self.uri, err);
                    self.drop_inner();
                }
            }
        }
    }

    fn release(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.drop_inner();
        self.released = true;
    }

    fn cancel_token(&self) -> Option<Arc<AtomicBool>> {
        Some(self.cancel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameImage;
    use crate::ingest::VecSource;
    use std::sync::atomic::AtomicU32;

    fn frames(n: u64) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame::new(i, i as f64, FrameImage::blank(2, 2)))
            .collect()
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn ids_keep_increasing_across_reconnects() -> Result<()> {
        let mut source = ReconnectingSource::new("test://cam", fast_policy(3), || {
            Ok(Box::new(VecSource::new(frames(2))) as Box<dyn FrameProducer>)
        });
        let ids: Vec<u64> = (0..5)
            .map(|_| source.next_frame().map(|f| f.map(|f| f.id)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(source.reconnects(), 3);
        Ok(())
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut source = ReconnectingSource::new("test://down", fast_policy(3), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("connection refused"))
        });
        let err = source.next_frame().unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(VisionError::Source(_))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(9), Duration::from_millis(1_000));
    }
}
