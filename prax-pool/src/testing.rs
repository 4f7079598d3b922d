//! Mock driver used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::BoxError;
use crate::options::{ConnectionOptions, PoolKey};
use crate::provider::{ConnectionProvider, PhysicalConnection};

#[derive(Debug, Default, Clone)]
pub(crate) struct MockSession {
    pub broken: Arc<AtomicBool>,
    pub fail_reset: Arc<AtomicBool>,
    pub closes: Arc<AtomicUsize>,
}

impl PhysicalConnection for MockSession {
    fn reset(&mut self) -> Result<(), BoxError> {
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err("reset failed".into());
        }
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockProvider {
    pub connects: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Option<Duration>,
    pub closes: Arc<AtomicUsize>,
}

impl MockProvider {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for MockProvider {
    fn connect(
        &self,
        _options: &ConnectionOptions,
        _key: &PoolKey,
    ) -> Result<Box<dyn PhysicalConnection>, BoxError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err("server unreachable".into());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            closes: self.closes.clone(),
            ..MockSession::default()
        }))
    }
}
