//! Shared mock driver for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use prax_pool::{
    BoxError, ConnectionFactory, ConnectionOptions, ConnectionProvider, FactoryConfig,
    PhysicalConnection, PoolKey,
};

/// Counters shared between a provider and the sessions it creates.
#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub break_sessions: AtomicBool,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.connects() - self.closes()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

pub struct Session {
    counters: Arc<Counters>,
}

impl PhysicalConnection for Session {
    fn is_broken(&self) -> bool {
        self.counters.break_sessions.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct CountingProvider {
    pub counters: Arc<Counters>,
    pub connect_delay: Duration,
}

impl ConnectionProvider for CountingProvider {
    fn connect(
        &self,
        _options: &ConnectionOptions,
        _key: &PoolKey,
    ) -> Result<Box<dyn PhysicalConnection>, BoxError> {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            std::thread::sleep(self.connect_delay);
        }
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.counters.fail_connect.load(Ordering::SeqCst) {
            return Err("login failed".into());
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Session {
            counters: self.counters.clone(),
        }))
    }
}

pub fn factory() -> (Arc<ConnectionFactory>, Arc<Counters>) {
    factory_with(Duration::ZERO, FactoryConfig::new().throttle_slots(2))
}

pub fn factory_with(
    connect_delay: Duration,
    config: FactoryConfig,
) -> (Arc<ConnectionFactory>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let provider = CountingProvider {
        counters: counters.clone(),
        connect_delay,
    };
    let factory = ConnectionFactory::with_config(provider, config).expect("valid config");
    (factory, counters)
}
