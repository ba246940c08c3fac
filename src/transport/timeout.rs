//! Cancelable, resettable one-shot timer wrapper.

use std::sync::Arc;
use std::time::Duration;

use crate::transport::{CancelHandle, Transport};

/// Stateful wrapper over [`Transport::spawn_after`]. The timeout is
/// single-shot: once fired it is disabled until the next `reset()`; users
/// call `reset()` from the fire callback to obtain periodic behavior.
pub struct StatefulTimeout<T: Transport> {
    transport: T,
    delay: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    pending: Option<CancelHandle>,
}

impl<T: Transport> StatefulTimeout<T> {
    /// Creates a disabled timeout firing `callback` `delay` after each
    /// `reset()`.
    pub fn new(
        transport: T,
        delay: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        StatefulTimeout {
            transport,
            delay,
            callback: Arc::new(callback),
            pending: None,
        }
    }

    /// Cancels any pending fire and schedules a new one at `delay` from now.
    pub fn reset(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.cancel();
        }
        let callback = self.callback.clone();
        self.pending = Some(
            self.transport
                .spawn_after(self.delay, move || callback()),
        );
    }

    /// Schedules a fire if none is pending; no-op otherwise.
    pub fn enable(&mut self) {
        let live = self
            .pending
            .as_ref()
            .is_some_and(|handle| handle.is_pending());
        if !live {
            self.reset();
        }
    }

    /// Cancels the pending fire, if any.
    pub fn disable(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.cancel();
        }
    }
}

impl<T: Transport> Drop for StatefulTimeout<T> {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod timeout_tests {
    use super::*;
    use crate::transport::{FleetConfig, SimulatedTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use crate::utils::ReplicoreError;

    fn harness() -> (
        SimulatedTransport,
        Arc<Mutex<StatefulTimeout<SimulatedTransport>>>,
        Arc<AtomicUsize>,
    ) {
        let transport = SimulatedTransport::new(FleetConfig {
            n_fault: 0,
            replicas: vec![],
            multicast: None,
        });
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_ref = fires.clone();
        let timeout = StatefulTimeout::new(
            transport.clone(),
            Duration::from_millis(10),
            move || {
                fires_ref.fetch_add(1, Ordering::SeqCst);
            },
        );
        (transport, Arc::new(Mutex::new(timeout)), fires)
    }

    #[test]
    fn fires_once_after_reset() -> Result<(), ReplicoreError> {
        let (transport, timeout, fires) = harness();
        timeout.lock().unwrap().reset();
        transport.run(Duration::from_millis(100))?;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(transport.elapsed(), Duration::from_millis(10));
        Ok(())
    }

    #[test]
    fn disable_suppresses_fire() -> Result<(), ReplicoreError> {
        let (transport, timeout, fires) = harness();
        timeout.lock().unwrap().reset();
        let timeout_ref = timeout.clone();
        transport.spawn_after(Duration::from_millis(5), move || {
            timeout_ref.lock().unwrap().disable();
        });
        transport.run(Duration::from_millis(100))?;
        assert_eq!(fires.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn reset_postpones_fire() -> Result<(), ReplicoreError> {
        let (transport, timeout, fires) = harness();
        timeout.lock().unwrap().reset();
        let timeout_ref = timeout.clone();
        transport.spawn_after(Duration::from_millis(5), move || {
            timeout_ref.lock().unwrap().reset();
        });
        transport.run(Duration::from_millis(100))?;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        // fire lands at 5 ms (the reset) + the 10 ms delay
        assert_eq!(transport.elapsed(), Duration::from_millis(15));
        Ok(())
    }

    #[test]
    fn enable_is_noop_while_pending() -> Result<(), ReplicoreError> {
        let (transport, timeout, fires) = harness();
        timeout.lock().unwrap().reset();
        let timeout_ref = timeout.clone();
        transport.spawn_after(Duration::from_millis(5), move || {
            timeout_ref.lock().unwrap().enable();
        });
        transport.run(Duration::from_millis(100))?;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(transport.elapsed(), Duration::from_millis(10));
        Ok(())
    }

    #[test]
    fn enable_rearms_after_fire() -> Result<(), ReplicoreError> {
        let (transport, timeout, fires) = harness();
        timeout.lock().unwrap().reset();
        let timeout_ref = timeout.clone();
        transport.spawn_after(Duration::from_millis(20), move || {
            timeout_ref.lock().unwrap().enable();
        });
        transport.run(Duration::from_millis(100))?;
        assert_eq!(fires.load(Ordering::SeqCst), 2);
        assert_eq!(transport.elapsed(), Duration::from_millis(30));
        Ok(())
    }
}
