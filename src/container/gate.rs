//! Per-container operation gate
//!
//! Lifecycle operations on one container are serialized; operations on
//! distinct containers run concurrently. The gate remembers which operation
//! currently holds the container so a refused caller can name its conflict,
//! and `kill` refuses to queue at all rather than waiting behind a stop
//! that is already escalating.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as SerialLock, MutexGuard};

/// The lifecycle operations that contend for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Stop,
    Kill,
    Pause,
    Unpause,
    Remove,
}

impl std::fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleOp::Start => write!(f, "start"),
            LifecycleOp::Stop => write!(f, "stop"),
            LifecycleOp::Kill => write!(f, "kill"),
            LifecycleOp::Pause => write!(f, "pause"),
            LifecycleOp::Unpause => write!(f, "unpause"),
            LifecycleOp::Remove => write!(f, "remove"),
        }
    }
}

/// Refusal to enter the gate without waiting
#[derive(Debug, Error)]
#[error("{}", in_flight.map(|op| format!("{} already in progress", op)).unwrap_or_else(|| "another operation in progress".into()))]
pub struct Busy {
    /// The operation holding the container, when observable
    pub in_flight: Option<LifecycleOp>,
}

/// Serializes lifecycle operations on one container
#[derive(Debug)]
pub struct OpGate {
    serial: SerialLock<()>,
    in_flight: Mutex<Option<LifecycleOp>>,
}

impl OpGate {
    pub fn new() -> Self {
        Self {
            serial: SerialLock::new(()),
            in_flight: Mutex::new(None),
        }
    }

    /// Enter the gate, waiting for whatever operation currently holds it
    pub async fn enter(&self, op: LifecycleOp) -> OpGuard<'_> {
        let serial = self.serial.lock().await;
        *self.in_flight.lock() = Some(op);
        OpGuard {
            gate: self,
            _serial: serial,
        }
    }

    /// Enter without waiting; refusal names the operation in flight
    pub fn try_enter(&self, op: LifecycleOp) -> Result<OpGuard<'_>, Busy> {
        match self.serial.try_lock() {
            Ok(serial) => {
                *self.in_flight.lock() = Some(op);
                Ok(OpGuard {
                    gate: self,
                    _serial: serial,
                })
            }
            Err(_) => Err(Busy {
                in_flight: *self.in_flight.lock(),
            }),
        }
    }

    /// The operation currently holding the container, if any
    pub fn in_flight(&self) -> Option<LifecycleOp> {
        *self.in_flight.lock()
    }
}

impl Default for OpGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the gate when dropped
#[derive(Debug)]
pub struct OpGuard<'a> {
    gate: &'a OpGate,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        *self.gate.in_flight.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kill_refuses_to_queue_behind_stop() {
        let gate = OpGate::new();

        let stop = gate.enter(LifecycleOp::Stop).await;
        assert_eq!(gate.in_flight(), Some(LifecycleOp::Stop));

        // Kill does not wait; the refusal names the stop in flight
        let busy = gate.try_enter(LifecycleOp::Kill).unwrap_err();
        assert_eq!(busy.in_flight, Some(LifecycleOp::Stop));
        assert!(busy.to_string().contains("stop"));

        drop(stop);
        assert_eq!(gate.in_flight(), None);
        let _kill = gate.try_enter(LifecycleOp::Kill).unwrap();
        assert_eq!(gate.in_flight(), Some(LifecycleOp::Kill));
    }

    #[tokio::test]
    async fn test_enter_waits_for_the_holder() {
        let gate = std::sync::Arc::new(OpGate::new());

        let start = gate.enter(LifecycleOp::Start).await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _guard = gate.enter(LifecycleOp::Stop).await;
                gate.in_flight()
            })
        };

        // The stop is parked until the start releases
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.in_flight(), Some(LifecycleOp::Start));

        drop(start);
        assert_eq!(waiter.await.unwrap(), Some(LifecycleOp::Stop));
    }
}
