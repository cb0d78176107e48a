//! Fault-injection port for the plan executor.
//!
//! The executor calls [`FaultInjector::hit`] at named points around each
//! task's persist and apply steps. Production wiring uses [`NoopInjector`];
//! tests install an injector that fails or kills at a chosen point. The
//! port is always passed in explicitly, never a process-global.

use crate::error::{LatticeError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Notify;

/// What an injected fault does to the executing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Task fails; its compensation runs and the plan ends ERROR.
    Fail,
    /// Execution stops dead, as if the orchestrator process was killed.
    /// No compensation runs and no state transition is persisted.
    Kill,
}

/// Outcome of consulting the injector at a point.
pub enum FaultCheck {
    Proceed,
    Inject(FaultAction),
}

/// Injection port consulted at named execution points. The executor hits
/// `"before:{task label}"` and `"after:{task label}"` around every leaf
/// task, e.g. `"before:start rg1-rn2"`.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn hit(&self, point: &str) -> FaultCheck;
}

/// Production default: never injects.
#[derive(Debug, Default)]
pub struct NoopInjector;

#[async_trait]
impl FaultInjector for NoopInjector {
    async fn hit(&self, _point: &str) -> FaultCheck {
        FaultCheck::Proceed
    }
}

/// Test injector that triggers on the nth hit of one named point.
#[derive(Debug)]
pub struct TriggerInjector {
    point: String,
    action: FaultAction,
    /// Hits of the point remaining before the fault fires.
    remaining: AtomicU32,
    /// Fire at most once.
    armed: std::sync::atomic::AtomicBool,
}

impl TriggerInjector {
    /// Fire `action` the first time `point` is hit.
    pub fn once(point: impl Into<String>, action: FaultAction) -> Self {
        Self::nth(point, action, 1)
    }

    /// Fire `action` on the nth (1-based) hit of `point`.
    pub fn nth(point: impl Into<String>, action: FaultAction, n: u32) -> Self {
        Self {
            point: point.into(),
            action,
            remaining: AtomicU32::new(n),
            armed: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl FaultInjector for TriggerInjector {
    async fn hit(&self, point: &str) -> FaultCheck {
        if point != self.point || !self.armed.load(Ordering::SeqCst) {
            return FaultCheck::Proceed;
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.armed.store(false, Ordering::SeqCst);
            return FaultCheck::Inject(self.action);
        }
        FaultCheck::Proceed
    }
}

/// Test injector that parks execution at the first hit of one named point
/// until the test releases it, so the test can act while the plan is
/// mid-flight. Every other hit proceeds untouched.
#[derive(Debug)]
pub struct GateInjector {
    point: String,
    armed: std::sync::atomic::AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GateInjector {
    /// Park execution the first time `point` is hit.
    pub fn at(point: impl Into<String>) -> Self {
        Self {
            point: point.into(),
            armed: std::sync::atomic::AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Resolves once execution is parked at the gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the parked task proceed.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl FaultInjector for GateInjector {
    async fn hit(&self, point: &str) -> FaultCheck {
        if point == self.point && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        FaultCheck::Proceed
    }
}

/// Convert an injected failure into the error a genuine fault would raise.
pub fn injected_failure(point: &str) -> LatticeError {
    LatticeError::RemotePermanent {
        node: "injected".into(),
        reason: format!("injected fault at {}", point),
    }
}

/// Helper the executor uses: consult the injector, map a `Fail` action to a
/// task error, and report whether a `Kill` was injected.
pub async fn check(injector: &dyn FaultInjector, point: &str) -> Result<bool> {
    match injector.hit(point).await {
        FaultCheck::Proceed => Ok(false),
        FaultCheck::Inject(FaultAction::Fail) => Err(injected_failure(point)),
        FaultCheck::Inject(FaultAction::Kill) => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_always_proceeds() {
        let injector = NoopInjector;
        assert!(matches!(
            injector.hit("anything").await,
            FaultCheck::Proceed
        ));
    }

    #[tokio::test]
    async fn test_trigger_fires_once_at_nth_hit() {
        let injector = TriggerInjector::nth("p", FaultAction::Fail, 2);
        assert!(matches!(injector.hit("p").await, FaultCheck::Proceed));
        assert!(matches!(
            injector.hit("p").await,
            FaultCheck::Inject(FaultAction::Fail)
        ));
        // Single shot.
        assert!(matches!(injector.hit("p").await, FaultCheck::Proceed));
        // Other points unaffected.
        assert!(matches!(injector.hit("q").await, FaultCheck::Proceed));
    }

    #[tokio::test]
    async fn test_check_maps_fail_to_error() {
        let injector = TriggerInjector::once("p", FaultAction::Fail);
        let err = check(&injector, "p").await.unwrap_err();
        assert!(err.to_string().contains("injected fault at p"));

        let killer = TriggerInjector::once("p", FaultAction::Kill);
        assert!(check(&killer, "p").await.unwrap());
        // Disarmed after the shot.
        assert!(!check(&killer, "p").await.unwrap());
    }

    #[tokio::test]
    async fn test_gate_parks_until_released() {
        let gate = std::sync::Arc::new(GateInjector::at("p"));
        let hitter = std::sync::Arc::clone(&gate);
        let parked = tokio::spawn(async move { hitter.hit("p").await });

        gate.reached().await;
        assert!(!parked.is_finished());
        gate.release();
        assert!(matches!(parked.await.unwrap(), FaultCheck::Proceed));

        // Later hits pass straight through.
        assert!(matches!(gate.hit("p").await, FaultCheck::Proceed));
    }
}
