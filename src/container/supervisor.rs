//! Container process supervision
//!
//! Each running container has one owning supervisor task that awaits the
//! main-process exit, records it, and evaluates the restart policy. Restart
//! logic lives here so a crash recovers without an external orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::events::EventType;
use crate::system::short_id;

use super::container::{ContainerState, HealthStatus, RestartPolicy};
use super::engine::{ContainerEngine, ContainerHandle};
use super::health;

/// Restart backoff base and cap
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Spawn the supervisor for a freshly started container
pub(crate) fn spawn(engine: Arc<ContainerEngine>, handle: Arc<ContainerHandle>, id: String) {
    // Health checking rides along with supervision
    if let Some(health_config) = handle.record.read().config.health.clone() {
        health::spawn_checker(engine.clone(), handle.clone(), id.clone(), health_config);
    }

    tokio::spawn(async move {
        supervise(engine, handle, id).await;
    });
}

async fn supervise(engine: Arc<ContainerEngine>, handle: Arc<ContainerHandle>, id: String) {
    let exit = match engine.backend().wait(&id).await {
        Ok(exit) => exit,
        Err(e) => {
            // The backend lost track of the process; record the loss
            warn!("supervisor for {} lost its process: {}", short_id(&id), e);
            let mut record = handle.record.write();
            record.state = ContainerState::Stopped;
            record.exit_code = Some(255);
            record.finished_at = Some(Utc::now());
            record.dead = true;
            record.reason = Some("supervisor lost".into());
            let _ = engine.persist(&record);
            drop(record);
            let _ = handle.state_tx.send(ContainerState::Stopped);
            return;
        }
    };

    // Record the exit before anything else observes it
    let (policy, stop_requested, restart_count) = {
        let mut record = handle.record.write();
        record.state = ContainerState::Stopped;
        record.exit_code = Some(exit.exit_code);
        record.finished_at = Some(Utc::now());
        record.oom_killed = exit.oom_killed;
        record.pid = None;
        if record.config.health.is_some() {
            record.health_status = HealthStatus::None;
        }
        if exit.vm_lost {
            record.reason = Some("vm_lost".into());
        }
        let _ = engine.persist(&record);
        (
            record.config.restart_policy.clone(),
            record.stop_requested,
            record.restart_count,
        )
    };
    handle.log.flush();
    let _ = handle.state_tx.send(ContainerState::Stopped);

    info!(
        "container {} exited with {} (oom={})",
        short_id(&id),
        exit.exit_code,
        exit.oom_killed
    );
    engine.events().publish(
        crate::events::EventRecord::new(EventType::Container, "die", id.as_str())
            .with_attribute("exitCode", exit.exit_code.to_string()),
    );

    // Restart policy evaluation
    if exit.vm_lost || engine.restarts_suppressed() {
        debug!("restart suppressed for {} (vm lost)", short_id(&id));
        return;
    }

    // Only unless-stopped honors explicit-stop intent; always re-enters
    // Start unconditionally
    let should_restart = match policy {
        RestartPolicy::No => false,
        RestartPolicy::Always => true,
        RestartPolicy::UnlessStopped => !stop_requested,
        RestartPolicy::OnFailure { max } => exit.exit_code != 0 && restart_count < max,
    };
    if !should_restart {
        return;
    }

    // Exponential backoff keyed on how many starts have happened
    let exponent = restart_count.saturating_sub(1).min(10);
    let delay = std::cmp::min(BACKOFF_BASE * 2u32.saturating_pow(exponent), BACKOFF_CAP);
    debug!(
        "restarting {} in {:?} (attempt {})",
        short_id(&id),
        delay,
        restart_count + 1
    );
    tokio::time::sleep(delay).await;

    // Re-check after the sleep; removal, a concurrent start, or a freshly
    // opened suppression window wins, and a late explicit stop cancels the
    // unless-stopped restart
    if engine.restarts_suppressed() {
        return;
    }
    {
        let record = handle.record.read();
        if record.state != ContainerState::Stopped {
            return;
        }
        if record.config.restart_policy == RestartPolicy::UnlessStopped && record.stop_requested {
            return;
        }
    }

    let guard = handle.gate.enter(super::gate::LifecycleOp::Start).await;
    let result = engine.start_locked(&handle).await;
    drop(guard);

    if let Err(e) = result {
        warn!("restart of {} failed: {}", short_id(&id), e);
    }
}

/// Poll liveness for a container adopted after a daemon restart. The
/// original supervisor is gone; all we can observe is whether the process
/// still exists.
pub(crate) fn spawn_adoption_poller(
    engine: Arc<ContainerEngine>,
    handle: Arc<ContainerHandle>,
    id: String,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let (state, pid) = {
                let record = handle.record.read();
                (record.state, record.pid)
            };
            if !matches!(state, ContainerState::Running | ContainerState::Paused) {
                return;
            }

            let alive = engine
                .backend()
                .is_alive(&id, pid)
                .await
                .unwrap_or(false);
            if alive {
                continue;
            }

            info!("adopted container {} went away", short_id(&id));
            {
                let mut record = handle.record.write();
                record.state = ContainerState::Stopped;
                record.exit_code = Some(255);
                record.finished_at = Some(Utc::now());
                record.dead = true;
                record.reason = Some("supervisor lost".into());
                let _ = engine.persist(&record);
            }
            let _ = handle.state_tx.send(ContainerState::Stopped);
            engine.events().emit(EventType::Container, "die", &id);
            return;
        }
    });
}
