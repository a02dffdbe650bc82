//! Container health checking

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::events::EventType;
use crate::system::short_id;

use super::container::{ContainerState, HealthConfig, HealthStatus};
use super::engine::{ContainerEngine, ContainerHandle};

/// Translate the configured test into argv.
///
/// `["CMD", ...]` runs directly; `["CMD-SHELL", script]` goes through a
/// shell; a bare command string is shell-parsed.
pub(crate) fn test_argv(test: &[String]) -> Result<Vec<String>> {
    match test.first().map(String::as_str) {
        Some("CMD") => Ok(test[1..].to_vec()),
        Some("CMD-SHELL") => {
            let script = test[1..].join(" ");
            Ok(vec!["sh".into(), "-c".into(), script])
        }
        Some(_) if test.len() == 1 => {
            let parsed = shell_words::split(&test[0]).map_err(|e| {
                crate::error::DaemonError::invalid_argument(
                    "health_check",
                    format!("unparseable test command: {}", e),
                )
            })?;
            Ok(parsed)
        }
        _ => Ok(test.to_vec()),
    }
}

/// Run periodic health checks until the container leaves Running
pub(crate) fn spawn_checker(
    engine: Arc<ContainerEngine>,
    handle: Arc<ContainerHandle>,
    id: String,
    config: HealthConfig,
) {
    tokio::spawn(async move {
        let argv = match test_argv(&config.test) {
            Ok(argv) if !argv.is_empty() => argv,
            _ => {
                debug!("health checker for {} has no command, exiting", short_id(&id));
                return;
            }
        };

        let started = tokio::time::Instant::now();
        let mut failures = 0u32;
        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if handle.record.read().state != ContainerState::Running {
                return;
            }

            let healthy = match engine
                .exec_sync(
                    &id,
                    argv.clone(),
                    Some(Duration::from_secs(config.timeout.max(1))),
                )
                .await
            {
                Ok((exit_code, _, _)) => exit_code == 0,
                Err(_) => false,
            };

            // Failures inside the grace period never count
            let in_grace = started.elapsed() < Duration::from_secs(config.start_period);

            let new_status = if healthy {
                failures = 0;
                HealthStatus::Healthy
            } else if in_grace {
                HealthStatus::Starting
            } else {
                failures += 1;
                if failures >= config.retries {
                    HealthStatus::Unhealthy
                } else {
                    // Still counting; keep the previous surfaced status
                    handle.record.read().health_status
                }
            };

            let changed = {
                let mut record = handle.record.write();
                if record.state != ContainerState::Running {
                    return;
                }
                let changed = record.health_status != new_status;
                record.health_status = new_status;
                if changed {
                    let _ = engine.persist(&record);
                }
                changed
            };

            if changed {
                info!(
                    "container {} health is now {:?}",
                    short_id(&id),
                    new_status
                );
                engine.events().publish(
                    crate::events::EventRecord::new(EventType::Container, "health_status", id.as_str())
                        .with_attribute("status", format!("{:?}", new_status).to_lowercase()),
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_cmd() {
        let argv = test_argv(&["CMD".into(), "curl".into(), "-f".into(), "http://x".into()])
            .unwrap();
        assert_eq!(argv, vec!["curl", "-f", "http://x"]);
    }

    #[test]
    fn test_argv_cmd_shell() {
        let argv = test_argv(&["CMD-SHELL".into(), "exit 0".into()]).unwrap();
        assert_eq!(argv, vec!["sh", "-c", "exit 0"]);
    }

    #[test]
    fn test_argv_bare_string() {
        let argv = test_argv(&["curl -f http://localhost/".into()]).unwrap();
        assert_eq!(argv, vec!["curl", "-f", "http://localhost/"]);
    }
}
