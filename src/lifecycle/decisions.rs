//! Pure decision functions for the Sandbox Lifecycle Controller
//! (SPEC_FULL.md §4.4). No I/O, no side effects — the controller
//! (`super::controller`) evaluates these and then drives the effects.
//! Kept pure and free of timers so every boundary case is a plain unit
//! test, per SPEC_FULL.md §8.

use crate::models::SandboxStatus;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub window_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerDecision {
    /// Proceed with the spawn attempt. `reset` indicates the failure
    /// counter should be zeroed first.
    Proceed { reset: bool },
    Block { wait_ms: i64 },
}

/// SPEC_FULL.md §4.4.1. Boundary rule: at exactly the window, reset (`≥`).
pub fn circuit_breaker_decision(
    failure_count: u32,
    last_failure_at: Option<i64>,
    config: CircuitBreakerConfig,
    now: i64,
) -> CircuitBreakerDecision {
    let Some(last_failure_at) = last_failure_at else {
        return CircuitBreakerDecision::Proceed { reset: false };
    };
    let elapsed = now - last_failure_at;
    if failure_count > 0 && elapsed >= config.window_ms {
        CircuitBreakerDecision::Proceed { reset: true }
    } else if failure_count >= config.threshold && elapsed < config.window_ms {
        CircuitBreakerDecision::Block {
            wait_ms: config.window_ms - elapsed,
        }
    } else {
        CircuitBreakerDecision::Proceed { reset: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnConfig {
    pub cooldown_ms: i64,
    pub ready_wait_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnDecision {
    Restore,
    Skip { reason: &'static str },
    Wait,
    Spawn,
}

pub struct SpawnDecisionInput {
    pub status: SandboxStatus,
    pub created_at: i64,
    pub has_snapshot_image: bool,
    pub has_active_socket: bool,
    pub in_memory_spawning: bool,
    pub now: i64,
}

/// SPEC_FULL.md §4.4.2 — evaluated in the documented order.
pub fn spawn_decision(input: SpawnDecisionInput, config: SpawnConfig) -> SpawnDecision {
    use SandboxStatus::*;

    if input.has_snapshot_image && matches!(input.status, Stopped | Stale | Failed) {
        return SpawnDecision::Restore;
    }
    if matches!(input.status, Spawning | Connecting) {
        return SpawnDecision::Skip {
            reason: "already spawning/connecting",
        };
    }
    if input.status == Ready {
        if input.has_active_socket {
            return SpawnDecision::Skip {
                reason: "ready with active WS",
            };
        }
        if (input.now - input.created_at) < config.ready_wait_ms {
            return SpawnDecision::Wait;
        }
    }
    if (input.now - input.created_at) < config.cooldown_ms && !matches!(input.status, Failed | Stopped) {
        return SpawnDecision::Wait;
    }
    if input.in_memory_spawning {
        return SpawnDecision::Skip {
            reason: "spawn already in flight",
        };
    }
    SpawnDecision::Spawn
}

#[derive(Debug, Clone, Copy)]
pub struct InactivityConfig {
    pub timeout_ms: i64,
    pub extension_ms: i64,
    pub min_check_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivityDecision {
    /// Re-arm the alarm this many ms from now; no action taken.
    Schedule { next_check_ms: i64 },
    /// Extend the grace period and warn connected clients.
    Extend { next_check_ms: i64 },
    /// No clients connected after the timeout: stop and snapshot.
    Timeout,
}

pub struct InactivityInput {
    pub last_activity: Option<i64>,
    pub status: SandboxStatus,
    pub connected_client_count: usize,
    pub now: i64,
}

/// SPEC_FULL.md §4.4.5.
pub fn inactivity_decision(input: InactivityInput, config: InactivityConfig) -> InactivityDecision {
    if input.status.is_terminal()
        || input.last_activity.is_none()
        || !matches!(input.status, SandboxStatus::Ready | SandboxStatus::Running)
    {
        return InactivityDecision::Schedule {
            next_check_ms: config.min_check_ms,
        };
    }
    let last_activity = input.last_activity.unwrap();
    let inactive_time = input.now - last_activity;

    if inactive_time >= config.timeout_ms {
        if input.connected_client_count > 0 {
            InactivityDecision::Extend {
                next_check_ms: config.extension_ms,
            }
        } else {
            InactivityDecision::Timeout
        }
    } else {
        InactivityDecision::Schedule {
            next_check_ms: (config.timeout_ms - inactive_time).max(config.min_check_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDecision {
    Healthy,
    Stale,
}

/// SPEC_FULL.md §4.4.6. `last_heartbeat = None` means still warming up,
/// never stale.
pub fn heartbeat_decision(last_heartbeat: Option<i64>, stale_after_ms: i64, now: i64) -> HeartbeatDecision {
    match last_heartbeat {
        None => HeartbeatDecision::Healthy,
        Some(t) if now - t > stale_after_ms => HeartbeatDecision::Stale,
        Some(_) => HeartbeatDecision::Healthy,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmDecision {
    Skip,
    Spawn,
}

/// SPEC_FULL.md §4.4.7.
pub fn warm_decision(
    socket_open: bool,
    in_memory_spawning: bool,
    status: SandboxStatus,
) -> WarmDecision {
    if socket_open || in_memory_spawning || matches!(status, SandboxStatus::Spawning | SandboxStatus::Connecting) {
        WarmDecision::Skip
    } else {
        WarmDecision::Spawn
    }
}

/// SPEC_FULL.md §4.4.8 preconditions. `None` means ineligible; the `Some`
/// value says whether the pre-snapshot status needs to move to
/// `snapshotting` (it doesn't if already terminal — stickiness).
pub fn snapshot_eligible(
    provider_supports_snapshot: bool,
    has_provider_object_id: bool,
    session_exists: bool,
    current_status: SandboxStatus,
) -> bool {
    provider_supports_snapshot
        && has_provider_object_id
        && session_exists
        && current_status != SandboxStatus::Snapshotting
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: 3,
            window_ms: 5 * 60 * 1000,
        }
    }

    #[test]
    fn circuit_breaker_blocks_after_threshold() {
        let now = 1_000_000;
        let d = circuit_breaker_decision(3, Some(now - 1000), cb_config(), now);
        assert_eq!(
            d,
            CircuitBreakerDecision::Block {
                wait_ms: cb_config().window_ms - 1000
            }
        );
    }

    #[test]
    fn circuit_breaker_resets_exactly_at_window_boundary() {
        let now = 1_000_000;
        let d = circuit_breaker_decision(3, Some(now - cb_config().window_ms), cb_config(), now);
        assert_eq!(d, CircuitBreakerDecision::Proceed { reset: true });
    }

    #[test]
    fn circuit_breaker_proceeds_below_threshold() {
        let now = 1_000_000;
        let d = circuit_breaker_decision(2, Some(now - 1000), cb_config(), now);
        assert_eq!(d, CircuitBreakerDecision::Proceed { reset: false });
    }

    #[test]
    fn circuit_breaker_proceeds_with_no_prior_failure() {
        let d = circuit_breaker_decision(0, None, cb_config(), 1_000_000);
        assert_eq!(d, CircuitBreakerDecision::Proceed { reset: false });
    }

    fn spawn_config() -> SpawnConfig {
        SpawnConfig {
            cooldown_ms: 30_000,
            ready_wait_ms: 60_000,
        }
    }

    #[test]
    fn restore_wins_over_everything_when_snapshot_present() {
        let input = SpawnDecisionInput {
            status: SandboxStatus::Stopped,
            created_at: 0,
            has_snapshot_image: true,
            has_active_socket: false,
            in_memory_spawning: false,
            now: 100_000,
        };
        assert_eq!(spawn_decision(input, spawn_config()), SpawnDecision::Restore);
    }

    #[test]
    fn skip_when_already_spawning_or_connecting() {
        for status in [SandboxStatus::Spawning, SandboxStatus::Connecting] {
            let input = SpawnDecisionInput {
                status,
                created_at: 0,
                has_snapshot_image: false,
                has_active_socket: false,
                in_memory_spawning: false,
                now: 100_000,
            };
            assert!(matches!(
                spawn_decision(input, spawn_config()),
                SpawnDecision::Skip { .. }
            ));
        }
    }

    #[test]
    fn ready_with_socket_skips() {
        let input = SpawnDecisionInput {
            status: SandboxStatus::Ready,
            created_at: 0,
            has_snapshot_image: false,
            has_active_socket: true,
            in_memory_spawning: false,
            now: 100_000,
        };
        assert!(matches!(
            spawn_decision(input, spawn_config()),
            SpawnDecision::Skip { .. }
        ));
    }

    #[test]
    fn ready_without_socket_waits_inside_ready_wait_window() {
        let input = SpawnDecisionInput {
            status: SandboxStatus::Ready,
            created_at: 100_000,
            has_snapshot_image: false,
            has_active_socket: false,
            in_memory_spawning: false,
            now: 100_000 + 30_000,
        };
        assert_eq!(spawn_decision(input, spawn_config()), SpawnDecision::Wait);
    }

    #[test]
    fn cooldown_blocks_fresh_spawn_unless_failed_or_stopped() {
        let input = SpawnDecisionInput {
            status: SandboxStatus::Pending,
            created_at: 100_000,
            has_snapshot_image: false,
            has_active_socket: false,
            in_memory_spawning: false,
            now: 100_000 + 10_000,
        };
        assert_eq!(spawn_decision(input, spawn_config()), SpawnDecision::Wait);
    }

    #[test]
    fn failed_status_bypasses_cooldown() {
        let input = SpawnDecisionInput {
            status: SandboxStatus::Failed,
            created_at: 100_000,
            has_snapshot_image: false,
            has_active_socket: false,
            in_memory_spawning: false,
            now: 100_000 + 10_000,
        };
        assert_eq!(spawn_decision(input, spawn_config()), SpawnDecision::Spawn);
    }

    #[test]
    fn in_memory_spawning_skips_fresh_spawn() {
        let input = SpawnDecisionInput {
            status: SandboxStatus::Pending,
            created_at: 0,
            has_snapshot_image: false,
            has_active_socket: false,
            in_memory_spawning: true,
            now: 1_000_000,
        };
        assert!(matches!(
            spawn_decision(input, spawn_config()),
            SpawnDecision::Skip { .. }
        ));
    }

    fn inactivity_config() -> InactivityConfig {
        InactivityConfig {
            timeout_ms: 10 * 60 * 1000,
            extension_ms: 5 * 60 * 1000,
            min_check_ms: 30 * 1000,
        }
    }

    #[test]
    fn inactivity_extends_with_clients_connected() {
        let now = 10_000_000;
        let input = InactivityInput {
            last_activity: Some(now - 600_001),
            status: SandboxStatus::Ready,
            connected_client_count: 1,
            now,
        };
        assert_eq!(
            inactivity_decision(input, inactivity_config()),
            InactivityDecision::Extend {
                next_check_ms: 300_000
            }
        );
    }

    #[test]
    fn inactivity_times_out_with_no_clients() {
        let now = 10_000_000;
        let input = InactivityInput {
            last_activity: Some(now - 600_001),
            status: SandboxStatus::Ready,
            connected_client_count: 0,
            now,
        };
        assert_eq!(
            inactivity_decision(input, inactivity_config()),
            InactivityDecision::Timeout
        );
    }

    #[test]
    fn inactivity_schedules_when_terminal() {
        let input = InactivityInput {
            last_activity: Some(0),
            status: SandboxStatus::Stopped,
            connected_client_count: 3,
            now: 1_000_000,
        };
        assert_eq!(
            inactivity_decision(input, inactivity_config()),
            InactivityDecision::Schedule {
                next_check_ms: 30_000
            }
        );
    }

    #[test]
    fn heartbeat_stale_after_three_intervals() {
        assert_eq!(
            heartbeat_decision(Some(0), 90_000, 91_000),
            HeartbeatDecision::Stale
        );
        assert_eq!(
            heartbeat_decision(Some(0), 90_000, 90_000),
            HeartbeatDecision::Healthy
        );
    }

    #[test]
    fn heartbeat_healthy_while_warming_up() {
        assert_eq!(heartbeat_decision(None, 90_000, 1_000_000), HeartbeatDecision::Healthy);
    }

    #[test]
    fn warm_skips_when_socket_open() {
        assert_eq!(
            warm_decision(true, false, SandboxStatus::Pending),
            WarmDecision::Skip
        );
    }

    #[test]
    fn warm_spawns_when_idle() {
        assert_eq!(
            warm_decision(false, false, SandboxStatus::Stopped),
            WarmDecision::Spawn
        );
    }

    #[test]
    fn snapshot_ineligible_while_already_snapshotting() {
        assert!(!snapshot_eligible(true, true, true, SandboxStatus::Snapshotting));
    }

    #[test]
    fn snapshot_eligible_when_preconditions_met() {
        assert!(snapshot_eligible(true, true, true, SandboxStatus::Ready));
    }
}
