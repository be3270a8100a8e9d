//! Controller lifecycle states.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Initializing,
    MigrationCheck,
    Migrating,
    Connecting,
    Connected,
    Fallback,
    Ready,
    Error,
    Closed,
}

impl ControllerState {
    /// Whether `self → next` is a legal step. `Error` and `Closed` are
    /// reachable from anywhere.
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;
        match (self, next) {
            (_, Error | Closed) => true,
            (Initializing, MigrationCheck | Connecting) => true,
            (MigrationCheck, Migrating | Connecting) => true,
            (Migrating, Connecting) => true,
            (Connecting, Connected | Fallback) => true,
            (Error, Fallback) => true,
            (Connected | Fallback, Ready) => true,
            _ => false,
        }
    }

    pub fn is_ready(self) -> bool {
        self == ControllerState::Ready
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Initializing => "INITIALIZING",
            ControllerState::MigrationCheck => "MIGRATION_CHECK",
            ControllerState::Migrating => "MIGRATING",
            ControllerState::Connecting => "CONNECTING",
            ControllerState::Connected => "CONNECTED",
            ControllerState::Fallback => "FALLBACK",
            ControllerState::Ready => "READY",
            ControllerState::Error => "ERROR",
            ControllerState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ControllerState::*;

    #[test]
    fn happy_paths_are_legal() {
        let relational = [Initializing, MigrationCheck, Migrating, Connecting, Connected, Ready];
        let degraded = [Initializing, MigrationCheck, Connecting, Error, Fallback, Ready];
        for path in [&relational[..], &degraded[..]] {
            for step in path.windows(2) {
                assert!(step[0].can_transition_to(step[1]), "{} -> {}", step[0], step[1]);
            }
        }
    }

    #[test]
    fn ready_is_terminal_until_close() {
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Ready.can_transition_to(Fallback));
        assert!(Ready.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Ready));
    }

    #[test]
    fn display_matches_serde() {
        assert_eq!(MigrationCheck.to_string(), "MIGRATION_CHECK");
        assert_eq!(
            serde_json::to_value(MigrationCheck).unwrap(),
            serde_json::json!("MIGRATION_CHECK")
        );
    }
}
