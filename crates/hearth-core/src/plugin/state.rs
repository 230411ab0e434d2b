//! Plugin lifecycle states and the transition graph.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Manifest accepted and registered, nothing instantiated.
    Discovered,
    /// Code unit instantiated, init not yet run.
    Loaded,
    /// Init entry point returned successfully.
    Initialized,
    /// Serving hooks and background work.
    Running,
    /// Inert after a failure; inspectable and reloadable.
    Error,
    /// Torn down by the operator.
    Disabled,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Loaded => "loaded",
            PluginState::Initialized => "initialized",
            PluginState::Running => "running",
            PluginState::Error => "error",
            PluginState::Disabled => "disabled",
        }
    }

    /// `loaded`, `initialized` or `running`: the record holds a live instance.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PluginState::Loaded | PluginState::Initialized | PluginState::Running
        )
    }

    /// `error` or `disabled`: the record may be replaced by re-registration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginState::Error | PluginState::Disabled)
    }

    /// Whether the lifecycle graph has an edge `self -> to`.
    pub fn can_transition_to(&self, to: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, to),
            (Discovered, Loaded | Error | Disabled)
                | (Loaded, Initialized | Error | Disabled)
                | (Initialized, Running | Error | Disabled)
                | (Running, Error | Disabled)
                | (Error, Loaded | Disabled)
                | (Disabled, Loaded | Error)
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded edge of a plugin's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PluginState,
    pub to: PluginState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Rejected edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{from} -> {to}")]
pub struct TransitionError {
    pub from: PluginState,
    pub to: PluginState,
}

/// Tracks the current state and a bounded transition history.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: PluginState,
    history: Vec<StateTransition>,
    max_history_size: usize,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::with_state(PluginState::Discovered)
    }

    pub fn with_state(state: PluginState) -> Self {
        Self {
            current: state,
            history: Vec::new(),
            max_history_size: 32,
        }
    }

    pub fn current(&self) -> PluginState {
        self.current
    }

    /// Apply `to` if the graph allows it.
    pub fn transition(
        &mut self,
        to: PluginState,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.current.can_transition_to(to) {
            return Err(TransitionError {
                from: self.current,
                to,
            });
        }

        self.history.push(StateTransition {
            from: self.current,
            to,
            at: Utc::now(),
            reason,
        });
        if self.history.len() > self.max_history_size {
            self.history.remove(0);
        }

        self.current = to;
        Ok(())
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// When the current state was entered, if it was entered by a transition.
    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|t| t.at)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateMachine(current={}, history_len={})",
            self.current,
            self.history.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PluginState::*;

    const ALL: [PluginState; 6] = [Discovered, Loaded, Initialized, Running, Error, Disabled];

    #[test]
    fn test_running_only_reaches_error_or_disabled() {
        for to in ALL {
            let expected = matches!(to, Error | Disabled);
            assert_eq!(Running.can_transition_to(to), expected, "running -> {}", to);
        }
    }

    #[test]
    fn test_error_and_disabled_reachable_from_first_four() {
        for from in [Discovered, Loaded, Initialized, Running] {
            assert!(from.can_transition_to(Error));
            assert!(from.can_transition_to(Disabled));
        }
    }

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new();
        sm.transition(Loaded, None).unwrap();
        sm.transition(Initialized, None).unwrap();
        sm.transition(Running, None).unwrap();
        assert_eq!(sm.current(), Running);
        assert_eq!(sm.history().len(), 3);
        assert_eq!(sm.history()[0].from, Discovered);
    }

    #[test]
    fn test_no_skipping() {
        let mut sm = StateMachine::new();
        let err = sm.transition(Running, None).unwrap_err();
        assert_eq!(err, TransitionError { from: Discovered, to: Running });
        assert_eq!(sm.current(), Discovered);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn test_reload_edge() {
        let mut sm = StateMachine::with_state(Error);
        sm.transition(Loaded, Some("reload".into())).unwrap();
        assert_eq!(sm.history()[0].reason.as_deref(), Some("reload"));
    }

    #[test]
    fn test_history_bounded() {
        let mut sm = StateMachine::with_state(Error);
        for _ in 0..40 {
            sm.transition(Loaded, None).unwrap();
            sm.transition(Error, None).unwrap();
        }
        assert_eq!(sm.history().len(), 32);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(Running.to_string(), "running");
        assert_eq!(serde_json::to_string(&Disabled).unwrap(), "\"disabled\"");
        let s: PluginState = serde_json::from_str("\"initialized\"").unwrap();
        assert_eq!(s, Initialized);
    }
}
