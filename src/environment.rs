//! Host environment signals and the level state derived from them.
//!
//! Signals are levels, not pulses: the registry remembers whether the host is
//! hidden and whether it is offline, and the desired pause state is recomputed
//! from both after every signal. Repeating a signal is harmless.

use std::fmt;

/// External lifecycle input consumed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    Hidden,
    Visible,
    Offline,
    Online,
    /// The host is going away; every connection is closed.
    Teardown,
}

impl fmt::Display for EnvironmentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hidden => "hidden",
            Self::Visible => "visible",
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Teardown => "teardown",
        })
    }
}

/// What the registry should do after a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    PauseAll,
    ResumeAll,
    CloseAll,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Environment {
    hidden: bool,
    offline: bool,
}

impl Environment {
    /// Connections should idle while the host is hidden or offline.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.hidden || self.offline
    }

    /// Record `signal` and return the directive for the new level.
    pub fn apply(&mut self, signal: EnvironmentSignal) -> Directive {
        match signal {
            EnvironmentSignal::Hidden => self.hidden = true,
            EnvironmentSignal::Visible => self.hidden = false,
            EnvironmentSignal::Offline => self.offline = true,
            EnvironmentSignal::Online => self.offline = false,
            EnvironmentSignal::Teardown => return Directive::CloseAll,
        }
        if self.paused() { Directive::PauseAll } else { Directive::ResumeAll }
    }
}
