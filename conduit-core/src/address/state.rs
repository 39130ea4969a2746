use std::fmt::{self, Display};

/// The lifecycle of an address.
///
/// Neighbors move Init → Incomplete → Reachable as ARP resolves them, and
/// fall back to Init if six requests go unanswered. Local addresses move
/// Tentative → Preferred once duplicate address detection finds no one else
/// using them. Probe and Deprecated are accepted but nothing drives an
/// address into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init,
    Incomplete,
    Reachable,
    Probe,
    Tentative,
    Preferred,
    Deprecated,
}

impl State {
    /// Whether packets may be sent to or from an address in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Reachable | Self::Preferred)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Incomplete => "incomplete",
            Self::Reachable => "reachable",
            Self::Probe => "probe",
            Self::Tentative => "tentative",
            Self::Preferred => "preferred",
            Self::Deprecated => "deprecated",
        };
        f.write_str(name)
    }
}
