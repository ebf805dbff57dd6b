//! Three-valued logic for facts that a probe may not be able to determine.

/// A boolean that may also be unknown.
///
/// Facts gathered by exec-ing into a pod are `Unknown` while the pod is not
/// running. Aggregate queries must keep `Unknown` apart from `False` so that
/// callers retry instead of acting on a guess.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TriState {
    True,
    False,
    #[default]
    Unknown,
}

impl TriState {
    pub fn is_true(self) -> bool {
        self == TriState::True
    }

    pub fn is_false(self) -> bool {
        self == TriState::False
    }

    pub fn is_unknown(self) -> bool {
        self == TriState::Unknown
    }
}

impl From<bool> for TriState {
    fn from(b: bool) -> Self {
        if b { TriState::True } else { TriState::False }
    }
}

impl std::fmt::Display for TriState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriState::True => write!(f, "true"),
            TriState::False => write!(f, "false"),
            TriState::Unknown => write!(f, "unknown"),
        }
    }
}
