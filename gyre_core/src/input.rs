use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a run's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum InputOrigin {
    /// An initial seed, from a file when `path` is set.
    Seed { path: Option<PathBuf> },
    /// Freshly drawn from the session random generator.
    Fresh,
    /// Mutated from a saved corpus entry.
    Mutated { parent: usize },
    /// Recombined from two saved corpus entries.
    Spliced { parent: usize, donor: usize },
}

impl InputOrigin {
    pub fn parent(&self) -> Option<usize> {
        match self {
            InputOrigin::Mutated { parent } | InputOrigin::Spliced { parent, .. } => {
                Some(*parent)
            }
            _ => None,
        }
    }
}

impl fmt::Display for InputOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputOrigin::Seed { path: Some(path) } => write!(f, "seed {}", path.display()),
            InputOrigin::Seed { path: None } => write!(f, "seed"),
            InputOrigin::Fresh => write!(f, "fresh"),
            InputOrigin::Mutated { parent } => write!(f, "src:{parent:06}"),
            InputOrigin::Spliced { parent, donor } => write!(f, "src:{parent:06}+{donor:06}"),
        }
    }
}

/// An initial input served before any mutation happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub bytes: Vec<u8>,
    pub path: Option<PathBuf>,
}

impl Seed {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, path: None }
    }

    pub fn origin(&self) -> InputOrigin {
        InputOrigin::Seed {
            path: self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_display_and_parent() {
        assert_eq!(InputOrigin::Fresh.to_string(), "fresh");
        assert_eq!(InputOrigin::Mutated { parent: 3 }.to_string(), "src:000003");
        assert_eq!(
            InputOrigin::Spliced {
                parent: 1,
                donor: 12
            }
            .to_string(),
            "src:000001+000012"
        );
        assert_eq!(InputOrigin::Spliced { parent: 4, donor: 5 }.parent(), Some(4));
        assert_eq!(Seed::new(vec![]).origin().parent(), None);
    }
}
