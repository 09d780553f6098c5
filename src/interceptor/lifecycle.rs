use serde::Serialize;

/// Lifecycle of one deployed generation of the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  /// Installed, but another generation still serves requests
  Waiting,
  Activating,
  Active,
  /// Replaced or failed to install; serves nothing new
  Redundant,
}

impl LifecycleState {
  pub fn can_become(self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Installing, Waiting)
        | (Waiting, Activating)
        | (Activating, Active)
        | (Installing | Waiting | Activating | Active, Redundant)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::LifecycleState::*;

  #[test]
  fn test_forward_path_only() {
    assert!(Installing.can_become(Waiting));
    assert!(Waiting.can_become(Activating));
    assert!(Activating.can_become(Active));
    assert!(Active.can_become(Redundant));

    assert!(!Installing.can_become(Active));
    assert!(!Active.can_become(Waiting));
    assert!(!Redundant.can_become(Active));
  }
}
