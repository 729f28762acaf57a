use serde::{Deserialize, Serialize};

/// Lifecycle state of a server-side upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Uploading,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl SessionStatus {
    /// Returns `true` for states no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Returns `true` while the session still accepts chunk acks.
    pub fn accepts_chunks(self) -> bool {
        matches!(self, Self::Created | Self::Uploading)
    }

    /// Position in the forward-only progression.
    ///
    /// `Cancelled` and `Expired` share the terminal rank with the other
    /// end states; they are reachable from any non-terminal state.
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Uploading => 1,
            Self::Completing => 2,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired => 3,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled | Self::Expired => true,
            Self::Completed | Self::Failed => self == Self::Completing,
            Self::Completing => self.accepts_chunks(),
            _ => next.rank() >= self.rank(),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Links returned for a published image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedLinks {
    pub url: String,
    pub markdown: String,
    pub html: String,
    pub bbcode: String,
}
