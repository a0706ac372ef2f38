//! Attendance mode: who answers a conversation right now.
//!
//! The mode and the assigned operator are one value so an `ai` conversation
//! can never carry an operator and a `hybrid` one behaves by its assignment.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Conversation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Attendance {
    /// Automation answers.
    Ai,
    /// An operator answers; automation is silent.
    Human { assigned_to: Option<String> },
    /// Automation answers until an operator is assigned.
    Hybrid { assigned_to: Option<String> },
}

impl Default for Attendance {
    fn default() -> Self {
        Self::Ai
    }
}

impl Attendance {
    /// Rebuild from the two stored columns. Unknown modes fall back to `ai`.
    pub fn from_parts(mode: &str, assigned_to: Option<String>) -> Self {
        let assigned_to = assigned_to.filter(|a| !a.is_empty());
        match mode {
            "human" => Self::Human { assigned_to },
            "hybrid" => Self::Hybrid { assigned_to },
            _ => Self::Ai,
        }
    }

    pub fn mode_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Human { .. } => "human",
            Self::Hybrid { .. } => "hybrid",
        }
    }

    pub fn assigned_to(&self) -> Option<&str> {
        match self {
            Self::Ai => None,
            Self::Human { assigned_to } | Self::Hybrid { assigned_to } => assigned_to.as_deref(),
        }
    }

    /// Whether automation may answer in this mode.
    pub fn is_automated(&self) -> bool {
        match self {
            Self::Ai => true,
            Self::Human { .. } => false,
            Self::Hybrid { assigned_to } => assigned_to.is_none(),
        }
    }

    /// Explicit operator takeover.
    pub fn take_over(&self, operator: Option<String>) -> Self {
        let assigned_to = operator
            .filter(|o| !o.is_empty())
            .or_else(|| self.assigned_to().map(String::from));
        Self::Human { assigned_to }
    }

    /// Escalation requested by a flow; keeps any existing assignment.
    pub fn transfer_to_human(&self) -> Self {
        Self::Human {
            assigned_to: self.assigned_to().map(String::from),
        }
    }

    /// Takeover inferred from an outgoing message this system did not send.
    ///
    /// Returns `None` when the conversation is already under human control.
    pub fn infer_takeover(&self) -> Option<Self> {
        if self.is_automated() {
            Some(self.transfer_to_human())
        } else {
            None
        }
    }

    /// "Return to AI" or a flow `transfer_to_ai`; clears the assignment.
    pub fn return_to_ai(&self) -> Self {
        Self::Ai
    }
}

/// Decide whether an incoming message on this conversation runs automation.
///
/// False when a human owns the conversation, or when the bot itself spoke
/// within `anti_loop_secs` (an echo of our own reply must not trigger another).
pub fn should_auto_process(conversation: &Conversation, now: DateTime<Utc>, anti_loop_secs: i64) -> bool {
    if !conversation.attendance.is_automated() {
        return false;
    }
    match conversation.bot_state.last_bot_message_at {
        Some(last) if anti_loop_secs > 0 => now - last >= Duration::seconds(anti_loop_secs),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BotState, ConversationStatus};

    fn conversation(attendance: Attendance) -> Conversation {
        Conversation {
            id: "c1".into(),
            tenant_id: "t1".into(),
            instance_id: "i1".into(),
            contact_id: "k1".into(),
            status: ConversationStatus::Open,
            attendance,
            department: None,
            unread_count: 0,
            bot_state: BotState::default(),
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(Attendance::from_parts("ai", Some("op".into())), Attendance::Ai);
        assert_eq!(
            Attendance::from_parts("human", Some(String::new())),
            Attendance::Human { assigned_to: None }
        );
        assert_eq!(Attendance::from_parts("garbage", None), Attendance::Ai);
    }

    #[test]
    fn test_gate_exclusivity() {
        assert!(Attendance::Ai.is_automated());
        assert!(!Attendance::Human { assigned_to: None }.is_automated());
        assert!(Attendance::Hybrid { assigned_to: None }.is_automated());
        assert!(!Attendance::Hybrid {
            assigned_to: Some("ana".into())
        }
        .is_automated());
    }

    #[test]
    fn test_takeover_and_return() {
        let human = Attendance::Ai.take_over(Some("ana".into()));
        assert_eq!(human.assigned_to(), Some("ana"));
        assert!(!human.is_automated());

        let back = human.return_to_ai();
        assert_eq!(back, Attendance::Ai);
        assert_eq!(back.assigned_to(), None);
    }

    #[test]
    fn test_inferred_takeover_only_from_automated() {
        assert_eq!(
            Attendance::Ai.infer_takeover(),
            Some(Attendance::Human { assigned_to: None })
        );
        assert_eq!(Attendance::Human { assigned_to: None }.infer_takeover(), None);
    }

    #[test]
    fn test_anti_loop_window() {
        let now = Utc::now();
        let mut conv = conversation(Attendance::Ai);
        assert!(should_auto_process(&conv, now, 5));

        conv.bot_state.last_bot_message_at = Some(now - Duration::seconds(2));
        assert!(!should_auto_process(&conv, now, 5));

        conv.bot_state.last_bot_message_at = Some(now - Duration::seconds(6));
        assert!(should_auto_process(&conv, now, 5));
    }

    #[test]
    fn test_human_never_auto_processes() {
        let conv = conversation(Attendance::Human { assigned_to: None });
        assert!(!should_auto_process(&conv, Utc::now(), 0));
    }
}
