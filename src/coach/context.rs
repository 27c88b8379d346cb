//! Session bootstrap and per-card context messages

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::config::CoachConfig;
use crate::protocol::ControlMessage;

/// The problem currently being studied
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCard {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ActiveCard {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: description.into(),
            topic: topic.into(),
            url: None,
        }
    }

    /// Text injected into the conversation when this card becomes active
    pub fn context_text(&self) -> String {
        format!(
            "The candidate is now working on: \"{}\". Problem: {}. Topic area: {}. \
             Listen to their explanation and provide guidance.",
            self.title, self.description, self.topic
        )
    }
}

/// Builds the control messages that set up and steer a session.
///
/// Card changes are only turned into messages while connected; a change
/// made while disconnected is kept as the current card but never queued.
#[derive(Debug)]
pub struct SessionContextManager {
    config: CoachConfig,
    card: Option<ActiveCard>,
}

impl SessionContextManager {
    pub fn new(config: CoachConfig) -> Self {
        Self { config, card: None }
    }

    pub fn card(&self) -> Option<&ActiveCard> {
        self.card.as_ref()
    }

    pub fn set_config(&mut self, config: CoachConfig) {
        self.config = config;
    }

    /// `session.update` sent once when a connection is established
    pub fn session_update(&self) -> ControlMessage {
        ControlMessage::session_update(&self.config)
    }

    /// Context for the current card, if one is set
    pub fn current_context(&self) -> Option<ControlMessage> {
        self.card
            .as_ref()
            .map(|card| ControlMessage::context_inject(card.context_text()))
    }

    /// Replace the active card. Returns the inject to send when `connected`.
    pub fn set_card(&mut self, card: ActiveCard, connected: bool) -> Option<ControlMessage> {
        self.card = Some(card);
        if connected {
            self.current_context()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_sum() -> ActiveCard {
        ActiveCard::new(
            "Two Sum",
            "Find two numbers adding up to target",
            "Hash Map",
        )
    }

    #[test]
    fn test_context_text() {
        assert_eq!(
            two_sum().context_text(),
            "The candidate is now working on: \"Two Sum\". Problem: Find two numbers adding up \
             to target. Topic area: Hash Map. Listen to their explanation and provide guidance."
        );
    }

    #[test]
    fn test_set_card_only_emits_when_connected() {
        let mut manager = SessionContextManager::new(CoachConfig::default());
        assert!(manager.current_context().is_none());

        assert!(manager.set_card(two_sum(), false).is_none());
        assert_eq!(manager.card().unwrap().title, "Two Sum");

        let b = ActiveCard::new("Valid Parentheses", "Match brackets", "Stack");
        match manager.set_card(b, true) {
            Some(ControlMessage::ContextInject { item }) => {
                assert!(item.text().contains("Valid Parentheses"));
                assert!(!item.text().contains("Two Sum"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_session_update_uses_config() {
        let config = CoachConfig {
            voice: "verse".to_string(),
            ..Default::default()
        };
        let manager = SessionContextManager::new(config);
        match manager.session_update() {
            ControlMessage::SessionUpdate { session } => assert_eq!(session.voice, "verse"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
