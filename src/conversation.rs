//! # Conversation Collaborator Boundary
//!
//! The persistence/business layer is an external collaborator; this module
//! defines the narrow interface the call bridge consumes and an in-memory
//! implementation used standalone and in tests. Persisting patients,
//! caregivers, billing and alerting all live behind this seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppResult;

/// Minimal patient view the bridge needs (identity only).
#[derive(Debug, Clone)]
pub struct Patient {
    pub id: String,
    pub name: String,
}

/// Reference to a conversation record owned by the collaborator.
#[derive(Debug, Clone)]
pub struct ConversationRef {
    pub id: String,
    pub patient_id: Option<String>,
}

/// One persisted utterance.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Fields supplied when creating or updating a conversation record.
#[derive(Debug, Clone, Default)]
pub struct ConversationFields {
    pub channel_id: String,
    pub patient_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// The collaborator interface (spec'd at the boundary; persistence itself is
/// out of scope).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_patient_by_id(&self, id: &str) -> AppResult<Option<Patient>>;

    async fn create_or_update_conversation(
        &self,
        fields: ConversationFields,
    ) -> AppResult<ConversationRef>;

    async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> AppResult<()>;

    async fn mark_conversation_completed(
        &self,
        conversation_id: &str,
        end_time: DateTime<Utc>,
    ) -> AppResult<()>;
}

#[derive(Debug, Default)]
struct StoredConversation {
    channel_id: String,
    patient_id: Option<String>,
    messages: Vec<ConversationMessage>,
    completed_at: Option<DateTime<Utc>>,
}

/// In-memory implementation keyed by channel id; one conversation per
/// channel, matching the bridge's create-or-update semantics.
#[derive(Default)]
pub struct InMemoryConversationStore {
    patients: Mutex<HashMap<String, Patient>>,
    conversations: Mutex<HashMap<String, StoredConversation>>,
    by_channel: Mutex<HashMap<String, String>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a patient (tests and standalone runs).
    pub fn insert_patient(&self, patient: Patient) {
        self.patients
            .lock()
            .unwrap()
            .insert(patient.id.clone(), patient);
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ConversationMessage> {
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn is_completed(&self, conversation_id: &str) -> bool {
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .map(|c| c.completed_at.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn find_patient_by_id(&self, id: &str) -> AppResult<Option<Patient>> {
        Ok(self.patients.lock().unwrap().get(id).cloned())
    }

    async fn create_or_update_conversation(
        &self,
        fields: ConversationFields,
    ) -> AppResult<ConversationRef> {
        let mut by_channel = self.by_channel.lock().unwrap();
        let mut conversations = self.conversations.lock().unwrap();

        let id = match by_channel.get(&fields.channel_id) {
            Some(existing) => existing.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                by_channel.insert(fields.channel_id.clone(), id.clone());
                id
            }
        };

        let entry = conversations.entry(id.clone()).or_default();
        entry.channel_id = fields.channel_id;
        if fields.patient_id.is_some() {
            entry.patient_id = fields.patient_id.clone();
        }
        debug!(conversation_id = %id, "conversation record upserted");

        Ok(ConversationRef {
            id,
            patient_id: entry.patient_id.clone(),
        })
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> AppResult<()> {
        if let Some(conv) = self
            .conversations
            .lock()
            .unwrap()
            .get_mut(conversation_id)
        {
            conv.messages.push(ConversationMessage {
                role: role.to_string(),
                content: content.to_string(),
                at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn mark_conversation_completed(
        &self,
        conversation_id: &str,
        end_time: DateTime<Utc>,
    ) -> AppResult<()> {
        if let Some(conv) = self
            .conversations
            .lock()
            .unwrap()
            .get_mut(conversation_id)
        {
            conv.completed_at = Some(end_time);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent_per_channel() {
        let store = InMemoryConversationStore::new();
        let a = store
            .create_or_update_conversation(ConversationFields {
                channel_id: "chan-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .create_or_update_conversation(ConversationFields {
                channel_id: "chan-1".into(),
                patient_id: Some("507f1f77bcf86cd799439011".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.patient_id.as_deref(), Some("507f1f77bcf86cd799439011"));
    }

    #[tokio::test]
    async fn test_append_and_complete() {
        let store = InMemoryConversationStore::new();
        let conv = store
            .create_or_update_conversation(ConversationFields {
                channel_id: "chan-2".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .append_message(&conv.id, "assistant", "Hello, how are you today?")
            .await
            .unwrap();
        store
            .append_message(&conv.id, "user", "I'm doing well")
            .await
            .unwrap();

        let messages = store.messages(&conv.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "assistant");

        store
            .mark_conversation_completed(&conv.id, Utc::now())
            .await
            .unwrap();
        assert!(store.is_completed(&conv.id));
    }

    #[tokio::test]
    async fn test_patient_lookup() {
        let store = InMemoryConversationStore::new();
        store.insert_patient(Patient {
            id: "507f1f77bcf86cd799439011".into(),
            name: "Ada".into(),
        });
        let found = store
            .find_patient_by_id("507f1f77bcf86cd799439011")
            .await
            .unwrap();
        assert!(found.is_some());
        assert!(store.find_patient_by_id("missing").await.unwrap().is_none());
    }
}
