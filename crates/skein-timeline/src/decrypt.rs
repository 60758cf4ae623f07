//! Decryption hook applied to events after a read.
//!
//! Decryption runs in two phases: [`Decryptor::prepare`] loads key material
//! while the read transaction is still open, then [`Decryptor::decrypt_event`]
//! runs outside of it. Failures degrade a single entry and never fail the read.

use std::collections::HashMap;

use async_trait::async_trait;
use skein_store::{ReadTxn, StoreResult};
use skein_types::{RoomId, TimelineEvent};

use crate::entry::TimelineEntry;
use crate::error::DecryptError;

/// Decryption status of one event entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DecryptionState {
    /// Plaintext event.
    #[default]
    NotEncrypted,
    /// Encrypted and not (yet) decrypted.
    Encrypted,
    /// Decrypted payload replacing the encrypted envelope.
    Decrypted {
        event_type: String,
        content: serde_json::Value,
    },
    /// Decryption was attempted and failed.
    Failed(DecryptError),
}

/// Plaintext recovered from an encrypted event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedPayload {
    pub event_type: String,
    pub content: serde_json::Value,
}

/// Key material loaded for one batch of entries, keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct DecryptionPreparation {
    pub keys: HashMap<String, Vec<u8>>,
}

impl DecryptionPreparation {
    pub fn key(&self, session_id: &str) -> Option<&[u8]> {
        self.keys.get(session_id).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Session id of an encrypted event, from `content.session_id`.
pub fn session_id(event: &TimelineEvent) -> Option<&str> {
    event.content.get("session_id").and_then(|v| v.as_str())
}

#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Load the keys needed for `entries` inside the read transaction.
    ///
    /// The default looks up one room key per distinct session id.
    fn prepare(
        &self,
        txn: &ReadTxn<'_>,
        room: &RoomId,
        entries: &[TimelineEntry],
    ) -> StoreResult<DecryptionPreparation> {
        let mut preparation = DecryptionPreparation::default();
        for entry in entries {
            let Some(event) = entry.as_event().map(|e| &e.event) else {
                continue;
            };
            if !event.is_encrypted() {
                continue;
            }
            let Some(session) = session_id(event) else {
                continue;
            };
            if preparation.keys.contains_key(session) {
                continue;
            }
            if let Some(key) = txn.room_key(room, session)? {
                preparation.keys.insert(session.to_string(), key);
            }
        }
        Ok(preparation)
    }

    /// Decrypt a single event with previously loaded keys.
    async fn decrypt_event(
        &self,
        preparation: &DecryptionPreparation,
        event: &TimelineEvent,
    ) -> Result<DecryptedPayload, DecryptError>;
}

/// Decrypt every still-encrypted event entry in place.
///
/// Returns the number of entries that failed.
pub async fn decrypt_entries(
    decryptor: &dyn Decryptor,
    preparation: &DecryptionPreparation,
    entries: &mut [TimelineEntry],
) -> usize {
    let mut failed = 0;
    for entry in entries.iter_mut() {
        let TimelineEntry::Event(event_entry) = entry else {
            continue;
        };
        if event_entry.decryption != DecryptionState::Encrypted {
            continue;
        }
        event_entry.decryption = match decryptor.decrypt_event(preparation, &event_entry.event).await {
            Ok(payload) => DecryptionState::Decrypted {
                event_type: payload.event_type,
                content: payload.content,
            },
            Err(e) => {
                failed += 1;
                tracing::warn!(
                    event_id = %event_entry.event.event_id,
                    key = %event_entry.key,
                    error = %e,
                    "failed to decrypt event"
                );
                DecryptionState::Failed(e)
            }
        };
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EventEntry;
    use serde_json::json;
    use skein_store::TimelineStore;
    use skein_types::{EntryIndex, EventId, FragmentId, SortKey};

    /// Ciphertext is `"<key>|<json payload>"`.
    struct PrefixDecryptor;

    #[async_trait]
    impl Decryptor for PrefixDecryptor {
        async fn decrypt_event(
            &self,
            preparation: &DecryptionPreparation,
            event: &TimelineEvent,
        ) -> Result<DecryptedPayload, DecryptError> {
            let session = session_id(event)
                .ok_or_else(|| DecryptError::MalformedPayload("no session_id".into()))?;
            let key = preparation
                .key(session)
                .ok_or_else(|| DecryptError::MissingKey(session.to_string()))?;
            let ciphertext = event.content["ciphertext"].as_str().unwrap_or_default();
            let key = std::str::from_utf8(key).unwrap();
            let plain = ciphertext
                .strip_prefix(&format!("{key}|"))
                .ok_or_else(|| DecryptError::Cipher("bad key".into()))?;
            let payload: serde_json::Value = serde_json::from_str(plain).unwrap();
            Ok(DecryptedPayload {
                event_type: payload["type"].as_str().unwrap_or_default().to_string(),
                content: payload["content"].clone(),
            })
        }
    }

    fn encrypted(id: &str, session: &str, ciphertext: &str, index: i64) -> TimelineEntry {
        let event = TimelineEvent::new(
            EventId::parse(id).unwrap(),
            "@amy:example.org",
            "m.room.encrypted",
            json!({"session_id": session, "ciphertext": ciphertext}),
        );
        TimelineEntry::Event(EventEntry::new(
            SortKey::new(FragmentId::FIRST, EntryIndex::new(index)),
            event,
        ))
    }

    #[tokio::test]
    async fn test_failures_degrade_single_entries() {
        let store = TimelineStore::in_memory().unwrap();
        let room = RoomId::parse("!crypt:example.org").unwrap();
        store
            .write(|txn| txn.put_room_key(&room, "s1", b"k1"))
            .unwrap();

        let plain = r#"{"type":"m.room.message","content":{"body":"hello"}}"#;
        let mut entries = vec![
            encrypted("$ok", "s1", &format!("k1|{plain}"), 0),
            encrypted("$nokey", "s2", &format!("k2|{plain}"), 1),
            encrypted("$wrong", "s1", &format!("k9|{plain}"), 2),
        ];

        let decryptor = PrefixDecryptor;
        let preparation = store.read(|txn| decryptor.prepare(txn, &room, &entries)).unwrap();
        assert_eq!(preparation.keys.len(), 1);

        let failed = decrypt_entries(&decryptor, &preparation, &mut entries).await;
        assert_eq!(failed, 2);

        let states: Vec<_> = entries
            .iter()
            .map(|e| e.as_event().unwrap().decryption.clone())
            .collect();
        assert_eq!(
            states[0],
            DecryptionState::Decrypted {
                event_type: "m.room.message".into(),
                content: json!({"body": "hello"}),
            }
        );
        assert_eq!(states[1], DecryptionState::Failed(DecryptError::MissingKey("s2".into())));
        assert!(matches!(states[2], DecryptionState::Failed(DecryptError::Cipher(_))));
    }
}
