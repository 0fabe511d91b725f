//! Chat services layered on the connection manager
//!
//! The connectivity core owns no persistence or cryptography. Both are
//! consumed through the [`MessageStore`] and [`MessageCipher`] traits, and
//! [`ChatService`] wires them to the manager's send path and incoming
//! messages.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::network::manager::ConnectionManager;
use crate::network::protocol::{unix_timestamp_millis, WireMessage};

/// A known user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    /// Reference to the user's public key, understood by the cipher
    pub public_key_ref: Option<String>,
}

/// A persisted chat message (content stays encrypted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: u64,
    pub key_ref: Option<String>,
}

/// Output of [`MessageCipher::encrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub key_material: String,
}

/// Message and user persistence
pub trait MessageStore: Send + Sync {
    /// Persists a message and returns the stored record
    fn save_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        timestamp: u64,
        key_ref: Option<&str>,
    ) -> ServiceResult<StoredMessage>;

    /// Looks up a user, failing with `UserNotFound`
    fn get_user_by_id(&self, id: &str) -> ServiceResult<UserRecord>;
}

/// End-to-end message encryption
pub trait MessageCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str, recipient_key_ref: Option<&str>) -> ServiceResult<EncryptedPayload>;

    fn decrypt(&self, payload: &EncryptedPayload, own_key_ref: Option<&str>) -> ServiceResult<String>;
}

/// Result of sending a chat message
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub record: StoredMessage,
    /// False when no connection to the recipient could be used
    pub delivered: bool,
}

/// What an incoming wire message turned into
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A chat message, decrypted and persisted
    Chat {
        record: StoredMessage,
        plaintext: String,
    },
    /// A contact request for the presentation layer
    FriendRequest {
        sender_id: String,
        sender_username: String,
        request_id: String,
    },
    /// An answer to one of our contact requests
    FriendResponse {
        sender_id: String,
        request_id: String,
        accepted: bool,
    },
    /// Not for this service
    Ignored,
}

/// Chat operations over a connection manager
pub struct ChatService {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn MessageStore>,
    cipher: Arc<dyn MessageCipher>,
    own_key_ref: Option<String>,
}

impl ChatService {
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<dyn MessageStore>,
        cipher: Arc<dyn MessageCipher>,
    ) -> Self {
        Self {
            manager,
            store,
            cipher,
            own_key_ref: None,
        }
    }

    /// Sets the key reference used to decrypt incoming messages
    pub fn with_own_key_ref(mut self, key_ref: impl Into<String>) -> Self {
        self.own_key_ref = Some(key_ref.into());
        self
    }

    fn local_id(&self) -> &str {
        self.manager.peer_id()
    }

    /// Encrypts, sends and persists a chat message
    ///
    /// The message is stored even when delivery fails.
    pub async fn send_chat_message(&self, recipient_id: &str, text: &str) -> ServiceResult<SentMessage> {
        let recipient = self.store.get_user_by_id(recipient_id)?;
        let encrypted = self
            .cipher
            .encrypt(text, recipient.public_key_ref.as_deref())?;

        let message = WireMessage::message(
            self.local_id(),
            recipient_id,
            encrypted.ciphertext.clone(),
            Some(encrypted.key_material.clone()),
        );
        let timestamp = match &message {
            WireMessage::Message { timestamp, .. } => *timestamp,
            _ => unix_timestamp_millis(),
        };

        let delivered = self.manager.send_message(recipient_id, &message).await;
        if !delivered {
            warn!("Message to {} was not delivered", recipient_id);
        }

        let record = self.store.save_message(
            self.local_id(),
            recipient_id,
            &encrypted.ciphertext,
            timestamp,
            Some(&encrypted.key_material),
        )?;
        Ok(SentMessage { record, delivered })
    }

    /// Sends a contact request and returns its id
    pub async fn send_friend_request(&self, recipient_id: &str, sender_username: &str) -> ServiceResult<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let message = WireMessage::FriendRequest {
            sender_id: self.local_id().to_string(),
            sender_username: sender_username.to_string(),
            recipient_id: recipient_id.to_string(),
            id: request_id.clone(),
            timestamp: unix_timestamp_millis(),
        };

        if !self.manager.send_message(recipient_id, &message).await {
            return Err(ServiceError::Undelivered(recipient_id.to_string()));
        }
        info!("Sent friend request {} to {}", request_id, recipient_id);
        Ok(request_id)
    }

    /// Answers a contact request
    pub async fn send_friend_response(
        &self,
        recipient_id: &str,
        request_id: &str,
        accepted: bool,
    ) -> ServiceResult<()> {
        let message = WireMessage::FriendResponse {
            sender_id: self.local_id().to_string(),
            recipient_id: recipient_id.to_string(),
            request_id: request_id.to_string(),
            accepted,
            timestamp: unix_timestamp_millis(),
        };

        if !self.manager.send_message(recipient_id, &message).await {
            return Err(ServiceError::Undelivered(recipient_id.to_string()));
        }
        Ok(())
    }

    /// Processes a message received from `peer_id`
    ///
    /// Messages whose claimed sender differs from the authenticated peer
    /// are ignored.
    pub fn handle_incoming(&self, peer_id: &str, message: WireMessage) -> ServiceResult<Incoming> {
        match message {
            WireMessage::Message {
                sender_id,
                recipient_id,
                content,
                key,
                timestamp,
            } => {
                if sender_id != peer_id {
                    warn!("Dropping message from {} claiming to be {}", peer_id, sender_id);
                    return Ok(Incoming::Ignored);
                }

                let payload = EncryptedPayload {
                    ciphertext: content,
                    key_material: key.clone().unwrap_or_default(),
                };
                let plaintext = self.cipher.decrypt(&payload, self.own_key_ref.as_deref())?;
                let record = self.store.save_message(
                    &sender_id,
                    &recipient_id,
                    &payload.ciphertext,
                    timestamp,
                    key.as_deref(),
                )?;
                debug!("Stored message {} from {}", record.id, sender_id);
                Ok(Incoming::Chat { record, plaintext })
            }
            WireMessage::FriendRequest {
                sender_id,
                sender_username,
                id,
                ..
            } if sender_id == peer_id => Ok(Incoming::FriendRequest {
                sender_id,
                sender_username,
                request_id: id,
            }),
            WireMessage::FriendResponse {
                sender_id,
                request_id,
                accepted,
                ..
            } if sender_id == peer_id => Ok(Incoming::FriendResponse {
                sender_id,
                request_id,
                accepted,
            }),
            other => {
                debug!("Chat service ignoring {} from {}", other.message_type(), peer_id);
                Ok(Incoming::Ignored)
            }
        }
    }
}
