use crate::error::NotificationError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

const ENVELOPE_CONTEXT: &[u8] = b"courier:push-envelope:v1";
const RECEIVER_ID_SIZE: usize = 8;
const NONCE_SIZE: usize = 24;

/// Server-encrypted push envelope: receiver id, nonce, then ciphertext. The
/// receiver id doubles as the encryption key id and is readable without the
/// key; it is also bound into the AEAD as associated data.
fn derive_envelope_key(key: &[u8]) -> Result<[u8; 32], NotificationError> {
    let hkdf = Hkdf::<Sha256>::new(None, key);
    let mut out = [0u8; 32];
    hkdf.expand(ENVELOPE_CONTEXT, &mut out)
        .map_err(|_| NotificationError::InvalidPayload("key derivation".to_string()))?;
    Ok(out)
}

fn read_receiver_id(envelope: &[u8]) -> Result<i64, NotificationError> {
    if envelope.len() < RECEIVER_ID_SIZE {
        return Err(NotificationError::InvalidPayload(
            "envelope too short".to_string(),
        ));
    }
    let mut raw = [0u8; RECEIVER_ID_SIZE];
    raw.copy_from_slice(&envelope[..RECEIVER_ID_SIZE]);
    Ok(i64::from_le_bytes(raw))
}

fn envelope_bytes(payload: &str) -> Result<Option<Vec<u8>>, NotificationError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|_| NotificationError::InvalidPayload("payload is not json".to_string()))?;
    let Some(encoded) = value.get("p") else {
        return Ok(None);
    };
    let Some(encoded) = encoded.as_str() else {
        return Err(NotificationError::InvalidPayload(
            "p is not a string".to_string(),
        ));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| NotificationError::InvalidPayload("p is not base64".to_string()))?;
    Ok(Some(bytes))
}

/// True when the payload carries a server-encrypted envelope.
pub fn is_encrypted_payload(payload: &str) -> Result<bool, NotificationError> {
    Ok(envelope_bytes(payload)?.is_some())
}

/// Reads the push receiver id from the leading envelope bytes, without the
/// encryption key. Plain payloads fall back to their `user_id` field; zero
/// means the payload does not name a receiver.
pub fn get_push_receiver_id(payload: &str) -> Result<i64, NotificationError> {
    if let Some(envelope) = envelope_bytes(payload)? {
        return read_receiver_id(&envelope);
    }
    let value: Value = serde_json::from_str(payload)
        .map_err(|_| NotificationError::InvalidPayload("payload is not json".to_string()))?;
    match value.get("user_id") {
        None => Ok(0),
        Some(Value::Number(number)) => number.as_i64().ok_or_else(|| {
            NotificationError::InvalidPayload("user_id out of range".to_string())
        }),
        Some(Value::String(raw)) => raw
            .parse::<i64>()
            .map_err(|_| NotificationError::InvalidPayload("user_id not a number".to_string())),
        Some(_) => Err(NotificationError::InvalidPayload(
            "user_id has wrong type".to_string(),
        )),
    }
}

/// Decrypts a server-encrypted push back into its inner JSON payload.
pub fn decrypt_push(
    encryption_key_id: i64,
    encryption_key: &[u8],
    payload: &str,
) -> Result<String, NotificationError> {
    let Some(envelope) = envelope_bytes(payload)? else {
        return Err(NotificationError::InvalidPayload(
            "payload is not encrypted".to_string(),
        ));
    };
    decrypt_push_envelope(encryption_key_id, encryption_key, &envelope)
}

pub(crate) fn decrypt_push_envelope(
    encryption_key_id: i64,
    encryption_key: &[u8],
    envelope: &[u8],
) -> Result<String, NotificationError> {
    let receiver_id = read_receiver_id(envelope)?;
    if receiver_id != encryption_key_id {
        return Err(NotificationError::WrongReceiver);
    }
    if envelope.len() < RECEIVER_ID_SIZE + NONCE_SIZE {
        return Err(NotificationError::InvalidPayload(
            "envelope too short".to_string(),
        ));
    }
    let nonce = &envelope[RECEIVER_ID_SIZE..RECEIVER_ID_SIZE + NONCE_SIZE];
    let ciphertext = &envelope[RECEIVER_ID_SIZE + NONCE_SIZE..];
    let key = derive_envelope_key(encryption_key)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| NotificationError::InvalidPayload("bad key".to_string()))?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &envelope[..RECEIVER_ID_SIZE],
            },
        )
        .map_err(|_| NotificationError::InvalidPayload("decryption failed".to_string()))?;
    String::from_utf8(plaintext)
        .map_err(|_| NotificationError::InvalidPayload("payload is not utf8".to_string()))
}

/// Builds an encrypted push payload addressed to `receiver_id`. The inverse
/// of `decrypt_push`, kept public so hosts and tests can produce payloads.
pub fn encrypt_push(
    receiver_id: i64,
    encryption_key: &[u8],
    payload: &str,
) -> Result<String, NotificationError> {
    let key = derive_envelope_key(encryption_key)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| NotificationError::InvalidPayload("bad key".to_string()))?;
    let mut envelope = Vec::with_capacity(RECEIVER_ID_SIZE + NONCE_SIZE + payload.len() + 16);
    envelope.extend_from_slice(&receiver_id.to_le_bytes());
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    envelope.extend_from_slice(&nonce);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: payload.as_bytes(),
                aad: &receiver_id.to_le_bytes(),
            },
        )
        .map_err(|_| NotificationError::InvalidPayload("encryption failed".to_string()))?;
    envelope.extend_from_slice(&ciphertext);
    Ok(format!("{{\"p\":\"{}\"}}", URL_SAFE_NO_PAD.encode(envelope)))
}

/// Parsed inner payload of a push. Unknown fields are tolerated: the server
/// is free to add them.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub loc_key: String,
    #[serde(default)]
    pub loc_args: Vec<String>,
    #[serde(default)]
    pub custom: PushCustom,
    #[serde(default)]
    pub date: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PushCustom {
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub from_id: Option<i64>,
    #[serde(default)]
    pub msg_id: Option<i64>,
    #[serde(default)]
    pub random_id: Option<i64>,
    #[serde(default)]
    pub max_id: Option<i64>,
    #[serde(default)]
    pub messages: Option<String>,
    #[serde(default)]
    pub announcement_id: Option<i32>,
    #[serde(default)]
    pub silent: Option<i32>,
    #[serde(default)]
    pub mention: Option<i32>,
}

impl PushPayload {
    pub fn parse(payload: &str) -> Result<Self, NotificationError> {
        serde_json::from_str(payload)
            .map_err(|_| NotificationError::InvalidPayload("malformed push".to_string()))
    }

    pub fn is_silent(&self) -> bool {
        self.custom.silent.unwrap_or(0) != 0
    }

    pub fn is_mention(&self) -> bool {
        self.custom.mention.unwrap_or(0) != 0
    }

    /// Message ids from a `messages.deleted` push, a comma separated list.
    pub fn deleted_message_ids(&self) -> Vec<i64> {
        let Some(raw) = self.custom.messages.as_deref() else {
            return Vec::new();
        };
        raw.split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect()
    }
}

/// Canonical action selected by a loc key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushSchema {
    /// A new-message push; the tag names the rendered message kind and binds
    /// positional loc args, starting with the sender name.
    Message { tag: &'static str },
    ReadHistory,
    MessagesDeleted,
    ContactRegistered,
    /// Recognized but carries no notification state.
    Ignored,
}

/// Parses a dotted loc key into its canonical action tag. Group-chat
/// variants under `chat.` share the direct-chat schemas.
pub fn convert_loc_key(loc_key: &str) -> Option<PushSchema> {
    let key = loc_key.strip_prefix("chat.").unwrap_or(loc_key);
    let schema = match key {
        "message.text" => PushSchema::Message { tag: "MESSAGE_TEXT" },
        "message.photo" => PushSchema::Message { tag: "MESSAGE_PHOTO" },
        "message.video" => PushSchema::Message { tag: "MESSAGE_VIDEO" },
        "message.document" => PushSchema::Message {
            tag: "MESSAGE_DOCUMENT",
        },
        "message.sticker" => PushSchema::Message {
            tag: "MESSAGE_STICKER",
        },
        "message.voice" => PushSchema::Message {
            tag: "MESSAGE_VOICE_NOTE",
        },
        "message.contact" => PushSchema::Message {
            tag: "MESSAGE_CONTACT",
        },
        "message.location" => PushSchema::Message {
            tag: "MESSAGE_LOCATION",
        },
        "message.game" => PushSchema::Message { tag: "MESSAGE_GAME" },
        "message.invoice" => PushSchema::Message {
            tag: "MESSAGE_INVOICE",
        },
        "message.announcement" => PushSchema::Message {
            tag: "MESSAGE_ANNOUNCEMENT",
        },
        "history.read" => PushSchema::ReadHistory,
        "messages.deleted" => PushSchema::MessagesDeleted,
        "contact.registered" => PushSchema::ContactRegistered,
        "session.revoked" => PushSchema::Ignored,
        "config.dc_changed" => PushSchema::Ignored,
        _ => return None,
    };
    Some(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = &[7u8; 32];

    #[test]
    fn envelope_roundtrip() {
        let inner = r#"{"loc_key":"message.text","loc_args":["alice","hi"]}"#;
        let push = encrypt_push(4242, KEY, inner).expect("encrypt");
        assert_eq!(get_push_receiver_id(&push).expect("receiver"), 4242);
        let decrypted = decrypt_push(4242, KEY, &push).expect("decrypt");
        assert_eq!(decrypted, inner);
    }

    #[test]
    fn rejects_wrong_receiver() {
        let push = encrypt_push(10, KEY, "{}").expect("encrypt");
        let err = decrypt_push(11, KEY, &push).unwrap_err();
        assert!(matches!(err, NotificationError::WrongReceiver));
    }

    #[test]
    fn detects_tampering() {
        let push = encrypt_push(10, KEY, r#"{"loc_key":"message.text"}"#).expect("encrypt");
        let value: Value = serde_json::from_str(&push).expect("json");
        let mut envelope = URL_SAFE_NO_PAD
            .decode(value["p"].as_str().expect("p"))
            .expect("decode");
        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        let tampered = format!("{{\"p\":\"{}\"}}", URL_SAFE_NO_PAD.encode(envelope));
        let err = decrypt_push(10, KEY, &tampered).unwrap_err();
        assert!(matches!(err, NotificationError::InvalidPayload(_)));
    }

    #[test]
    fn plain_payload_receiver_id() {
        assert_eq!(
            get_push_receiver_id(r#"{"user_id":99,"loc_key":"history.read"}"#).expect("receiver"),
            99
        );
        assert_eq!(
            get_push_receiver_id(r#"{"user_id":"77"}"#).expect("receiver"),
            77
        );
        assert_eq!(get_push_receiver_id("{}").expect("receiver"), 0);
        assert!(get_push_receiver_id("not json").is_err());
    }

    #[test]
    fn loc_key_table() {
        assert_eq!(
            convert_loc_key("message.text"),
            Some(PushSchema::Message { tag: "MESSAGE_TEXT" })
        );
        assert_eq!(
            convert_loc_key("chat.message.photo"),
            Some(PushSchema::Message { tag: "MESSAGE_PHOTO" })
        );
        assert_eq!(convert_loc_key("history.read"), Some(PushSchema::ReadHistory));
        assert_eq!(
            convert_loc_key("messages.deleted"),
            Some(PushSchema::MessagesDeleted)
        );
        assert_eq!(convert_loc_key("session.revoked"), Some(PushSchema::Ignored));
        assert_eq!(convert_loc_key("message.dance"), None);
    }

    #[test]
    fn payload_helpers() {
        let payload = PushPayload::parse(
            r#"{"loc_key":"messages.deleted","custom":{"chat_id":5,"messages":"3, 4,x,9"}}"#,
        )
        .expect("parse");
        assert_eq!(payload.deleted_message_ids(), vec![3, 4, 9]);
        assert!(!payload.is_silent());
        assert!(!payload.is_mention());
    }
}
