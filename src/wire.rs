//! Event signing and sealed-sender wrapping.
//!
//! Account identities are secp256k1 keypairs; transport events carry
//! BIP-340 schnorr signatures over their content-addressed id. Gift wraps
//! (kind 1059) seal a [`Rumor`] to a recipient pubkey with ECIES and are
//! signed by a throwaway key so the outer event reveals nothing about the
//! sender.

use base64::Engine as _;
use rand::rngs::OsRng;
use secp256k1::{Keypair, Parity, SecretKey, XOnlyPublicKey, SECP256K1};

use crate::error::CoreError;
use crate::types::{compute_event_id, kind, PublicKey, RelayEvent, Rumor, Timestamp};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// A secp256k1 account keypair, normalized so the public key has even
/// parity (x-only keys imply even y).
#[derive(Clone)]
pub struct AccountKeys {
    keypair: Keypair,
    public_key: PublicKey,
}

impl AccountKeys {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut OsRng);
        Self::from_secret(secret)
    }

    /// Import from a 64-char hex secret. Fails with `InvalidInput` on
    /// malformed material.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|_| CoreError::invalid_input("secret key is not valid hex"))?;
        if bytes.len() != 32 {
            return Err(CoreError::invalid_input("secret key must be 32 bytes"));
        }
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| CoreError::invalid_input("secret key is out of range"))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(mut secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, &secret);
        if keypair.x_only_public_key().1 == Parity::Odd {
            secret = secret.negate();
        }
        let keypair = Keypair::from_secret_key(SECP256K1, &secret);
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key: PublicKey::from_bytes(&xonly.serialize()),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Export the raw secret as hex. Handle with care; callers are expected
    /// to hand this straight to OS keychain storage.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_key().secret_bytes())
    }

    /// Sign a rumor's fields into a full transport event.
    pub fn sign_event(
        &self,
        created_at: Timestamp,
        event_kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> RelayEvent {
        let id = compute_event_id(&self.public_key, created_at, event_kind, &tags, &content);
        let sig = SECP256K1.sign_schnorr(id.as_hex().as_bytes(), &self.keypair);
        RelayEvent {
            id,
            pubkey: self.public_key.clone(),
            created_at,
            kind: event_kind,
            tags,
            content,
            sig: hex::encode(sig.to_byte_array()),
        }
    }

    fn secret_bytes(&self) -> [u8; 32] {
        self.keypair.secret_key().secret_bytes()
    }
}

impl std::fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKeys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Verify a transport event: id must match the canonical serialization and
/// the signature must verify against the event pubkey.
pub fn verify_event(event: &RelayEvent) -> Result<(), CoreError> {
    let expected = compute_event_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    if expected != event.id {
        return Err(CoreError::invalid_input("event id does not match content"));
    }

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|_| CoreError::invalid_input("malformed event signature"))?;
    let sig = secp256k1::schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|_| CoreError::invalid_input("malformed event signature"))?;
    let pubkey = XOnlyPublicKey::from_slice(&event.pubkey.to_bytes())
        .map_err(|_| CoreError::invalid_input("malformed event pubkey"))?;

    SECP256K1
        .verify_schnorr(&sig, event.id.as_hex().as_bytes(), &pubkey)
        .map_err(|_| CoreError::invalid_input("event signature verification failed"))
}

/// Seal a rumor to `recipient` inside a kind-1059 gift wrap.
///
/// The wrap is signed by a single-use throwaway key and timestamped with
/// up to two days of backdating jitter so outer metadata leaks neither
/// sender nor exact send time.
pub fn seal_gift(rumor: &Rumor, recipient: &PublicKey) -> Result<RelayEvent, CoreError> {
    let plaintext = serde_json::to_vec(rumor)
        .map_err(|e| CoreError::invalid_input(format!("rumor serialization: {e}")))?;

    let mut recipient_sec1 = vec![0x02];
    recipient_sec1.extend_from_slice(&recipient.to_bytes());
    let ciphertext = ecies::encrypt(&recipient_sec1, &plaintext)
        .map_err(|e| CoreError::invalid_input(format!("gift wrap sealing: {e}")))?;

    let throwaway = AccountKeys::generate();
    let jitter = (rand::random::<u32>() % 172_800) as i64;
    let tags = vec![vec!["p".to_string(), recipient.as_hex().to_string()]];
    Ok(throwaway.sign_event(
        Timestamp(Timestamp::now().as_secs() - jitter),
        kind::GIFT_WRAP,
        tags,
        BASE64.encode(ciphertext),
    ))
}

/// Open a kind-1059 gift wrap addressed to us. Returns the inner rumor.
pub fn unseal_gift(wrap: &RelayEvent, keys: &AccountKeys) -> Result<Rumor, CoreError> {
    if wrap.kind != kind::GIFT_WRAP {
        return Err(CoreError::invalid_input(format!(
            "expected gift wrap, got kind {}",
            wrap.kind
        )));
    }

    let ciphertext = BASE64
        .decode(&wrap.content)
        .map_err(|_| CoreError::invalid_input("gift wrap content is not valid base64"))?;
    let plaintext = ecies::decrypt(&keys.secret_bytes(), &ciphertext)
        .map_err(|_| CoreError::invalid_input("gift wrap is not addressed to this account"))?;

    let rumor: Rumor = serde_json::from_slice(&plaintext)
        .map_err(|_| CoreError::invalid_input("gift wrap payload is not a rumor"))?;
    if !rumor.verify_id() {
        return Err(CoreError::invalid_input("inner rumor id does not verify"));
    }
    Ok(rumor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_round_trips_through_hex() {
        let keys = AccountKeys::generate();
        let restored = AccountKeys::from_secret_hex(&keys.secret_hex()).unwrap();
        assert_eq!(keys.public_key(), restored.public_key());
    }

    #[test]
    fn malformed_secret_is_rejected() {
        assert!(AccountKeys::from_secret_hex("not-hex").is_err());
        assert!(AccountKeys::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn signed_event_verifies() {
        let keys = AccountKeys::generate();
        let event = keys.sign_event(Timestamp::now(), kind::CHAT, vec![], "hi".into());
        verify_event(&event).unwrap();
    }

    #[test]
    fn tampered_event_fails_verification() {
        let keys = AccountKeys::generate();
        let mut event = keys.sign_event(Timestamp::now(), kind::CHAT, vec![], "hi".into());
        event.content = "bye".into();
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn gift_wrap_round_trip() {
        let sender = AccountKeys::generate();
        let recipient = AccountKeys::generate();
        let rumor = Rumor::new(
            sender.public_key().clone(),
            Timestamp::now(),
            kind::WELCOME,
            vec![],
            "welcome payload".into(),
        );

        let wrap = seal_gift(&rumor, recipient.public_key()).unwrap();
        assert_eq!(wrap.kind, kind::GIFT_WRAP);
        // Outer pubkey is a throwaway, not the sender.
        assert_ne!(&wrap.pubkey, sender.public_key());

        let opened = unseal_gift(&wrap, &recipient).unwrap();
        assert_eq!(opened, rumor);
    }

    #[test]
    fn gift_wrap_for_someone_else_fails() {
        let sender = AccountKeys::generate();
        let recipient = AccountKeys::generate();
        let eavesdropper = AccountKeys::generate();
        let rumor = Rumor::new(
            sender.public_key().clone(),
            Timestamp::now(),
            kind::WELCOME,
            vec![],
            "secret".into(),
        );

        let wrap = seal_gift(&rumor, recipient.public_key()).unwrap();
        assert!(unseal_gift(&wrap, &eavesdropper).is_err());
    }
}
