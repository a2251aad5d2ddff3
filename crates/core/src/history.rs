//! Tamper-evident purchase history.
//!
//! Every recorded transaction is chained to the user's previous one by a
//! SHA-256 entry hash and signed with an HMAC over that hash. The hash
//! covers only the immutable identity of the attempt (never the status),
//! so settling a pending transaction later does not break the chain.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::transaction::Transaction;
use crate::domain::user::UserId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub user_id: UserId,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ChainSigner {
    signing_key: Vec<u8>,
}

impl ChainSigner {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self { signing_key: signing_key.as_ref().to_vec() }
    }

    /// Fill in `prev_hash`, `entry_hash`, and `signature` on a transaction
    /// about to be recorded, linking it to the user's latest entry.
    pub fn seal(&self, transaction: &mut Transaction, prev_hash: Option<String>) {
        let entry_hash = hash_entry_material(transaction, prev_hash.as_deref());
        transaction.signature = Some(self.hmac_hex(entry_hash.as_bytes()));
        transaction.entry_hash = Some(entry_hash);
        transaction.prev_hash = prev_hash;
    }

    /// Walk a user's transactions oldest-first and re-derive every link.
    pub fn verify(&self, user_id: &UserId, entries: &[Transaction]) -> ChainVerification {
        let mut previous_hash: Option<String> = None;

        for (index, entry) in entries.iter().enumerate() {
            if entry.prev_hash != previous_hash {
                return failure(user_id, index, previous_hash, format!(
                    "previous hash mismatch at entry {}",
                    entry.id
                ));
            }

            let computed = hash_entry_material(entry, entry.prev_hash.as_deref());
            if entry.entry_hash.as_deref() != Some(computed.as_str()) {
                return failure(user_id, index, previous_hash, format!(
                    "entry hash mismatch at entry {}",
                    entry.id
                ));
            }

            let expected_signature = self.hmac_hex(computed.as_bytes());
            if entry.signature.as_deref() != Some(expected_signature.as_str()) {
                return failure(user_id, index, previous_hash, format!(
                    "signature mismatch at entry {}",
                    entry.id
                ));
            }

            previous_hash = Some(computed);
        }

        ChainVerification {
            user_id: user_id.clone(),
            valid: true,
            verified_entries: entries.len(),
            latest_hash: previous_hash,
            failure_reason: None,
        }
    }

    fn hmac_hex(&self, payload: &[u8]) -> String {
        let mut mac = match HmacSha256::new_from_slice(&self.signing_key) {
            Ok(mac) => mac,
            Err(_) => return sha256_hex(payload),
        };
        mac.update(payload);
        encode_hex(mac.finalize().into_bytes().as_slice())
    }
}

fn failure(
    user_id: &UserId,
    verified: usize,
    latest_hash: Option<String>,
    reason: String,
) -> ChainVerification {
    ChainVerification {
        user_id: user_id.clone(),
        valid: false,
        verified_entries: verified,
        latest_hash,
        failure_reason: Some(reason),
    }
}

fn hash_entry_material(transaction: &Transaction, prev_hash: Option<&str>) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        transaction.id,
        transaction.cart_id,
        transaction.user_id,
        transaction.amount,
        transaction.currency,
        transaction.reservation_token,
        transaction.created_at.to_rfc3339(),
        prev_hash.unwrap_or(""),
    );
    sha256_hex(material.as_bytes())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::ChainSigner;
    use crate::domain::cart::CartId;
    use crate::domain::transaction::Transaction;
    use crate::domain::user::UserId;
    use crate::ledger::ReservationToken;

    fn user() -> UserId {
        UserId("shopper@example.com".to_string())
    }

    fn sample_transaction(cart: &str, cents: i64) -> Transaction {
        Transaction::pending(
            CartId(cart.to_string()),
            user(),
            Decimal::new(cents, 2),
            "USD",
            ReservationToken::generate(),
        )
    }

    #[test]
    fn sealing_links_entries_into_a_chain() {
        let signer = ChainSigner::new("secret-key");
        let mut first = sample_transaction("cart-1", 40_00);
        let mut second = sample_transaction("cart-2", 12_50);

        signer.seal(&mut first, None);
        signer.seal(&mut second, first.entry_hash.clone());

        assert!(first.prev_hash.is_none());
        assert_eq!(second.prev_hash, first.entry_hash);

        let result = signer.verify(&user(), &[first, second]);
        assert!(result.valid);
        assert_eq!(result.verified_entries, 2);
    }

    #[test]
    fn settling_a_transaction_does_not_break_the_chain() {
        let signer = ChainSigner::new("secret-key");
        let mut tx = sample_transaction("cart-1", 40_00);
        signer.seal(&mut tx, None);

        tx.mark_succeeded("rye-receipt-1").expect("succeed");

        let result = signer.verify(&user(), &[tx]);
        assert!(result.valid);
    }

    #[test]
    fn tampered_amount_is_detected() {
        let signer = ChainSigner::new("secret-key");
        let mut tx = sample_transaction("cart-1", 40_00);
        signer.seal(&mut tx, None);

        tx.amount = Decimal::new(1_00, 2);

        let result = signer.verify(&user(), &[tx]);
        assert!(!result.valid);
        assert!(result.failure_reason.unwrap_or_default().contains("entry hash mismatch"));
    }

    #[test]
    fn foreign_signature_is_detected() {
        let signer = ChainSigner::new("secret-key");
        let other = ChainSigner::new("different-key");
        let mut tx = sample_transaction("cart-1", 40_00);
        other.seal(&mut tx, None);

        let result = signer.verify(&user(), &[tx]);
        assert!(!result.valid);
        assert!(result.failure_reason.unwrap_or_default().contains("signature mismatch"));
    }
}
