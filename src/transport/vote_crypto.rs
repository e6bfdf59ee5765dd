//! Poll vote cipher
//!
//! Reference implementation of the vote encrypt/decrypt primitive exposed by
//! the in-process transport. Options are identified by the SHA-256 of their
//! label; a vote is the concatenation of the selected option hashes, sealed
//! with AES-256-GCM under a key derived from the poll's embedded secret and
//! the creator/voter identities.
//!
//! ## Key derivation
//!
//! ```text
//! HKDF-SHA256(salt = poll secret,
//!             ikm  = poll_id || 0x00 || creator || 0x00 || voter,
//!             info = "Poll Vote")  -> 32-byte AES-256-GCM key
//! AAD = poll_id || 0x00 || voter
//! ```

use super::traits::{DecryptedVote, EncryptedVote, TransportError, VoteContext};
use hkdf::Hkdf;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const VOTE_INFO: &[u8] = b"Poll Vote";
const IV_LEN: usize = 12;
const HASH_LEN: usize = 32;

/// Identity of a poll option: SHA-256 of its label
pub fn option_hash(label: &str) -> [u8; HASH_LEN] {
    let digest = Sha256::digest(label.as_bytes());
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&digest);
    hash
}

fn derive_vote_key(ctx: &VoteContext<'_>) -> Result<Zeroizing<[u8; 32]>, TransportError> {
    let mut ikm = Vec::with_capacity(
        ctx.poll_message_id.len() + ctx.poll_creator.len() + ctx.voter.len() + 2,
    );
    ikm.extend_from_slice(ctx.poll_message_id.as_bytes());
    ikm.push(0);
    ikm.extend_from_slice(ctx.poll_creator.as_bytes());
    ikm.push(0);
    ikm.extend_from_slice(ctx.voter.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(ctx.secret), &ikm);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(VOTE_INFO, key.as_mut())
        .map_err(|e| TransportError::Decrypt(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

fn vote_aad(ctx: &VoteContext<'_>) -> Vec<u8> {
    let mut aad = Vec::with_capacity(ctx.poll_message_id.len() + ctx.voter.len() + 1);
    aad.extend_from_slice(ctx.poll_message_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(ctx.voter.as_bytes());
    aad
}

fn sealing_key(ctx: &VoteContext<'_>) -> Result<LessSafeKey, TransportError> {
    let key = derive_vote_key(ctx)?;
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_ref())
        .map_err(|_| TransportError::Decrypt("Invalid vote key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt a selection of option labels for `ctx.voter`
pub fn encrypt_vote(
    selected: &[&str],
    ctx: &VoteContext<'_>,
) -> Result<EncryptedVote, TransportError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let nonce = Nonce::try_assume_unique_for_key(&iv)
        .map_err(|_| TransportError::Protocol("Failed to create nonce".to_string()))?;

    let mut payload: Vec<u8> = selected.iter().flat_map(|s| option_hash(s)).collect();
    sealing_key(ctx)?
        .seal_in_place_append_tag(nonce, Aad::from(vote_aad(ctx)), &mut payload)
        .map_err(|_| TransportError::Protocol("Vote encryption failed".to_string()))?;

    Ok(EncryptedVote {
        enc_payload: payload,
        enc_iv: iv.to_vec(),
    })
}

/// Decrypt a vote into the hashes of the selected options
pub fn decrypt_vote(
    vote: &EncryptedVote,
    ctx: &VoteContext<'_>,
) -> Result<DecryptedVote, TransportError> {
    let nonce = Nonce::try_assume_unique_for_key(&vote.enc_iv)
        .map_err(|_| TransportError::Decrypt("Invalid IV".to_string()))?;

    let mut buffer = vote.enc_payload.clone();
    let plaintext = sealing_key(ctx)?
        .open_in_place(nonce, Aad::from(vote_aad(ctx)), &mut buffer)
        .map_err(|_| TransportError::Decrypt("Vote authentication failed".to_string()))?;

    if plaintext.len() % HASH_LEN != 0 {
        return Err(TransportError::Decrypt(format!(
            "Vote payload length {} is not a multiple of {}",
            plaintext.len(),
            HASH_LEN
        )));
    }

    let selected_options = plaintext
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    Ok(DecryptedVote { selected_options })
}
