//! Key derivation for 1-RTT key updates using HKDF

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{
    key_set::{Direction, HeaderKey, IV_LEN, KEY_LEN, KeySet},
    secret::{OneRttSecrets, Role, SECRET_LEN, TrafficSecret},
};

/// Prefix prepended to every label (TLS 1.3 `HkdfLabel`)
const LABEL_PREFIX: &[u8] = b"tls13 ";

/// Label for the next-generation secret
const KEY_UPDATE_LABEL: &[u8] = b"quic ku";

/// Label for the AEAD packet key
const PACKET_KEY_LABEL: &[u8] = b"quic key";

/// Label for the AEAD IV
const IV_LABEL: &[u8] = b"quic iv";

/// Label for the header protection key
const HEADER_KEY_LABEL: &[u8] = b"quic hp";

/// Labels for the handshake stand-in secrets
const CLIENT_SECRET_LABEL: &[u8] = b"client 1rtt";
const SERVER_SECRET_LABEL: &[u8] = b"server 1rtt";

/// HKDF-Expand-Label over SHA-256 with an empty context.
///
/// The `info` layout is `length (u16) || label length (u8) || "tls13 " ||
/// label || context length (u8, always 0)`.
pub fn hkdf_expand_label(secret: &[u8; SECRET_LEN], label: &[u8], out: &mut [u8]) {
    let Ok(hkdf) = Hkdf::<Sha256>::from_prk(secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 PRK length");
    };

    // Capacity: 2 (length) + 1 (label length) + 6 (prefix) + label + 1 (context)
    let mut info = Vec::with_capacity(10 + label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((LABEL_PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(LABEL_PREFIX);
    info.extend_from_slice(label);
    info.push(0);

    let Ok(()) = hkdf.expand(&info, out) else {
        unreachable!("key, IV and secret lengths are valid HKDF-SHA256 output lengths");
    };
}

/// Ratchet a traffic secret one generation forward.
///
/// One-way: recovering `current` from the result requires inverting
/// HKDF-Expand.
pub fn next_generation_secret(current: &TrafficSecret) -> TrafficSecret {
    let mut next = [0u8; SECRET_LEN];
    hkdf_expand_label(current.as_bytes(), KEY_UPDATE_LABEL, &mut next);
    TrafficSecret::new(next)
}

/// Build the generation-0 key set for `direction` from the handshake secret.
///
/// This is the only place the header protection key is derived.
pub fn derive_initial_key_set(secret: &TrafficSecret, direction: Direction) -> KeySet {
    let mut header_key = [0u8; KEY_LEN];
    hkdf_expand_label(secret.as_bytes(), HEADER_KEY_LABEL, &mut header_key);
    key_set_from_secret(secret, direction, 0, HeaderKey::new(header_key))
}

/// Derive the next generation: `Derive(currentSecret) -> nextSecret,
/// nextKeySet`.
///
/// The returned key set keeps the direction and header protection key of
/// `current` and carries generation `current.generation() + 1`.
///
/// # Security
///
/// - Deterministic: both endpoints derive the same key set independently
/// - One-way: the returned secret does not reveal `current_secret`
pub fn derive_next(current_secret: &TrafficSecret, current: &KeySet) -> (TrafficSecret, KeySet) {
    let next_secret = next_generation_secret(current_secret);
    let next_keys = key_set_from_secret(
        &next_secret,
        current.direction(),
        current.generation().saturating_add(1),
        current.header_key().clone(),
    );
    (next_secret, next_keys)
}

/// Derive generation-0 secrets for `role` from a shared handshake secret.
///
/// Stand-in for the TLS exporter: both endpoints call this with the same
/// `handshake_secret` and opposite roles, and end up with mirrored secrets.
pub fn derive_traffic_secrets(handshake_secret: &[u8], role: Role) -> OneRttSecrets {
    let hkdf = Hkdf::<Sha256>::new(None, handshake_secret);

    let expand = |label: &[u8]| {
        let mut secret = [0u8; SECRET_LEN];
        let Ok(()) = hkdf.expand(label, &mut secret) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };
        TrafficSecret::new(secret)
    };

    let client = expand(CLIENT_SECRET_LABEL);
    let server = expand(SERVER_SECRET_LABEL);

    match role {
        Role::Client => OneRttSecrets { local: client, remote: server },
        Role::Server => OneRttSecrets { local: server, remote: client },
    }
}

fn key_set_from_secret(
    secret: &TrafficSecret,
    direction: Direction,
    generation: u64,
    header_key: HeaderKey,
) -> KeySet {
    let mut packet_key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    hkdf_expand_label(secret.as_bytes(), PACKET_KEY_LABEL, &mut packet_key);
    hkdf_expand_label(secret.as_bytes(), IV_LABEL, &mut iv);
    KeySet::new(direction, generation, packet_key, iv, header_key)
}
