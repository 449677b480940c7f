use ed25519_dalek::ed25519::signature::Signer;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::crypt::token::{TokenCipher, TOKEN_MAX_PADDING_SIZE, TOKEN_OVERHEAD_SIZE};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const DERIVED_KEY_LENGTH: usize = 64;

pub trait HashIdentity {
    fn as_address_hash_slice(&self) -> &[u8];
}

/// Public half of an identity: X25519 encryption key plus Ed25519
/// verification key. The identity hash is the truncated digest of both.
#[derive(Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(public_key.as_bytes())
                .chain_update(verifying_key.as_bytes())
                .finalize()
                .into(),
        );

        Self { public_key, verifying_key, address_hash: hash.truncated() }
    }

    pub fn new_from_slices(public_key: &[u8], verifying_key: &[u8]) -> Result<Self, RnsError> {
        if public_key.len() != PUBLIC_KEY_LENGTH || verifying_key.len() != PUBLIC_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        key_bytes.copy_from_slice(public_key);
        let public_key = PublicKey::from(key_bytes);

        key_bytes.copy_from_slice(verifying_key);
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| RnsError::CryptoError)?;

        Ok(Self::new(public_key, verifying_key))
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::IncorrectHash)?;
        if decoded.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::IncorrectHash);
        }
        Self::new_from_slices(&decoded[..PUBLIC_KEY_LENGTH], &decoded[PUBLIC_KEY_LENGTH..])
    }

    pub fn to_hex_string(&self) -> String {
        format!(
            "{}{}",
            hex::encode(self.public_key.as_bytes()),
            hex::encode(self.verifying_key.as_bytes())
        )
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.verifying_key.verify_strict(data, signature).map_err(|_| RnsError::IncorrectSignature)
    }

    /// Per-message encryption toward this identity: fresh ephemeral X25519
    /// key, HKDF over the shared secret, token over the plaintext.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        plaintext: &[u8],
        salt: &[u8],
        rng: R,
    ) -> Result<Vec<u8>, RnsError> {
        encrypt_for_public_key(&self.public_key, salt, plaintext, rng)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(PublicKey::from([0u8; PUBLIC_KEY_LENGTH]), VerifyingKey::default())
    }
}

impl HashIdentity for Identity {
    fn as_address_hash_slice(&self) -> &[u8] {
        self.address_hash.as_slice()
    }
}

/// Identity of a PLAIN endpoint; hashes over nothing and cannot sign.
#[derive(Default, Copy, Clone)]
pub struct EmptyIdentity;

impl HashIdentity for EmptyIdentity {
    fn as_address_hash_slice(&self) -> &[u8] {
        &[]
    }
}

#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    private_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(private_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&private_key).into(), sign_key.verifying_key()),
            private_key,
            sign_key,
        }
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let private_key = StaticSecret::random_from_rng(rng);
        Self::new(private_key, sign_key)
    }

    /// Deterministic identity derived from a name. Test and tooling use
    /// only; the keys are as guessable as the name.
    pub fn new_from_name(name: &str) -> Self {
        let hash = Hash::new_from_slice(name.as_bytes());
        let private_key = StaticSecret::from(hash.to_bytes());

        let hash = Hash::new_from_slice(hash.as_slice());
        let sign_key = SigningKey::from_bytes(hash.as_bytes());

        Self::new(private_key, sign_key)
    }

    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut private_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        let mut sign_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        private_key_bytes.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        sign_key_bytes.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(StaticSecret::from(private_key_bytes), SigningKey::from_bytes(&sign_key_bytes)))
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.private_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::IncorrectHash)?;
        Self::from_private_key_bytes(&decoded)
    }

    pub fn to_hex_string(&self) -> String {
        hex::encode(self.to_private_key_bytes())
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::new(&self.private_key.diffie_hellman(public_key), salt)
    }

    pub fn decrypt(&self, ciphertext: &[u8], salt: &[u8]) -> Result<Vec<u8>, RnsError> {
        decrypt_with_private_key(&self.private_key, salt, ciphertext)
    }

    pub fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }
}

impl HashIdentity for PrivateIdentity {
    fn as_address_hash_slice(&self) -> &[u8] {
        self.identity.address_hash.as_slice()
    }
}

/// Symmetric material expanded from an ECDH secret with HKDF-SHA256. The
/// first half signs, the second half encrypts.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_LENGTH],
}

impl DerivedKey {
    pub fn new(shared_key: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(salt, shared_key.as_bytes()).expand(&[], &mut key[..]);
        Self { key }
    }

    pub fn new_empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_LENGTH] }
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LENGTH] {
        &self.key
    }

    fn cipher(&self) -> TokenCipher {
        TokenCipher::new_from_slices(
            &self.key[..DERIVED_KEY_LENGTH / 2],
            &self.key[DERIVED_KEY_LENGTH / 2..],
        )
    }

    pub fn encrypt<'a, R: CryptoRngCore>(
        &self,
        plaintext: &[u8],
        out_buf: &'a mut [u8],
        rng: R,
    ) -> Result<&'a [u8], RnsError> {
        self.cipher().encrypt(plaintext, out_buf, rng)
    }

    pub fn decrypt<'a>(&self, token: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        self.cipher().decrypt(token, out_buf)
    }
}

pub fn encrypt_for_public_key<R: CryptoRngCore + Copy>(
    public_key: &PublicKey,
    salt: &[u8],
    plaintext: &[u8],
    rng: R,
) -> Result<Vec<u8>, RnsError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let derived = DerivedKey::new(&secret.diffie_hellman(public_key), Some(salt));

    let mut out = vec![
        0u8;
        PUBLIC_KEY_LENGTH + plaintext.len() + TOKEN_OVERHEAD_SIZE + TOKEN_MAX_PADDING_SIZE
    ];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token_len = derived.encrypt(plaintext, &mut out[PUBLIC_KEY_LENGTH..], rng)?.len();
    out.truncate(PUBLIC_KEY_LENGTH + token_len);
    Ok(out)
}

pub fn decrypt_with_private_key(
    private_key: &StaticSecret,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RnsError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(RnsError::InvalidArgument);
    }

    let mut key_bytes = [0u8; PUBLIC_KEY_LENGTH];
    key_bytes.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let ephemeral_public = PublicKey::from(key_bytes);
    let derived = DerivedKey::new(&private_key.diffie_hellman(&ephemeral_public), Some(salt));

    let mut out = vec![0u8; ciphertext.len()];
    let plaintext_len = derived.decrypt(&ciphertext[PUBLIC_KEY_LENGTH..], &mut out)?.len();
    out.truncate(plaintext_len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{decrypt_with_private_key, encrypt_for_public_key, PrivateIdentity};

    #[test]
    fn private_identity_hex_roundtrip() {
        let original = PrivateIdentity::new_from_rand(OsRng);
        let decoded =
            PrivateIdentity::new_from_hex_string(&original.to_hex_string()).expect("identity");
        assert_eq!(decoded.to_private_key_bytes(), original.to_private_key_bytes());
        assert_eq!(decoded.address_hash(), original.address_hash());
    }

    #[test]
    fn sign_and_verify() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let signature = identity.sign(b"signed data");
        assert!(identity.verify(b"signed data", &signature).is_ok());
        assert!(identity.verify(b"other data", &signature).is_err());
    }

    #[test]
    fn ephemeral_encrypt_roundtrip() {
        let recipient = PrivateIdentity::new_from_rand(OsRng);
        let salt = recipient.address_hash().as_slice();

        let ciphertext = encrypt_for_public_key(
            &recipient.as_identity().public_key,
            salt,
            b"per-message secrecy",
            OsRng,
        )
        .expect("ciphertext");

        let plaintext =
            decrypt_with_private_key(recipient.private_key(), salt, &ciphertext).expect("plain");
        assert_eq!(plaintext, b"per-message secrecy");
    }

    #[test]
    fn derived_keys_agree_across_the_exchange() {
        let left = PrivateIdentity::new_from_rand(OsRng);
        let right = PrivateIdentity::new_from_rand(OsRng);

        let key_left = left.derive_key(&right.as_identity().public_key, Some(b"salt"));
        let key_right = right.derive_key(&left.as_identity().public_key, Some(b"salt"));
        assert_eq!(key_left.as_bytes(), key_right.as_bytes());
    }

    #[test]
    fn name_identities_are_deterministic() {
        let first = PrivateIdentity::new_from_name("node-a");
        let second = PrivateIdentity::new_from_name("node-a");
        assert_eq!(first.address_hash(), second.address_hash());
    }
}
