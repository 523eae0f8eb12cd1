//! Cryptography bridge.
//!
//! Stateful digests, MACs, ciphers and streaming signers live host-side
//! behind handles; `digest`/`final` consume the handle. Keys cross as PEM
//! strings, data as bytes, and algorithm names follow the usual node
//! spellings (`sha256`, `aes-256-gcm`, `RSA-SHA256`, …).

use std::sync::Arc;

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::Aead;
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm, KeyInit};
use digest::DynDigest;
use ed25519_dalek::pkcs8::{DecodePrivateKey as _, DecodePublicKey as _};
use funclite_shared::{FuncliteError, FuncliteResult};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use ripemd::Ripemd160;
use rquickjs::Ctx;
use rquickjs::function::{Async, Func, Opt};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use sha3::{Sha3_256, Sha3_384, Sha3_512};
use signature::{Signer as _, Verifier as _};

use super::convert::{
    AsyncReply, BytesArg, JsBytes, TextOrBytes, data_with_encoding, sync_result,
};
use super::encoding::encode_bytes;
use super::handles::HandleObject;
use super::{BridgeState, opt_str};

type Aes192Gcm = aes_gcm::AesGcm<aes::Aes192, aes_gcm::aead::consts::U12>;

const GCM_TAG_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

// ============================================================================
// HASH & MAC STATE
// ============================================================================

/// Incremental digest behind a handle.
pub struct HasherState {
    digest: Box<dyn DynDigest + Send>,
}

impl HasherState {
    pub fn create(algorithm: &str) -> FuncliteResult<Self> {
        let digest: Box<dyn DynDigest + Send> = match normalize_alg(algorithm).as_str() {
            "md5" => Box::new(Md5::default()),
            "sha1" => Box::new(Sha1::default()),
            "sha224" => Box::new(Sha224::default()),
            "sha256" => Box::new(Sha256::default()),
            "sha384" => Box::new(Sha384::default()),
            "sha512" => Box::new(Sha512::default()),
            "sha3-256" => Box::new(Sha3_256::default()),
            "sha3-384" => Box::new(Sha3_384::default()),
            "sha3-512" => Box::new(Sha3_512::default()),
            "ripemd160" | "rmd160" => Box::new(Ripemd160::default()),
            other => {
                return Err(FuncliteError::InvalidArgument(format!(
                    "unknown hash algorithm: {}",
                    other
                )));
            }
        };
        Ok(Self { digest })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.digest.finalize_reset().to_vec()
    }
}

/// Incremental MAC behind a handle. The `Mac` trait consumes on finalize, so
/// this is enum dispatch over the supported digests.
pub enum MacState {
    Md5(Hmac<Md5>),
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

impl MacState {
    pub fn create(algorithm: &str, key: &[u8]) -> FuncliteResult<Self> {
        let bad_key = |_| FuncliteError::InvalidArgument("invalid hmac key".into());
        match normalize_alg(algorithm).as_str() {
            "md5" => Ok(MacState::Md5(KeyInit::new_from_slice(key).map_err(bad_key)?)),
            "sha1" => Ok(MacState::Sha1(KeyInit::new_from_slice(key).map_err(bad_key)?)),
            "sha256" => Ok(MacState::Sha256(KeyInit::new_from_slice(key).map_err(bad_key)?)),
            "sha384" => Ok(MacState::Sha384(KeyInit::new_from_slice(key).map_err(bad_key)?)),
            "sha512" => Ok(MacState::Sha512(KeyInit::new_from_slice(key).map_err(bad_key)?)),
            other => Err(FuncliteError::InvalidArgument(format!(
                "unknown hmac algorithm: {}",
                other
            ))),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            MacState::Md5(m) => Mac::update(m, data),
            MacState::Sha1(m) => Mac::update(m, data),
            MacState::Sha256(m) => Mac::update(m, data),
            MacState::Sha384(m) => Mac::update(m, data),
            MacState::Sha512(m) => Mac::update(m, data),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            MacState::Md5(m) => m.finalize().into_bytes().to_vec(),
            MacState::Sha1(m) => m.finalize().into_bytes().to_vec(),
            MacState::Sha256(m) => m.finalize().into_bytes().to_vec(),
            MacState::Sha384(m) => m.finalize().into_bytes().to_vec(),
            MacState::Sha512(m) => m.finalize().into_bytes().to_vec(),
        }
    }
}

// ============================================================================
// SYMMETRIC CIPHERS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CipherAlg {
    Gcm128,
    Gcm192,
    Gcm256,
    Cbc128,
    Cbc192,
    Cbc256,
}

impl CipherAlg {
    fn parse(name: &str) -> FuncliteResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherAlg::Gcm128),
            "aes-192-gcm" => Ok(CipherAlg::Gcm192),
            "aes-256-gcm" => Ok(CipherAlg::Gcm256),
            "aes-128-cbc" => Ok(CipherAlg::Cbc128),
            "aes-192-cbc" => Ok(CipherAlg::Cbc192),
            "aes-256-cbc" => Ok(CipherAlg::Cbc256),
            other => Err(FuncliteError::InvalidArgument(format!(
                "unknown cipher algorithm: {}",
                other
            ))),
        }
    }

    fn key_len(self) -> usize {
        match self {
            CipherAlg::Gcm128 | CipherAlg::Cbc128 => 16,
            CipherAlg::Gcm192 | CipherAlg::Cbc192 => 24,
            CipherAlg::Gcm256 | CipherAlg::Cbc256 => 32,
        }
    }

    fn is_gcm(self) -> bool {
        matches!(self, CipherAlg::Gcm128 | CipherAlg::Gcm192 | CipherAlg::Gcm256)
    }
}

/// Buffered cipher behind a handle. Input accumulates on `update`; the
/// transform happens at `final`, which also fixes the auth tag for GCM.
pub struct CipherState {
    alg: CipherAlg,
    key: Vec<u8>,
    iv: Vec<u8>,
    encrypt: bool,
    buffer: Vec<u8>,
    auto_padding: bool,
    auth_tag: Option<Vec<u8>>,
}

impl CipherState {
    pub fn create(
        algorithm: &str,
        key: Vec<u8>,
        iv: Vec<u8>,
        encrypt: bool,
    ) -> FuncliteResult<Self> {
        let alg = CipherAlg::parse(algorithm)?;
        if key.len() != alg.key_len() {
            return Err(FuncliteError::InvalidArgument(format!(
                "invalid key length {} for {}",
                key.len(),
                algorithm
            )));
        }
        if alg.is_gcm() {
            if iv.len() != GCM_NONCE_LEN {
                return Err(FuncliteError::InvalidArgument(
                    "gcm requires a 12-byte iv".into(),
                ));
            }
        } else if iv.len() != 16 {
            return Err(FuncliteError::InvalidArgument(
                "cbc requires a 16-byte iv".into(),
            ));
        }
        Ok(Self {
            alg,
            key,
            iv,
            encrypt,
            buffer: Vec::new(),
            auto_padding: true,
            auth_tag: None,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn set_auto_padding(&mut self, enabled: bool) {
        self.auto_padding = enabled;
    }

    pub fn set_auth_tag(&mut self, tag: Vec<u8>) -> FuncliteResult<()> {
        if !self.alg.is_gcm() || self.encrypt {
            return Err(FuncliteError::InvalidArgument(
                "auth tags only apply to gcm decryption".into(),
            ));
        }
        self.auth_tag = Some(tag);
        Ok(())
    }

    /// Consume the handle, producing output and (for GCM encryption) the tag.
    pub fn finish(self) -> FuncliteResult<(Vec<u8>, Option<Vec<u8>>)> {
        if self.alg.is_gcm() {
            self.finish_gcm()
        } else {
            self.finish_cbc().map(|out| (out, None))
        }
    }

    fn finish_gcm(self) -> FuncliteResult<(Vec<u8>, Option<Vec<u8>>)> {
        let nonce = aes_gcm::Nonce::from_slice(&self.iv);
        if self.encrypt {
            let mut combined = match self.alg {
                CipherAlg::Gcm128 => gcm_seal::<Aes128Gcm>(&self.key, nonce, &self.buffer)?,
                CipherAlg::Gcm192 => gcm_seal::<Aes192Gcm>(&self.key, nonce, &self.buffer)?,
                _ => gcm_seal::<Aes256Gcm>(&self.key, nonce, &self.buffer)?,
            };
            let tag = combined.split_off(combined.len() - GCM_TAG_LEN);
            Ok((combined, Some(tag)))
        } else {
            let tag = self.auth_tag.as_deref().ok_or_else(|| {
                FuncliteError::InvalidArgument("auth tag not set before final".into())
            })?;
            if tag.len() != GCM_TAG_LEN {
                return Err(FuncliteError::InvalidArgument("invalid auth tag length".into()));
            }
            let mut combined = self.buffer.clone();
            combined.extend_from_slice(tag);
            let plain = match self.alg {
                CipherAlg::Gcm128 => gcm_open::<Aes128Gcm>(&self.key, nonce, &combined)?,
                CipherAlg::Gcm192 => gcm_open::<Aes192Gcm>(&self.key, nonce, &combined)?,
                _ => gcm_open::<Aes256Gcm>(&self.key, nonce, &combined)?,
            };
            Ok((plain, None))
        }
    }

    fn finish_cbc(self) -> FuncliteResult<Vec<u8>> {
        macro_rules! cbc_run {
            ($cipher:ty) => {{
                if self.encrypt {
                    let enc = cbc::Encryptor::<$cipher>::new_from_slices(&self.key, &self.iv)
                        .map_err(|_| FuncliteError::InvalidArgument("invalid key or iv".into()))?;
                    if self.auto_padding {
                        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(&self.buffer))
                    } else {
                        if self.buffer.len() % 16 != 0 {
                            return Err(FuncliteError::InvalidArgument(
                                "data length must be a multiple of the block size".into(),
                            ));
                        }
                        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(&self.buffer))
                    }
                } else {
                    let dec = cbc::Decryptor::<$cipher>::new_from_slices(&self.key, &self.iv)
                        .map_err(|_| FuncliteError::InvalidArgument("invalid key or iv".into()))?;
                    if self.auto_padding {
                        dec.decrypt_padded_vec_mut::<Pkcs7>(&self.buffer)
                            .map_err(|_| FuncliteError::InvalidArgument("bad decrypt".into()))
                    } else {
                        dec.decrypt_padded_vec_mut::<NoPadding>(&self.buffer)
                            .map_err(|_| FuncliteError::InvalidArgument("bad decrypt".into()))
                    }
                }
            }};
        }
        match self.alg {
            CipherAlg::Cbc128 => cbc_run!(aes::Aes128),
            CipherAlg::Cbc192 => cbc_run!(aes::Aes192),
            CipherAlg::Cbc256 => cbc_run!(aes::Aes256),
            _ => unreachable!("gcm handled separately"),
        }
    }
}

fn gcm_seal<C>(key: &[u8], nonce: &aes_gcm::Nonce<<C as AeadCore>::NonceSize>, plain: &[u8]) -> FuncliteResult<Vec<u8>>
where
    C: Aead + KeyInit + AeadCore,
{
    let cipher = C::new_from_slice(key)
        .map_err(|_| FuncliteError::InvalidArgument("invalid key".into()))?;
    cipher
        .encrypt(nonce, plain)
        .map_err(|_| FuncliteError::InvalidArgument("encryption failed".into()))
}

fn gcm_open<C>(key: &[u8], nonce: &aes_gcm::Nonce<<C as AeadCore>::NonceSize>, combined: &[u8]) -> FuncliteResult<Vec<u8>>
where
    C: Aead + KeyInit + AeadCore,
{
    let cipher = C::new_from_slice(key)
        .map_err(|_| FuncliteError::InvalidArgument("invalid key".into()))?;
    cipher
        .decrypt(nonce, combined)
        .map_err(|_| FuncliteError::InvalidArgument("authentication failed".into()))
}

// ============================================================================
// SIGNATURES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignAlg {
    RsaSha256,
    RsaSha384,
    RsaSha512,
    EcdsaP256,
    Ed25519,
}

impl SignAlg {
    fn parse(name: &str) -> FuncliteResult<Self> {
        match normalize_alg(name).as_str() {
            "sha256" | "rsa-sha256" => Ok(SignAlg::RsaSha256),
            "sha384" | "rsa-sha384" => Ok(SignAlg::RsaSha384),
            "sha512" | "rsa-sha512" => Ok(SignAlg::RsaSha512),
            "ecdsa-sha256" | "ecdsa-p256" | "p256" => Ok(SignAlg::EcdsaP256),
            "ed25519" => Ok(SignAlg::Ed25519),
            other => Err(FuncliteError::InvalidArgument(format!(
                "unknown signature algorithm: {}",
                other
            ))),
        }
    }
}

fn rsa_private_key(pem: &str) -> FuncliteResult<rsa::RsaPrivateKey> {
    rsa::RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| rsa::RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| FuncliteError::InvalidArgument("invalid private key".into()))
}

pub fn sign_data(algorithm: &str, data: &[u8], private_pem: &str) -> FuncliteResult<Vec<u8>> {
    match SignAlg::parse(algorithm)? {
        SignAlg::RsaSha256 => {
            let key = rsa::pkcs1v15::SigningKey::<Sha256>::new(rsa_private_key(private_pem)?);
            Ok(signature::SignatureEncoding::to_vec(&key.sign(data)))
        }
        SignAlg::RsaSha384 => {
            let key = rsa::pkcs1v15::SigningKey::<Sha384>::new(rsa_private_key(private_pem)?);
            Ok(signature::SignatureEncoding::to_vec(&key.sign(data)))
        }
        SignAlg::RsaSha512 => {
            let key = rsa::pkcs1v15::SigningKey::<Sha512>::new(rsa_private_key(private_pem)?);
            Ok(signature::SignatureEncoding::to_vec(&key.sign(data)))
        }
        SignAlg::EcdsaP256 => {
            let key = p256::ecdsa::SigningKey::from_pkcs8_pem(private_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid private key".into()))?;
            let sig: p256::ecdsa::Signature = key.sign(data);
            Ok(sig.to_der().as_bytes().to_vec())
        }
        SignAlg::Ed25519 => {
            let key = ed25519_dalek::SigningKey::from_pkcs8_pem(private_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid private key".into()))?;
            Ok(key.sign(data).to_bytes().to_vec())
        }
    }
}

pub fn verify_data(
    algorithm: &str,
    data: &[u8],
    public_pem: &str,
    signature_bytes: &[u8],
) -> FuncliteResult<bool> {
    let verified = match SignAlg::parse(algorithm)? {
        SignAlg::RsaSha256 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid public key".into()))?;
            let key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
            rsa::pkcs1v15::Signature::try_from(signature_bytes)
                .map(|sig| key.verify(data, &sig).is_ok())
                .unwrap_or(false)
        }
        SignAlg::RsaSha384 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid public key".into()))?;
            let key = rsa::pkcs1v15::VerifyingKey::<Sha384>::new(key);
            rsa::pkcs1v15::Signature::try_from(signature_bytes)
                .map(|sig| key.verify(data, &sig).is_ok())
                .unwrap_or(false)
        }
        SignAlg::RsaSha512 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid public key".into()))?;
            let key = rsa::pkcs1v15::VerifyingKey::<Sha512>::new(key);
            rsa::pkcs1v15::Signature::try_from(signature_bytes)
                .map(|sig| key.verify(data, &sig).is_ok())
                .unwrap_or(false)
        }
        SignAlg::EcdsaP256 => {
            let key = p256::ecdsa::VerifyingKey::from_public_key_pem(public_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid public key".into()))?;
            p256::ecdsa::Signature::from_der(signature_bytes)
                .map(|sig| key.verify(data, &sig).is_ok())
                .unwrap_or(false)
        }
        SignAlg::Ed25519 => {
            let key = ed25519_dalek::VerifyingKey::from_public_key_pem(public_pem)
                .map_err(|_| FuncliteError::InvalidArgument("invalid public key".into()))?;
            let bytes: [u8; 64] = match signature_bytes.try_into() {
                Ok(b) => b,
                Err(_) => return Ok(false),
            };
            key.verify(data, &ed25519_dalek::Signature::from_bytes(&bytes))
                .is_ok()
        }
    };
    Ok(verified)
}

/// Streaming `crypto.createSign` handle: buffers data, signs at the end.
pub struct StreamSigner {
    algorithm: String,
    buffer: Vec<u8>,
}

impl StreamSigner {
    pub fn create(algorithm: &str) -> FuncliteResult<Self> {
        SignAlg::parse(algorithm)?;
        Ok(Self { algorithm: algorithm.to_string(), buffer: Vec::new() })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn finish(self, private_pem: &str) -> FuncliteResult<Vec<u8>> {
        sign_data(&self.algorithm, &self.buffer, private_pem)
    }
}

/// Streaming `crypto.createVerify` handle.
pub struct StreamVerifier {
    algorithm: String,
    buffer: Vec<u8>,
}

impl StreamVerifier {
    pub fn create(algorithm: &str) -> FuncliteResult<Self> {
        SignAlg::parse(algorithm)?;
        Ok(Self { algorithm: algorithm.to_string(), buffer: Vec::new() })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn finish(self, public_pem: &str, signature: &[u8]) -> FuncliteResult<bool> {
        verify_data(&self.algorithm, &self.buffer, public_pem, signature)
    }
}

// ============================================================================
// KDF / RANDOM
// ============================================================================

pub fn pbkdf2_derive(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    key_len: usize,
    digest: &str,
) -> FuncliteResult<Vec<u8>> {
    if iterations == 0 {
        return Err(FuncliteError::InvalidArgument("iterations must be positive".into()));
    }
    let mut out = vec![0u8; key_len];
    match normalize_alg(digest).as_str() {
        "sha1" => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out),
        "sha256" => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
        "sha512" => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out),
        other => {
            return Err(FuncliteError::InvalidArgument(format!(
                "unknown pbkdf2 digest: {}",
                other
            )));
        }
    }
    Ok(out)
}

fn normalize_alg(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

/// Consume data with an optional named output encoding.
fn finish_encoded(bytes: Vec<u8>, encoding: Option<&str>) -> FuncliteResult<TextOrBytes> {
    match encoding {
        Some(enc) => encode_bytes(&bytes, enc).map(TextOrBytes::Text),
        None => Ok(TextOrBytes::Bytes(bytes)),
    }
}

// ============================================================================
// INSTALLATION
// ============================================================================

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    // ---- hashes ----
    let st = Arc::clone(state);
    globals.set(
        "_crypto_hashNew",
        Func::from(move |ctx: Ctx<'_>, algorithm: String| {
            let hasher = sync_result(&ctx, HasherState::create(&algorithm))?;
            Ok::<_, rquickjs::Error>(st.handles.lock().insert(HandleObject::Hasher(hasher)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_hashUpdate",
        Func::from(
            move |ctx: Ctx<'_>, handle: u32, data: BytesArg, encoding: Opt<String>| {
                let bytes =
                    sync_result(&ctx, data_with_encoding(data, opt_str(&encoding)))?;
                let mut handles = st.handles.lock();
                match sync_result(&ctx, handles.get_mut(handle))? {
                    HandleObject::Hasher(h) => h.update(&bytes),
                    HandleObject::Mac(m) => m.update(&bytes),
                    HandleObject::Cipher(c) => c.update(&bytes),
                    HandleObject::Signer(s) => s.update(&bytes),
                    HandleObject::Verifier(v) => v.update(&bytes),
                    _ => {
                        drop(handles);
                        return Err(super::throw_funclite(
                            &ctx,
                            FuncliteError::InvalidArgument("handle is not updatable".into()),
                        ));
                    }
                }
                Ok::<_, rquickjs::Error>(())
            },
        ),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_hashDigest",
        Func::from(move |ctx: Ctx<'_>, handle: u32, encoding: Opt<String>| {
            let object = sync_result(&ctx, st.handles.lock().remove(handle))?;
            let bytes = match object {
                HandleObject::Hasher(h) => h.finish(),
                HandleObject::Mac(m) => m.finish(),
                _ => {
                    return Err(super::throw_funclite(
                        &ctx,
                        FuncliteError::InvalidArgument("handle is not a digest".into()),
                    ));
                }
            };
            sync_result(&ctx, finish_encoded(bytes, opt_str(&encoding)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_hmacNew",
        Func::from(move |ctx: Ctx<'_>, algorithm: String, key: BytesArg| {
            let mac = sync_result(&ctx, MacState::create(&algorithm, &key.0))?;
            Ok::<_, rquickjs::Error>(st.handles.lock().insert(HandleObject::Mac(mac)))
        }),
    )?;

    // ---- ciphers ----
    let st = Arc::clone(state);
    globals.set(
        "_crypto_cipherNew",
        Func::from(
            move |ctx: Ctx<'_>, algorithm: String, key: BytesArg, iv: BytesArg, encrypt: bool| {
                let cipher =
                    sync_result(&ctx, CipherState::create(&algorithm, key.0, iv.0, encrypt))?;
                Ok::<_, rquickjs::Error>(st.handles.lock().insert(HandleObject::Cipher(cipher)))
            },
        ),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_cipherSetAutoPadding",
        Func::from(move |ctx: Ctx<'_>, handle: u32, enabled: bool| {
            let mut handles = st.handles.lock();
            match sync_result(&ctx, handles.get_mut(handle))? {
                HandleObject::Cipher(c) => {
                    c.set_auto_padding(enabled);
                    Ok::<_, rquickjs::Error>(())
                }
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a cipher".into()),
                )),
            }
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_cipherSetAuthTag",
        Func::from(move |ctx: Ctx<'_>, handle: u32, tag: BytesArg| {
            let mut handles = st.handles.lock();
            match sync_result(&ctx, handles.get_mut(handle))? {
                HandleObject::Cipher(c) => {
                    let result = c.set_auth_tag(tag.0);
                    drop(handles);
                    sync_result(&ctx, result)
                }
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a cipher".into()),
                )),
            }
        }),
    )?;

    // Returns {data, authTag?}; the shim splits them.
    let st = Arc::clone(state);
    globals.set(
        "_crypto_cipherFinal",
        Func::from(super::constrain_ctx_u32_obj(move |ctx: Ctx<'_>, handle: u32| {
            let object = sync_result(&ctx, st.handles.lock().remove(handle))?;
            let cipher = match object {
                HandleObject::Cipher(c) => c,
                _ => {
                    return Err(super::throw_funclite(
                        &ctx,
                        FuncliteError::InvalidArgument("handle is not a cipher".into()),
                    ));
                }
            };
            let (data, tag) = sync_result(&ctx, cipher.finish())?;
            let obj = rquickjs::Object::new(ctx.clone())?;
            obj.set("data", JsBytes(data))?;
            if let Some(tag) = tag {
                obj.set("authTag", JsBytes(tag))?;
            }
            Ok::<_, rquickjs::Error>(obj)
        })),
    )?;

    // ---- signatures ----
    globals.set(
        "_crypto_sign",
        Func::from(
            |ctx: Ctx<'_>, algorithm: String, data: BytesArg, private_pem: String| {
                sync_result(&ctx, sign_data(&algorithm, &data.0, &private_pem).map(JsBytes))
            },
        ),
    )?;

    globals.set(
        "_crypto_verify",
        Func::from(
            |ctx: Ctx<'_>,
             algorithm: String,
             data: BytesArg,
             public_pem: String,
             signature: BytesArg| {
                sync_result(
                    &ctx,
                    verify_data(&algorithm, &data.0, &public_pem, &signature.0),
                )
            },
        ),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_signNew",
        Func::from(move |ctx: Ctx<'_>, algorithm: String| {
            let signer = sync_result(&ctx, StreamSigner::create(&algorithm))?;
            Ok::<_, rquickjs::Error>(st.handles.lock().insert(HandleObject::Signer(signer)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_signFinal",
        Func::from(move |ctx: Ctx<'_>, handle: u32, private_pem: String| {
            let object = sync_result(&ctx, st.handles.lock().remove(handle))?;
            match object {
                HandleObject::Signer(s) => {
                    sync_result(&ctx, s.finish(&private_pem).map(JsBytes))
                }
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a signer".into()),
                )),
            }
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_verifyNew",
        Func::from(move |ctx: Ctx<'_>, algorithm: String| {
            let verifier = sync_result(&ctx, StreamVerifier::create(&algorithm))?;
            Ok::<_, rquickjs::Error>(st.handles.lock().insert(HandleObject::Verifier(verifier)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_verifyFinal",
        Func::from(
            move |ctx: Ctx<'_>, handle: u32, public_pem: String, signature: BytesArg| {
                let object = sync_result(&ctx, st.handles.lock().remove(handle))?;
                match object {
                    HandleObject::Verifier(v) => {
                        sync_result(&ctx, v.finish(&public_pem, &signature.0))
                    }
                    _ => Err(super::throw_funclite(
                        &ctx,
                        FuncliteError::InvalidArgument("handle is not a verifier".into()),
                    )),
                }
            },
        ),
    )?;

    // ---- randoms ----
    globals.set(
        "_crypto_randomBytes",
        Func::from(|ctx: Ctx<'_>, len: u32| {
            if len > 1 << 20 {
                return Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("randomBytes size too large".into()),
                ));
            }
            let mut bytes = vec![0u8; len as usize];
            rand::thread_rng().fill(&mut bytes[..]);
            Ok::<_, rquickjs::Error>(JsBytes(bytes))
        }),
    )?;

    globals.set(
        "_crypto_randomUUID",
        Func::from(|| Ok::<_, rquickjs::Error>(uuid::Uuid::new_v4().to_string())),
    )?;

    globals.set(
        "_crypto_randomInt",
        Func::from(|ctx: Ctx<'_>, min: i64, max: i64| {
            if min >= max {
                return Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("min must be below max".into()),
                ));
            }
            Ok::<_, rquickjs::Error>(rand::thread_rng().gen_range(min..max))
        }),
    )?;

    globals.set(
        "_crypto_pbkdf2Sync",
        Func::from(
            |ctx: Ctx<'_>,
             password: BytesArg,
             salt: BytesArg,
             iterations: u32,
             key_len: u32,
             digest: String| {
                sync_result(
                    &ctx,
                    pbkdf2_derive(&password.0, &salt.0, iterations, key_len as usize, &digest)
                        .map(JsBytes),
                )
            },
        ),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_crypto_pbkdf2",
        Func::from(Async(
            move |password: BytesArg,
                  salt: BytesArg,
                  iterations: u32,
                  key_len: u32,
                  digest: String| {
                let st = Arc::clone(&st);
                async move {
                    let result = st
                        .guard(async move {
                            tokio::task::spawn_blocking(move || {
                                pbkdf2_derive(
                                    &password.0,
                                    &salt.0,
                                    iterations,
                                    key_len as usize,
                                    &digest,
                                )
                                .map(JsBytes)
                            })
                            .await
                            .map_err(|e| {
                                FuncliteError::Internal(format!("blocking task failed: {}", e))
                            })?
                        })
                        .await;
                    Ok::<_, rquickjs::Error>(AsyncReply::from(result))
                }
            },
        )),
    )?;

    Ok(())
}
