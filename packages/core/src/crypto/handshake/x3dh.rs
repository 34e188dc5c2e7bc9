//! X3DH (Extended Triple Diffie-Hellman) Protocol
//!
//! ## Ключи
//!
//! ### Alice (инициатор)
//! - **IK_A**: Identity Key (долгосрочный)
//! - **EK_A**: Base Key (одноразовый, генерируется для каждой сессии)
//!
//! ### Bob (получатель)
//! - **IK_B**: Identity Key (долгосрочный)
//! - **SPK_B**: Signed Prekey (среднесрочный, ротируется)
//! - **OPK_B**: One-time Prekey (опционален, расходуется ровно один раз)
//!
//! ```text
//! SK = HKDF(salt = 0^32, ikm = 0xFF^32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! Подпись signed pre-key покрывает identity key, id и публичный ключ
//! signed pre-key, поэтому подмена identity в bundle ломает проверку.

use crate::crypto::handshake::{InitiatorState, KeyAgreement, SharedSecret};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::SuiteID;
use crate::error::CryptoError;
use crate::utils::logging::key_prefix;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, trace};
use zeroize::Zeroizing;

const X3DH_INFO: &[u8] = b"Signet-X3DH";

/// Публичная one-time pre-key из bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

/// Публичные ключи одного устройства получателя
///
/// Alice получает этот bundle из директории перед началом handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,

    /// IK_B (X25519)
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,

    /// Ed25519 ключ, которым подписан signed pre-key
    #[serde(with = "serde_bytes")]
    pub verifying_key: Vec<u8>,

    pub signed_prekey_id: u32,
    #[serde(with = "serde_bytes")]
    pub signed_prekey_public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signed_prekey_signature: Vec<u8>,

    pub one_time_prekey: Option<OneTimePreKeyPublic>,

    pub suite_id: SuiteID,
}

/// Байты, которые подписываются signing key: IK || id (BE) || SPK
pub fn signed_prekey_message(identity_key: &[u8], signed_prekey_id: u32, signed_prekey: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(identity_key.len() + 4 + signed_prekey.len());
    message.extend_from_slice(identity_key);
    message.extend_from_slice(&signed_prekey_id.to_be_bytes());
    message.extend_from_slice(signed_prekey);
    message
}

/// X3DH Protocol Implementation
///
/// Stateless struct - все данные передаются через параметры методов.
pub struct X3DHProtocol<P: CryptoProvider> {
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> X3DHProtocol<P> {
    fn derive_root_key(dh_outputs: &[Vec<u8>]) -> Result<SharedSecret, CryptoError> {
        // 0xFF * 32 префикс отделяет X25519 вывод от любых других KDF входов
        let mut ikm = Zeroizing::new(vec![0xFFu8; 32]);
        for dh in dh_outputs {
            ikm.extend_from_slice(dh);
        }

        let root_key = P::hkdf_derive_key(&[0u8; 32], &ikm, X3DH_INFO, 32)?;
        Ok(Zeroizing::new(root_key))
    }
}

impl<P: CryptoProvider> KeyAgreement<P> for X3DHProtocol<P> {
    type PublicKeyBundle = PreKeyBundle;
    type SharedSecret = SharedSecret;

    fn perform_as_initiator(
        local_identity: &P::DhPrivateKey,
        remote_bundle: &Self::PublicKeyBundle,
    ) -> Result<(Self::SharedSecret, InitiatorState<P>), CryptoError> {
        debug!(
            target: "crypto::x3dh",
            remote_identity = %key_prefix(&remote_bundle.identity_key),
            signed_prekey_id = remote_bundle.signed_prekey_id,
            has_one_time = remote_bundle.one_time_prekey.is_some(),
            "Starting X3DH as initiator"
        );

        if remote_bundle.suite_id != P::suite_id() {
            return Err(CryptoError::InvalidInputError(format!(
                "Unsupported suite {} (expected {})",
                remote_bundle.suite_id,
                P::suite_id()
            )));
        }

        let remote_identity = P::dh_public_key_from_bytes(&remote_bundle.identity_key)?;
        let remote_signed_prekey = P::dh_public_key_from_bytes(&remote_bundle.signed_prekey_public)?;
        let remote_verifying_key = P::signature_public_key_from_bytes(&remote_bundle.verifying_key)?;

        // 1. Подпись signed pre-key
        let signed = signed_prekey_message(
            &remote_bundle.identity_key,
            remote_bundle.signed_prekey_id,
            &remote_bundle.signed_prekey_public,
        );
        P::verify(&remote_verifying_key, &signed, &remote_bundle.signed_prekey_signature).map_err(|e| {
            debug!(target: "crypto::x3dh", error = %e, "Signed pre-key signature rejected");
            e
        })?;

        // 2. Base key для этой сессии
        let (base_private, base_public) = P::generate_dh_keys()?;
        let base_private = Zeroizing::new(base_private);

        // 3. DH1..DH4
        trace!(target: "crypto::x3dh", "Computing DH1..DH3");
        let mut dh_outputs = vec![
            P::dh(local_identity, &remote_signed_prekey)?,
            P::dh(&base_private, &remote_identity)?,
            P::dh(&base_private, &remote_signed_prekey)?,
        ];

        let one_time_prekey_id = match &remote_bundle.one_time_prekey {
            Some(otpk) => {
                trace!(target: "crypto::x3dh", one_time_prekey_id = otpk.id, "Computing DH4");
                let one_time_public = P::dh_public_key_from_bytes(&otpk.public_key)?;
                dh_outputs.push(P::dh(&base_private, &one_time_public)?);
                Some(otpk.id)
            }
            None => None,
        };

        let root_key = Self::derive_root_key(&dh_outputs);
        for dh in dh_outputs.iter_mut() {
            zeroize::Zeroize::zeroize(dh);
        }
        let root_key = root_key?;

        debug!(
            target: "crypto::x3dh",
            base_key = %key_prefix(base_public.as_ref()),
            "X3DH completed as initiator"
        );

        Ok((
            root_key,
            InitiatorState {
                base_key_public: base_public,
                remote_signed_prekey,
                signed_prekey_id: remote_bundle.signed_prekey_id,
                one_time_prekey_id,
            },
        ))
    }

    fn perform_as_responder(
        local_identity: &P::DhPrivateKey,
        local_signed_prekey: &P::DhPrivateKey,
        local_one_time_prekey: Option<&P::DhPrivateKey>,
        remote_identity: &P::DhPublicKey,
        remote_base_key: &P::DhPublicKey,
    ) -> Result<Self::SharedSecret, CryptoError> {
        debug!(
            target: "crypto::x3dh",
            remote_identity = %key_prefix(remote_identity.as_ref()),
            base_key = %key_prefix(remote_base_key.as_ref()),
            "Starting X3DH as responder"
        );

        let mut dh_outputs = vec![
            P::dh(local_signed_prekey, remote_identity)?,
            P::dh(local_identity, remote_base_key)?,
            P::dh(local_signed_prekey, remote_base_key)?,
        ];
        if let Some(one_time) = local_one_time_prekey {
            dh_outputs.push(P::dh(one_time, remote_base_key)?);
        }

        let root_key = Self::derive_root_key(&dh_outputs);
        for dh in dh_outputs.iter_mut() {
            zeroize::Zeroize::zeroize(dh);
        }

        debug!(target: "crypto::x3dh", "X3DH completed as responder");
        root_key
    }
}
