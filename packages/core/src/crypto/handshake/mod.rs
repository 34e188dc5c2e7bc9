//! Key Agreement Protocols
//!
//! Протоколы установки ключей: общий секрет между двумя сторонами без
//! предварительного обмена секретами, Bob при этом может быть offline.
//!
//! ## Dataflow
//! ```text
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//! 1. Получает Bob's PreKeyBundle из директории
//! 2. KeyAgreement::perform_as_initiator()
//!    → (shared_secret, InitiatorState)
//! 3. InitiatorState содержит base key и id использованных pre-keys,
//!    они уходят в каждом PreKeySignalMessage до первого ответа
//!
//!                                            1. Получает PreKeySignalMessage
//!                                            2. Находит signed / one-time pre-key по id
//!                                            3. KeyAgreement::perform_as_responder()
//!                                               → тот же shared_secret
//! ```

use crate::crypto::provider::CryptoProvider;
use crate::error::CryptoError;
use zeroize::Zeroizing;

/// Состояние инициатора после key agreement
///
/// Всё, что нужно Alice, чтобы построить ratchet и сообщить Bob'у,
/// какие его pre-keys были использованы.
pub struct InitiatorState<P: CryptoProvider> {
    /// Base key (EK_A) - публичная часть отправляется в PreKeySignalMessage
    pub base_key_public: P::DhPublicKey,

    /// Signed pre-key получателя, становится первым remote ratchet key
    pub remote_signed_prekey: P::DhPublicKey,

    pub signed_prekey_id: u32,

    /// None, если в bundle не было one-time pre-key
    pub one_time_prekey_id: Option<u32>,
}

/// Протокол установки ключей (Key Agreement)
///
/// ## Ответственность
/// - Проверка подписи signed pre-key
/// - Вычисление общего секрета (root key)
///
/// ## Не отвечает за:
/// - Шифрование сообщений (это делает SecureMessaging)
/// - Хранение и расход pre-keys (это делает IdentityKeyStore)
pub trait KeyAgreement<P: CryptoProvider> {
    /// Публичные ключи получателя, опубликованные в директории
    type PublicKeyBundle;

    /// Общий секретный ключ, становится root key для Double Ratchet
    type SharedSecret;

    /// Выполнить handshake как инициатор (Alice)
    ///
    /// # Ошибки
    /// - Signature verification failed
    /// - Invalid public key format
    fn perform_as_initiator(
        local_identity: &P::DhPrivateKey,
        remote_bundle: &Self::PublicKeyBundle,
    ) -> Result<(Self::SharedSecret, InitiatorState<P>), CryptoError>;

    /// Выполнить handshake как получатель (Bob)
    ///
    /// # Математика
    /// ```text
    /// Alice computes:                 Bob computes:
    ///   DH1 = DH(IK_A, SPK_B)           DH1 = DH(SPK_B, IK_A)
    ///   DH2 = DH(EK_A, IK_B)            DH2 = DH(IK_B, EK_A)
    ///   DH3 = DH(EK_A, SPK_B)           DH3 = DH(SPK_B, EK_A)
    ///   DH4 = DH(EK_A, OPK_B)           DH4 = DH(OPK_B, EK_A)
    /// ```
    fn perform_as_responder(
        local_identity: &P::DhPrivateKey,
        local_signed_prekey: &P::DhPrivateKey,
        local_one_time_prekey: Option<&P::DhPrivateKey>,
        remote_identity: &P::DhPublicKey,
        remote_base_key: &P::DhPublicKey,
    ) -> Result<Self::SharedSecret, CryptoError>;
}

/// Root key после X3DH
pub type SharedSecret = Zeroizing<Vec<u8>>;

pub mod x3dh;

pub use x3dh::{signed_prekey_message, OneTimePreKeyPublic, PreKeyBundle, X3DHProtocol};
