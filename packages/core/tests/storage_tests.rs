//! File-backed encrypted storage: password unlock, persistence across
//! restarts, unlock attempt limits

use signet_core::config::Config;
use signet_core::crypto::keys::IdentityKeyStore;
use signet_core::crypto::messaging::RatchetLimits;
use signet_core::crypto::suites::classic::ClassicSuiteProvider;
use signet_core::pipeline::MessagePipeline;
use signet_core::protocol::messages::{Content, DataMessage};
use signet_core::session::{SessionAddress, SessionStore};
use signet_core::storage::{BlobStore, EncryptedStore, FileBlobStore, MemoryBlobStore, StorageEncryption};
use signet_core::trust::TrustStore;
use signet_core::utils::error::{CoreError, ErrorClass, KeyStoreError};
use std::path::Path;
use std::sync::Arc;

type Suite = ClassicSuiteProvider;

const PASSWORD: &str = "correct1horse";

fn config() -> Config {
    Config {
        pbkdf2_iterations: 1_000,
        one_time_prekey_batch_size: 5,
        one_time_prekey_low_water_mark: 2,
        max_unlock_attempts: 3,
        ..Config::default()
    }
}

fn file_store(root: &Path) -> Arc<dyn BlobStore> {
    Arc::new(FileBlobStore::open(root).unwrap())
}

fn pipeline(name: &str, store: Arc<EncryptedStore>) -> MessagePipeline<Suite> {
    let keys = Arc::new(IdentityKeyStore::new(store.clone(), config()));
    let sessions = Arc::new(SessionStore::new(store.clone(), RatchetLimits::from_config(&config())));
    let trust = Arc::new(TrustStore::new(store));
    MessagePipeline::new(name, keys, sessions, trust, 64)
}

fn memory_store() -> Arc<EncryptedStore> {
    Arc::new(
        EncryptedStore::create(
            Arc::new(MemoryBlobStore::new()),
            StorageEncryption::AutoUnlock,
            None,
            config(),
        )
        .unwrap(),
    )
}

fn files_under(root: &Path) -> Vec<Vec<u8>> {
    let mut contents = Vec::new();
    for namespace in std::fs::read_dir(root).unwrap() {
        let namespace = namespace.unwrap().path();
        if namespace.is_dir() {
            for record in std::fs::read_dir(&namespace).unwrap() {
                contents.push(std::fs::read(record.unwrap().path()).unwrap());
            }
        }
    }
    contents
}

#[test]
fn test_sessions_survive_restart_with_password() {
    let dir = tempfile::tempdir().unwrap();
    let bob_address = SessionAddress::new("bob", 1);

    let bob = pipeline("bob", memory_store());
    let bob_identity = bob.keys().generate_identity(1).unwrap();
    let bob_bundle = bob.keys().upload_bundle().unwrap().to_bundle(Some(0)).unwrap();

    let alice_identity = {
        let store = Arc::new(
            EncryptedStore::create(
                file_store(dir.path()),
                StorageEncryption::Password,
                Some(PASSWORD),
                config(),
            )
            .unwrap(),
        );
        let alice = pipeline("alice", store);
        let identity = alice.keys().generate_identity(1).unwrap();
        alice.establish(&bob_address, &bob_bundle).unwrap();

        let content = Content::Data(DataMessage {
            body: b"before restart".to_vec(),
            attachments: Vec::new(),
            timestamp: 1,
        });
        let sealed = alice.encrypt_content(&bob_address, &content).unwrap();
        bob.decrypt(&alice.envelope(&identity, &sealed, 1)).unwrap();
        identity
    };

    // Ключевой материал на диске только в зашифрованном виде
    for record in files_under(dir.path()) {
        assert!(!record
            .windows(alice_identity.identity_key.len())
            .any(|window| window == alice_identity.identity_key.as_slice()));
    }

    let store = Arc::new(EncryptedStore::open(file_store(dir.path()), config()).unwrap());
    assert!(!store.is_unlocked());
    let alice = pipeline("alice", store);

    let err = alice.keys().load_identity(Some("wrong1horse")).unwrap_err();
    assert!(matches!(err, CoreError::KeyStore(KeyStoreError::Auth)));
    assert_eq!(alice.keys().load_identity(Some(PASSWORD)).unwrap(), alice_identity);

    let info = alice.sessions().get_session(&bob_address).unwrap().unwrap();
    assert_eq!(info.remote_identity, bob_identity.identity_key);

    // Ratchet продолжается с сохранённого состояния
    let content = Content::Data(DataMessage {
        body: b"after restart".to_vec(),
        attachments: Vec::new(),
        timestamp: 2,
    });
    let sealed = alice.encrypt_content(&bob_address, &content).unwrap();
    let received = bob.decrypt(&alice.envelope(&alice_identity, &sealed, 2)).unwrap();
    assert_eq!(received.content, content);
}

#[test]
fn test_unlock_attempts_exhausted_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(
            EncryptedStore::create(
                file_store(dir.path()),
                StorageEncryption::Password,
                Some(PASSWORD),
                config(),
            )
            .unwrap(),
        );
        IdentityKeyStore::<Suite>::new(store, config())
            .generate_identity(1)
            .unwrap();
    }

    let store = Arc::new(EncryptedStore::open(file_store(dir.path()), config()).unwrap());
    let keys = IdentityKeyStore::<Suite>::new(store.clone(), config());
    for _ in 0..2 {
        let err = keys.load_identity(Some("wrong1horse")).unwrap_err();
        assert!(matches!(err, CoreError::KeyStore(KeyStoreError::Auth)));
    }
    let err = keys.load_identity(Some("wrong1horse")).unwrap_err();
    assert!(matches!(err, CoreError::KeyStore(KeyStoreError::UnlockAttemptsExhausted(3))));
    assert_eq!(err.class(), ErrorClass::Fatal);

    // Счётчик переживает перезапуск, правильный пароль уже не помогает
    let store = Arc::new(EncryptedStore::open(file_store(dir.path()), config()).unwrap());
    assert_eq!(store.failed_attempts().unwrap(), 3);
    let keys = IdentityKeyStore::<Suite>::new(store, config());
    let err = keys.load_identity(Some(PASSWORD)).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);
}

#[test]
fn test_wipe_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let inner = file_store(dir.path());
    let store = Arc::new(
        EncryptedStore::create(inner.clone(), StorageEncryption::AutoUnlock, None, config()).unwrap(),
    );
    IdentityKeyStore::<Suite>::new(store.clone(), config())
        .generate_identity(1)
        .unwrap();
    assert!(EncryptedStore::exists(inner.as_ref()).unwrap());

    store.wipe().unwrap();
    assert!(!EncryptedStore::exists(inner.as_ref()).unwrap());
    assert!(files_under(dir.path()).is_empty());
    assert!(EncryptedStore::open(inner, config()).is_err());
}
