//! Alice/Bob scenarios through the message pipeline
//!
//! Each device has its own encrypted store, key store, session store and
//! trust store. Envelopes are passed between them by hand.

use signet_core::config::Config;
use signet_core::crypto::handshake::PreKeyBundle;
use signet_core::crypto::keys::{IdentityKeyStore, IdentityPublic};
use signet_core::crypto::messaging::RatchetLimits;
use signet_core::crypto::suites::classic::ClassicSuiteProvider;
use signet_core::pipeline::MessagePipeline;
use signet_core::protocol::messages::{Content, DataMessage, Envelope, EnvelopeType};
use signet_core::session::{SessionAddress, SessionState, SessionStore};
use signet_core::storage::{EncryptedStore, MemoryBlobStore, StorageEncryption};
use signet_core::trust::{TrustState, TrustStore, UntrustedReason};
use signet_core::utils::error::{CoreError, DecryptionError, ErrorClass, SessionError};
use signet_core::utils::logging::init_tracing;
use std::sync::Arc;

const WINDOW: u32 = 5;

fn config() -> Config {
    Config {
        pbkdf2_iterations: 1_000,
        one_time_prekey_batch_size: 5,
        one_time_prekey_low_water_mark: 2,
        max_skipped_messages: WINDOW,
        max_message_keys: WINDOW as usize,
        ..Config::default()
    }
}

struct Device {
    name: &'static str,
    identity: IdentityPublic,
    pipeline: MessagePipeline<ClassicSuiteProvider>,
}

fn device(name: &'static str) -> Device {
    init_tracing("warn");
    let store = Arc::new(
        EncryptedStore::create(
            Arc::new(MemoryBlobStore::new()),
            StorageEncryption::AutoUnlock,
            None,
            config(),
        )
        .unwrap(),
    );
    let keys = Arc::new(IdentityKeyStore::new(store.clone(), config()));
    let identity = keys.generate_identity(1).unwrap();
    let sessions = Arc::new(SessionStore::new(
        store.clone(),
        RatchetLimits::from_config(&config()),
    ));
    let trust = Arc::new(TrustStore::new(store));

    Device {
        name,
        identity,
        pipeline: MessagePipeline::new(name, keys, sessions, trust, 64),
    }
}

fn text(body: &str) -> Content {
    Content::Data(DataMessage {
        body: body.as_bytes().to_vec(),
        attachments: Vec::new(),
        timestamp: 0,
    })
}

fn body_of(content: &Content) -> String {
    match content {
        Content::Data(data) => String::from_utf8(data.body.clone()).unwrap(),
        other => panic!("unexpected content {:?}", other),
    }
}

impl Device {
    fn address(&self) -> SessionAddress {
        SessionAddress::new(self.name, 1)
    }

    fn bundle(&self, one_time_index: Option<usize>) -> PreKeyBundle {
        self.pipeline
            .keys()
            .upload_bundle()
            .unwrap()
            .to_bundle(one_time_index)
            .unwrap()
    }

    fn send(&self, to: &Device, body: &str, timestamp: u64) -> Envelope {
        let sealed = self
            .pipeline
            .encrypt_content(&to.address(), &text(body))
            .unwrap();
        self.pipeline.envelope(&self.identity, &sealed, timestamp)
    }

    fn receive(&self, envelope: &Envelope) -> String {
        body_of(&self.pipeline.decrypt(envelope).unwrap().content)
    }

    fn session_state(&self, peer: &Device) -> Option<SessionState> {
        self.pipeline
            .sessions()
            .get_session(&peer.address())
            .unwrap()
            .map(|info| info.state)
    }
}

/// Alice начинает сессию pre-key сообщением, Bob отвечает
fn handshake(alice: &Device, bob: &Device) {
    assert!(alice.pipeline.establish(&bob.address(), &bob.bundle(Some(0))).unwrap());
    let first = alice.send(bob, "hello", 1);
    assert_eq!(first.envelope_type, EnvelopeType::PreKeyBundle);
    assert_eq!(bob.receive(&first), "hello");
}

#[test]
fn test_reordered_delivery_and_duplicate() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);
    assert_eq!(bob.session_state(&alice), Some(SessionState::Established));

    let m1 = bob.send(&alice, "one", 10);
    let m2 = bob.send(&alice, "two", 11);
    let m3 = bob.send(&alice, "three", 12);
    assert_eq!(m1.envelope_type, EnvelopeType::Ciphertext);

    assert_eq!(alice.receive(&m2), "two");
    assert_eq!(alice.receive(&m3), "three");
    assert_eq!(alice.receive(&m1), "one");
    assert_eq!(alice.session_state(&bob), Some(SessionState::Established));

    let err = alice.pipeline.decrypt(&m2).unwrap_err();
    match err {
        CoreError::Decryption(e) => assert!(e.is_duplicate()),
        other => panic!("unexpected error {:?}", other),
    }

    // Сессия не пострадала
    let m4 = bob.send(&alice, "four", 13);
    assert_eq!(alice.receive(&m4), "four");
}

#[test]
fn test_long_conversation_roundtrip() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);

    let mut timestamp = 100;
    for round in 0..10 {
        for i in 0..(round % 3 + 1) {
            timestamp += 1;
            let body = format!("bob {} {}", round, i);
            assert_eq!(alice.receive(&bob.send(&alice, &body, timestamp)), body);
        }
        timestamp += 1;
        let body = format!("alice {}", round);
        assert_eq!(bob.receive(&alice.send(&bob, &body, timestamp)), body);
    }
}

#[test]
fn test_replayed_prekey_message_after_session_loss() {
    let alice = device("alice");
    let bob = device("bob");
    alice.pipeline.establish(&bob.address(), &bob.bundle(Some(0))).unwrap();
    let first = alice.send(&bob, "hello", 1);
    assert_eq!(bob.receive(&first), "hello");

    // Сессия потеряна, тот же pre-key message приходит снова с другим timestamp
    assert!(bob.pipeline.sessions().delete_session(&alice.address()).unwrap());
    let mut replay = first.clone();
    replay.timestamp = 2;

    let err = bob.pipeline.decrypt(&replay).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Decryption(DecryptionError::Session(SessionError::PreKeyAlreadyUsed(_)))
    ));
    assert_eq!(err.class(), ErrorClass::PerSession);
    assert_eq!(bob.session_state(&alice), None);
}

#[test]
fn test_replayed_prekey_message_without_one_time_prekey() {
    let alice = device("alice");
    let bob = device("bob");

    // Пул one-time pre-keys пуст: bundle только с signed pre-key
    alice.pipeline.establish(&bob.address(), &bob.bundle(None)).unwrap();
    let first = alice.send(&bob, "hello", 1);
    assert_eq!(bob.receive(&first), "hello");

    // Alice потеряла сессию и начала новую, тоже без one-time pre-key
    alice.pipeline.sessions().delete_session(&bob.address()).unwrap();
    alice.pipeline.establish(&bob.address(), &bob.bundle(None)).unwrap();
    assert_eq!(bob.receive(&alice.send(&bob, "second", 2)), "second");
    let generation = bob.pipeline.sessions().generation(&alice.address()).unwrap();

    // Перехваченное первое сообщение с новым timestamp
    let mut replay = first.clone();
    replay.timestamp = 99;
    match bob.pipeline.decrypt(&replay).unwrap_err() {
        CoreError::Decryption(e) => assert!(e.is_duplicate()),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        bob.pipeline.sessions().generation(&alice.address()).unwrap(),
        generation
    );

    // Живая сессия не пострадала
    assert_eq!(bob.receive(&alice.send(&bob, "third", 3)), "third");
    assert_eq!(alice.receive(&bob.send(&alice, "reply", 4)), "reply");

    // Даже без сессии у Bob повтор не создаёт новую
    bob.pipeline.sessions().delete_session(&alice.address()).unwrap();
    replay.timestamp = 100;
    assert!(bob.pipeline.decrypt(&replay).is_err());
    assert_eq!(bob.session_state(&alice), None);
}

#[test]
fn test_identity_change_forces_untrusted() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);

    // Даже проверенный собеседник теряет статус при смене ключа
    alice.pipeline.trust().mark_verified("bob").unwrap();
    assert_eq!(
        alice.pipeline.trust().trust_state("bob").unwrap(),
        Some(TrustState::UserVerified)
    );

    let reinstalled = device("bob");
    let err = alice
        .pipeline
        .establish(&bob.address(), &reinstalled.bundle(Some(0)))
        .unwrap_err();
    assert!(matches!(err, CoreError::Session(SessionError::UntrustedIdentity(_))));
    assert_eq!(
        alice.pipeline.trust().trust_state("bob").unwrap(),
        Some(TrustState::Untrusted(UntrustedReason::Changed))
    );

    let err = alice
        .pipeline
        .encrypt_content(&bob.address(), &text("blocked"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Session(SessionError::UntrustedIdentity(_))));

    // Пользователь подтвердил новый ключ: старая сессия заменяется
    alice.pipeline.trust().confirm_identity("bob").unwrap();
    assert!(alice
        .pipeline
        .establish(&bob.address(), &reinstalled.bundle(Some(0)))
        .unwrap());
    let envelope = alice.send(&reinstalled, "welcome back", 20);
    assert_eq!(reinstalled.receive(&envelope), "welcome back");
}

#[test]
fn test_skip_window_boundary() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);

    let messages: Vec<Envelope> = (0..=WINDOW + 1)
        .map(|i| bob.send(&alice, &format!("m{}", i), 10 + u64::from(i)))
        .collect();

    let err = alice.pipeline.decrypt(&messages[(WINDOW + 1) as usize]).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Decryption(DecryptionError::Session(SessionError::TooManySkippedMessages { .. }))
    ));

    // Сообщения внутри окна расшифровываются
    assert_eq!(alice.receive(&messages[WINDOW as usize]), format!("m{}", WINDOW));
    assert_eq!(alice.receive(&messages[0]), "m0");
    assert_eq!(alice.receive(&messages[(WINDOW + 1) as usize]), format!("m{}", WINDOW + 1));
}

#[test]
fn test_end_session_notice_removes_peer_session() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);
    let reply = bob.send(&alice, "hi", 5);
    alice.receive(&reply);

    let sealed = alice
        .pipeline
        .reset_session(&bob.address())
        .unwrap()
        .expect("established session sends a notice");
    assert_eq!(alice.session_state(&bob), None);

    let notice = alice.pipeline.envelope(&alice.identity, &sealed, 6);
    let received = bob.pipeline.decrypt(&notice).unwrap();
    assert_eq!(received.content, Content::EndSession);
    assert_eq!(bob.session_state(&alice), None);

    // Следующая отправка начинает новый обмен ключами
    assert!(alice.pipeline.establish(&bob.address(), &bob.bundle(Some(1))).unwrap());
    let again = alice.send(&bob, "fresh start", 7);
    assert_eq!(again.envelope_type, EnvelopeType::PreKeyBundle);
    assert_eq!(bob.receive(&again), "fresh start");
}

#[test]
fn test_new_prekey_message_supersedes_session() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);
    let before = bob.pipeline.sessions().generation(&alice.address()).unwrap();

    // Alice потеряла сессию и начинает заново
    alice.pipeline.sessions().delete_session(&bob.address()).unwrap();
    alice.pipeline.establish(&bob.address(), &bob.bundle(Some(1))).unwrap();
    assert_eq!(bob.receive(&alice.send(&bob, "again", 30)), "again");

    assert!(bob.pipeline.sessions().generation(&alice.address()).unwrap() > before);
    assert_eq!(bob.pipeline.sessions().sub_device_sessions("alice").unwrap(), vec![1]);

    // Ответ идёт уже в новой сессии
    assert_eq!(alice.receive(&bob.send(&alice, "got it", 31)), "got it");
}

#[test]
fn test_tampered_ciphertext_is_terminal_for_message_only() {
    let alice = device("alice");
    let bob = device("bob");
    handshake(&alice, &bob);

    let mut tampered = bob.send(&alice, "original", 40);
    let last = tampered.content.len() - 1;
    tampered.content[last] ^= 0x01;
    let err = alice.pipeline.decrypt(&tampered).unwrap_err();
    assert_eq!(err.class(), ErrorClass::PerMessage);

    assert_eq!(alice.receive(&bob.send(&alice, "next", 41)), "next");
}
