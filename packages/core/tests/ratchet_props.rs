//! Property tests: round-trip of arbitrary plaintext and out-of-order
//! delivery inside the skip window

use proptest::prelude::*;
use signet_core::config::Config;
use signet_core::crypto::keys::{IdentityKeyStore, IdentityPublic};
use signet_core::crypto::messaging::RatchetLimits;
use signet_core::crypto::suites::classic::ClassicSuiteProvider;
use signet_core::pipeline::MessagePipeline;
use signet_core::protocol::messages::{Attachment, Content, DataMessage, Envelope};
use signet_core::session::{SessionAddress, SessionStore};
use signet_core::storage::{EncryptedStore, MemoryBlobStore, StorageEncryption};
use signet_core::trust::TrustStore;
use std::sync::Arc;

const WINDOW: u32 = 8;

struct Device {
    identity: IdentityPublic,
    pipeline: MessagePipeline<ClassicSuiteProvider>,
}

fn device(name: &str) -> Device {
    let config = Config {
        max_skipped_messages: WINDOW,
        max_message_keys: WINDOW as usize,
        one_time_prekey_batch_size: 2,
        one_time_prekey_low_water_mark: 1,
        ..Config::default()
    };
    let store = Arc::new(
        EncryptedStore::create(
            Arc::new(MemoryBlobStore::new()),
            StorageEncryption::AutoUnlock,
            None,
            config.clone(),
        )
        .unwrap(),
    );
    let keys = Arc::new(IdentityKeyStore::new(store.clone(), config.clone()));
    let identity = keys.generate_identity(1).unwrap();
    let sessions = Arc::new(SessionStore::new(store.clone(), RatchetLimits::from_config(&config)));
    let trust = Arc::new(TrustStore::new(store));
    Device {
        identity,
        pipeline: MessagePipeline::new(name, keys, sessions, trust, 256),
    }
}

fn seal(from: &Device, to: &str, content: &Content, timestamp: u64) -> Envelope {
    let sealed = from
        .pipeline
        .encrypt_content(&SessionAddress::new(to, 1), content)
        .unwrap();
    from.pipeline.envelope(&from.identity, &sealed, timestamp)
}

/// Сессия alice -> bob после первого pre-key сообщения
fn connected() -> (Device, Device) {
    let alice = device("alice");
    let bob = device("bob");
    let bundle = bob.pipeline.keys().upload_bundle().unwrap().to_bundle(Some(0)).unwrap();
    alice
        .pipeline
        .establish(&SessionAddress::new("bob", 1), &bundle)
        .unwrap();
    let hello = seal(&alice, "bob", &data(b"hello".to_vec(), Vec::new()), 1);
    bob.pipeline.decrypt(&hello).unwrap();
    (alice, bob)
}

fn data(body: Vec<u8>, attachments: Vec<Attachment>) -> Content {
    Content::Data(DataMessage {
        body,
        attachments,
        timestamp: 0,
    })
}

fn attachment() -> impl Strategy<Value = Attachment> {
    (
        "[a-z0-9]{1,16}",
        prop::collection::vec(any::<u8>(), 32),
        any::<u64>(),
    )
        .prop_map(|(id, key, size)| Attachment {
            id,
            content_type: "application/octet-stream".to_string(),
            size,
            digest: key.iter().rev().copied().collect(),
            key,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_roundtrip_both_directions(
        messages in prop::collection::vec(
            (any::<bool>(), prop::collection::vec(any::<u8>(), 0..512), prop::collection::vec(attachment(), 0..3)),
            1..16,
        )
    ) {
        let (alice, bob) = connected();
        for (i, (from_alice, body, attachments)) in messages.into_iter().enumerate() {
            let content = data(body, attachments);
            let timestamp = 10 + i as u64;
            let (sender, receiver, to) = if from_alice {
                (&alice, &bob, "bob")
            } else {
                (&bob, &alice, "alice")
            };
            let received = receiver.pipeline.decrypt(&seal(sender, to, &content, timestamp)).unwrap();
            prop_assert_eq!(received.content, content);
        }
    }

    #[test]
    fn prop_any_order_inside_window(order in Just((0..WINDOW as usize).collect::<Vec<_>>()).prop_shuffle()) {
        let (alice, bob) = connected();
        let envelopes: Vec<Envelope> = (0..WINDOW as usize)
            .map(|i| seal(&bob, "alice", &data(vec![i as u8], Vec::new()), 100 + i as u64))
            .collect();

        for index in order {
            let received = alice.pipeline.decrypt(&envelopes[index]).unwrap();
            prop_assert_eq!(received.content, data(vec![index as u8], Vec::new()));
        }

        // Каждое сообщение расшифровывается только один раз
        for envelope in &envelopes {
            prop_assert!(alice.pipeline.decrypt(envelope).is_err());
        }
    }
}
