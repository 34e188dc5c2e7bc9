// In-memory транспорт и директория для тестов
//
// Доступны в тестах крейта и с feature `test`.

use super::transport::{KeyDirectory, Transport};
use crate::crypto::handshake::PreKeyBundle;
use crate::protocol::messages::PreKeyUpload;
use crate::utils::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// In-memory директория
///
/// Как и сервер, выдаёт каждый one-time pre-key только один раз.
#[derive(Default)]
pub struct MemoryDirectory {
    uploads: Mutex<HashMap<String, HashMap<u32, PreKeyUpload>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Убрать устройство (unlink)
    pub fn remove_device(&self, peer: &str, device: u32) -> bool {
        self.uploads
            .lock()
            .map(|mut uploads| {
                uploads
                    .get_mut(peer)
                    .map(|devices| devices.remove(&device).is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn fetch_bundles(&self, peer: &str) -> Result<Vec<PreKeyBundle>, TransportError> {
        let mut uploads = self
            .uploads
            .lock()
            .map_err(|_| TransportError::Unavailable("Directory lock poisoned".to_string()))?;
        let devices = uploads
            .get_mut(peer)
            .ok_or_else(|| TransportError::Rejected(format!("Unknown peer {}", peer)))?;

        let mut device_ids: Vec<u32> = devices.keys().copied().collect();
        device_ids.sort_unstable();

        let mut bundles = Vec::with_capacity(device_ids.len());
        for device in device_ids {
            if let Some(upload) = devices.get_mut(&device) {
                let has_one_time = !upload.one_time_prekeys.is_empty();
                let bundle = upload
                    .to_bundle(has_one_time.then_some(0))
                    .map_err(|e| TransportError::Rejected(e.to_string()))?;
                if has_one_time {
                    upload.one_time_prekeys.remove(0);
                }
                bundles.push(bundle);
            }
        }
        Ok(bundles)
    }

    async fn publish(&self, peer: &str, upload: PreKeyUpload) -> Result<(), TransportError> {
        let mut uploads = self
            .uploads
            .lock()
            .map_err(|_| TransportError::Unavailable("Directory lock poisoned".to_string()))?;
        uploads
            .entry(peer.to_string())
            .or_default()
            .insert(upload.device_id, upload);
        Ok(())
    }
}

/// Транспорт поверх tokio канала
///
/// `fail_next(n)` заставляет следующие n отправок вернуть `Unavailable`.
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    failures: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                failures: AtomicUsize::new(0),
            },
            receiver,
        )
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_envelope(&self, envelope: Vec<u8>) -> Result<(), TransportError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Unavailable("Simulated network failure".to_string()));
        }

        self.sender
            .send(envelope)
            .map_err(|_| TransportError::Unavailable("Receiver closed".to_string()))
    }
}
