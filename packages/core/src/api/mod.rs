// Публичный API ядра мессенджера
//
// MessengerCore связывает хранилища, pipeline и внешних коллабораторов
// (транспорт, директорию ключей). Отправка асинхронная: send_message
// возвращает MessageId сразу, результат приходит событием.

pub mod maintenance;

use crate::config::Config;
use crate::crypto::keys::{IdentityKeyStore, IdentityPublic};
use crate::crypto::messaging::RatchetLimits;
use crate::crypto::CryptoProvider;
use crate::pipeline::{MessagePipeline, Outbox, ReceivedMessage, SealedMessage};
use crate::protocol::messages::{Attachment, Content, DataMessage, EnvelopeType, MessageId};
use crate::protocol::transport::{KeyDirectory, Transport};
use crate::protocol::validation::validate_address;
use crate::protocol::wire::{pack_content, pack_envelope, unpack_envelope};
use crate::session::{SessionAddress, SessionStore};
use crate::state::{ConnectionCell, ConnectionState, RetryBackoff};
use crate::storage::EncryptedStore;
use crate::trust::{TrustState, TrustStore};
use crate::utils::error::{CoreError, ErrorClass, SessionError, StorageError};
use crate::utils::time::current_timestamp_millis;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use maintenance::MaintenanceReport;

/// Сколько событий держит broadcast канал для медленных подписчиков
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// События ядра для UI слоя
#[derive(Debug, Clone)]
pub enum CoreEvent {
    MessageReceived(ReceivedMessage),
    /// Envelope не расшифрован; разговор продолжается
    Undecryptable {
        sender: String,
        device: u32,
        timestamp: u64,
        class: ErrorClass,
        error: String,
    },
    SendCompleted {
        id: MessageId,
        peer: String,
    },
    SendFailed {
        id: MessageId,
        peer: String,
        class: ErrorClass,
        error: String,
    },
    SendCancelled {
        id: MessageId,
        peer: String,
    },
    /// Identity собеседника сменилась, нужно подтверждение пользователя
    IdentityChanged {
        peer: String,
    },
    /// Собеседник сбросил сессию с этим устройством
    SessionEnded {
        address: SessionAddress,
    },
    ConnectionChanged(ConnectionState),
}

type MessageListener = Box<dyn Fn(&ReceivedMessage) + Send + Sync>;

pub struct MessengerCore<P: CryptoProvider> {
    config: Config,
    store: Arc<EncryptedStore>,
    pipeline: MessagePipeline<P>,
    outbox: Outbox,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn KeyDirectory>,
    connection: ConnectionCell,
    events: broadcast::Sender<CoreEvent>,
    listeners: RwLock<Vec<MessageListener>>,
    /// Последняя публикация pre-keys не дошла до сервера
    publish_pending: AtomicBool,
    /// Timestamp последнего исходящего сообщения, часть ключа дедупликации у получателя
    last_timestamp: AtomicU64,
}

impl<P: CryptoProvider> MessengerCore<P> {
    pub fn new(
        config: Config,
        local_address: impl Into<String>,
        store: Arc<EncryptedStore>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn KeyDirectory>,
    ) -> Result<Arc<Self>, CoreError> {
        let local_address = local_address.into();
        validate_address(&local_address)?;

        let keys = Arc::new(IdentityKeyStore::new(Arc::clone(&store), config.clone()));
        let sessions = Arc::new(SessionStore::new(
            Arc::clone(&store),
            RatchetLimits::from_config(&config),
        ));
        let trust = Arc::new(TrustStore::new(Arc::clone(&store)));
        let pipeline = MessagePipeline::new(
            local_address,
            keys,
            sessions,
            trust,
            config.dedup_capacity,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            config,
            store,
            pipeline,
            outbox: Outbox::new(),
            transport,
            directory,
            connection: ConnectionCell::new(),
            events,
            listeners: RwLock::new(Vec::new()),
            publish_pending: AtomicBool::new(false),
            last_timestamp: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_address(&self) -> &str {
        self.pipeline.local_address()
    }

    pub fn pipeline(&self) -> &MessagePipeline<P> {
        &self.pipeline
    }

    fn keys(&self) -> &IdentityKeyStore<P> {
        self.pipeline.keys()
    }

    fn sessions(&self) -> &SessionStore<P> {
        self.pipeline.sessions()
    }

    fn trust(&self) -> &TrustStore {
        self.pipeline.trust()
    }

    /// Строго возрастающий timestamp отправки в миллисекундах
    fn next_timestamp(&self) -> u64 {
        let now = current_timestamp_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn emit(&self, event: CoreEvent) {
        // Ошибка означает только отсутствие подписчиков
        let _ = self.events.send(event);
    }

    // ============================================
    // IDENTITY
    // ============================================

    /// Первая регистрация устройства: новая identity и публикация pre-keys
    pub async fn register(&self, device_id: u32) -> Result<IdentityPublic, CoreError> {
        let identity = self.keys().generate_identity(device_id)?;
        self.publish_prekeys().await?;
        Ok(identity)
    }

    /// Загрузить identity; в режиме Password разблокирует хранилище
    pub fn unlock(&self, password: Option<&str>) -> Result<IdentityPublic, CoreError> {
        self.keys().load_identity(password)
    }

    /// Заблокировать хранилище и забыть ключи в памяти
    pub fn lock(&self) -> Result<(), CoreError> {
        self.store.lock()?;
        self.keys().unload()?;
        self.sessions().evict_cache()?;
        info!(target: "api", "Core locked");
        Ok(())
    }

    pub fn local_identity(&self) -> Result<IdentityPublic, CoreError> {
        self.keys().local_identity()
    }

    /// Опубликовать текущий bundle в директории
    pub async fn publish_prekeys(&self) -> Result<(), CoreError> {
        let upload = self.keys().upload_bundle()?;
        let one_time = upload.one_time_prekeys.len();

        match self.directory.publish(self.local_address(), upload).await {
            Ok(()) => {
                self.publish_pending.store(false, Ordering::SeqCst);
                info!(target: "api", one_time_prekeys = one_time, "Published pre-keys");
                Ok(())
            }
            Err(e) => {
                self.publish_pending.store(true, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Новая identity по запросу пользователя
    ///
    /// Все сессии удаляются, собеседники увидят смену ключа.
    pub async fn reset_identity(&self) -> Result<IdentityPublic, CoreError> {
        let identity = self.keys().reset_identity()?;
        let removed = self.sessions().delete_all()?;
        warn!(target: "api", sessions_removed = removed, "Identity reset");
        self.publish_prekeys().await?;
        Ok(identity)
    }

    /// Удалить все локальные данные: identity, сессии, trust
    pub fn wipe(&self) -> Result<(), CoreError> {
        self.sessions().delete_all()?;
        self.trust().wipe()?;
        self.keys().wipe()?;
        self.store.wipe()?;
        self.sessions().evict_cache()?;
        Ok(())
    }

    // ============================================
    // TRUST
    // ============================================

    /// Пользователь принял новую identity собеседника
    pub fn confirm_identity(&self, peer: &str) -> Result<TrustState, CoreError> {
        self.trust().confirm_identity(peer)
    }

    pub fn trust_state(&self, peer: &str) -> Result<Option<TrustState>, CoreError> {
        self.trust().trust_state(peer)
    }

    /// Safety number для показа: 12 групп по 5 цифр
    pub fn get_safety_number(&self, peer: &str) -> Result<String, CoreError> {
        let local = self.local_identity()?;
        Ok(self
            .trust()
            .safety_number(self.local_address(), &local, peer)?
            .display())
    }

    /// Сравнить safety number, введённый пользователем; при совпадении - UserVerified
    pub fn verify_safety_number(&self, peer: &str, candidate: &str) -> Result<bool, CoreError> {
        let local = self.local_identity()?;
        self.trust()
            .verify_safety_number(self.local_address(), &local, peer, candidate)
    }

    // ============================================
    // СЕССИИ
    // ============================================

    /// Устройства собеседника, с которыми есть сессия
    pub fn devices(&self, peer: &str) -> Result<Vec<u32>, CoreError> {
        self.sessions().sub_device_sessions(peer)
    }

    /// Удалить сессии со всеми устройствами собеседника без уведомления
    pub fn delete_all_sessions(&self, peer: &str) -> Result<usize, CoreError> {
        self.sessions().delete_all_sessions(peer)
    }

    /// Сбросить сессии с собеседником
    ///
    /// Каждое устройство получает end-session уведомление (одна попытка,
    /// без повторов). Следующая отправка начнёт новый X3DH.
    pub async fn reset_session(&self, peer: &str) -> Result<usize, CoreError> {
        validate_address(peer)?;
        let local = self.local_identity()?;
        let devices = self.sessions().sub_device_sessions(peer)?;

        let mut notices = Vec::new();
        for device in &devices {
            if let Some(sealed) = self
                .pipeline
                .reset_session(&SessionAddress::new(peer, *device))?
            {
                notices.push(sealed);
            }
        }

        for sealed in notices {
            let envelope = self
                .pipeline
                .envelope(&local, &sealed, self.next_timestamp());
            if let Err(e) = self.transport.send_envelope(pack_envelope(&envelope)?).await {
                warn!(target: "api", address = %sealed.address, error = %e, "End-session notice not delivered");
            }
        }
        Ok(devices.len())
    }

    // ============================================
    // ОТПРАВКА
    // ============================================

    /// Поставить сообщение в очередь отправки
    ///
    /// Возвращает сразу; `SendCompleted` / `SendFailed` / `SendCancelled`
    /// приходят через [`MessengerCore::subscribe`].
    pub async fn send_message(
        self: &Arc<Self>,
        peer: &str,
        body: Vec<u8>,
        attachments: Vec<Attachment>,
    ) -> Result<MessageId, CoreError> {
        let timestamp = self.next_timestamp();
        let content = Content::Data(DataMessage {
            body,
            attachments,
            timestamp,
        });
        self.queue(peer, content, timestamp)
    }

    /// Отправить произвольное содержимое (квитанции, реакции)
    pub async fn send_content(self: &Arc<Self>, peer: &str, content: Content) -> Result<MessageId, CoreError> {
        let timestamp = self.next_timestamp();
        self.queue(peer, content, timestamp)
    }

    fn queue(self: &Arc<Self>, peer: &str, content: Content, timestamp: u64) -> Result<MessageId, CoreError> {
        validate_address(peer)?;
        self.local_identity()?;
        if !self.trust().is_trusted_for_send(peer)? {
            return Err(SessionError::UntrustedIdentity(peer.to_string()).into());
        }
        let plaintext = pack_content(&content)?;

        let id = MessageId::new();
        self.outbox.register(id, peer)?;
        debug!(target: "api", message_id = %id, peer = %peer, "Send queued");

        let core = Arc::clone(self);
        let peer = peer.to_string();
        tokio::spawn(async move {
            let result = core.deliver(id, &peer, &plaintext, timestamp).await;
            core.outbox.complete(id);

            let event = match result {
                Ok(()) => CoreEvent::SendCompleted { id, peer },
                Err(CoreError::Session(SessionError::Cancelled)) => CoreEvent::SendCancelled { id, peer },
                Err(e) => {
                    warn!(target: "api", message_id = %id, peer = %peer, error = %e, "Send failed");
                    CoreEvent::SendFailed {
                        id,
                        peer,
                        class: e.class(),
                        error: e.to_string(),
                    }
                }
            };
            core.emit(event);
        });
        Ok(id)
    }

    /// Отменить сообщение, ещё не переданное транспорту
    pub fn cancel_send(&self, id: MessageId) -> bool {
        self.outbox.cancel(id)
    }

    /// Отменить все ожидающие сообщения собеседнику
    pub fn cancel_pending(&self, peer: &str) -> usize {
        self.outbox.cancel_peer(peer)
    }

    async fn deliver(&self, id: MessageId, peer: &str, plaintext: &[u8], timestamp: u64) -> Result<(), CoreError> {
        if self.outbox.is_cancelled(id) {
            return Err(SessionError::Cancelled.into());
        }

        let addresses = self.resolve_devices(peer).await?;
        for address in &addresses {
            self.deliver_to(id, address, plaintext, timestamp).await?;
        }
        debug!(target: "api", message_id = %id, devices = addresses.len(), "Send completed");
        Ok(())
    }

    /// Адреса устройств собеседника; без сессий - X3DH по bundles из директории
    async fn resolve_devices(&self, peer: &str) -> Result<Vec<SessionAddress>, CoreError> {
        let mut active = Vec::new();
        for device in self.sessions().sub_device_sessions(peer)? {
            let address = SessionAddress::new(peer, device);
            if self.is_usable(&address)? {
                active.push(address);
            }
        }
        if !active.is_empty() {
            return Ok(active);
        }

        self.establish_from_directory(peer, None).await
    }

    /// Сессия шифрует и построена с identity, которую знает trust
    fn is_usable(&self, address: &SessionAddress) -> Result<bool, CoreError> {
        let Some(info) = self.sessions().get_session(address)? else {
            return Ok(false);
        };
        let known_identity = self.trust().record(&address.peer)?.map(|record| record.identity_key);
        let same_identity = known_identity
            .map(|key| key == info.remote_identity)
            .unwrap_or(true);
        Ok(info.state.can_encrypt() && same_identity)
    }

    /// Построить сессии по bundles; сеть вызывается без локов сессий
    async fn establish_from_directory(
        &self,
        peer: &str,
        only_device: Option<u32>,
    ) -> Result<Vec<SessionAddress>, CoreError> {
        let bundles = self.directory.fetch_bundles(peer).await?;

        let mut addresses = Vec::new();
        for bundle in bundles
            .iter()
            .filter(|b| only_device.map(|d| d == b.device_id).unwrap_or(true))
        {
            let address = SessionAddress::new(peer, bundle.device_id);
            self.pipeline.establish(&address, bundle)?;
            addresses.push(address);
        }

        if addresses.is_empty() {
            return Err(CoreError::NotFound(format!("No pre-key bundles for {}", peer)));
        }
        Ok(addresses)
    }

    /// Доставка одному устройству с повторами
    ///
    /// Между попытками сессия могла быть сброшена: тогда старый шифротекст
    /// выбрасывается и сообщение шифруется заново.
    async fn deliver_to(
        &self,
        id: MessageId,
        address: &SessionAddress,
        plaintext: &[u8],
        timestamp: u64,
    ) -> Result<(), CoreError> {
        let local = self.local_identity()?;
        let mut backoff = RetryBackoff::new(&self.config);
        let mut sealed = self.pipeline.encrypt(address, plaintext)?;

        loop {
            // После begin_handoff отменить уже нельзя
            self.outbox.begin_handoff(id)?;
            let envelope = self.pipeline.envelope(&local, &sealed, timestamp);

            match self.transport.send_envelope(pack_envelope(&envelope)?).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.outbox.handoff_failed(id);
                    if !backoff.can_retry() {
                        return Err(e.into());
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        target: "api",
                        message_id = %id,
                        address = %address,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    if self.outbox.is_cancelled(id) {
                        return Err(SessionError::Cancelled.into());
                    }
                    sealed = self.refresh_if_stale(address, sealed, plaintext).await?;
                }
            }
        }
    }

    async fn refresh_if_stale(
        &self,
        address: &SessionAddress,
        sealed: SealedMessage,
        plaintext: &[u8],
    ) -> Result<SealedMessage, CoreError> {
        if self.sessions().generation(address)? == sealed.generation {
            return Ok(sealed);
        }

        info!(target: "api", address = %address, "Session changed between attempts, re-encrypting");
        if !self.is_usable(address)? {
            self.establish_from_directory(&address.peer, Some(address.device))
                .await?;
        }
        self.pipeline.encrypt(address, plaintext)
    }

    // ============================================
    // ПРИЁМ
    // ============================================

    /// Зарегистрировать обработчик расшифрованных сообщений
    pub fn on_message_received(
        &self,
        callback: impl Fn(&ReceivedMessage) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        self.listeners
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(Box::new(callback));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Обработать envelope от транспорта
    ///
    /// Ok(None) - серверная квитанция или повтор уже обработанного сообщения.
    pub fn on_envelope_received(&self, bytes: &[u8]) -> Result<Option<ReceivedMessage>, CoreError> {
        let envelope = unpack_envelope(bytes)?;
        if envelope.envelope_type == EnvelopeType::Receipt {
            debug!(target: "api", source = %envelope.source, timestamp = envelope.timestamp, "Server receipt");
            return Ok(None);
        }

        match self.pipeline.decrypt(&envelope) {
            Ok(message) => {
                if message.identity_changed {
                    self.emit(CoreEvent::IdentityChanged {
                        peer: message.address.peer.clone(),
                    });
                }
                if matches!(message.content, Content::EndSession) {
                    self.emit(CoreEvent::SessionEnded {
                        address: message.address.clone(),
                    });
                }
                self.notify_listeners(&message);
                self.emit(CoreEvent::MessageReceived(message.clone()));
                Ok(Some(message))
            }
            Err(CoreError::Decryption(e)) if e.is_duplicate() => {
                debug!(target: "api", source = %envelope.source, timestamp = envelope.timestamp, "Dropped duplicate envelope");
                Ok(None)
            }
            Err(e) => {
                warn!(
                    target: "api",
                    source = %envelope.source,
                    device = envelope.source_device,
                    timestamp = envelope.timestamp,
                    error = %e,
                    "Could not decrypt envelope"
                );
                self.emit(CoreEvent::Undecryptable {
                    sender: envelope.source.clone(),
                    device: envelope.source_device,
                    timestamp: envelope.timestamp,
                    class: e.class(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn notify_listeners(&self, message: &ReceivedMessage) {
        match self.listeners.read() {
            Ok(listeners) => listeners.iter().for_each(|listener| listener(message)),
            Err(_) => warn!(target: "api", "Listener registry poisoned"),
        }
    }

    /// Обрабатывать входящие envelope по порядку, пока канал открыт
    pub fn spawn_receive_loop(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(bytes) = incoming.recv().await {
                // Ошибки уже отданы подписчикам событием
                let _ = core.on_envelope_received(&bytes);
            }
            debug!(target: "api", "Receive loop finished");
        })
    }

    // ============================================
    // ПОДКЛЮЧЕНИЕ
    // ============================================

    pub fn get_connection_state(&self) -> ConnectionState {
        self.connection.get()
    }

    /// Транспорт сообщает о смене состояния соединения
    pub fn set_connection_state(&self, state: ConnectionState) {
        let previous = self.connection.set(state);
        if previous != state {
            info!(target: "api", from = ?previous, to = ?state, "Connection state changed");
            self.emit(CoreEvent::ConnectionChanged(state));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;
    use crate::protocol::memory::{ChannelTransport, MemoryDirectory};
    use crate::storage::{MemoryBlobStore, StorageEncryption};

    pub(crate) type Core = MessengerCore<ClassicSuiteProvider>;

    pub(crate) struct Harness {
        pub alice: Arc<Core>,
        pub bob: Arc<Core>,
        pub directory: Arc<MemoryDirectory>,
        pub alice_transport: Arc<ChannelTransport>,
        pub alice_out: mpsc::UnboundedReceiver<Vec<u8>>,
        pub bob_out: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    fn test_config() -> Config {
        Config {
            pbkdf2_iterations: 1_000,
            one_time_prekey_batch_size: 5,
            one_time_prekey_low_water_mark: 2,
            send_retry_initial_ms: 10,
            send_retry_max_ms: 40,
            send_max_attempts: 3,
            ..Config::default()
        }
    }

    fn core(
        name: &str,
        directory: &Arc<MemoryDirectory>,
    ) -> (Arc<Core>, Arc<ChannelTransport>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let store = EncryptedStore::create(
            Arc::new(MemoryBlobStore::new()),
            StorageEncryption::AutoUnlock,
            None,
            test_config(),
        )
        .unwrap();
        let (transport, out) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let core = MessengerCore::new(
            test_config(),
            name,
            Arc::new(store),
            transport.clone(),
            directory.clone(),
        )
        .unwrap();
        (core, transport, out)
    }

    pub(crate) async fn core_pair(registered: bool) -> Harness {
        let directory = Arc::new(MemoryDirectory::new());
        let (alice, alice_transport, alice_out) = core("alice", &directory);
        let (bob, _, bob_out) = core("bob", &directory);
        if registered {
            alice.register(1).await.unwrap();
            bob.register(1).await.unwrap();
        }
        Harness {
            alice,
            bob,
            directory,
            alice_transport,
            alice_out,
            bob_out,
        }
    }

    async fn send_outcome(events: &mut broadcast::Receiver<CoreEvent>) -> CoreEvent {
        loop {
            match events.recv().await.unwrap() {
                event @ (CoreEvent::SendCompleted { .. }
                | CoreEvent::SendFailed { .. }
                | CoreEvent::SendCancelled { .. }) => return event,
                _ => {}
            }
        }
    }

    fn body(message: &ReceivedMessage) -> &[u8] {
        match &message.content {
            Content::Data(data) => &data.body,
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let Harness { alice, bob, mut alice_out, .. } = core_pair(true).await;
        let mut events = alice.subscribe();

        let id = alice.send_message("bob", b"hi bob".to_vec(), Vec::new()).await.unwrap();
        match send_outcome(&mut events).await {
            CoreEvent::SendCompleted { id: done, peer } => {
                assert_eq!(done, id);
                assert_eq!(peer, "bob");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let bytes = alice_out.recv().await.unwrap();
        let received = bob.on_envelope_received(&bytes).unwrap().unwrap();
        assert_eq!(body(&received), b"hi bob");
        assert_eq!(received.address, SessionAddress::new("alice", 1));
        assert!(!received.is_suspect());

        // Повтор того же envelope молча отбрасывается
        assert!(bob.on_envelope_received(&bytes).unwrap().is_none());
        assert_eq!(bob.devices("alice").unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_listener_called_on_receive() {
        let Harness { alice, bob, mut alice_out, .. } = core_pair(true).await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        bob.on_message_received(move |message| {
            sink.lock().unwrap().push(message.timestamp);
        })
        .unwrap();

        alice.send_message("bob", b"one".to_vec(), Vec::new()).await.unwrap();
        let bytes = alice_out.recv().await.unwrap();
        let received = bob.on_envelope_received(&bytes).unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![received.timestamp]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_after_transport_failures() {
        let Harness { alice, bob, alice_transport, mut alice_out, .. } = core_pair(true).await;
        let mut events = alice.subscribe();
        alice_transport.fail_next(2);

        alice.send_message("bob", b"eventually".to_vec(), Vec::new()).await.unwrap();
        assert!(matches!(send_outcome(&mut events).await, CoreEvent::SendCompleted { .. }));

        let bytes = alice_out.recv().await.unwrap();
        let received = bob.on_envelope_received(&bytes).unwrap().unwrap();
        assert_eq!(body(&received), b"eventually");
        assert!(alice_out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_after_max_attempts() {
        let Harness { alice, alice_transport, mut alice_out, .. } = core_pair(true).await;
        let mut events = alice.subscribe();
        alice_transport.fail_next(10);

        alice.send_message("bob", b"lost".to_vec(), Vec::new()).await.unwrap();
        match send_outcome(&mut events).await {
            CoreEvent::SendFailed { class, .. } => assert_eq!(class, ErrorClass::Transient),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(alice_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_before_handoff() {
        let Harness { alice, mut alice_out, .. } = core_pair(true).await;
        let mut events = alice.subscribe();

        // Задача отправки ещё не запускалась: current_thread runtime
        let id = alice.send_message("bob", b"never".to_vec(), Vec::new()).await.unwrap();
        assert!(alice.cancel_send(id));

        match send_outcome(&mut events).await {
            CoreEvent::SendCancelled { id: cancelled, .. } => assert_eq!(cancelled, id),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(alice_out.try_recv().is_err());
        assert!(!alice.cancel_send(id));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let Harness { alice, .. } = core_pair(true).await;
        let mut events = alice.subscribe();

        alice.send_message("carol", b"?".to_vec(), Vec::new()).await.unwrap();
        match send_outcome(&mut events).await {
            CoreEvent::SendFailed { peer, class, .. } => {
                assert_eq!(peer, "carol");
                assert_eq!(class, ErrorClass::Transient);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_change_blocks_send_until_confirmed() {
        let Harness { alice, bob, mut alice_out, mut bob_out, .. } = core_pair(true).await;
        let mut events = alice.subscribe();

        alice.send_message("bob", b"before".to_vec(), Vec::new()).await.unwrap();
        let bytes = alice_out.recv().await.unwrap();
        bob.on_envelope_received(&bytes).unwrap().unwrap();
        assert!(matches!(send_outcome(&mut events).await, CoreEvent::SendCompleted { .. }));
        let old_number = alice.get_safety_number("bob").unwrap();

        // Bob переустановил приложение
        bob.reset_identity().await.unwrap();
        let mut bob_events = bob.subscribe();
        bob.send_message("alice", b"new phone".to_vec(), Vec::new()).await.unwrap();
        assert!(matches!(send_outcome(&mut bob_events).await, CoreEvent::SendCompleted { .. }));

        let bytes = bob_out.recv().await.unwrap();
        let received = alice.on_envelope_received(&bytes).unwrap().unwrap();
        assert!(received.identity_changed);
        assert!(received.is_suspect());
        loop {
            if let CoreEvent::IdentityChanged { peer } = events.recv().await.unwrap() {
                assert_eq!(peer, "bob");
                break;
            }
        }

        let err = alice
            .send_message("bob", b"blocked".to_vec(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Session(SessionError::UntrustedIdentity(_))));
        assert_ne!(alice.get_safety_number("bob").unwrap(), old_number);

        alice.confirm_identity("bob").unwrap();
        alice.send_message("bob", b"ok".to_vec(), Vec::new()).await.unwrap();
        assert!(matches!(send_outcome(&mut events).await, CoreEvent::SendCompleted { .. }));
        let bytes = alice_out.recv().await.unwrap();
        let received = bob.on_envelope_received(&bytes).unwrap().unwrap();
        assert_eq!(body(&received), b"ok");
    }

    #[tokio::test]
    async fn test_safety_number_verification() {
        let Harness { alice, bob, mut alice_out, .. } = core_pair(true).await;
        alice.send_message("bob", b"x".to_vec(), Vec::new()).await.unwrap();
        let bytes = alice_out.recv().await.unwrap();
        bob.on_envelope_received(&bytes).unwrap().unwrap();

        let seen_by_alice = alice.get_safety_number("bob").unwrap();
        let seen_by_bob = bob.get_safety_number("alice").unwrap();
        assert_eq!(seen_by_alice, seen_by_bob);

        assert!(!bob.verify_safety_number("alice", "00000").unwrap());
        assert!(bob.verify_safety_number("alice", &seen_by_alice).unwrap());
        assert_eq!(
            bob.trust_state("alice").unwrap(),
            Some(TrustState::UserVerified)
        );
    }

    #[tokio::test]
    async fn test_reset_session_notifies_peer() {
        let Harness { alice, bob, mut alice_out, .. } = core_pair(true).await;
        let mut bob_events = bob.subscribe();

        alice.send_message("bob", b"hello".to_vec(), Vec::new()).await.unwrap();
        let bytes = alice_out.recv().await.unwrap();
        bob.on_envelope_received(&bytes).unwrap().unwrap();

        assert_eq!(alice.reset_session("bob").await.unwrap(), 1);
        assert!(alice.devices("bob").unwrap().is_empty());

        let notice = alice_out.recv().await.unwrap();
        let received = bob.on_envelope_received(&notice).unwrap().unwrap();
        assert_eq!(received.content, Content::EndSession);
        assert!(bob.devices("alice").unwrap().is_empty());

        let mut ended = false;
        while let Ok(event) = bob_events.try_recv() {
            if let CoreEvent::SessionEnded { address } = event {
                assert_eq!(address, SessionAddress::new("alice", 1));
                ended = true;
            }
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn test_undecryptable_envelope_emits_event() {
        let Harness { alice, bob, mut alice_out, .. } = core_pair(true).await;
        let mut bob_events = bob.subscribe();

        alice.send_message("bob", b"first".to_vec(), Vec::new()).await.unwrap();
        alice.send_message("bob", b"second".to_vec(), Vec::new()).await.unwrap();
        let first = alice_out.recv().await.unwrap();
        let second = alice_out.recv().await.unwrap();
        bob.on_envelope_received(&first).unwrap().unwrap();

        let mut envelope = unpack_envelope(&second).unwrap();
        let last = envelope.content.len() - 1;
        envelope.content[last] ^= 0x01;
        let tampered = pack_envelope(&envelope).unwrap();

        assert!(bob.on_envelope_received(&tampered).is_err());
        let mut undecryptable = false;
        while let Ok(event) = bob_events.try_recv() {
            if let CoreEvent::Undecryptable { sender, .. } = event {
                assert_eq!(sender, "alice");
                undecryptable = true;
            }
        }
        assert!(undecryptable);
    }

    #[tokio::test]
    async fn test_server_receipt_is_ignored() {
        let Harness { bob, .. } = core_pair(true).await;
        let receipt = crate::protocol::messages::Envelope {
            envelope_type: EnvelopeType::Receipt,
            source: "server".to_string(),
            source_device: 1,
            destination: "bob".to_string(),
            destination_device: 1,
            timestamp: 1,
            content: Vec::new(),
            urgent: false,
        };
        let bytes = pack_envelope(&receipt).unwrap();
        assert!(bob.on_envelope_received(&bytes).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_forgets_identity() {
        let Harness { alice, .. } = core_pair(true).await;
        assert!(alice.local_identity().is_ok());

        alice.lock().unwrap();
        assert!(alice.local_identity().is_err());
        assert!(alice.send_message("bob", b"x".to_vec(), Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_state_events() {
        let Harness { alice, .. } = core_pair(false).await;
        let mut events = alice.subscribe();
        assert_eq!(alice.get_connection_state(), ConnectionState::Disconnected);

        alice.set_connection_state(ConnectionState::Synchronizing);
        alice.set_connection_state(ConnectionState::Synchronizing);
        alice.set_connection_state(ConnectionState::Connected);

        let mut seen = Vec::new();
        while let Ok(CoreEvent::ConnectionChanged(state)) = events.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen, vec![ConnectionState::Synchronizing, ConnectionState::Connected]);
    }

    #[tokio::test]
    async fn test_receive_loop_processes_in_order() {
        let Harness { alice, bob, mut alice_out, .. } = core_pair(true).await;
        for text in ["a", "b", "c"] {
            alice.send_message("bob", text.as_bytes().to_vec(), Vec::new()).await.unwrap();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut bob_events = bob.subscribe();
        let handle = bob.spawn_receive_loop(rx);
        for _ in 0..3 {
            tx.send(alice_out.recv().await.unwrap()).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let mut bodies = Vec::new();
        while let Ok(event) = bob_events.try_recv() {
            if let CoreEvent::MessageReceived(message) = event {
                bodies.push(body(&message).to_vec());
            }
        }
        assert_eq!(bodies.len(), 3);
    }
}
