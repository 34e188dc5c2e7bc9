// Машина состояний сессии
//
//   NoSession ──InitiatorStarted──▶ Pending ──MessageReceived──▶ Established
//       │                              │                            │
//       └──────PreKeyAccepted──────────┼────────────────────────────┘
//                                      ▼                            ▼
//                               ResetPending ◀──ResetRequested──────┘
//                                      │
//                                ResetCompleted ──▶ NoSession
//
// Любая активная сессия может стать Superseded, когда её вытесняет новая.

use crate::utils::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    NoSession,
    /// Pre-key сообщение отправлено, ответа ещё не было
    Pending,
    Established,
    /// Пользователь сбросил сессию, осталось отправить end-session
    ResetPending,
    /// Вытеснена новой сессией, больше не используется
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// X3DH по bundle собеседника, первое сообщение уйдёт как pre-key
    InitiatorStarted,
    /// Получено pre-key сообщение, сессия создана на нашей стороне
    PreKeyAccepted,
    MessageSent,
    MessageReceived,
    ResetRequested,
    ResetCompleted,
    Superseded,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::InitiatorStarted => "initiator-started",
            SessionEvent::PreKeyAccepted => "pre-key-accepted",
            SessionEvent::MessageSent => "message-sent",
            SessionEvent::MessageReceived => "message-received",
            SessionEvent::ResetRequested => "reset-requested",
            SessionEvent::ResetCompleted => "reset-completed",
            SessionEvent::Superseded => "superseded",
        }
    }
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::NoSession => "no-session",
            SessionState::Pending => "pending",
            SessionState::Established => "established",
            SessionState::ResetPending => "reset-pending",
            SessionState::Superseded => "superseded",
        }
    }

    /// Следующее состояние или ошибка для недопустимого перехода
    pub fn transition(self, event: SessionEvent) -> Result<SessionState, SessionError> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::NoSession, E::InitiatorStarted) => Ok(S::Pending),
            (S::NoSession, E::PreKeyAccepted) => Ok(S::Established),

            (S::Pending, E::MessageSent) => Ok(S::Pending),
            (S::Pending, E::MessageReceived) => Ok(S::Established),
            (S::Established, E::MessageSent | E::MessageReceived) => Ok(S::Established),

            (S::Pending | S::Established, E::ResetRequested) => Ok(S::ResetPending),
            // Единственное сообщение в ResetPending - уведомление end-session
            (S::ResetPending, E::MessageSent) => Ok(S::ResetPending),
            (S::ResetPending, E::ResetCompleted) => Ok(S::NoSession),

            (S::Pending | S::Established | S::ResetPending, E::Superseded) => Ok(S::Superseded),

            (state, event) => Err(SessionError::InvalidTransition {
                from: state.name(),
                event: event.name(),
            }),
        }
    }

    pub fn can_encrypt(&self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Established)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Pending | SessionState::Established | SessionState::ResetPending
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
