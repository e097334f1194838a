use crate::market::types::{SessionStatus, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    ConnectingPrimary,
    ConnectedPrimary,
    FallingBackToSecondary,
    ConnectedSecondary,
    FallingBackToTertiary,
    Polling,
    RetryPending,
    Misconfigured,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Subscribe,
    MissingConfiguration,
    Opened,
    Failed,
    RetryElapsed,
    Unsubscribe,
}

impl TransportState {
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Idle | Self::Closed => SessionStatus::Idle,
            Self::ConnectingPrimary | Self::FallingBackToSecondary | Self::FallingBackToTertiary => {
                SessionStatus::Connecting
            }
            Self::ConnectedPrimary => SessionStatus::ConnectedWs,
            Self::ConnectedSecondary => SessionStatus::ConnectedSse,
            Self::Polling => SessionStatus::Polling,
            Self::RetryPending | Self::Misconfigured => SessionStatus::Error,
        }
    }

    pub fn transport(self) -> Option<TransportKind> {
        match self {
            Self::ConnectingPrimary | Self::ConnectedPrimary => Some(TransportKind::Ws),
            Self::FallingBackToSecondary | Self::ConnectedSecondary => Some(TransportKind::Sse),
            Self::FallingBackToTertiary | Self::Polling => Some(TransportKind::Poll),
            _ => None,
        }
    }

    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::ConnectingPrimary | Self::FallingBackToSecondary | Self::FallingBackToTertiary
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Misconfigured)
    }
}

pub fn transition(state: TransportState, event: TransportEvent) -> Option<TransportState> {
    use TransportEvent as E;
    use TransportState as S;

    match (state, event) {
        (S::Closed, _) => None,
        (_, E::Unsubscribe) => Some(S::Closed),

        (S::Idle, E::Subscribe) => Some(S::ConnectingPrimary),
        (S::Idle, E::MissingConfiguration) => Some(S::Misconfigured),

        (S::ConnectingPrimary, E::Opened) => Some(S::ConnectedPrimary),
        (S::ConnectingPrimary, E::Failed) => Some(S::FallingBackToSecondary),
        (S::ConnectedPrimary, E::Failed) => Some(S::FallingBackToSecondary),

        (S::FallingBackToSecondary, E::Opened) => Some(S::ConnectedSecondary),
        (S::FallingBackToSecondary, E::Failed) => Some(S::FallingBackToTertiary),
        (S::ConnectedSecondary, E::Failed) => Some(S::FallingBackToTertiary),

        (S::FallingBackToTertiary, E::Opened) => Some(S::Polling),
        (S::FallingBackToTertiary, E::Failed) => Some(S::RetryPending),
        (S::Polling, E::Failed) => Some(S::FallingBackToTertiary),

        (S::RetryPending, E::RetryElapsed) => Some(S::ConnectingPrimary),

        _ => None,
    }
}
