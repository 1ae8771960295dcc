//! In-process typed event bus.
//!
//! Handlers for a single emit run in registration order and are awaited
//! one after another; `emit` returns after all handlers settled. A
//! failing handler is logged and does not prevent the others from
//! running. Emitting from inside a handler is allowed: the event is
//! queued and dispatched after the current handler (and the rest of the
//! in-flight dispatch) completes, and that inner `emit` returns as soon
//! as the event is queued.
//!
//! Services only emit after their transaction has committed, so
//! handlers always observe committed state.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use cashu::nuts::CurrencyUnit;
use cashu::secret::Secret;
use cashu::Amount;
use satchel_common::mint_url::MintUrl;
use satchel_common::proof::ProofState;
use satchel_common::quotes::{MeltQuote, MintQuote, MintQuoteState};
use satchel_common::token::ProofToken;
use satchel_common::{Error, Id};
use uuid::Uuid;

/// Discriminant of a [`WalletEvent`], used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `mint:added`
    MintAdded,
    /// `mint:updated`
    MintUpdated,
    /// `mint:untrusted`
    MintUntrusted,
    /// `counter:updated`
    CounterUpdated,
    /// `proofs:saved`
    ProofsSaved,
    /// `proofs:state-changed`
    ProofsStateChanged,
    /// `proofs:reserved`
    ProofsReserved,
    /// `proofs:released`
    ProofsReleased,
    /// `proofs:deleted`
    ProofsDeleted,
    /// `proofs:wiped`
    ProofsWiped,
    /// `mint-quote:created`
    MintQuoteCreated,
    /// `mint-quote:state-changed`
    MintQuoteStateChanged,
    /// `mint-quote:redeemed`
    MintQuoteRedeemed,
    /// `melt-quote:created`
    MeltQuoteCreated,
    /// `melt-quote:paid`
    MeltQuotePaid,
    /// `send:prepared`
    SendPrepared,
    /// `send:pending`
    SendPending,
    /// `send:finalized`
    SendFinalized,
    /// `send:rolled-back`
    SendRolledBack,
    /// `receive:created`
    ReceiveCreated,
}

/// Events emitted by the core. Closed set.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// A mint was added to the wallet
    MintAdded {
        /// The mint
        mint_url: MintUrl,
    },
    /// A mint's info or keysets were refreshed
    MintUpdated {
        /// The mint
        mint_url: MintUrl,
    },
    /// A mint lost the user's trust
    MintUntrusted {
        /// The mint
        mint_url: MintUrl,
    },
    /// A keyset counter advanced
    CounterUpdated {
        /// The mint
        mint_url: MintUrl,
        /// The keyset
        keyset_id: Id,
        /// New counter value
        value: u32,
    },
    /// New proofs were persisted
    ProofsSaved {
        /// The mint
        mint_url: MintUrl,
        /// Secrets of the saved proofs
        secrets: Vec<Secret>,
        /// Unit of the saved proofs
        unit: CurrencyUnit,
    },
    /// Proof states changed
    ProofsStateChanged {
        /// The mint
        mint_url: MintUrl,
        /// Affected secrets
        secrets: Vec<Secret>,
        /// The new state
        state: ProofState,
    },
    /// Proofs were reserved for an operation
    ProofsReserved {
        /// The mint
        mint_url: MintUrl,
        /// Affected secrets
        secrets: Vec<Secret>,
        /// Operation holding the reservation
        operation_id: Uuid,
    },
    /// Reservations were released
    ProofsReleased {
        /// The mint
        mint_url: MintUrl,
        /// Affected secrets
        secrets: Vec<Secret>,
    },
    /// Proofs were removed from the ledger
    ProofsDeleted {
        /// The mint
        mint_url: MintUrl,
        /// Removed secrets
        secrets: Vec<Secret>,
    },
    /// Every proof of a keyset was wiped (recovery tool)
    ProofsWiped {
        /// The mint
        mint_url: MintUrl,
        /// The keyset
        keyset_id: Id,
    },
    /// A mint quote was created
    MintQuoteCreated {
        /// The quote
        quote: MintQuote,
    },
    /// A mint quote changed state
    MintQuoteStateChanged {
        /// The mint
        mint_url: MintUrl,
        /// Quote id
        quote_id: String,
        /// New state
        state: MintQuoteState,
    },
    /// A paid mint quote was redeemed into proofs
    MintQuoteRedeemed {
        /// The quote
        quote: MintQuote,
        /// Amount issued
        amount: Amount,
    },
    /// A melt quote was created
    MeltQuoteCreated {
        /// The quote
        quote: MeltQuote,
    },
    /// A melt quote settled
    MeltQuotePaid {
        /// The mint
        mint_url: MintUrl,
        /// Quote id
        quote_id: String,
        /// Payment preimage, when returned
        preimage: Option<String>,
    },
    /// A send operation finished preparing
    SendPrepared {
        /// Operation id
        operation_id: Uuid,
        /// The mint
        mint_url: MintUrl,
        /// Amount being sent
        amount: Amount,
    },
    /// A send token is outstanding
    SendPending {
        /// Operation id
        operation_id: Uuid,
        /// The mint
        mint_url: MintUrl,
        /// The outgoing token
        token: ProofToken,
    },
    /// A send was confirmed claimed
    SendFinalized {
        /// Operation id
        operation_id: Uuid,
        /// The mint
        mint_url: MintUrl,
    },
    /// A send was cancelled
    SendRolledBack {
        /// Operation id
        operation_id: Uuid,
        /// The mint
        mint_url: MintUrl,
    },
    /// Incoming proofs were claimed
    ReceiveCreated {
        /// The mint
        mint_url: MintUrl,
        /// Amount received
        amount: Amount,
    },
}

impl WalletEvent {
    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            WalletEvent::MintAdded { .. } => EventKind::MintAdded,
            WalletEvent::MintUpdated { .. } => EventKind::MintUpdated,
            WalletEvent::MintUntrusted { .. } => EventKind::MintUntrusted,
            WalletEvent::CounterUpdated { .. } => EventKind::CounterUpdated,
            WalletEvent::ProofsSaved { .. } => EventKind::ProofsSaved,
            WalletEvent::ProofsStateChanged { .. } => EventKind::ProofsStateChanged,
            WalletEvent::ProofsReserved { .. } => EventKind::ProofsReserved,
            WalletEvent::ProofsReleased { .. } => EventKind::ProofsReleased,
            WalletEvent::ProofsDeleted { .. } => EventKind::ProofsDeleted,
            WalletEvent::ProofsWiped { .. } => EventKind::ProofsWiped,
            WalletEvent::MintQuoteCreated { .. } => EventKind::MintQuoteCreated,
            WalletEvent::MintQuoteStateChanged { .. } => EventKind::MintQuoteStateChanged,
            WalletEvent::MintQuoteRedeemed { .. } => EventKind::MintQuoteRedeemed,
            WalletEvent::MeltQuoteCreated { .. } => EventKind::MeltQuoteCreated,
            WalletEvent::MeltQuotePaid { .. } => EventKind::MeltQuotePaid,
            WalletEvent::SendPrepared { .. } => EventKind::SendPrepared,
            WalletEvent::SendPending { .. } => EventKind::SendPending,
            WalletEvent::SendFinalized { .. } => EventKind::SendFinalized,
            WalletEvent::SendRolledBack { .. } => EventKind::SendRolledBack,
            WalletEvent::ReceiveCreated { .. } => EventKind::ReceiveCreated,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type Handler = Arc<dyn Fn(WalletEvent) -> HandlerFuture + Send + Sync>;

/// Identifies a registered handler so it can be removed with
/// [`EventBus::off`]. Returned by [`EventBus::on`] and
/// [`EventBus::once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    kind: EventKind,
    id: u64,
}

struct Registration {
    id: u64,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<Registration>>,
    /// Whether a dispatch loop is currently running.
    dispatching: bool,
    /// Events emitted from inside a handler, drained by the running
    /// dispatch loop once the current handler settled.
    queued: VecDeque<WalletEvent>,
}

/// Typed publish/subscribe bus.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kind: EventKind, handler: Handler, once: bool) -> HandlerId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handlers.entry(kind).or_default().push(Registration {
            id,
            handler,
            once,
        });
        HandlerId { kind, id }
    }

    /// Register a handler for an event kind.
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(WalletEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.register(kind, Arc::new(move |event| Box::pin(handler(event))), false)
    }

    /// Register a handler that disposes itself after its first call.
    pub fn once<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(WalletEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.register(kind, Arc::new(move |event| Box::pin(handler(event))), true)
    }

    /// Remove a handler.
    pub fn off(&self, handler_id: HandlerId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(registrations) = inner.handlers.get_mut(&handler_id.kind) {
            registrations.retain(|registration| registration.id != handler_id.id);
        }
    }

    /// Remove every handler.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.clear();
    }

    fn snapshot(&self, kind: EventKind) -> Vec<(u64, Handler)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(registrations) = inner.handlers.get_mut(&kind) else {
            return Vec::new();
        };
        let snapshot = registrations
            .iter()
            .map(|registration| (registration.id, registration.handler.clone()))
            .collect();
        registrations.retain(|registration| !registration.once);
        snapshot
    }

    /// Dispatch an event to its handlers and await all of them.
    ///
    /// A re-entrant emit from inside a handler does not dispatch
    /// inline: the event is queued, this call returns immediately, and
    /// the running dispatch loop drains the queue once the current
    /// handler completed.
    pub async fn emit(&self, event: WalletEvent) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.dispatching {
                inner.queued.push_back(event);
                return;
            }
            inner.dispatching = true;
        }

        let mut next = Some(event);
        while let Some(event) = next {
            let kind = event.kind();
            for (id, handler) in self.snapshot(kind) {
                if let Err(err) = handler(event.clone()).await {
                    tracing::warn!(?kind, handler_id = id, "event handler failed: {err}");
                }
            }

            next = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let queued = inner.queued.pop_front();
                if queued.is_none() {
                    inner.dispatching = false;
                }
                queued
            };
        }
    }

    /// Emit a batch of events in order.
    pub async fn emit_all(&self, events: Vec<WalletEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }
}
