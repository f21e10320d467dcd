//! Connection lifecycle and reconnection.
//!
//! Contains the shared [`ManagerContext`], the state transition helpers,
//! generation startup, and the single delayed retry scheduled after a
//! transport failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::pumps::read::ReadOutcome;
use crate::types::{ConnectionConfig, ConnectionEvent, ConnectionIdentity, ConnectionState};
use crate::ws_client::{GenerationContext, WsClient, open_transport};

/// State shared by the manager facade and the background tasks.
pub(crate) struct ManagerContext {
    pub(crate) config: ConnectionConfig,
    pub(crate) bus: EventBus,
    state: Mutex<ConnectionState>,
    /// Current generation. Held across connect and teardown so that at most
    /// one attempt runs at a time.
    pub(crate) lifecycle: tokio::sync::Mutex<Option<WsClient>>,
    /// Write path of the current generation, keyed by generation id, for
    /// sends that must not wait on the lifecycle lock.
    writer: Mutex<Option<(u64, mpsc::Sender<tungstenite::Message>)>>,
    next_generation: AtomicU64,
    /// Token of the current session (explicit connect to explicit disconnect).
    session: Mutex<CancellationToken>,
}

impl ManagerContext {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        let session = CancellationToken::new();
        session.cancel();
        Self {
            config,
            bus: EventBus::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            lifecycle: tokio::sync::Mutex::new(None),
            writer: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            session: Mutex::new(session),
        }
    }

    /// Snapshot of the current state.
    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Transitions unless `guard` has been cancelled. Returns `false` when the
    /// caller's generation or session has been retired and must stop.
    ///
    /// The guard is checked under the state lock, so a retired task can never
    /// publish after the teardown that retired it.
    pub(crate) fn transition(&self, to: ConnectionState, guard: &CancellationToken) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if guard.is_cancelled() {
            return false;
        }
        self.apply(&mut state, to);
        true
    }

    /// Like [`transition`](Self::transition), but also cancels `guard` while
    /// still holding the state lock. Once this returns `true`, no other task
    /// guarded by the same token can publish.
    pub(crate) fn retire(&self, to: ConnectionState, guard: &CancellationToken) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if guard.is_cancelled() {
            return false;
        }
        self.apply(&mut state, to);
        guard.cancel();
        true
    }

    /// Transitions unconditionally. Used by explicit connect/disconnect.
    pub(crate) fn force_transition(&self, to: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            self.apply(&mut state, to);
        }
    }

    fn apply(&self, state: &mut ConnectionState, to: ConnectionState) {
        if *state == to {
            return;
        }
        debug!(from = %state, to = %to, "connection state changed");
        *state = to;
        // Published under the lock: subscribers see transitions in order.
        self.bus.publish(ConnectionEvent::StateChanged(to));
    }

    /// Cancels the current session, its generations and any pending retry.
    pub(crate) fn cancel_session(&self) {
        if let Ok(session) = self.session.lock() {
            session.cancel();
        }
    }

    /// Retires the current session and starts a new one.
    pub(crate) fn begin_session(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        if let Ok(mut session) = self.session.lock() {
            session.cancel();
            *session = fresh.clone();
        }
        fresh
    }

    pub(crate) fn next_generation_id(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn writer(&self) -> Option<mpsc::Sender<tungstenite::Message>> {
        self.writer
            .lock()
            .ok()
            .and_then(|w| w.as_ref().map(|(_, tx)| tx.clone()))
    }

    pub(crate) fn install_writer(&self, generation: u64, tx: mpsc::Sender<tungstenite::Message>) {
        if let Ok(mut w) = self.writer.lock() {
            *w = Some((generation, tx));
        }
    }

    /// Drops the write path, whichever generation owns it.
    pub(crate) fn clear_writer(&self) {
        if let Ok(mut w) = self.writer.lock() {
            *w = None;
        }
    }

    /// Drops the write path only if `generation` still owns it.
    pub(crate) fn release_writer(&self, generation: u64) {
        if let Ok(mut w) = self.writer.lock()
            && w.as_ref().is_some_and(|(id, _)| *id == generation)
        {
            *w = None;
        }
    }
}

/// Opens a new generation for `identity` and stores it in `slot`.
///
/// Publishes `Connecting`, then `Connected` or `Failed`. Does nothing once
/// `session` is cancelled; an in-flight handshake is abandoned as soon as it is.
pub(crate) async fn open_generation(
    ctx: &Arc<ManagerContext>,
    slot: &mut Option<WsClient>,
    identity: ConnectionIdentity,
    session: &CancellationToken,
) {
    if !ctx.transition(ConnectionState::Connecting, session) {
        return;
    }
    info!(url = %ctx.config.endpoint(&identity), "connecting");

    let result = tokio::select! {
        _ = session.cancelled() => {
            debug!("connect attempt cancelled");
            return;
        }
        result = open_transport(&ctx.config, &identity) => result,
    };

    match result {
        Ok(stream) => {
            let client = WsClient::start(stream, identity, session, Arc::clone(ctx));
            // Sends must work as soon as `Connected` is observed.
            ctx.install_writer(client.id(), client.writer());
            if ctx.transition(ConnectionState::Connected, client.token()) {
                info!("connected");
            } else {
                // Retired before it was announced: the session was cancelled
                // or the transport already failed. Whoever retired it will
                // shut it down from the slot.
                ctx.release_writer(client.id());
            }
            *slot = Some(client);
        }
        Err(e) => {
            warn!(error = %e, "connection failed");
            ctx.transition(ConnectionState::Failed, session);
        }
    }
}

/// Handles the end of a generation's receive loop.
///
/// A clean close settles in `Disconnected`. A transport failure settles in
/// `Failed` and schedules one reconnection attempt. Either way the generation
/// is cancelled so its heartbeat and writer stop. A retired generation exits
/// silently.
pub(crate) fn handle_receive_exit(
    ctx: &Arc<ManagerContext>,
    generation: &GenerationContext,
    outcome: ReadOutcome,
) {
    match outcome {
        ReadOutcome::Cancelled => debug!("receive loop cancelled"),
        ReadOutcome::Closed => {
            if ctx.retire(ConnectionState::Disconnected, &generation.cancel) {
                ctx.release_writer(generation.id);
                info!("backend closed the connection");
            }
        }
        ReadOutcome::Failed(reason) => {
            if !ctx.retire(ConnectionState::Failed, &generation.cancel) {
                return;
            }
            ctx.release_writer(generation.id);
            warn!(%reason, "connection lost");

            if generation.identity.is_empty() {
                info!("no identity on record, not reconnecting");
                return;
            }
            tokio::spawn(reconnect_after_failure(
                Arc::clone(ctx),
                generation.identity.clone(),
                generation.session.clone(),
            ));
        }
    }
}

/// Waits the configured delay, then makes exactly one attempt to reopen
/// the connection. A failed attempt settles in `Failed`; no further retry
/// happens until another live connection fails.
pub(crate) async fn reconnect_after_failure(
    ctx: Arc<ManagerContext>,
    identity: ConnectionIdentity,
    session: CancellationToken,
) {
    if !ctx.transition(ConnectionState::Reconnecting, &session) {
        return;
    }
    let delay = ctx.config.reconnect_delay;
    info!(delay_ms = delay.as_millis() as u64, "reconnecting");

    tokio::select! {
        _ = session.cancelled() => {
            debug!("reconnect cancelled");
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    let mut slot = ctx.lifecycle.lock().await;
    if session.is_cancelled() {
        debug!("reconnect cancelled");
        return;
    }
    if let Some(mut old) = slot.take() {
        ctx.clear_writer();
        old.shutdown(ctx.config.close_timeout).await;
    }
    open_generation(&ctx, &mut slot, identity, &session).await;
}
