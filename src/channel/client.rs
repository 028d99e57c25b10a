use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::builder::SessionOptions;
use super::{Channel, ChannelError};
use crate::context::Context;
use crate::envelope::{
    new_envelope_id, Command, Envelope, Message, Notification, Session, SessionState,
};
use crate::mux::EnvelopeMux;
use crate::node::Node;
use crate::transport::{Transport, TransportError};

const OUTBOUND_QUEUE: usize = 64;

struct Outbound {
    envelope: Envelope,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

/// Session state shared between the channel handle and its I/O task.
#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    established: AtomicBool,
    pending: Mutex<HashMap<String, oneshot::Sender<Command>>>,
    finish: Mutex<Option<oneshot::Sender<Session>>>,
    close_error: Mutex<Option<TransportError>>,
}

impl Shared {
    fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
            established: AtomicBool::new(state == SessionState::Established),
            pending: Mutex::new(HashMap::new()),
            finish: Mutex::new(None),
            close_error: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        *state = next;
        self.established
            .store(next == SessionState::Established, Ordering::Release);
    }

    /// Moves to `next` unless the session already ended.
    fn end(&self, next: SessionState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
        self.established.store(false, Ordering::Release);
    }

    /// Returns to `Established` after a finish that never reached the transport.
    fn resume(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Finishing {
            *state = SessionState::Established;
            self.established.store(true, Ordering::Release);
        }
    }
}

/// Removes a pending request entry on every exit path of `process_command`.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// Client side of an established session.
///
/// A background task owns the transport: it writes queued outbound envelopes, matches
/// command responses to waiting requests and hands every other inbound envelope to
/// the [`EnvelopeMux`].
pub struct ClientChannel {
    session_id: String,
    local_node: Option<Node>,
    remote_node: Option<Node>,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    io: Context,
    stopped: CancellationToken,
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("session_id", &self.session_id)
            .field("local_node", &self.local_node)
            .field("remote_node", &self.remote_node)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl ClientChannel {
    /// Runs the client session handshake over `transport`, bounded by `ctx`.
    ///
    /// # Errors
    /// `SessionFailed` when the server refuses the session, `Protocol` for unexpected
    /// frames, `Cancelled` when `ctx` ends first and `Transport` for I/O failures.
    /// The transport is closed on every error path.
    pub async fn establish<T>(
        ctx: &Context,
        mut transport: T,
        options: &SessionOptions,
        mux: Arc<EnvelopeMux>,
    ) -> Result<Self, ChannelError>
    where
        T: Transport + 'static,
    {
        let outcome = match ctx.run(handshake(&mut transport, options)).await {
            Ok(outcome) => outcome,
            Err(err) => Err(err.into()),
        };
        let session = match outcome {
            Ok(session) => session,
            Err(err) => {
                let _ = transport.close().await;
                return Err(err);
            }
        };

        debug!(
            session_id = %session.base.id,
            local = ?session.base.to,
            remote = ?session.base.from,
            "session established"
        );

        let shared = Arc::new(Shared::new(SessionState::Established));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let io = Context::background().with_cancel();
        let stopped = CancellationToken::new();
        tokio::spawn(run_io(
            transport,
            outbound_rx,
            shared.clone(),
            mux,
            io.clone(),
            stopped.clone().drop_guard(),
        ));

        Ok(Self {
            session_id: session.base.id,
            local_node: session.base.to,
            remote_node: session.base.from,
            shared,
            outbound,
            io,
            stopped,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Node assigned to this side by the server.
    pub fn local_node(&self) -> Option<&Node> {
        self.local_node.as_ref()
    }

    pub fn remote_node(&self) -> Option<&Node> {
        self.remote_node.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    fn ensure_established(&self) -> Result<(), ChannelError> {
        if self.established() {
            Ok(())
        } else {
            Err(ChannelError::NotEstablished(self.shared.state()))
        }
    }

    async fn enqueue(&self, ctx: &Context, envelope: Envelope) -> Result<(), ChannelError> {
        let (ack, ack_rx) = oneshot::channel();
        ctx.run(self.outbound.send(Outbound { envelope, ack }))
            .await?
            .map_err(|_| ChannelError::Closed)?;
        let sent = ctx.run(ack_rx).await?.map_err(|_| ChannelError::Closed)?;
        Ok(sent?)
    }

    async fn send_envelope(&self, ctx: &Context, envelope: Envelope) -> Result<(), ChannelError> {
        self.ensure_established()?;
        self.enqueue(ctx, envelope).await
    }
}

#[async_trait]
impl Channel for ClientChannel {
    fn established(&self) -> bool {
        self.shared.established.load(Ordering::Acquire)
    }

    async fn send_message(&self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        self.send_envelope(ctx, msg.into()).await
    }

    async fn send_notification(
        &self,
        ctx: &Context,
        not: Notification,
    ) -> Result<(), ChannelError> {
        self.send_envelope(ctx, not.into()).await
    }

    async fn send_command(&self, ctx: &Context, cmd: Command) -> Result<(), ChannelError> {
        self.send_envelope(ctx, cmd.into()).await
    }

    async fn process_command(&self, ctx: &Context, cmd: Command) -> Result<Command, ChannelError> {
        if cmd.is_response() {
            return Err(ChannelError::Protocol(
                "cannot process a command response as a request".into(),
            ));
        }
        let mut cmd = cmd;
        if cmd.base.id.is_empty() {
            cmd.base.id = new_envelope_id();
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(cmd.base.id.clone(), tx);
        let _guard = PendingGuard {
            shared: &*self.shared,
            id: cmd.base.id.clone(),
        };

        self.send_envelope(ctx, cmd.into()).await?;
        ctx.run(rx).await?.map_err(|_| ChannelError::Closed)
    }

    async fn finish_session(&self, ctx: &Context) -> Result<Session, ChannelError> {
        self.ensure_established()?;

        let (tx, rx) = oneshot::channel();
        *self.shared.finish.lock() = Some(tx);
        self.shared.set_state(SessionState::Finishing);

        let mut finishing = Session::new(SessionState::Finishing);
        finishing.base.id = self.session_id.clone();
        if let Err(err) = self.enqueue(ctx, finishing.into()).await {
            self.shared.finish.lock().take();
            self.shared.resume();
            return Err(err);
        }

        let session = ctx.run(rx).await?.map_err(|_| ChannelError::Closed)?;
        match session.state {
            SessionState::Finished => Ok(session),
            _ => Err(ChannelError::SessionFailed(session.reason)),
        }
    }

    /// Stops the I/O task, interrupting any send in flight, and waits until it has
    /// closed the transport.
    async fn close_transport(&self) -> Result<(), ChannelError> {
        self.io.cancel();
        self.stopped.cancelled().await;
        match self.shared.close_error.lock().take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

async fn handshake<T: Transport>(
    transport: &mut T,
    options: &SessionOptions,
) -> Result<Session, ChannelError> {
    let mut new = Session::new(SessionState::New);
    new.base.id = new_envelope_id();
    transport.send(new.into()).await?;

    loop {
        let session = match transport.recv().await? {
            Envelope::Session(session) => session,
            other => {
                return Err(ChannelError::Protocol(format!(
                    "unexpected {} during session handshake",
                    other.kind()
                )))
            }
        };

        match session.state {
            SessionState::Negotiating if session.has_negotiation_options() => {
                let mut reply = Session::new(SessionState::Negotiating);
                reply.base.id = session.base.id.clone();
                reply.compression = session
                    .compression_options
                    .as_ref()
                    .and_then(|options| options.first().copied());
                reply.encryption = session
                    .encryption_options
                    .as_ref()
                    .and_then(|options| options.first().copied());
                transport.send(reply.into()).await?;
            }
            // server confirming the negotiated options
            SessionState::Negotiating => {}
            SessionState::Authenticating => {
                let scheme = options.authentication.scheme();
                if let Some(offered) = &session.scheme_options {
                    if !offered.contains(&scheme) {
                        return Err(ChannelError::Protocol(format!(
                            "authentication scheme {scheme:?} not offered by server"
                        )));
                    }
                }
                let mut reply = Session::new(SessionState::Authenticating);
                reply.base.id = session.base.id.clone();
                reply.base.from = Some(options.identity.with_instance(options.instance.clone()));
                reply.scheme = Some(scheme);
                reply.authentication = Some(options.authentication.to_value());
                transport.send(reply.into()).await?;
            }
            SessionState::Established => return Ok(session),
            SessionState::Failed => return Err(ChannelError::SessionFailed(session.reason)),
            state => {
                return Err(ChannelError::Protocol(format!(
                    "unexpected session state {state:?} during handshake"
                )))
            }
        }
    }
}

/// Owns the transport for the lifetime of the session.
///
/// Stops when the remote ends the session, the transport fails, every channel handle
/// is gone or `ctx` is cancelled. Cancellation also interrupts a send blocked on a
/// peer that stopped reading.
async fn run_io<T: Transport>(
    mut transport: T,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    mux: Arc<EnvelopeMux>,
    ctx: Context,
    _stopped: DropGuard,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.done() => {
                debug!("channel closed locally");
                break;
            }
            op = outbound.recv() => match op {
                Some(Outbound { envelope, ack }) => {
                    // the caller gave up before the envelope reached the transport
                    if ack.is_closed() {
                        debug!(id = envelope.id(), "dropping abandoned outbound envelope");
                        continue;
                    }
                    match ctx.run(transport.send(envelope)).await {
                        Ok(sent) => {
                            let _ = ack.send(sent);
                        }
                        Err(_) => break,
                    }
                }
                None => break,
            },
            inbound = transport.recv() => match inbound {
                Ok(envelope) => {
                    if route(&shared, &mux, &ctx, envelope) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "channel receive failed, ending session");
                    break;
                }
            },
        }
    }

    shared.end(SessionState::Failed);
    if let Err(err) = transport.close().await {
        debug!(error = %err, "closing channel transport");
        *shared.close_error.lock() = Some(err);
    }
    // wakes pending requests and finish waiters with a closed error
    shared.pending.lock().clear();
    shared.finish.lock().take();
    ctx.cancel();
}

/// Routes one inbound envelope. Returns `true` once the session has ended.
fn route(shared: &Shared, mux: &Arc<EnvelopeMux>, ctx: &Context, envelope: Envelope) -> bool {
    let envelope = match envelope {
        Envelope::Session(session) => {
            if !session.state.is_terminal() {
                debug!(state = ?session.state, "ignoring session envelope");
                return false;
            }
            debug!(state = ?session.state, reason = ?session.reason, "session ended by remote");
            shared.set_state(session.state);
            if let Some(waiter) = shared.finish.lock().take() {
                let _ = waiter.send(session);
            }
            return true;
        }
        Envelope::Command(cmd) if cmd.is_response() => {
            let waiter = shared.pending.lock().remove(&cmd.base.id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(cmd);
                    return false;
                }
                None => Envelope::Command(cmd),
            }
        }
        other => other,
    };

    let mux = mux.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let kind = envelope.kind();
        let id = envelope.id().to_string();
        match mux.dispatch(&ctx, envelope).await {
            Ok(true) => {}
            Ok(false) => debug!(%kind, %id, "no handler for inbound envelope"),
            Err(err) => warn!(%kind, %id, error = %err, "envelope handler failed"),
        }
    });
    false
}
