use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use lime::{
    Channel, ChannelBuilder, ChannelError, Client, ClientConfig, ClientError, Command,
    CommandMethod, Context, ContextError, Envelope, Message, Notification, NotificationEvent,
    Session, SessionState, TransportError,
};

#[derive(Clone, Copy, PartialEq)]
enum Finish {
    Succeed,
    Fail,
    Hang,
}

/// Channel double recording what the client delegates to it.
struct FakeChannel {
    established: AtomicBool,
    finish: Finish,
    fail_sends: bool,
    sent: Mutex<Vec<Envelope>>,
    finish_calls: AtomicUsize,
    transport_closes: AtomicUsize,
}

impl FakeChannel {
    fn new(finish: Finish) -> Self {
        Self {
            established: AtomicBool::new(true),
            finish,
            fail_sends: false,
            sent: Mutex::new(Vec::new()),
            finish_calls: AtomicUsize::new(0),
            transport_closes: AtomicUsize::new(0),
        }
    }

    fn record(&self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.fail_sends {
            return Err(ChannelError::Transport(TransportError::Io(
                "broken pipe".into(),
            )));
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    async fn send_message(&self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        self.record(msg.into())
    }

    async fn send_notification(
        &self,
        _ctx: &Context,
        not: Notification,
    ) -> Result<(), ChannelError> {
        self.record(not.into())
    }

    async fn send_command(&self, _ctx: &Context, cmd: Command) -> Result<(), ChannelError> {
        self.record(cmd.into())
    }

    async fn process_command(&self, _ctx: &Context, cmd: Command) -> Result<Command, ChannelError> {
        let response = cmd.success_response(None);
        self.record(cmd.into())?;
        Ok(response)
    }

    async fn finish_session(&self, _ctx: &Context) -> Result<Session, ChannelError> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        self.established.store(false, Ordering::SeqCst);
        match self.finish {
            Finish::Succeed => Ok(Session::new(SessionState::Finished)),
            Finish::Fail => Err(ChannelError::Closed),
            Finish::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn close_transport(&self) -> Result<(), ChannelError> {
        self.transport_closes.fetch_add(1, Ordering::SeqCst);
        self.established.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder failing a fixed number of times before handing out channels.
struct FlakyBuilder {
    failures: AtomicUsize,
    calls: Arc<AtomicUsize>,
    build_delay: Duration,
    make: Box<dyn Fn() -> Arc<FakeChannel> + Send + Sync>,
    built: Arc<Mutex<Vec<Arc<FakeChannel>>>>,
}

impl FlakyBuilder {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: Arc::new(AtomicUsize::new(0)),
            build_delay: Duration::from_millis(5),
            make: Box::new(|| Arc::new(FakeChannel::new(Finish::Succeed))),
            built: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn making(mut self, make: impl Fn() -> FakeChannel + Send + Sync + 'static) -> Self {
        self.make = Box::new(move || Arc::new(make()));
        self
    }
}

#[async_trait]
impl ChannelBuilder for FlakyBuilder {
    async fn build(&self, _ctx: &Context) -> Result<Arc<dyn Channel>, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.build_delay).await;
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ChannelError::Transport(TransportError::Io(
                "connection refused".into(),
            )));
        }
        let channel = (self.make)();
        self.built.lock().push(channel.clone());
        Ok(channel as Arc<dyn Channel>)
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .backoff_unit(Duration::from_millis(1))
        .close_timeout(Duration::from_millis(200))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_share_a_single_build() {
    let builder = FlakyBuilder::new(3);
    let calls = builder.calls.clone();
    let built = builder.built.clone();
    let client = Arc::new(Client::with_config(builder, fast_config()));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = Context::background().with_timeout(Duration::from_secs(10));
            client
                .send_message(&ctx, Message::text(format!("hello {i}")))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let built = built.lock();
    assert_eq!(built.len(), 1);
    assert_eq!(built[0].sent.lock().len(), 8);
}

#[tokio::test]
async fn retries_follow_quadratic_backoff() {
    let builder = FlakyBuilder::new(3);
    let calls = builder.calls.clone();
    let config = ClientConfig::default().backoff_unit(Duration::from_millis(20));
    let client = Client::with_config(builder, config);

    let started = Instant::now();
    let ctx = Context::background().with_timeout(Duration::from_secs(10));
    client.send_message(&ctx, Message::text("hi")).await.unwrap();

    // 0 + 20 + 80 ms of backoff before the fourth attempt
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn healthy_channel_is_reused() {
    let builder = FlakyBuilder::new(0);
    let calls = builder.calls.clone();
    let client = Client::with_config(builder, fast_config());
    let ctx = Context::background();

    client.send_message(&ctx, Message::text("one")).await.unwrap();
    client
        .send_notification(&ctx, Notification::new("x", NotificationEvent::Consumed))
        .await
        .unwrap();
    client
        .send_command(&ctx, Command::new(CommandMethod::Set, "/presence"))
        .await
        .unwrap();
    let request = Command::new(CommandMethod::Get, "/account");
    let response = client.process_command(&ctx, request.clone()).await.unwrap();

    assert_eq!(response.base.id, request.base.id);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(client.established());
}

#[tokio::test]
async fn done_context_never_calls_the_builder() {
    let builder = FlakyBuilder::new(0);
    let calls = builder.calls.clone();
    let client = Client::with_config(builder, fast_config());

    let ctx = Context::background().with_cancel();
    ctx.cancel();
    let err = client
        .send_message(&ctx, Message::text("never"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::AcquisitionCancelled {
            source: ContextError::Cancelled,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deadline_interrupts_backoff() {
    let builder = FlakyBuilder::new(usize::MAX);
    let config = ClientConfig::default().backoff_unit(Duration::from_secs(30));
    let client = Client::with_config(builder, config);

    let started = Instant::now();
    let ctx = Context::background().with_timeout(Duration::from_millis(100));
    let Err(err) = client.get_or_build_channel(&ctx).await else {
        panic!("builder never succeeds");
    };

    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        ClientError::AcquisitionCancelled { attempts, source } => {
            assert!(attempts >= 1);
            assert_eq!(source, ContextError::DeadlineExceeded);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn send_failures_are_surfaced_without_retry() {
    let builder = FlakyBuilder::new(0).making(|| FakeChannel {
        fail_sends: true,
        ..FakeChannel::new(Finish::Succeed)
    });
    let calls = builder.calls.clone();
    let client = Client::with_config(builder, fast_config());

    let err = client
        .send_message(&Context::background(), Message::text("lost"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Channel(ChannelError::Transport(TransportError::Io(_)))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_without_channel_is_a_no_op() {
    let builder = FlakyBuilder::new(0);
    let calls = builder.calls.clone();
    let client = Client::with_config(builder, fast_config());

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn close_finishes_session_once() {
    let builder = FlakyBuilder::new(0);
    let built = builder.built.clone();
    let client = Client::with_config(builder, fast_config());
    client
        .send_message(&Context::background(), Message::text("hi"))
        .await
        .unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();

    let channel = built.lock()[0].clone();
    assert_eq!(channel.finish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.transport_closes.load(Ordering::SeqCst), 0);
    assert!(!client.established());
}

#[tokio::test]
async fn failed_finish_still_drops_the_channel() {
    let builder = FlakyBuilder::new(0).making(|| FakeChannel::new(Finish::Fail));
    let calls = builder.calls.clone();
    let built = builder.built.clone();
    let client = Client::with_config(builder, fast_config());
    let ctx = Context::background();
    client.send_message(&ctx, Message::text("hi")).await.unwrap();

    let err = client.close().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::GracefulCloseFailed(ChannelError::Closed)
    ));
    assert!(!client.established());
    assert_eq!(built.lock()[0].transport_closes.load(Ordering::SeqCst), 1);

    // next send needs a fresh channel
    client.send_message(&ctx, Message::text("again")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn hanging_finish_is_bounded_by_close_timeout() {
    let builder = FlakyBuilder::new(0).making(|| FakeChannel::new(Finish::Hang));
    let client = Client::with_config(builder, fast_config());
    client
        .send_message(&Context::background(), Message::text("hi"))
        .await
        .unwrap();

    let started = Instant::now();
    let err = client.close().await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        err,
        ClientError::GracefulCloseFailed(ChannelError::Cancelled(ContextError::DeadlineExceeded))
    ));
    assert!(!client.established());
}

#[tokio::test]
async fn broken_channel_is_closed_without_finish() {
    let builder = FlakyBuilder::new(0);
    let built = builder.built.clone();
    let client = Client::with_config(builder, fast_config());
    client
        .send_message(&Context::background(), Message::text("hi"))
        .await
        .unwrap();

    let channel = built.lock()[0].clone();
    channel.established.store(false, Ordering::SeqCst);
    client.close().await.unwrap();

    assert_eq!(channel.finish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(channel.transport_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lost_channel_is_rebuilt_on_next_send() {
    let builder = FlakyBuilder::new(0);
    let calls = builder.calls.clone();
    let built = builder.built.clone();
    let client = Client::with_config(builder, fast_config());
    let ctx = Context::background();

    client.send_message(&ctx, Message::text("first")).await.unwrap();
    let first = built.lock()[0].clone();
    first.established.store(false, Ordering::SeqCst);
    client.send_message(&ctx, Message::text("second")).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.sent.lock().len(), 1);
    assert_eq!(built.lock()[1].sent.lock().len(), 1);
}
