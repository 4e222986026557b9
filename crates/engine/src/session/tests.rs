use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::Instant;

use turnstile_domain::{
    CommandRequest, LifecycleState, Outgoing, ResourceId, RuleError, SessionError,
};

use super::{create_session, SessionHandle, SessionRequest};
use crate::message_bus::Envelope;
use crate::rule::{MockRule, Rule};

#[derive(Debug, Clone)]
enum Cmd {
    /// Hold `locks` for `hold`, then publish `label`.
    Work {
        label: &'static str,
        locks: &'static [&'static str],
        hold: Duration,
    },
    Script(Vec<Step>),
    Reject,
    /// Try to close the session from inside a command.
    CloseSelf,
}

#[derive(Debug, Clone)]
enum Step {
    Say(&'static str),
    Later(Cmd, Duration),
    CloseAfter(Duration),
}

#[derive(Default)]
struct TestRule {
    spans: StdMutex<Vec<(&'static str, Instant, Instant)>>,
    this: StdMutex<Option<SessionHandle<TestRule>>>,
}

impl TestRule {
    fn spans(&self) -> Vec<(&'static str, Instant, Instant)> {
        self.spans.lock().expect("spans").clone()
    }
}

#[async_trait]
impl Rule for TestRule {
    type Player = &'static str;
    type Command = Cmd;
    type Message = String;
    type Error = RuleError;

    fn locks_for(&self, command: &Cmd) -> BTreeSet<ResourceId> {
        match command {
            Cmd::Work { locks, .. } => locks.iter().map(|name| ResourceId::from(*name)).collect(),
            _ => BTreeSet::new(),
        }
    }

    async fn process(
        &self,
        player: &'static str,
        command: Cmd,
    ) -> Result<Vec<Outgoing<&'static str, Cmd, String>>, RuleError> {
        match command {
            Cmd::Work { label, hold, .. } => {
                let started = Instant::now();
                tokio::time::sleep(hold).await;
                self.spans
                    .lock()
                    .expect("spans")
                    .push((label, started, Instant::now()));
                Ok(vec![Outgoing::message(label.to_string())])
            }
            Cmd::Script(steps) => Ok(steps
                .into_iter()
                .map(|step| match step {
                    Step::Say(text) => Outgoing::message(text.to_string()),
                    Step::Later(command, delay) => Outgoing::deferred(player, command, delay),
                    Step::CloseAfter(delay) => Outgoing::close_after(delay),
                })
                .collect()),
            Cmd::Reject => Err(RuleError::incorrect_stage("ended", ["in_process"])),
            Cmd::CloseSelf => {
                let this = self
                    .this
                    .lock()
                    .expect("handle")
                    .clone()
                    .expect("handle installed");
                let outcome = match this.close().await {
                    Ok(()) => "self-close allowed",
                    Err(SessionError::SelfCloseViolation(_)) => "self-close rejected",
                    Err(_) => "self-close failed",
                };
                Ok(vec![Outgoing::message(outcome.to_string())])
            }
        }
    }
}

fn session() -> (SessionHandle<TestRule>, Arc<TestRule>, Arc<AtomicUsize>) {
    let rule = Arc::new(TestRule::default());
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    let handle = create_session(rule.clone(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    *rule.this.lock().expect("handle") = Some(handle.clone());
    (handle, rule, closed)
}

fn cmd(command: Cmd) -> SessionRequest<TestRule> {
    CommandRequest::command("team-1", command)
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn work(label: &'static str, locks: &'static [&'static str], hold_ms: u64) -> Cmd {
    Cmd::Work {
        label,
        locks,
        hold: ms(hold_ms),
    }
}

fn script(steps: impl IntoIterator<Item = Step>) -> Cmd {
    Cmd::Script(steps.into_iter().collect())
}

fn spawn_accept(
    session: &SessionHandle<TestRule>,
    request: SessionRequest<TestRule>,
) -> tokio::task::JoinHandle<Result<(), SessionError<RuleError>>> {
    let session = session.clone();
    tokio::spawn(async move { session.accept(request).await })
}

#[tokio::test]
async fn messages_are_published_in_rule_order() {
    let (session, _, _) = session();

    session
        .accept(cmd(script([Step::Say("a"), Step::Say("b"), Step::Say("c")])))
        .await
        .expect("accepted");

    assert_eq!(session.history(), vec!["a", "b", "c"]);
    assert_eq!(session.state(), LifecycleState::Open);
}

#[tokio::test(start_paused = true)]
async fn commands_sharing_a_resource_run_one_after_another() {
    let (session, rule, _) = session();

    let first = spawn_accept(&session, cmd(work("long", &["team-1"], 100)));
    tokio::time::sleep(ms(1)).await;
    let second = spawn_accept(&session, cmd(work("short", &["team-1"], 10)));

    first.await.expect("task").expect("long");
    second.await.expect("task").expect("short");

    let spans = rule.spans();
    assert_eq!(spans.len(), 2);
    let (long, short) = (spans[0], spans[1]);
    assert_eq!((long.0, short.0), ("long", "short"));
    assert!(short.1 >= long.2, "short started before long released team-1");
    assert_eq!(session.history(), vec!["long", "short"]);
}

#[tokio::test(start_paused = true)]
async fn commands_with_disjoint_resources_overlap() {
    let (session, rule, _) = session();
    let started = Instant::now();

    let a = spawn_accept(&session, cmd(work("a", &["team-1"], 100)));
    let b = spawn_accept(&session, cmd(work("b", &["team-2"], 100)));
    a.await.expect("task").expect("a");
    b.await.expect("task").expect("b");

    assert!(started.elapsed() < ms(150));
    let spans = rule.spans();
    assert!(spans[0].1 < spans[1].2 && spans[1].1 < spans[0].2);
}

#[tokio::test(start_paused = true)]
async fn shared_resource_serializes_otherwise_disjoint_commands() {
    let (session, rule, _) = session();

    let a = spawn_accept(&session, cmd(work("a", &["round", "team-1"], 50)));
    tokio::time::sleep(ms(1)).await;
    let b = spawn_accept(&session, cmd(work("b", &["round", "team-2"], 50)));
    a.await.expect("task").expect("a");
    b.await.expect("task").expect("b");

    let spans = rule.spans();
    assert!(spans[1].1 >= spans[0].2);
}

#[tokio::test(start_paused = true)]
async fn deferred_close_fires_after_its_delay() {
    let (session, _, closed) = session();
    let stream = session.messages();
    let started = Instant::now();

    let accepting = spawn_accept(
        &session,
        cmd(script([Step::Say("x"), Step::CloseAfter(ms(50))])),
    );

    tokio::time::sleep(ms(10)).await;
    assert_eq!(session.history(), vec!["x"]);
    assert!(session.state().is_open());

    accepting.await.expect("task").expect("accepted");
    assert!(started.elapsed() >= ms(50));
    assert!(session.state().is_closed());
    assert_eq!(stream.collect::<Vec<_>>().await, vec!["x"]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_closes_close_once_after_draining() {
    let (session, _, closed) = session();

    let slow = spawn_accept(&session, cmd(work("slow", &["team-1"], 100)));
    tokio::time::sleep(ms(10)).await;

    let closes: Vec<_> = (0..3)
        .map(|_| spawn_accept(&session, CommandRequest::close()))
        .collect();
    for close in closes {
        close.await.expect("task").expect("closed");
    }
    slow.await.expect("task").expect("in-flight command finished");

    assert_eq!(
        session.inner.bus.entries(),
        vec![Envelope::Regular("slow".to_string()), Envelope::Terminal]
    );
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(session.state().is_closed());
}

#[tokio::test]
async fn closed_session_rejects_commands_and_close_is_idempotent() {
    let (session, _, closed) = session();
    session.close().await.expect("closed");

    let err = session
        .accept(cmd(script([Step::Say("late")])))
        .await
        .expect_err("rejected");
    assert!(err.is_already_closed());

    session.close().await.expect("second close is a no-op");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(session.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn commands_are_rejected_while_closing() {
    let (session, _, _) = session();

    let slow = spawn_accept(&session, cmd(work("slow", &["team-1"], 100)));
    tokio::time::sleep(ms(10)).await;
    let closing = spawn_accept(&session, CommandRequest::close());
    tokio::time::sleep(ms(10)).await;

    assert_eq!(session.state(), LifecycleState::Closing);
    let err = session
        .accept(cmd(script([Step::Say("too late")])))
        .await
        .expect_err("rejected");
    assert!(matches!(err, SessionError::AlreadyClosed(id) if id == session.id()));

    closing.await.expect("task").expect("closed");
    slow.await.expect("task").expect("slow");
    assert_eq!(session.history(), vec!["slow"]);
}

#[tokio::test]
async fn rule_error_reaches_the_submitter_and_session_stays_open() {
    let (session, _, _) = session();

    let err = session
        .accept(cmd(Cmd::Reject))
        .await
        .expect_err("rejected");
    assert_eq!(
        err.domain(),
        Some(&RuleError::incorrect_stage("ended", ["in_process"]))
    );
    assert!(session.state().is_open());

    session
        .accept(cmd(script([Step::Say("after")])))
        .await
        .expect("still accepting");
    assert_eq!(session.history(), vec!["after"]);
}

#[tokio::test(start_paused = true)]
async fn close_from_inside_the_session_is_rejected() {
    let (session, _, closed) = session();

    session.accept(cmd(Cmd::CloseSelf)).await.expect("accepted");
    session
        .accept(cmd(script([Step::Later(Cmd::CloseSelf, ms(20))])))
        .await
        .expect("accepted");

    assert_eq!(
        session.history(),
        vec!["self-close rejected", "self-close rejected"]
    );
    assert!(session.state().is_open());

    session.close().await.expect("external close");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_subscriber_replays_history_then_follows() {
    let (session, _, _) = session();
    session
        .accept(cmd(script([Step::Say("one"), Step::Say("two"), Step::Say("three")])))
        .await
        .expect("accepted");

    let stream = session.messages();
    session
        .accept(cmd(script([Step::Say("four")])))
        .await
        .expect("accepted");
    session.close().await.expect("closed");

    assert_eq!(
        stream.collect::<Vec<_>>().await,
        vec!["one", "two", "three", "four"]
    );
    assert_eq!(
        session.messages().collect::<Vec<_>>().await,
        vec!["one", "two", "three", "four"]
    );
}

#[tokio::test(start_paused = true)]
async fn close_cancels_unfired_deferred_commands() {
    let (session, _, _) = session();

    let accepting = spawn_accept(
        &session,
        cmd(script([
            Step::Say("now"),
            Step::Later(script([Step::Say("never")]), Duration::from_secs(10)),
        ])),
    );
    tokio::time::sleep(ms(10)).await;

    let started = Instant::now();
    session.close().await.expect("closed");
    assert!(started.elapsed() < Duration::from_secs(1));

    accepting
        .await
        .expect("task")
        .expect("accept resolves once its branch is abandoned");
    assert_eq!(session.history(), vec!["now"]);
}

#[tokio::test(start_paused = true)]
async fn deferred_commands_chain_recursively() {
    let (session, _, _) = session();
    let started = Instant::now();

    let third = script([Step::Say("3")]);
    let second = script([Step::Say("2"), Step::Later(third, ms(10))]);
    session
        .accept(cmd(script([Step::Say("1"), Step::Later(second, ms(10))])))
        .await
        .expect("accepted");

    assert!(started.elapsed() >= ms(20));
    assert_eq!(session.history(), vec!["1", "2", "3"]);
    assert!(session.state().is_open());
}

#[tokio::test(start_paused = true)]
async fn own_deferred_close_wins_over_a_child_close() {
    let (session, _, _) = session();
    let started = Instant::now();

    let child = script([Step::Say("child"), Step::CloseAfter(ms(10))]);
    let accepting = spawn_accept(
        &session,
        cmd(script([Step::CloseAfter(ms(100)), Step::Later(child, ms(10))])),
    );

    tokio::time::sleep(ms(50)).await;
    assert_eq!(session.history(), vec!["child"]);
    assert!(session.state().is_open());

    accepting.await.expect("task").expect("accepted");
    assert!(started.elapsed() >= ms(100));
    assert!(session.state().is_closed());
}

#[tokio::test(start_paused = true)]
async fn children_finish_before_a_shorter_own_close() {
    let (session, _, _) = session();
    let started = Instant::now();

    session
        .accept(cmd(script([
            Step::CloseAfter(ms(10)),
            Step::Later(script([Step::Say("late child")]), ms(50)),
        ])))
        .await
        .expect("accepted");

    assert!(started.elapsed() >= ms(50));
    assert_eq!(session.history(), vec!["late child"]);
    assert!(session.state().is_closed());
}

#[tokio::test(start_paused = true)]
async fn first_declared_child_close_wins() {
    let (session, _, _) = session();
    let started = Instant::now();

    let slow_close = script([Step::CloseAfter(ms(200))]);
    let quick_close = script([Step::CloseAfter(ms(10))]);
    let accepting = spawn_accept(
        &session,
        cmd(script([
            Step::Later(slow_close, ms(10)),
            Step::Later(quick_close, ms(10)),
        ])),
    );

    tokio::time::sleep(ms(100)).await;
    assert!(session.state().is_open());

    accepting.await.expect("task").expect("accepted");
    assert!(started.elapsed() >= ms(200));
    assert!(session.state().is_closed());
}

#[tokio::test(start_paused = true)]
async fn deferred_rule_error_is_logged_not_returned() {
    let (session, _, _) = session();

    session
        .accept(cmd(script([Step::Say("parent"), Step::Later(Cmd::Reject, ms(10))])))
        .await
        .expect("parent succeeded");

    assert_eq!(session.history(), vec!["parent"]);
    assert!(session.state().is_open());
}

#[tokio::test]
async fn mock_rule_errors_surface_as_domain_errors() {
    let mut rule = MockRule::new();
    rule.expect_locks_for()
        .returning(|_| BTreeSet::from([ResourceId::from("board")]));
    rule.expect_process()
        .times(1)
        .returning(|_, _| Err(RuleError::validation("not your turn")));
    let session = create_session(Arc::new(rule), || {});

    let err = session
        .accept(CommandRequest::command("alice".to_string(), "move".to_string()))
        .await
        .expect_err("rejected");

    assert_eq!(err.domain(), Some(&RuleError::validation("not your turn")));
    assert!(session.history().is_empty());
    assert!(session.state().is_open());
}

#[tokio::test]
async fn mock_rule_receives_player_and_command() {
    let mut rule = MockRule::new();
    rule.expect_locks_for().returning(|_| BTreeSet::new());
    rule.expect_process()
        .withf(|player, command| player == "alice" && command == "hello")
        .times(1)
        .returning(|player, command| {
            Ok(vec![
                Outgoing::message(format!("{player} says {command}")),
                Outgoing::message("bye".to_string()),
            ])
        });
    let session = create_session(Arc::new(rule), || {});

    session
        .accept(CommandRequest::command("alice".to_string(), "hello".to_string()))
        .await
        .expect("accepted");

    assert_eq!(session.history(), vec!["alice says hello", "bye"]);
}

#[tokio::test]
async fn summary_reflects_session_state() {
    let (session, _, _) = session();
    session
        .accept(cmd(script([Step::Say("a"), Step::Say("b")])))
        .await
        .expect("accepted");

    let summary = session.summary();
    assert_eq!(summary.id, session.id());
    assert_eq!(summary.state, LifecycleState::Open);
    assert_eq!(summary.published_messages, 2);

    session.close().await.expect("closed");
    let json = serde_json::to_value(session.summary()).expect("serializes");
    assert_eq!(json["state"], "closed");
    assert_eq!(json["published_messages"], 2);
}

#[tokio::test(start_paused = true)]
async fn deferred_commands_take_the_same_locks_as_external_ones() {
    let (session, rule, _) = session();

    let external = spawn_accept(&session, cmd(work("external", &["team-1"], 100)));
    tokio::time::sleep(ms(1)).await;
    session
        .accept(cmd(script([
            Step::Later(work("deferred", &["team-1"], 10), ms(20)),
            Step::Later(work("elsewhere", &["team-2"], 10), ms(20)),
        ])))
        .await
        .expect("accepted");
    external.await.expect("task").expect("external");

    let spans = rule.spans();
    let span = |label: &str| {
        spans
            .iter()
            .find(|span| span.0 == label)
            .copied()
            .expect("span recorded")
    };
    let (external, deferred, elsewhere) = (span("external"), span("deferred"), span("elsewhere"));

    assert!(deferred.1 >= external.2, "deferred command ran while team-1 was held");
    assert!(elsewhere.1 < external.2 && external.1 < elsewhere.2);
}

#[tokio::test(start_paused = true)]
async fn oversized_close_delay_yields_to_an_external_close() {
    let (session, _, closed) = session();

    let accepting = spawn_accept(
        &session,
        cmd(script([Step::Say("x"), Step::CloseAfter(Duration::MAX)])),
    );
    tokio::time::sleep(ms(10)).await;
    assert!(session.state().is_open());

    session.close().await.expect("closed");
    accepting
        .await
        .expect("accept task finished without panicking")
        .expect("accepted");

    assert_eq!(session.history(), vec!["x"]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn deadline_saturates_instead_of_overflowing() {
    let now = Instant::now();
    assert!(super::deadline_after(now, Duration::MAX) > now + Duration::from_secs(86400));
    assert_eq!(super::deadline_after(now, ms(5)), now + ms(5));
}

#[tokio::test(start_paused = true)]
async fn panicking_close_callback_still_releases_waiting_closers() {
    let session = create_session(Arc::new(TestRule::default()), || {
        panic!("close callback failed");
    });

    let slow = spawn_accept(&session, cmd(work("slow", &["team-1"], 100)));
    tokio::time::sleep(ms(10)).await;
    let first = spawn_accept(&session, CommandRequest::close());
    tokio::time::sleep(ms(10)).await;
    assert_eq!(session.state(), LifecycleState::Closing);
    let second = spawn_accept(&session, CommandRequest::close());

    let panicked = first.await.expect_err("callback panic reaches the closer");
    assert!(panicked.is_panic());
    second
        .await
        .expect("task")
        .expect("waiting closer returns once closed");
    slow.await.expect("task").expect("slow");
    assert!(session.state().is_closed());
}
