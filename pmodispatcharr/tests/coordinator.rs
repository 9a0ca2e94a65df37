//! End-to-end tick tests against in-memory backends

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use pmodispatcharr::{
    Action, AuthError, AuthSession, Authenticator, Credentials, DataSource, DispatcharrConfig,
    DispatcharrCoordinator, EpgDataset, EpgProgram, FetchError, LoginResponse, RawStreamRecord,
    StreamIdentity, TickError, Token,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONFIG: &str = r#"
dispatcharr:
  host: dispatcharr.test
  username: admin
  password: secret
"#;

fn ts(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).unwrap()
}

fn stream(id: &str, clients: u32) -> RawStreamRecord {
    RawStreamRecord {
        channel_id: id.to_string(),
        channel_number: Some(id.to_string()),
        channel_name: Some(format!("Channel {}", id)),
        epg_channel_id: Some(format!("ch{}.tv", id)),
        client_count: Some(clients),
        avg_bitrate: Some("2500.0 kbps".to_string()),
        ..Default::default()
    }
}

fn program(channel: &str, title: &str, start: &str, stop: &str) -> EpgProgram {
    EpgProgram {
        channel_id: channel.to_string(),
        title: Some(title.to_string()),
        sub_title: None,
        season: Some(1),
        episode: Some(18),
        episode_num: None,
        description: None,
        start: ts(start),
        stop: ts(stop),
    }
}

struct FakeSource {
    streams: Mutex<Result<Vec<RawStreamRecord>, FetchError>>,
    epg: Mutex<Vec<EpgProgram>>,
    /// Number of upcoming stream fetches answered with 401
    unauthorized: AtomicUsize,
    delay_ms: AtomicUsize,
    stream_calls: AtomicUsize,
    epg_calls: AtomicUsize,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(Ok(Vec::new())),
            epg: Mutex::default(),
            unauthorized: AtomicUsize::default(),
            delay_ms: AtomicUsize::default(),
            stream_calls: AtomicUsize::default(),
            epg_calls: AtomicUsize::default(),
        })
    }

    fn set_streams(&self, streams: Vec<RawStreamRecord>) {
        *self.streams.lock().unwrap() = Ok(streams);
    }

    fn fail_with(&self, err: FetchError) {
        *self.streams.lock().unwrap() = Err(err);
    }

    fn set_epg(&self, programs: Vec<EpgProgram>) {
        *self.epg.lock().unwrap() = programs;
    }
}

#[async_trait]
impl DataSource for FakeSource {
    async fn fetch_active_streams(
        &self,
        _token: &Token,
    ) -> Result<Vec<RawStreamRecord>, FetchError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self
            .unauthorized
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FetchError::Unauthorized("token expired".into()));
        }
        self.streams.lock().unwrap().clone()
    }

    async fn fetch_epg(&self, _token: &Token) -> Result<EpgDataset, FetchError> {
        self.epg_calls.fetch_add(1, Ordering::SeqCst);
        Ok(EpgDataset::from_programs(self.epg.lock().unwrap().clone()))
    }
}

struct FakeAuth {
    accept: Mutex<bool>,
    logins: AtomicUsize,
}

impl FakeAuth {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            accept: Mutex::new(true),
            logins: AtomicUsize::new(0),
        })
    }

    fn set_accept(&self, accept: bool) {
        *self.accept.lock().unwrap() = accept;
    }

    fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for FakeAuth {
    async fn login(&self, _: &str, _: &str) -> Result<LoginResponse, AuthError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst);
        if *self.accept.lock().unwrap() {
            Ok(LoginResponse {
                access: Some(format!("token-{}", n)),
                refresh: None,
                expires_in: Some(3600),
            })
        } else {
            Err(AuthError::Rejected("invalid username or password".into()))
        }
    }
}

struct Harness {
    source: Arc<FakeSource>,
    auth: Arc<FakeAuth>,
    coordinator: Arc<DispatcharrCoordinator>,
}

fn harness() -> Harness {
    harness_with(CONFIG)
}

fn harness_with(yaml: &str) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pmodispatcharr=debug")
        .with_test_writer()
        .try_init();

    let source = FakeSource::new();
    let auth = FakeAuth::new();
    let config = Arc::new(DispatcharrConfig::from_yaml_str(yaml).unwrap());
    let session = AuthSession::new(auth.clone(), Credentials::new("admin", "secret"));
    let coordinator = Arc::new(DispatcharrCoordinator::new(
        source.clone(),
        session,
        config,
    ));
    Harness {
        source,
        auth,
        coordinator,
    }
}

async fn exposed(h: &Harness) -> Vec<String> {
    h.coordinator
        .exposed_identities()
        .await
        .into_iter()
        .map(|id| id.to_string())
        .collect()
}

fn describe(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .map(|a| match a {
            Action::Create(id, _) => format!("create:{}", id),
            Action::Update(id, _) => format!("update:{}", id),
            Action::Remove(id) => format!("remove:{}", id),
            Action::Count(n) => format!("count:{}", n),
        })
        .collect()
}

const NOW: &str = "2024-03-01T10:30:00Z";

#[tokio::test]
async fn test_first_tick_then_idempotent() {
    let h = harness();
    h.source.set_streams(vec![stream("2", 1), stream("1", 1)]);

    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(describe(&actions), vec!["create:1", "create:2", "count:2"]);

    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert!(actions.is_empty());
    assert_eq!(h.auth.logins(), 1);
}

#[tokio::test]
async fn test_diff_between_snapshots() {
    let h = harness();
    h.source
        .set_streams(vec![stream("1", 1), stream("2", 1), stream("3", 1)]);
    h.coordinator.run_tick(ts(NOW)).await.unwrap();

    h.source
        .set_streams(vec![stream("2", 4), stream("3", 1), stream("4", 1)]);
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();

    assert_eq!(describe(&actions), vec!["remove:1", "create:4", "update:2"]);
    assert_eq!(exposed(&h).await, vec!["2", "3", "4"]);
}

#[tokio::test]
async fn test_program_change_updates_entity() {
    let h = harness();
    h.source.set_streams(vec![stream("7", 1)]);
    h.source.set_epg(vec![
        program("ch7.tv", "A", "2024-03-01T10:00:00Z", "2024-03-01T11:00:00Z"),
        program("ch7.tv", "B", "2024-03-01T11:00:00Z", "2024-03-01T12:00:00Z"),
    ]);

    let actions = h.coordinator.run_tick(ts("2024-03-01T10:59:00Z")).await.unwrap();
    match &actions[0] {
        Action::Create(_, view) => {
            assert_eq!(view.program_title.as_deref(), Some("A"));
            assert_eq!(view.episode_number.as_deref(), Some("S1E18"));
        }
        other => panic!("unexpected action {:?}", other),
    }

    let actions = h.coordinator.run_tick(ts("2024-03-01T11:00:00Z")).await.unwrap();
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        Action::Update(id, view) => {
            assert_eq!(id, &StreamIdentity::new("7"));
            assert_eq!(view.program_title.as_deref(), Some("B"));
        }
        other => panic!("unexpected action {:?}", other),
    }
}

#[tokio::test]
async fn test_epg_disabled_skips_fetch_and_nulls_programs() {
    let h = harness_with(&format!("{}epg:\n  enabled: false\n", CONFIG));
    h.source.set_streams(vec![stream("7", 1)]);
    h.source.set_epg(vec![program(
        "ch7.tv",
        "A",
        "2024-03-01T10:00:00Z",
        "2024-03-01T11:00:00Z",
    )]);

    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(h.source.epg_calls.load(Ordering::SeqCst), 0);
    match &actions[0] {
        Action::Create(_, view) => {
            assert_eq!(view.program_title, None);
            assert_eq!(view.episode_number, None);
            assert_eq!(view.program_start, None);
        }
        other => panic!("unexpected action {:?}", other),
    }

    // turning the option on takes effect on the next tick
    h.coordinator.config().set_epg_enabled(true).unwrap();
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(h.source.epg_calls.load(Ordering::SeqCst), 1);
    assert_eq!(describe(&actions), vec!["update:7"]);
}

#[tokio::test]
async fn test_no_streams_skips_epg() {
    let h = harness();
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(describe(&actions), vec!["count:0"]);
    assert_eq!(h.source.epg_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fetch_failure_keeps_entities() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1), stream("2", 1)]);
    h.coordinator.run_tick(ts(NOW)).await.unwrap();

    h.source.fail_with(FetchError::Status {
        code: 502,
        message: "bad gateway".into(),
    });
    for _ in 0..3 {
        let err = h.coordinator.run_tick(ts(NOW)).await.unwrap_err();
        assert!(matches!(err, TickError::Fetch(FetchError::Status { code: 502, .. })));
        assert_eq!(exposed(&h).await, vec!["1", "2"]);
    }

    h.source.set_streams(vec![stream("2", 1)]);
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(describe(&actions), vec!["remove:1", "count:1"]);
}

#[tokio::test]
async fn test_rejected_login_keeps_entities() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1)]);
    h.coordinator.run_tick(ts(NOW)).await.unwrap();

    // force a new login on the next tick
    h.coordinator.auth().invalidate().await;
    h.auth.set_accept(false);
    h.source.set_streams(vec![stream("9", 1)]);

    let err = h.coordinator.run_tick(ts(NOW)).await.unwrap_err();
    assert!(matches!(err, TickError::Auth(AuthError::Rejected(_))));
    assert!(h.coordinator.auth_problem());
    assert_eq!(exposed(&h).await, vec!["1"]);

    h.auth.set_accept(true);
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert!(!h.coordinator.auth_problem());
    assert_eq!(describe(&actions), vec!["remove:1", "create:9"]);
}

#[tokio::test]
async fn test_successful_login_ends_auth_problem_even_if_fetch_fails() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1)]);

    h.auth.set_accept(false);
    let err = h.coordinator.run_tick(ts(NOW)).await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(h.coordinator.auth_problem());

    h.auth.set_accept(true);
    h.source.fail_with(FetchError::Status {
        code: 502,
        message: "bad gateway".into(),
    });
    let err = h.coordinator.run_tick(ts(NOW)).await.unwrap_err();
    assert!(matches!(err, TickError::Fetch(_)));
    assert!(!h.coordinator.auth_problem());

    // a new rejection is a new transition
    h.coordinator.auth().invalidate().await;
    h.auth.set_accept(false);
    let err = h.coordinator.run_tick(ts(NOW)).await.unwrap_err();
    assert!(matches!(err, TickError::Auth(AuthError::Rejected(_))));
    assert!(h.coordinator.auth_problem());
    assert_eq!(h.auth.logins(), 3);
}

#[tokio::test]
async fn test_refused_token_triggers_single_relogin() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1)]);
    h.source.unauthorized.store(1, Ordering::SeqCst);

    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(describe(&actions), vec!["create:1", "count:1"]);
    assert_eq!(h.auth.logins(), 2);
    assert_eq!(h.source.stream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_token_refusal_abandons_tick() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1)]);
    h.source.unauthorized.store(5, Ordering::SeqCst);

    let err = h.coordinator.run_tick(ts(NOW)).await.unwrap_err();
    assert!(matches!(err, TickError::Fetch(FetchError::Unauthorized(_))));
    assert_eq!(h.auth.logins(), 2);
    assert!(exposed(&h).await.is_empty());
}

#[tokio::test]
async fn test_overlapping_ticks_are_refused() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1)]);
    h.source.delay_ms.store(50, Ordering::SeqCst);

    let first = h.coordinator.clone();
    let second = h.coordinator.clone();
    let (a, b) = tokio::join!(first.run_tick(ts(NOW)), async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        second.run_tick(ts(NOW)).await
    });

    assert_eq!(describe(&a.unwrap()), vec!["create:1", "count:1"]);
    assert_eq!(b.unwrap_err(), TickError::TickInProgress);
    assert!(!h.coordinator.tick_running());
}

#[tokio::test]
async fn test_cancelled_tick_discards_data() {
    let h = harness();
    h.source.set_streams(vec![stream("1", 1)]);
    h.source.delay_ms.store(200, Ordering::SeqCst);

    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), h.coordinator.run_tick(ts(NOW))).await;
    assert!(cancelled.is_err());
    assert!(exposed(&h).await.is_empty());
    assert!(!h.coordinator.tick_running());

    h.source.delay_ms.store(0, Ordering::SeqCst);
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(describe(&actions), vec!["create:1", "count:1"]);
}

#[tokio::test]
async fn test_every_tick_count_policy() {
    let h = harness_with(&format!("{}polling:\n  count_policy: every_tick\n", CONFIG));
    h.source.set_streams(vec![stream("1", 1)]);

    h.coordinator.run_tick(ts(NOW)).await.unwrap();
    let actions = h.coordinator.run_tick(ts(NOW)).await.unwrap();
    assert_eq!(describe(&actions), vec!["count:1"]);
}
