use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use latch_common::{
    command_inbox, latch_status, lock_label, restore_state, ActuatorAction, ActuatorFrame,
    BridgeError, CloudBridge, InboxError, InputSample, LatchEngine, LatchEvent, LinkMonitor,
    LockStore, RuntimeConfig, StateStore, StoreError, Topics,
};

#[derive(Clone)]
struct AppState {
    state: Arc<StateStore>,
    frame: Arc<Mutex<ActuatorFrame>>,
    pins: Arc<SimPins>,
    bridge: CloudBridge,
    mqtt: AsyncClient,
    link: Arc<LinkMonitor>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock_state_path: Arc<PathBuf>,
}

/// Host stand-in for the GPIO inputs. Button presses are momentary and
/// consumed by the next sample.
#[derive(Debug)]
struct SimPins {
    door_closed: AtomicBool,
    toggle_pending: AtomicBool,
    bell_pending: AtomicBool,
}

/// Lock flag kept in a JSON object on disk.
#[derive(Debug)]
struct FileLockStore {
    path: PathBuf,
    values: HashMap<String, bool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct LockQuery {
    value: String,
}

#[derive(Debug, Deserialize)]
struct DoorQuery {
    value: String,
}

#[derive(Debug, Serialize)]
struct LockRequestResponse {
    queued: bool,
    #[serde(rename = "requestedLocked")]
    requested_locked: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    info!(
        "runtime config loaded: device=`{}`, mqtt=`{}:{}`",
        runtime.network.device_id, runtime.network.mqtt_host, runtime.network.mqtt_port
    );

    let lock_store = FileLockStore::open(store.lock_state_path.as_ref().clone())
        .unwrap_or_else(|err| {
            warn!("failed to read persisted lock state, starting unlocked: {err:#}");
            FileLockStore::empty(store.lock_state_path.as_ref().clone())
        });

    let pins = Arc::new(SimPins::new(true));
    let initial = restore_state(&lock_store, pins.sample().door_closed);
    info!(
        "restored state: {} door={}",
        lock_label(initial.locked()),
        door_label(initial.door_closed())
    );

    let state = Arc::new(StateStore::new(initial));
    let (sender, receiver) = command_inbox(runtime.latch.inbox_capacity);
    let engine = LatchEngine::new(&runtime.latch, Arc::clone(&state), receiver, lock_store);
    let frame = Arc::new(Mutex::new(engine.actuators().frame()));
    spawn_hardware_loop(
        engine,
        Arc::clone(&pins),
        Arc::clone(&frame),
        runtime.latch.poll_interval_ms,
    )?;

    let mut mqtt_options = MqttOptions::new(
        format!("latch-{}", runtime.network.device_id),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        state,
        frame,
        pins,
        bridge: CloudBridge::new(Topics::for_device(&runtime.network.device_id), sender),
        mqtt,
        link: Arc::new(LinkMonitor::default()),
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_status_publish_loop(app_state.clone(), runtime.latch.status_publish_interval_ms);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/lock", post(handle_lock_request))
        .route("/api/sim/door", post(handle_sim_door))
        .route("/api/sim/toggle", post(handle_sim_toggle))
        .route("/api/sim/bell", post(handle_sim_bell))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("LATCH_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind latch server at {addr}"))?;

    info!("latch dashboard listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Ok(device_id) = std::env::var("LATCH_DEVICE_ID") {
        network.device_id = device_id;
    }
}

fn spawn_hardware_loop(
    mut engine: LatchEngine<FileLockStore>,
    pins: Arc<SimPins>,
    frame: Arc<Mutex<ActuatorFrame>>,
    poll_interval_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("hardware-loop".into())
        .spawn(move || {
            execute_actions(engine.start(monotonic_ms()));
            publish_frame(&frame, engine.actuators().frame());

            loop {
                let tick = engine.tick(pins.sample(), monotonic_ms());
                log_events(&tick.events);
                if !tick.actions.is_empty() {
                    execute_actions(tick.actions);
                    publish_frame(&frame, engine.actuators().frame());
                }
                thread::sleep(Duration::from_millis(poll_interval_ms));
            }
        })
        .context("failed to spawn hardware loop thread")?;
    Ok(())
}

fn execute_actions(actions: Vec<ActuatorAction>) {
    for action in actions {
        match action {
            // Re-asserted every idle iteration.
            ActuatorAction::SetTone(0) => {}
            _ => debug!("actuator: {action:?}"),
        }
    }
}

fn publish_frame(shared: &Mutex<ActuatorFrame>, frame: ActuatorFrame) {
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = frame;
}

fn log_events(events: &[LatchEvent]) {
    for event in events {
        match event {
            LatchEvent::LockChanged { locked, source } => {
                info!("{} via {}", lock_label(*locked), source.as_str());
            }
            LatchEvent::CommandIgnored { locked } => {
                debug!("remote {} matches current state", lock_label(*locked));
            }
            LatchEvent::DoorChanged { closed } => info!("door {}", door_label(*closed)),
            LatchEvent::BellRung => info!("doorbell"),
            LatchEvent::PersistFailed { locked, error } => {
                warn!("failed to persist {}: {error}", lock_label(*locked));
            }
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if !app_state.bridge.is_control_topic(&message.topic) {
                        continue;
                    }
                    match app_state.bridge.handle_control(&message.payload) {
                        Ok(command) => info!("queued remote {}", lock_label(command.locked)),
                        Err(err) => warn!("control message rejected: {err}"),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.link.mark_connected();
                    if app_state.link.take_subscribe() {
                        let control = app_state.bridge.topics().control.clone();
                        if let Err(err) = app_state.mqtt.try_subscribe(control, QoS::AtLeastOnce)
                        {
                            warn!("mqtt subscribe failed: {err}");
                            app_state.link.retry_subscribe();
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.link.mark_disconnected();
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_status_publish_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            if app_state.link.take_subscribe() {
                let control = app_state.bridge.topics().control.clone();
                if let Err(err) = app_state.mqtt.subscribe(control, QoS::AtLeastOnce).await {
                    warn!("mqtt subscribe retry failed: {err}");
                    app_state.link.retry_subscribe();
                }
            }
            if !app_state.link.is_connected() {
                continue;
            }

            let report = match app_state
                .bridge
                .status_report(&app_state.state, Utc::now().timestamp_millis())
            {
                Ok(report) => report,
                Err(err) => {
                    warn!("status serialization failed: {err}");
                    continue;
                }
            };

            let topics = app_state.bridge.topics();
            if let Err(err) = app_state
                .mqtt
                .publish(topics.status.clone(), QoS::AtLeastOnce, true, report.status)
                .await
            {
                warn!("status publish failed: {err}");
            }
            if let Err(err) = app_state
                .mqtt
                .publish(
                    topics.heartbeat.clone(),
                    QoS::AtMostOnce,
                    false,
                    report.heartbeat,
                )
                .await
            {
                warn!("heartbeat publish failed: {err}");
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let frame = *state.frame.lock().unwrap_or_else(PoisonError::into_inner);
    Json(latch_status(
        state.state.read(),
        &frame,
        state.link.is_connected(),
    ))
}

async fn handle_lock_request(
    State(state): State<AppState>,
    Query(query): Query<LockQuery>,
) -> impl IntoResponse {
    match state.bridge.handle_control(query.value.as_bytes()) {
        Ok(command) => {
            info!("queued dashboard {}", lock_label(command.locked));
            (
                StatusCode::ACCEPTED,
                Json(LockRequestResponse {
                    queued: true,
                    requested_locked: command.locked,
                }),
            )
                .into_response()
        }
        Err(BridgeError::Payload(err)) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Err(BridgeError::Inbox(InboxError::Full(_))) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Command inbox is full, try again",
        ),
        Err(BridgeError::Inbox(InboxError::Closed)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Hardware loop is not running",
        ),
    }
}

async fn handle_sim_door(
    State(state): State<AppState>,
    Query(query): Query<DoorQuery>,
) -> impl IntoResponse {
    let closed = match query.value.to_ascii_lowercase().as_str() {
        "closed" => true,
        "open" => false,
        _ => {
            return error_response(StatusCode::BAD_REQUEST, "value must be `open` or `closed`");
        }
    };
    state.pins.set_door_closed(closed);
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_sim_toggle(State(state): State<AppState>) -> impl IntoResponse {
    state.pins.press_toggle();
    StatusCode::NO_CONTENT
}

async fn handle_sim_bell(State(state): State<AppState>) -> impl IntoResponse {
    state.pins.press_bell();
    StatusCode::NO_CONTENT
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("LATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.latch"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock_state_path: Arc::new(data_dir.join("lock_state.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl SimPins {
    fn new(door_closed: bool) -> Self {
        Self {
            door_closed: AtomicBool::new(door_closed),
            toggle_pending: AtomicBool::new(false),
            bell_pending: AtomicBool::new(false),
        }
    }

    fn sample(&self) -> InputSample {
        InputSample {
            door_closed: self.door_closed.load(Ordering::Relaxed),
            toggle_pressed: self.toggle_pending.swap(false, Ordering::Relaxed),
            bell_pressed: self.bell_pending.swap(false, Ordering::Relaxed),
        }
    }

    fn set_door_closed(&self, closed: bool) {
        self.door_closed.store(closed, Ordering::Relaxed);
    }

    fn press_toggle(&self) {
        self.toggle_pending.store(true, Ordering::Relaxed);
    }

    fn press_bell(&self) {
        self.bell_pending.store(true, Ordering::Relaxed);
    }
}

impl FileLockStore {
    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            values: HashMap::new(),
        }
    }

    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let values = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values })
    }

    fn write(path: &Path, values: &HashMap<String, bool>) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = staging_path(path);
        std::fs::write(&staging, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }
}

impl LockStore for FileLockStore {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).copied().unwrap_or(default)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        let mut next = self.values.clone();
        next.insert(key.to_string(), value);
        Self::write(&self.path, &next)?;
        self.values = next;
        Ok(())
    }
}

/// Sibling file the next snapshot is written to before it replaces `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn door_label(closed: bool) -> &'static str {
    if closed {
        "closed"
    } else {
        "open"
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use latch_common::LOCKED_KEY;

    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("latch-host-{}-{name}", std::process::id()))
            .join("lock_state.json")
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = scratch_path("reopen");
        let _ = std::fs::remove_file(&path);

        let mut store = FileLockStore::open(path.clone()).unwrap();
        assert!(!store.get_bool(LOCKED_KEY, false));
        store.put_bool(LOCKED_KEY, true).unwrap();

        let reopened = FileLockStore::open(path.clone()).unwrap();
        assert!(reopened.get_bool(LOCKED_KEY, false));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let path = scratch_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            FileLockStore::open(path.clone()),
            Err(StoreError::Json(_))
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_store_replaces_snapshot_without_leaving_staging_file() {
        let path = scratch_path("staging");
        let _ = std::fs::remove_file(&path);

        let mut store = FileLockStore::open(path.clone()).unwrap();
        store.put_bool(LOCKED_KEY, true).unwrap();
        store.put_bool(LOCKED_KEY, false).unwrap();

        assert!(!staging_path(&path).exists());
        let reopened = FileLockStore::open(path.clone()).unwrap();
        assert!(!reopened.get_bool(LOCKED_KEY, true));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn interrupted_write_keeps_previous_snapshot() {
        let path = scratch_path("interrupted");
        let _ = std::fs::remove_file(&path);

        let mut store = FileLockStore::open(path.clone()).unwrap();
        store.put_bool(LOCKED_KEY, true).unwrap();

        // A crash between the staging write and the rename leaves a partial sibling.
        std::fs::write(staging_path(&path), b"{\"locked\": tr").unwrap();

        let mut reopened = FileLockStore::open(path.clone()).unwrap();
        assert!(reopened.get_bool(LOCKED_KEY, false));

        reopened.put_bool(LOCKED_KEY, false).unwrap();
        assert!(!staging_path(&path).exists());
        assert!(!FileLockStore::open(path.clone())
            .unwrap()
            .get_bool(LOCKED_KEY, true));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn staging_file_sits_next_to_snapshot() {
        let path = PathBuf::from("/var/lib/latch/lock_state.json");
        assert_eq!(
            staging_path(&path),
            PathBuf::from("/var/lib/latch/lock_state.json.tmp")
        );
    }

    #[test]
    fn sim_presses_are_momentary() {
        let pins = SimPins::new(true);
        pins.press_toggle();
        pins.press_bell();
        pins.set_door_closed(false);

        let first = pins.sample();
        assert!(first.toggle_pressed && first.bell_pressed);
        assert!(!first.door_closed);

        let second = pins.sample();
        assert!(!second.toggle_pressed && !second.bell_pressed);
    }
}
