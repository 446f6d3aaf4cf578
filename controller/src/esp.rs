use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use latch_common::{
    command_inbox, lock_label, restore_state, Backoff, CloudBridge, LatchEngine, LatchEvent,
    LinkMonitor, LockStore, NetworkConfig, RuntimeConfig, StateStore, StoreError, Topics,
    LOCK_NAMESPACE,
};

use crate::pins::{LatchInputs, LatchOutputs};

const NVS_NAMESPACE: &str = "latch";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_BACKOFF_INITIAL_MS: u64 = 10_000;
const WIFI_BACKOFF_MAX_MS: u64 = 300_000;
const WIFI_CHECK_INTERVAL_MS: u64 = 10_000;
const MQTT_TX_POLL_MS: u64 = 100;

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// Lock flag kept in flash as a single `u8`.
struct NvsLockStore {
    nvs: EspNvs<NvsDefault>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    info!(
        "NVS config loaded: device=`{}`, ssid=`{}`, mqtt=`{}:{}`",
        runtime.network.device_id,
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;
    let inputs = LatchInputs::new(&runtime.pins)?;
    let outputs = LatchOutputs::new(
        ledc.timer0,
        ledc.channel0,
        ledc.timer1,
        ledc.channel1,
        &runtime.pins,
    )?;

    let lock_store = NvsLockStore::open(nvs_partition.clone())?;
    let initial = restore_state(&lock_store, inputs.sample().door_closed);
    info!(
        "Restored state: {} door={}",
        lock_label(initial.locked()),
        if initial.door_closed() { "closed" } else { "open" }
    );

    let state = Arc::new(StateStore::new(initial));
    let (sender, receiver) = command_inbox(runtime.latch.inbox_capacity);
    let engine = LatchEngine::new(&runtime.latch, Arc::clone(&state), receiver, lock_store);
    spawn_hardware_loop(engine, inputs, outputs, runtime.latch.poll_interval_ms)?;

    if runtime.network.wifi_ssid.is_empty() {
        warn!("wifi credentials missing, running offline");
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    configure_wifi(&mut esp_wifi, &sys_loop, &runtime.network)?;
    let mut backoff = Backoff::new(WIFI_BACKOFF_INITIAL_MS, WIFI_BACKOFF_MAX_MS);
    ensure_wifi(&mut esp_wifi, &sys_loop, &mut backoff);

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let bridge = CloudBridge::new(Topics::for_device(&runtime.network.device_id), sender);
    let link = Arc::new(LinkMonitor::default());
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    spawn_mqtt_receiver(bridge.clone(), mqtt_conn, Arc::clone(&link))?;
    spawn_mqtt_publisher(
        bridge,
        state,
        mqtt_client,
        link,
        runtime.latch.status_publish_interval_ms,
    )?;

    loop {
        thread::sleep(Duration::from_millis(WIFI_CHECK_INTERVAL_MS));
        if !esp_wifi.is_connected().unwrap_or(false) {
            warn!("wifi link lost, reconnecting");
            ensure_wifi(&mut esp_wifi, &sys_loop, &mut backoff);
        }
    }
}

fn spawn_hardware_loop(
    mut engine: LatchEngine<NvsLockStore>,
    inputs: LatchInputs,
    mut outputs: LatchOutputs,
    poll_interval_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("hardware-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register hardware loop with watchdog: {err:#}");
            }

            for action in engine.start(monotonic_ms()) {
                outputs.execute(action);
            }

            loop {
                feed_watchdog();
                let tick = engine.tick(inputs.sample(), monotonic_ms());
                log_events(&tick.events);
                for action in tick.actions {
                    outputs.execute(action);
                }
                thread::sleep(Duration::from_millis(poll_interval_ms));
            }
        })
        .context("failed to spawn hardware loop thread")?;
    Ok(())
}

fn log_events(events: &[LatchEvent]) {
    for event in events {
        match event {
            LatchEvent::LockChanged { locked, source } => {
                info!("{} via {}", lock_label(*locked), source.as_str());
            }
            LatchEvent::CommandIgnored { locked } => {
                info!("remote {} matches current state", lock_label(*locked));
            }
            LatchEvent::DoorChanged { closed } => {
                info!("door {}", if *closed { "closed" } else { "opened" });
            }
            LatchEvent::BellRung => info!("doorbell"),
            LatchEvent::PersistFailed { locked, error } => {
                warn!("failed to persist {}: {error}", lock_label(*locked));
            }
        }
    }
}

fn configure_wifi(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: &EspSystemEventLoop,
    network: &NetworkConfig,
) -> anyhow::Result<()> {
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop.clone())?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);
    Ok(())
}

/// Blocks until the station is up. The hardware loop keeps running meanwhile.
fn ensure_wifi(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: &EspSystemEventLoop,
    backoff: &mut Backoff,
) {
    loop {
        match connect_wifi(esp_wifi, sys_loop) {
            Ok(()) => {
                backoff.reset();
                return;
            }
            Err(err) => {
                let delay_ms = backoff.next_delay_ms();
                warn!("{err:#}; retrying in {}s", delay_ms / 1000);
                thread::sleep(Duration::from_millis(delay_ms));
            }
        }
    }
}

fn connect_wifi(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: &EspSystemEventLoop,
) -> anyhow::Result<()> {
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop.clone())?;

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}: {err:#}");
                last_err = Some(err);
            }
        }

        let _ = wifi.disconnect();
        if attempt < WIFI_CONNECT_ATTEMPTS {
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        Some(err) => Err(anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi attempts failed: {err:#}")),
        None => Err(anyhow!("wifi connect not attempted")),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let client_id = format!("latch-{}", network.device_id);

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_control(mqtt: &SharedMqtt, topics: &Topics) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    mqtt.subscribe(&topics.control, QoS::AtLeastOnce)?;
    Ok(())
}

/// Only records link events and queues control values. Subscribing from here
/// would call back into the client while its event is still borrowed.
fn spawn_mqtt_receiver(
    bridge: CloudBridge,
    mut conn: EspMqttConnection,
    link: Arc<LinkMonitor>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        link.mark_connected();
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        link.mark_disconnected();
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) || !bridge.is_control_topic(topic)
                        {
                            continue;
                        }
                        match bridge.handle_control(data) {
                            Ok(command) => {
                                info!("queued remote {}", lock_label(command.locked))
                            }
                            Err(err) => warn!("control message rejected: {err}"),
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    link.mark_disconnected();
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

/// Owns every outbound client call: the control subscription after each
/// connect, then status and heartbeat on the publish cadence.
fn spawn_mqtt_publisher(
    bridge: CloudBridge,
    state: Arc<StateStore>,
    mqtt: SharedMqtt,
    link: Arc<LinkMonitor>,
    interval_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-tx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut last_publish_ms: Option<u64> = None;
            loop {
                thread::sleep(Duration::from_millis(MQTT_TX_POLL_MS));

                if link.take_subscribe() {
                    match subscribe_control(&mqtt, bridge.topics()) {
                        Ok(()) => info!("subscribed to `{}`", bridge.topics().control),
                        Err(err) => {
                            warn!("mqtt subscribe failed: {err:#}");
                            link.retry_subscribe();
                        }
                    }
                }

                if !link.is_connected() {
                    continue;
                }
                let now_ms = monotonic_ms();
                if last_publish_ms.is_some_and(|last| now_ms.saturating_sub(last) < interval_ms) {
                    continue;
                }
                last_publish_ms = Some(now_ms);

                if let Err(err) = publish_status(&bridge, &state, &mqtt) {
                    warn!("status publish failed: {err:#}");
                }
            }
        })
        .context("failed to spawn mqtt publisher thread")?;
    Ok(())
}

fn publish_status(
    bridge: &CloudBridge,
    state: &StateStore,
    mqtt: &SharedMqtt,
) -> anyhow::Result<()> {
    let report = bridge.status_report(state, Utc::now().timestamp_millis())?;
    let topics = bridge.topics();

    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    client.publish(&topics.status, QoS::AtLeastOnce, true, &report.status)?;
    client.publish(&topics.heartbeat, QoS::AtMostOnce, false, &report.heartbeat)?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl NvsLockStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, LOCK_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{LOCK_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

impl LockStore for NvsLockStore {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.nvs.get_u8(key) {
            Ok(Some(value)) => value != 0,
            Ok(None) => default,
            Err(err) => {
                warn!("NVS read of `{key}` failed: {err}");
                default
            }
        }
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.nvs
            .set_u8(key, u8::from(value))
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
