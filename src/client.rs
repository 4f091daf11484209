use bytes::Bytes;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{broadcast, watch, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    catalog::{Characteristic, ServiceLayout},
    error::{CradleError, Result},
    protocol::{Command, DeviceEvent},
    transport::{GattTransport, LinkId, PermissionCheck, TransportEvent, TransportEvents},
    types::{
        ClientConfig, ConnectionState, CurrentTime, DeviceSnapshot, LedBrightness, LedColor,
        LedSwitch, PirSwitch, TimerSchedule,
    },
};

/// Reads issued once the link becomes ready, in order
pub const HYDRATION_ORDER: [Characteristic; 6] = [
    Characteristic::LedStatus,
    Characteristic::PirStatus,
    Characteristic::LedBrightness,
    Characteristic::TimerSchedule,
    Characteristic::LedColor,
    Characteristic::CurrentTime,
];

/// GATT client for one Cradle smart light at a time
///
/// `CradleLedClient` owns a single link and drives it through
/// `Unknown → Connected → Ready`, with `Disconnected` reachable from every
/// state. All radio outcomes arrive as [`TransportEvent`]s and are handled by
/// a background task; the public methods only submit requests.
///
/// # Operation queue
///
/// Most BLE stacks accept one outstanding GATT operation per connection. Reads
/// and writes are therefore queued per link and submitted strictly in order,
/// the next one only after the previous completion (success or failure) has
/// been observed. Every operation, connect attempt and service discovery runs
/// against a deadline from [`ClientConfig`]; expiry drops the link.
///
/// # Outputs
///
/// - [`connection_state`](Self::connection_state): latest-value stream, starts at `Unknown`
/// - one broadcast stream per characteristic, no replay for late subscribers
/// - [`snapshot`](Self::snapshot): last decoded value of each characteristic
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use cradle_led::{mock::MockTransport, AlwaysGranted, ClientConfig, CradleLedClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (transport, events) = MockTransport::new();
///     transport.add_known_peripheral("AA:BB:CC:DD:EE:FF");
///
///     let client = CradleLedClient::new(
///         transport,
///         events,
///         Arc::new(AlwaysGranted),
///         ClientConfig::default(),
///     );
///     client.connect("AA:BB:CC:DD:EE:FF").await?;
///
///     let mut state = client.connection_state();
///     state.wait_for(|s| s.is_ready()).await?;
///     client.set_led_color(255, 0, 0).await?;
///     Ok(())
/// }
/// ```
pub struct CradleLedClient<T: GattTransport> {
    shared: Arc<Shared<T>>,
    event_loop: JoinHandle<()>,
}

impl<T: GattTransport> CradleLedClient<T> {
    /// Create a client for the Cradle service layout
    ///
    /// `events` must be the receiving end paired with `transport`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        transport: T,
        events: TransportEvents,
        permissions: Arc<dyn PermissionCheck>,
        config: ClientConfig,
    ) -> Self {
        Self::with_layout(transport, events, permissions, config, ServiceLayout::cradle())
    }

    /// Create a client for a custom service layout
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_layout(
        transport: T,
        events: TransportEvents,
        permissions: Arc<dyn PermissionCheck>,
        config: ClientConfig,
        layout: ServiceLayout,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unknown);
        let streams = DeviceStreams::new(config.event_capacity);

        let shared = Arc::new(Shared {
            transport,
            permissions,
            layout,
            config,
            link: Mutex::new(None),
            next_link: AtomicU64::new(1),
            deadline_changed: Notify::new(),
            state,
            streams,
            snapshot: RwLock::new(DeviceSnapshot::default()),
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&shared), events));

        Self { shared, event_loop }
    }

    /// Start connecting to a previously scanned peripheral
    ///
    /// Returns once the request is submitted. Progress is reported on
    /// [`connection_state`](Self::connection_state), which restarts at
    /// `Unknown`. A link that is still shutting down after
    /// [`disconnect`](Self::disconnect) is released first.
    ///
    /// # Errors
    ///
    /// - [`CradleError::PermissionDenied`] if the permission gate refuses
    /// - [`CradleError::AlreadyConnected`] if a link is held
    /// - [`CradleError::PeripheralUnresolvable`] if the radio stack has never seen `address`
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.shared.connect(address).await
    }

    /// Request link teardown
    ///
    /// Pending operations are dropped at once and late completions of this
    /// link are ignored. The transition to `Disconnected` follows when the
    /// radio confirms (or after `disconnect_timeout_ms`). Calling this
    /// without a link is a no-op.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; a refused teardown request releases the link locally.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.disconnect().await
    }

    /// Latest-value stream of the connection state
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    /// Address of the link currently held
    pub async fn address(&self) -> Option<String> {
        self.shared
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.address.clone())
    }

    /// Operations in flight plus queued on the current link
    pub async fn pending_operations(&self) -> usize {
        self.shared
            .link
            .lock()
            .await
            .as_ref()
            .map_or(0, Link::pending)
    }

    /// Last decoded value of every characteristic
    pub async fn snapshot(&self) -> DeviceSnapshot {
        self.shared.snapshot.read().await.clone()
    }

    /// Decoded LED status reads
    #[must_use]
    pub fn subscribe_led_status(&self) -> broadcast::Receiver<LedSwitch> {
        self.shared.streams.led_status.subscribe()
    }

    /// Decoded PIR status reads
    #[must_use]
    pub fn subscribe_pir_status(&self) -> broadcast::Receiver<PirSwitch> {
        self.shared.streams.pir_status.subscribe()
    }

    /// Decoded LED color reads
    #[must_use]
    pub fn subscribe_led_color(&self) -> broadcast::Receiver<LedColor> {
        self.shared.streams.led_color.subscribe()
    }

    /// Decoded LED brightness reads
    #[must_use]
    pub fn subscribe_led_brightness(&self) -> broadcast::Receiver<LedBrightness> {
        self.shared.streams.led_brightness.subscribe()
    }

    /// Decoded device clock reads
    #[must_use]
    pub fn subscribe_current_time(&self) -> broadcast::Receiver<CurrentTime> {
        self.shared.streams.current_time.subscribe()
    }

    /// Decoded timer schedule reads
    #[must_use]
    pub fn subscribe_timer_schedule(&self) -> broadcast::Receiver<TimerSchedule> {
        self.shared.streams.timer_schedule.subscribe()
    }

    /// Turn the LED on or off
    ///
    /// `Ok` means the write was accepted into the queue; the device
    /// acknowledgement only shows up in the logs.
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_led_status(&self, on: bool) -> Result<()> {
        self.send_command(Command::SetLedStatus(LedSwitch { on }))
            .await
    }

    /// Configure PIR motion sensing
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_pir_status(&self, min_brightness: u8, on: bool) -> Result<()> {
        self.send_command(Command::SetPirStatus(PirSwitch { on, min_brightness }))
            .await
    }

    /// Change the LED color
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_led_color(&self, red: u8, green: u8, blue: u8) -> Result<()> {
        self.send_command(Command::SetLedColor(LedColor::new(red, green, blue)))
            .await
    }

    /// Change the LED brightness (0-255)
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_led_brightness(&self, brightness: u8) -> Result<()> {
        self.send_command(Command::SetLedBrightness(LedBrightness(brightness)))
            .await
    }

    /// Change the LED brightness from a 0-100 percentage
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] above 100 and
    /// [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_led_brightness_percent(&self, percent: u8) -> Result<()> {
        let brightness = LedBrightness::from_percent(percent)?;
        self.send_command(Command::SetLedBrightness(brightness))
            .await
    }

    /// Set the device clock
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if a field is out of range and
    /// [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_current_time(
        &self,
        hour: u8,
        minute: u8,
        second: u8,
        day: u8,
        month: u8,
        year_offset: u8,
    ) -> Result<()> {
        let time = CurrentTime::new(hour, minute, second, day, month, year_offset)?;
        self.send_command(Command::SetCurrentTime(time)).await
    }

    /// Set the device clock to the local wall-clock time
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if the local year is outside
    /// 2000-2255 and [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn sync_current_time(&self) -> Result<()> {
        let time = CurrentTime::now_local()?;
        info!("Syncing device clock to {}", time);
        self.send_command(Command::SetCurrentTime(time)).await
    }

    /// Configure the automatic on/off timer
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if a field is out of range and
    /// [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn set_timer_schedule(
        &self,
        enabled: bool,
        on_hour: u8,
        on_minute: u8,
        off_hour: u8,
        off_minute: u8,
    ) -> Result<()> {
        let schedule = TimerSchedule::new(enabled, on_hour, on_minute, off_hour, off_minute)?;
        self.send_command(Command::SetTimerSchedule(schedule))
            .await
    }

    /// Encode and queue any write
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if the command does not
    /// encode and [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        let payload = command.encode()?;
        self.shared
            .submit(GattOperation::Write(command.characteristic(), payload))
            .await
    }

    /// Queue a read of the LED status
    ///
    /// The value arrives on [`subscribe_led_status`](Self::subscribe_led_status).
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read_led_status(&self) -> Result<()> {
        self.read(Characteristic::LedStatus).await
    }

    /// Queue a read of the PIR status
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read_pir_status(&self) -> Result<()> {
        self.read(Characteristic::PirStatus).await
    }

    /// Queue a read of the LED color
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read_led_color(&self) -> Result<()> {
        self.read(Characteristic::LedColor).await
    }

    /// Queue a read of the LED brightness
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read_led_brightness(&self) -> Result<()> {
        self.read(Characteristic::LedBrightness).await
    }

    /// Queue a read of the device clock
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read_current_time(&self) -> Result<()> {
        self.read(Characteristic::CurrentTime).await
    }

    /// Queue a read of the timer schedule
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read_timer_schedule(&self) -> Result<()> {
        self.read(Characteristic::TimerSchedule).await
    }

    /// Queue a read of any characteristic
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] unless the link is `Ready`.
    pub async fn read(&self, characteristic: Characteristic) -> Result<()> {
        self.shared
            .submit(GattOperation::Read(characteristic))
            .await
    }

    /// Issue the hydration reads ([`HYDRATION_ORDER`]) paced by
    /// `hydration_interval_ms`
    ///
    /// Runs automatically on `Ready` when `hydrate_on_ready` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::NotReady`] if the link leaves `Ready` midway.
    pub async fn hydrate(&self) -> Result<()> {
        self.shared.hydrate().await
    }
}

impl<T: GattTransport> Drop for CradleLedClient<T> {
    fn drop(&mut self) {
        self.event_loop.abort();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            let link = shared.link.lock().await.take();
            if let Some(mut link) = link {
                link.abandon_operations();
                if let Err(e) = shared.transport.disconnect(link.id).await {
                    warn!("Failed to disconnect {} on drop: {}", link.id, e);
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Discovering,
    Ready,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GattOperation {
    Read(Characteristic),
    Write(Characteristic, Bytes),
}

impl GattOperation {
    const fn characteristic(&self) -> Characteristic {
        match self {
            Self::Read(characteristic) | Self::Write(characteristic, _) => *characteristic,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write(..) => "write",
        }
    }
}

struct Link {
    id: LinkId,
    address: String,
    phase: Phase,
    queue: VecDeque<GattOperation>,
    in_flight: Option<GattOperation>,
    deadline: Option<Instant>,
    hydration: Option<JoinHandle<()>>,
}

impl Link {
    fn new(id: LinkId, address: String) -> Self {
        Self {
            id,
            address,
            phase: Phase::Connecting,
            queue: VecDeque::new(),
            in_flight: None,
            deadline: None,
            hydration: None,
        }
    }

    fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// Drop queued and in-flight operations and stop hydration
    fn abandon_operations(&mut self) -> usize {
        let dropped = self.pending();
        self.queue.clear();
        self.in_flight = None;
        if let Some(hydration) = self.hydration.take() {
            hydration.abort();
        }
        dropped
    }
}

struct DeviceStreams {
    led_status: broadcast::Sender<LedSwitch>,
    pir_status: broadcast::Sender<PirSwitch>,
    led_color: broadcast::Sender<LedColor>,
    led_brightness: broadcast::Sender<LedBrightness>,
    current_time: broadcast::Sender<CurrentTime>,
    timer_schedule: broadcast::Sender<TimerSchedule>,
}

impl DeviceStreams {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            led_status: broadcast::channel(capacity).0,
            pir_status: broadcast::channel(capacity).0,
            led_color: broadcast::channel(capacity).0,
            led_brightness: broadcast::channel(capacity).0,
            current_time: broadcast::channel(capacity).0,
            timer_schedule: broadcast::channel(capacity).0,
        }
    }
}

struct Shared<T> {
    transport: T,
    permissions: Arc<dyn PermissionCheck>,
    layout: ServiceLayout,
    config: ClientConfig,
    link: Mutex<Option<Link>>,
    next_link: AtomicU64,
    deadline_changed: Notify,
    state: watch::Sender<ConnectionState>,
    streams: DeviceStreams,
    snapshot: RwLock<DeviceSnapshot>,
}

impl<T: GattTransport> Shared<T> {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn publish_state(&self, new_state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });
        if changed {
            info!("Connection state -> {}", new_state);
        }
    }

    fn set_deadline(&self, link: &mut Link, timeout_ms: Option<u64>) {
        link.deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.deadline_changed.notify_waiters();
    }

    async fn connect(&self, address: &str) -> Result<()> {
        if !self.permissions.has_required_permissions() {
            let reason = self.permissions.describe_missing();
            warn!("Connect to {} refused: {}", address, reason);
            return Err(CradleError::PermissionDenied(reason));
        }

        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.phase != Phase::Closing {
                return Err(CradleError::AlreadyConnected {
                    address: link.address.clone(),
                });
            }
            info!("Releasing {} before reconnecting", link.id);
            self.teardown(&mut slot);
        }

        let id = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        info!("Connecting to {} on {}", address, id);
        self.transport.connect(id, address).await?;

        let mut link = Link::new(id, address.to_string());
        self.set_deadline(&mut link, Some(self.config.connect_timeout_ms));
        *slot = Some(link);
        self.publish_state(ConnectionState::Unknown);

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_mut() else {
            debug!("Disconnect requested without a link");
            return Ok(());
        };
        if link.phase == Phase::Closing {
            return Ok(());
        }

        let dropped = link.abandon_operations();
        if dropped > 0 {
            info!("Dropping {} pending operation(s) on {}", dropped, link.id);
        }
        link.phase = Phase::Closing;
        self.set_deadline(link, Some(self.config.disconnect_timeout_ms));

        let id = link.id;
        info!("Disconnecting {}", id);
        if let Err(e) = self.transport.disconnect(id).await {
            warn!("Disconnect request for {} failed: {}", id, e);
            self.teardown(&mut slot);
        }

        Ok(())
    }

    async fn submit(&self, operation: GattOperation) -> Result<()> {
        let mut slot = self.link.lock().await;
        let link = match slot.as_mut() {
            Some(link) if link.phase == Phase::Ready => link,
            other => {
                let state = match other {
                    Some(link) if link.phase == Phase::Closing => ConnectionState::Disconnected,
                    _ => self.current_state(),
                };
                debug!(
                    "Rejecting {} of {}: connection state is {}",
                    operation.kind(),
                    operation.characteristic(),
                    state
                );
                return Err(CradleError::NotReady { state });
            }
        };

        if link.in_flight.is_none() && link.queue.is_empty() {
            return self.start_operation(link, operation).await;
        }

        debug!(
            "Queueing {} of {} behind {} pending operation(s)",
            operation.kind(),
            operation.characteristic(),
            link.pending()
        );
        link.queue.push_back(operation);
        Ok(())
    }

    async fn start_operation(&self, link: &mut Link, operation: GattOperation) -> Result<()> {
        let service = self.layout.uuid();
        let uuid = self.layout.uuid_of(operation.characteristic())?;

        match &operation {
            GattOperation::Read(characteristic) => {
                debug!("Reading {} on {}", characteristic, link.id);
                self.transport.read(link.id, service, uuid).await?;
            }
            GattOperation::Write(characteristic, payload) => {
                debug!("Writing {:02X?} to {} on {}", &payload[..], characteristic, link.id);
                self.transport
                    .write(link.id, service, uuid, payload.clone())
                    .await?;
            }
        }

        link.in_flight = Some(operation);
        self.set_deadline(link, Some(self.config.operation_timeout_ms));
        Ok(())
    }

    /// Submit queued operations until one is accepted by the transport
    async fn pump(&self, link: &mut Link) {
        while link.in_flight.is_none() {
            let Some(operation) = link.queue.pop_front() else {
                break;
            };
            let kind = operation.kind();
            let characteristic = operation.characteristic();
            if let Err(e) = self.start_operation(link, operation).await {
                warn!("Failed to submit {} of {}: {}", kind, characteristic, e);
            }
        }
    }

    fn finish_operation(&self, link: &mut Link, uuid: Uuid) {
        let expected = link
            .in_flight
            .as_ref()
            .and_then(|operation| self.layout.uuid_of(operation.characteristic()).ok());

        if expected == Some(uuid) {
            link.in_flight = None;
            self.set_deadline(link, None);
        } else {
            warn!(
                "Completion for {} does not match the operation in flight on {}",
                uuid, link.id
            );
        }
    }

    fn teardown(&self, slot: &mut Option<Link>) {
        if let Some(mut link) = slot.take() {
            link.abandon_operations();
            info!("Released {} ({})", link.id, link.address);
            self.deadline_changed.notify_waiters();
            self.publish_state(ConnectionState::Disconnected);
        }
    }

    /// Ask the radio to drop the link, then release it locally
    async fn abort_link(&self, slot: &mut Option<Link>) {
        if let Some(link) = slot.as_ref() {
            let id = link.id;
            if let Err(e) = self.transport.disconnect(id).await {
                warn!("Disconnect request for {} failed: {}", id, e);
            }
        }
        self.teardown(slot);
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_mut() else {
            debug!("Dropping {:?}: no active link", event);
            return;
        };
        if link.id != event.link() {
            debug!("Dropping {:?}: current link is {}", event, link.id);
            return;
        }

        match event {
            TransportEvent::Connected { .. } => {
                if link.phase != Phase::Connecting {
                    debug!("Ignoring link-up on {} while {:?}", link.id, link.phase);
                    return;
                }
                info!("Connected to {} on {}", link.address, link.id);
                link.phase = Phase::Discovering;
                self.set_deadline(link, Some(self.config.discovery_timeout_ms));
                let id = link.id;
                self.publish_state(ConnectionState::Connected);

                if let Err(e) = self.transport.discover_services(id).await {
                    error!("Service discovery could not start on {}: {}", id, e);
                    self.abort_link(&mut slot).await;
                }
            }
            TransportEvent::ServicesDiscovered { result, .. } => {
                if link.phase != Phase::Discovering {
                    debug!("Ignoring discovery result on {} while {:?}", link.id, link.phase);
                    return;
                }
                match result {
                    Ok(()) => {
                        info!("Services discovered on {}", link.id);
                        link.phase = Phase::Ready;
                        self.set_deadline(link, None);
                        if self.config.hydrate_on_ready {
                            let shared = Arc::clone(self);
                            link.hydration = Some(tokio::spawn(async move {
                                if let Err(e) = shared.hydrate().await {
                                    debug!("Hydration stopped: {}", e);
                                }
                            }));
                        }
                        self.publish_state(ConnectionState::Ready);
                    }
                    Err(reason) => {
                        error!("Service discovery failed on {}: {}", link.id, reason);
                        self.abort_link(&mut slot).await;
                    }
                }
            }
            TransportEvent::Disconnected { reason, .. } => {
                if link.phase == Phase::Closing {
                    info!("Disconnected {}", link.id);
                } else {
                    warn!(
                        "Lost {} ({}): {}",
                        link.id,
                        link.address,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                }
                self.teardown(&mut slot);
            }
            TransportEvent::ReadComplete { uuid, result, .. } => {
                if link.phase != Phase::Ready {
                    debug!("Ignoring read completion on {} while {:?}", link.id, link.phase);
                    return;
                }
                self.finish_operation(link, uuid);
                match result {
                    Ok(value) => self.publish_read(uuid, &value).await,
                    Err(reason) => warn!("Read of {} failed on {}: {}", uuid, link.id, reason),
                }
                self.pump(link).await;
            }
            TransportEvent::WriteComplete { uuid, result, .. } => {
                if link.phase != Phase::Ready {
                    debug!("Ignoring write completion on {} while {:?}", link.id, link.phase);
                    return;
                }
                self.finish_operation(link, uuid);
                let name = self
                    .layout
                    .characteristic_for(uuid)
                    .map_or_else(|| uuid.to_string(), |c| c.to_string());
                match result {
                    Ok(()) => info!("Write to {} acknowledged", name),
                    Err(reason) => warn!("Write to {} failed on {}: {}", name, link.id, reason),
                }
                self.pump(link).await;
            }
        }
    }

    async fn handle_deadline(&self) {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_mut() else {
            return;
        };
        let Some(deadline) = link.deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }

        let id = link.id;
        match link.phase {
            Phase::Connecting => {
                error!(
                    "{} did not come up within {}ms",
                    id, self.config.connect_timeout_ms
                );
                self.abort_link(&mut slot).await;
            }
            Phase::Discovering => {
                error!(
                    "Service discovery on {} timed out after {}ms",
                    id, self.config.discovery_timeout_ms
                );
                self.abort_link(&mut slot).await;
            }
            Phase::Ready => {
                let what = link.in_flight.as_ref().map_or_else(
                    || "operation".to_string(),
                    |operation| format!("{} of {}", operation.kind(), operation.characteristic()),
                );
                error!(
                    "{} on {} timed out after {}ms; dropping the link",
                    what, id, self.config.operation_timeout_ms
                );
                self.abort_link(&mut slot).await;
            }
            Phase::Closing => {
                warn!(
                    "{} did not confirm disconnect within {}ms",
                    id, self.config.disconnect_timeout_ms
                );
                self.teardown(&mut slot);
            }
        }
    }

    async fn publish_read(&self, uuid: Uuid, value: &[u8]) {
        let Some(characteristic) = self.layout.characteristic_for(uuid) else {
            debug!("Ignoring read of unknown characteristic {}", uuid);
            return;
        };
        debug!("Read {}: {:02X?}", characteristic, value);

        match DeviceEvent::decode(characteristic, value) {
            Ok(event) => self.publish_event(event).await,
            Err(e) => warn!("Dropping {} payload: {}", characteristic, e),
        }
    }

    async fn publish_event(&self, event: DeviceEvent) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.updated_at = Some(SystemTime::now());

        // A send error only means nobody is subscribed right now
        match event {
            DeviceEvent::LedStatus(value) => {
                snapshot.led_switch = Some(value);
                let _ = self.streams.led_status.send(value);
            }
            DeviceEvent::PirStatus(value) => {
                snapshot.pir_switch = Some(value);
                let _ = self.streams.pir_status.send(value);
            }
            DeviceEvent::LedColor(value) => {
                snapshot.led_color = Some(value);
                let _ = self.streams.led_color.send(value);
            }
            DeviceEvent::LedBrightness(value) => {
                snapshot.led_brightness = Some(value);
                let _ = self.streams.led_brightness.send(value);
            }
            DeviceEvent::CurrentTime(value) => {
                snapshot.current_time = Some(value);
                let _ = self.streams.current_time.send(value);
            }
            DeviceEvent::TimerSchedule(value) => {
                snapshot.timer_schedule = Some(value);
                let _ = self.streams.timer_schedule.send(value);
            }
        }
    }

    async fn hydrate(&self) -> Result<()> {
        let interval = Duration::from_millis(self.config.hydration_interval_ms);

        for (index, characteristic) in HYDRATION_ORDER.into_iter().enumerate() {
            if index > 0 {
                sleep(interval).await;
            }
            self.submit(GattOperation::Read(characteristic)).await?;
        }

        info!("Hydration reads submitted");
        Ok(())
    }
}

async fn run_event_loop<T: GattTransport>(shared: Arc<Shared<T>>, mut events: TransportEvents) {
    loop {
        let deadline_changed = shared.deadline_changed.notified();
        let deadline = shared.link.lock().await.as_ref().and_then(|link| link.deadline);

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event).await,
                None => {
                    info!("Transport event channel closed; stopping event loop");
                    break;
                }
            },
            () = wait_until(deadline) => shared.handle_deadline().await,
            () = deadline_changed => {}
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{GattCall, MockTransport},
        transport::AlwaysGranted,
    };

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn quiet_config() -> ClientConfig {
        ClientConfig {
            hydrate_on_ready: false,
            ..ClientConfig::default()
        }
    }

    fn client_with(
        config: ClientConfig,
    ) -> (CradleLedClient<MockTransport>, MockTransport) {
        let (transport, events) = MockTransport::new();
        transport.add_known_peripheral(ADDRESS);
        let client =
            CradleLedClient::new(transport.clone(), events, Arc::new(AlwaysGranted), config);
        (client, transport)
    }

    async fn ready_client(config: ClientConfig) -> (CradleLedClient<MockTransport>, MockTransport, LinkId) {
        let (client, transport) = client_with(config);
        let mut state = client.connection_state();

        client.connect(ADDRESS).await.unwrap();
        let link = transport.last_link().unwrap();
        transport.link_up(link);
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        transport.services_discovered(link);
        state.wait_for(|s| *s == ConnectionState::Ready).await.unwrap();

        (client, transport, link)
    }

    fn uuid(characteristic: Characteristic) -> Uuid {
        ServiceLayout::cradle().uuid_of(characteristic).unwrap()
    }

    #[tokio::test]
    async fn test_link_up_triggers_discovery() {
        let (client, transport) = client_with(quiet_config());
        let mut state = client.connection_state();

        client.connect(ADDRESS).await.unwrap();
        assert_eq!(client.current_state(), ConnectionState::Unknown);
        let link = transport.last_link().unwrap();

        transport.link_up(link);
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        transport.wait_for_calls(2).await;

        assert_eq!(
            transport.calls(),
            vec![
                GattCall::Connect {
                    link,
                    address: ADDRESS.to_string()
                },
                GattCall::DiscoverServices { link },
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (client, _transport, _link) = ready_client(quiet_config()).await;
        let result = client.connect(ADDRESS).await;
        assert!(matches!(result, Err(CradleError::AlreadyConnected { .. })));
        assert_eq!(client.address().await.as_deref(), Some(ADDRESS));
    }

    #[tokio::test]
    async fn test_write_waits_for_previous_completion() {
        let (client, transport, link) = ready_client(quiet_config()).await;

        client.set_led_status(true).await.unwrap();
        client.set_led_brightness(0x40).await.unwrap();
        assert_eq!(transport.operations().len(), 1);
        assert_eq!(client.pending_operations().await, 2);

        transport.write_complete(link, uuid(Characteristic::LedStatus));
        transport.wait_for_calls(4).await;

        assert_eq!(
            transport.operations(),
            vec![
                GattCall::Write {
                    link,
                    characteristic: uuid(Characteristic::LedStatus),
                    payload: vec![0x01],
                },
                GattCall::Write {
                    link,
                    characteristic: uuid(Characteristic::LedBrightness),
                    payload: vec![0x40],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_read_advances_queue() {
        let (client, transport, link) = ready_client(quiet_config()).await;

        client.read_led_color().await.unwrap();
        client.read_current_time().await.unwrap();

        transport.emit(TransportEvent::ReadComplete {
            link,
            uuid: uuid(Characteristic::LedColor),
            result: Err("GATT_READ_NOT_PERMITTED".to_string()),
        });
        transport.wait_for_calls(4).await;

        assert_eq!(
            transport.operations().last(),
            Some(&GattCall::Read {
                link,
                characteristic: uuid(Characteristic::CurrentTime),
            })
        );
        assert_eq!(client.current_state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_reported() {
        let (client, transport, _link) = ready_client(quiet_config()).await;
        transport.reject_submissions(true);

        let result = client.read_led_status().await;
        assert!(matches!(result, Err(CradleError::Transport(_))));
        assert_eq!(client.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_tracks_latest_reads() {
        let (client, transport, link) = ready_client(quiet_config()).await;
        let mut colors = client.subscribe_led_color();

        client.read_led_color().await.unwrap();
        transport.read_complete(link, uuid(Characteristic::LedColor), &[0x10, 0x20, 0x30]);
        assert_eq!(colors.recv().await.unwrap(), LedColor::new(0x10, 0x20, 0x30));

        let snapshot = client.snapshot().await;
        assert_eq!(snapshot.led_color, Some(LedColor::new(0x10, 0x20, 0x30)));
        assert!(snapshot.updated_at.is_some());
        assert!(snapshot.led_brightness.is_none());
    }

    #[tokio::test]
    async fn test_invalid_parameters_never_reach_transport() {
        let (client, transport, _link) = ready_client(quiet_config()).await;

        assert!(matches!(
            client.set_current_time(24, 0, 0, 1, 1, 24).await,
            Err(CradleError::InvalidParameters(_))
        ));
        assert!(matches!(
            client.set_timer_schedule(true, 7, 60, 22, 0).await,
            Err(CradleError::InvalidParameters(_))
        ));
        assert!(matches!(
            client.set_led_brightness_percent(150).await,
            Err(CradleError::InvalidParameters(_))
        ));
        assert!(transport.operations().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_connect() {
        let (transport, events) = MockTransport::new();
        transport.add_known_peripheral(ADDRESS);
        let client = CradleLedClient::new(
            transport.clone(),
            events,
            Arc::new(|| false),
            quiet_config(),
        );

        let result = client.connect(ADDRESS).await;
        assert!(matches!(result, Err(CradleError::PermissionDenied(_))));
        assert!(transport.calls().is_empty());
        assert_eq!(client.current_state(), ConnectionState::Unknown);
    }
}
