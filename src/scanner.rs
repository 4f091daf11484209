use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    catalog::CRADLE_SERVICE_ID,
    error::{CradleError, Result},
    transport::{PermissionCheck, RadioEvent, RadioEvents, ScanRadio, SCAN_FAILED_INTERNAL_ERROR},
    types::{DiscoveredPeripheral, ScanConfig, ScanState},
};

/// Longest accepted scan window in seconds
pub const MAX_SCAN_DURATION_SECS: u64 = 30;

/// Longest accepted rest interval in seconds
pub const MAX_REST_INTERVAL_SECS: u64 = 30;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

const fn failure_code(error: &CradleError) -> i32 {
    match error {
        CradleError::ScanHardwareFailure { code } => *code,
        _ => SCAN_FAILED_INTERNAL_ERROR,
    }
}

/// Scanner for peripherals advertising the Cradle service
pub struct PeripheralScanner<R: ScanRadio> {
    shared: Arc<ScannerShared<R>>,
    radio_events: JoinHandle<()>,
}

impl<R: ScanRadio> PeripheralScanner<R> {
    /// Create a scanner filtered to the Cradle service
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        radio: R,
        events: RadioEvents,
        permissions: Arc<dyn PermissionCheck>,
        config: ScanConfig,
    ) -> Self {
        Self::with_service(radio, events, permissions, config, Uuid::from_u128(CRADLE_SERVICE_ID))
    }

    /// Create a scanner filtered to another service
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_service(
        radio: R,
        events: RadioEvents,
        permissions: Arc<dyn PermissionCheck>,
        config: ScanConfig,
        service: Uuid,
    ) -> Self {
        let (state, _) = watch::channel(ScanState::Unknown);
        let (discovered, _) = broadcast::channel(config.discovery_capacity.max(1));

        let shared = Arc::new(ScannerShared {
            radio,
            permissions,
            config,
            service,
            state,
            discovered,
            known: Mutex::new(HashMap::new()),
            control: tokio::sync::Mutex::new(None),
        });

        let radio_events = tokio::spawn(run_radio_events(Arc::clone(&shared), events));

        Self {
            shared,
            radio_events,
        }
    }

    /// Start scanning with the configured windows
    ///
    /// # Errors
    ///
    /// See [`start_scan`](Self::start_scan).
    pub async fn start_scan_default(&self) -> Result<()> {
        let config = &self.shared.config;
        self.start_scan(config.scan_duration_secs, config.rest_interval_secs)
            .await
    }

    /// Start the scan duty cycle
    ///
    /// Scans for `scan_duration_secs`, pauses for `rest_interval_secs`, and
    /// repeats until [`stop_scan`](Self::stop_scan). Calling it while a cycle
    /// runs restarts the cycle with the new windows and keeps the
    /// deduplication cache.
    ///
    /// # Errors
    ///
    /// - [`CradleError::PermissionDenied`] if the permission gate refuses
    /// - [`CradleError::InvalidParameters`] if the duration is outside 1-30 s
    ///   or the rest interval above 30 s
    /// - [`CradleError::ScanHardwareFailure`] (or the radio's own error) if the
    ///   radio refuses to start; the state then shows `Error(code)`
    pub async fn start_scan(&self, scan_duration_secs: u64, rest_interval_secs: u64) -> Result<()> {
        if !self.shared.permissions.has_required_permissions() {
            let reason = self.shared.permissions.describe_missing();
            warn!("Scan refused: {}", reason);
            return Err(CradleError::PermissionDenied(reason));
        }
        if !(1..=MAX_SCAN_DURATION_SECS).contains(&scan_duration_secs) {
            return Err(CradleError::InvalidParameters(format!(
                "scan duration {scan_duration_secs}s is out of range (1-{MAX_SCAN_DURATION_SECS})"
            )));
        }
        if rest_interval_secs > MAX_REST_INTERVAL_SECS {
            return Err(CradleError::InvalidParameters(format!(
                "rest interval {rest_interval_secs}s is out of range (0-{MAX_REST_INTERVAL_SECS})"
            )));
        }

        let shared = &self.shared;
        let mut control = shared.control.lock().await;
        if let Some(previous) = control.take() {
            info!("Restarting scan cycle");
            previous.cancel();
        }

        if let Err(e) = shared.radio.stop_scan().await {
            debug!("Stopping the radio before a scan failed: {}", e);
        }
        if let Err(e) = shared.radio.start_scan(shared.service).await {
            error!("Radio refused to start scanning: {}", e);
            shared.fail(&mut control, failure_code(&e)).await;
            return Err(e);
        }

        info!(
            "Scanning for {} ({}s on, {}s off)",
            shared.service, scan_duration_secs, rest_interval_secs
        );
        shared.publish_state(ScanState::Start);

        let cancel = CancellationToken::new();
        *control = Some(cancel.clone());
        tokio::spawn(run_duty_cycle(
            Arc::clone(shared),
            cancel,
            Duration::from_secs(scan_duration_secs),
            Duration::from_secs(rest_interval_secs),
        ));

        Ok(())
    }

    /// Stop scanning and forget every discovered address
    ///
    /// No further scan window starts after this returns.
    ///
    /// # Errors
    ///
    /// Returns the radio's error if it refuses to stop; the state is `Stop` regardless.
    pub async fn stop_scan(&self) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock().await;
        if let Some(cancel) = control.take() {
            cancel.cancel();
        }
        // Leave `Start` before clearing so nothing late refills the cache
        shared.publish_state(ScanState::Stop);
        shared.clear_caches();

        shared.radio.stop_scan().await
    }

    /// Forget every discovered address
    pub fn clear_caches(&self) {
        self.shared.clear_caches();
    }

    /// Forget one address so its next advertisement is reported again
    ///
    /// Returns whether the address was known.
    pub fn clear_cache_for_address(&self, address: &str) -> bool {
        let removed = lock(&self.shared.known).remove(address).is_some();
        if removed {
            debug!("Forgot {}", address);
        }
        removed
    }

    /// Peripherals reported in this session
    #[must_use]
    pub fn known_peripherals(&self) -> Vec<DiscoveredPeripheral> {
        lock(&self.shared.known).values().cloned().collect()
    }

    /// Whether `address` was reported in this session
    #[must_use]
    pub fn is_known(&self, address: &str) -> bool {
        lock(&self.shared.known).contains_key(address)
    }

    /// Latest-value stream of the scan state
    #[must_use]
    pub fn scan_state(&self) -> watch::Receiver<ScanState> {
        self.shared.state.subscribe()
    }

    /// Current scan state
    #[must_use]
    pub fn current_state(&self) -> ScanState {
        *self.shared.state.borrow()
    }

    /// First sighting of every peripheral, no replay
    #[must_use]
    pub fn discovered(&self) -> broadcast::Receiver<DiscoveredPeripheral> {
        self.shared.discovered.subscribe()
    }
}

impl<R: ScanRadio> Drop for PeripheralScanner<R> {
    fn drop(&mut self) {
        self.radio_events.abort();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            let cancel = shared.control.lock().await.take();
            if let Some(cancel) = cancel {
                cancel.cancel();
                if let Err(e) = shared.radio.stop_scan().await {
                    warn!("Failed to stop scanning on drop: {}", e);
                }
            }
        });
    }
}

struct ScannerShared<R> {
    radio: R,
    permissions: Arc<dyn PermissionCheck>,
    config: ScanConfig,
    service: Uuid,
    state: watch::Sender<ScanState>,
    discovered: broadcast::Sender<DiscoveredPeripheral>,
    known: Mutex<HashMap<String, DiscoveredPeripheral>>,
    /// Token of the running duty cycle; held across every radio call
    control: tokio::sync::Mutex<Option<CancellationToken>>,
}

impl<R: ScanRadio> ScannerShared<R> {
    fn publish_state(&self, new_state: ScanState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });
        if changed {
            info!("Scan state -> {}", new_state);
        }
    }

    fn clear_caches(&self) {
        let mut known = lock(&self.known);
        if !known.is_empty() {
            debug!("Forgetting {} discovered peripheral(s)", known.len());
        }
        known.clear();
    }

    /// Publish `Error(code)` and stop everything without publishing `Stop`
    async fn fail(&self, control: &mut Option<CancellationToken>, code: i32) {
        warn!("Scan failed with code {}", code);
        self.publish_state(ScanState::Error(code));

        if let Some(cancel) = control.take() {
            cancel.cancel();
        }
        self.clear_caches();
        if let Err(e) = self.radio.stop_scan().await {
            debug!("Stopping the radio after a failure failed: {}", e);
        }
    }

    fn handle_advertisement(&self, peripheral: DiscoveredPeripheral) {
        // State is checked under the cache lock; stop and fail publish before clearing
        let mut known = lock(&self.known);
        let state = *self.state.borrow();
        if state != ScanState::Start {
            debug!("Ignoring advertisement from {} while {}", peripheral.address, state);
            return;
        }

        let first_sighting = match known.entry(peripheral.address.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(peripheral.clone());
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(peripheral.clone());
                true
            }
        };
        drop(known);

        if first_sighting {
            info!(
                "Discovered {} ({}) RSSI {:?}",
                peripheral.address,
                peripheral
                    .advertisement
                    .local_name
                    .as_deref()
                    .unwrap_or("unnamed"),
                peripheral.rssi
            );
            // Nobody listening is fine; the address stays in the cache
            let _ = self.discovered.send(peripheral);
        }
    }
}

async fn run_radio_events<R: ScanRadio>(shared: Arc<ScannerShared<R>>, mut events: RadioEvents) {
    while let Some(event) = events.recv().await {
        match event {
            RadioEvent::Advertisement(peripheral) => shared.handle_advertisement(peripheral),
            RadioEvent::ScanFailed { code } => {
                let mut control = shared.control.lock().await;
                if control.is_none() {
                    debug!("Ignoring scan failure {} with no scan running", code);
                    continue;
                }
                shared.fail(&mut control, code).await;
            }
        }
    }
    debug!("Radio event channel closed");
}

async fn run_duty_cycle<R: ScanRadio>(
    shared: Arc<ScannerShared<R>>,
    cancel: CancellationToken,
    scan_window: Duration,
    rest_interval: Duration,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = sleep(scan_window) => {}
        }
        {
            let _control = shared.control.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = shared.radio.stop_scan().await {
                warn!("Failed to pause scanning: {}", e);
            }
            shared.publish_state(ScanState::Pause);
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = sleep(rest_interval) => {}
        }
        {
            let mut control = shared.control.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = shared.radio.start_scan(shared.service).await {
                error!("Radio refused to resume scanning: {}", e);
                shared.fail(&mut control, failure_code(&e)).await;
                return;
            }
            shared.publish_state(ScanState::Start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{MockScanRadio, RadioCall},
        transport::AlwaysGranted,
    };

    fn scanner() -> (PeripheralScanner<MockScanRadio>, MockScanRadio) {
        let (radio, events) = MockScanRadio::new();
        let scanner = PeripheralScanner::new(
            radio.clone(),
            events,
            Arc::new(AlwaysGranted),
            ScanConfig::default(),
        );
        (scanner, radio)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_filters_on_cradle_service() {
        let (scanner, radio) = scanner();
        scanner.start_scan(5, 2).await.unwrap();

        assert_eq!(scanner.current_state(), ScanState::Start);
        assert_eq!(
            radio.calls(),
            vec![
                RadioCall::StopScan,
                RadioCall::StartScan(Uuid::from_u128(CRADLE_SERVICE_ID)),
            ]
        );
    }

    #[tokio::test]
    async fn test_window_bounds() {
        let (scanner, radio) = scanner();

        for (duration, rest) in [(0, 5), (31, 5), (20, 31)] {
            assert!(matches!(
                scanner.start_scan(duration, rest).await,
                Err(CradleError::InvalidParameters(_))
            ));
        }
        assert!(radio.calls().is_empty());
        assert_eq!(scanner.current_state(), ScanState::Unknown);
    }

    #[tokio::test]
    async fn test_permission_denied_scan() {
        let (radio, events) = MockScanRadio::new();
        let scanner = PeripheralScanner::new(radio.clone(), events, Arc::new(|| false), ScanConfig::default());

        assert!(matches!(
            scanner.start_scan_default().await,
            Err(CradleError::PermissionDenied(_))
        ));
        assert!(radio.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_start_reports_error() {
        let (scanner, radio) = scanner();
        radio.fail_start(true);

        let result = scanner.start_scan(5, 2).await;
        assert!(matches!(
            result,
            Err(CradleError::ScanHardwareFailure { code: 3 })
        ));
        assert_eq!(scanner.current_state(), ScanState::Error(3));
    }

    #[tokio::test]
    async fn test_cache_maintenance() {
        let (scanner, radio) = scanner();
        let mut discovered = scanner.discovered();
        scanner.start_scan(20, 5).await.unwrap();

        radio.advertise(DiscoveredPeripheral::new("11:22:33:44:55:66", Some(-60)));
        assert_eq!(discovered.recv().await.unwrap().address, "11:22:33:44:55:66");
        assert!(scanner.is_known("11:22:33:44:55:66"));

        assert!(scanner.clear_cache_for_address("11:22:33:44:55:66"));
        assert!(!scanner.clear_cache_for_address("11:22:33:44:55:66"));

        radio.advertise(DiscoveredPeripheral::new("11:22:33:44:55:66", Some(-58)));
        let again = discovered.recv().await.unwrap();
        assert_eq!(again.rssi, Some(-58));
        assert_eq!(scanner.known_peripherals().len(), 1);

        scanner.clear_caches();
        assert!(scanner.known_peripherals().is_empty());
    }
}
