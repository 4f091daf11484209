use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{CradleError, Result},
    transport::{
        GattTransport, LinkId, RadioEvent, RadioEvents, ScanRadio, TransportEvent,
        TransportEvents,
    },
    types::DiscoveredPeripheral,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request received by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCall {
    /// `connect`
    Connect {
        /// Link allocated by the client
        link: LinkId,
        /// Target address
        address: String,
    },
    /// `disconnect`
    Disconnect {
        /// Link to tear down
        link: LinkId,
    },
    /// `discover_services`
    DiscoverServices {
        /// Link to discover
        link: LinkId,
    },
    /// `read`
    Read {
        /// Link used
        link: LinkId,
        /// Characteristic read
        characteristic: Uuid,
    },
    /// `write`
    Write {
        /// Link used
        link: LinkId,
        /// Characteristic written
        characteristic: Uuid,
        /// Bytes written
        payload: Vec<u8>,
    },
}

impl GattCall {
    /// Whether the call is a read or write
    #[must_use]
    pub const fn is_operation(&self) -> bool {
        matches!(self, Self::Read { .. } | Self::Write { .. })
    }
}

struct MockTransportInner {
    calls: Mutex<Vec<GattCall>>,
    known: Mutex<HashSet<String>>,
    reject_submissions: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
    changed: Notify,
}

/// Scriptable [`GattTransport`]
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl MockTransport {
    /// Create a transport and the receiving end of its events
    #[must_use]
    pub fn new() -> (Self, TransportEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(MockTransportInner {
                calls: Mutex::new(Vec::new()),
                known: Mutex::new(HashSet::new()),
                reject_submissions: AtomicBool::new(false),
                events,
                changed: Notify::new(),
            }),
        };
        (transport, receiver)
    }

    /// Make `address` resolvable, as if a scan had reported it
    pub fn add_known_peripheral(&self, address: impl Into<String>) {
        lock(&self.inner.known).insert(address.into());
    }

    /// Make every read/write submission fail synchronously
    pub fn reject_submissions(&self, reject: bool) {
        self.inner.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Every request received so far
    #[must_use]
    pub fn calls(&self) -> Vec<GattCall> {
        lock(&self.inner.calls).clone()
    }

    /// Reads and writes received so far
    #[must_use]
    pub fn operations(&self) -> Vec<GattCall> {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| call.is_operation())
            .cloned()
            .collect()
    }

    /// Link of the latest `connect`
    #[must_use]
    pub fn last_link(&self) -> Option<LinkId> {
        lock(&self.inner.calls).iter().rev().find_map(|call| match call {
            GattCall::Connect { link, .. } => Some(*link),
            _ => None,
        })
    }

    /// Wait until at least `count` requests have been received
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let changed = self.inner.changed.notified();
            if lock(&self.inner.calls).len() >= count {
                return;
            }
            changed.await;
        }
    }

    /// Deliver a completion event to the client
    pub fn emit(&self, event: TransportEvent) {
        debug!("Mock transport emitting {:?}", event);
        // The client may already be gone; nothing to deliver to then
        let _ = self.inner.events.send(event);
    }

    /// Report the link as up
    pub fn link_up(&self, link: LinkId) {
        self.emit(TransportEvent::Connected { link });
    }

    /// Report the link as down
    pub fn link_down(&self, link: LinkId) {
        self.emit(TransportEvent::Disconnected { link, reason: None });
    }

    /// Report successful service discovery
    pub fn services_discovered(&self, link: LinkId) {
        self.emit(TransportEvent::ServicesDiscovered {
            link,
            result: Ok(()),
        });
    }

    /// Report a finished read
    pub fn read_complete(&self, link: LinkId, uuid: Uuid, value: &[u8]) {
        self.emit(TransportEvent::ReadComplete {
            link,
            uuid,
            result: Ok(value.to_vec()),
        });
    }

    /// Report a finished write
    pub fn write_complete(&self, link: LinkId, uuid: Uuid) {
        self.emit(TransportEvent::WriteComplete {
            link,
            uuid,
            result: Ok(()),
        });
    }

    fn record(&self, call: GattCall) {
        debug!("Mock transport received {:?}", call);
        lock(&self.inner.calls).push(call);
        self.inner.changed.notify_waiters();
    }

    fn check_submission(&self) -> Result<()> {
        if self.inner.reject_submissions.load(Ordering::SeqCst) {
            return Err(CradleError::Transport("submission rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GattTransport for MockTransport {
    async fn connect(&self, link: LinkId, address: &str) -> Result<()> {
        if !lock(&self.inner.known).contains(address) {
            return Err(CradleError::PeripheralUnresolvable {
                address: address.to_string(),
            });
        }
        self.record(GattCall::Connect {
            link,
            address: address.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> Result<()> {
        self.record(GattCall::Disconnect { link });
        Ok(())
    }

    async fn discover_services(&self, link: LinkId) -> Result<()> {
        self.record(GattCall::DiscoverServices { link });
        Ok(())
    }

    async fn read(&self, link: LinkId, _service: Uuid, characteristic: Uuid) -> Result<()> {
        self.check_submission()?;
        self.record(GattCall::Read {
            link,
            characteristic,
        });
        Ok(())
    }

    async fn write(
        &self,
        link: LinkId,
        _service: Uuid,
        characteristic: Uuid,
        payload: Bytes,
    ) -> Result<()> {
        self.check_submission()?;
        self.record(GattCall::Write {
            link,
            characteristic,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// A request received by [`MockScanRadio`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCall {
    /// `start_scan` with its service filter
    StartScan(Uuid),
    /// `stop_scan`
    StopScan,
}

struct MockScanRadioInner {
    calls: Mutex<Vec<RadioCall>>,
    fail_start: AtomicBool,
    stop_hook: Mutex<Option<(DiscoveredPeripheral, Duration)>>,
    events: mpsc::UnboundedSender<RadioEvent>,
    changed: Notify,
}

/// Scriptable [`ScanRadio`]
#[derive(Clone)]
pub struct MockScanRadio {
    inner: Arc<MockScanRadioInner>,
}

impl MockScanRadio {
    /// Create a radio and the receiving end of its events
    #[must_use]
    pub fn new() -> (Self, RadioEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let radio = Self {
            inner: Arc::new(MockScanRadioInner {
                calls: Mutex::new(Vec::new()),
                fail_start: AtomicBool::new(false),
                stop_hook: Mutex::new(None),
                events,
                changed: Notify::new(),
            }),
        };
        (radio, receiver)
    }

    /// Make `start_scan` fail
    pub fn fail_start(&self, fail: bool) {
        self.inner.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make the next `stop_scan` report `peripheral`, then take `linger` to return
    pub fn advertise_during_next_stop(&self, peripheral: DiscoveredPeripheral, linger: Duration) {
        *lock(&self.inner.stop_hook) = Some((peripheral, linger));
    }

    /// Every request received so far
    #[must_use]
    pub fn calls(&self) -> Vec<RadioCall> {
        lock(&self.inner.calls).clone()
    }

    /// Number of `start_scan` requests received so far
    #[must_use]
    pub fn start_count(&self) -> usize {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| matches!(call, RadioCall::StartScan(_)))
            .count()
    }

    /// Wait until at least `count` requests have been received
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let changed = self.inner.changed.notified();
            if lock(&self.inner.calls).len() >= count {
                return;
            }
            changed.await;
        }
    }

    /// Report an advertisement
    pub fn advertise(&self, peripheral: DiscoveredPeripheral) {
        let _ = self.inner.events.send(RadioEvent::Advertisement(peripheral));
    }

    /// Report a scan failure
    pub fn fail(&self, code: i32) {
        let _ = self.inner.events.send(RadioEvent::ScanFailed { code });
    }

    fn record(&self, call: RadioCall) {
        lock(&self.inner.calls).push(call);
        self.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl ScanRadio for MockScanRadio {
    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.record(RadioCall::StartScan(service));
        if self.inner.fail_start.load(Ordering::SeqCst) {
            return Err(CradleError::ScanHardwareFailure {
                code: crate::transport::SCAN_FAILED_INTERNAL_ERROR,
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(RadioCall::StopScan);
        let hook = lock(&self.inner.stop_hook).take();
        if let Some((peripheral, linger)) = hook {
            self.advertise(peripheral);
            tokio::time::sleep(linger).await;
        }
        Ok(())
    }
}
