use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::Result, types::DiscoveredPeripheral};

/// Identity of one connection attempt
///
/// Allocated by the client on every `connect`; the transport tags every
/// event of that link with it so completions of a torn-down link can be told
/// apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Out-of-band completion reported by a [`GattTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link came up
    Connected {
        /// Link the event belongs to
        link: LinkId,
    },
    /// The link went down, requested or not
    Disconnected {
        /// Link the event belongs to
        link: LinkId,
        /// Radio stack reason, if any
        reason: Option<String>,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Link the event belongs to
        link: LinkId,
        /// Failure description on error
        result: std::result::Result<(), String>,
    },
    /// A characteristic read finished
    ReadComplete {
        /// Link the event belongs to
        link: LinkId,
        /// Characteristic that was read
        uuid: Uuid,
        /// Value or failure description
        result: std::result::Result<Vec<u8>, String>,
    },
    /// A characteristic write finished
    WriteComplete {
        /// Link the event belongs to
        link: LinkId,
        /// Characteristic that was written
        uuid: Uuid,
        /// Failure description on error
        result: std::result::Result<(), String>,
    },
}

impl TransportEvent {
    /// Link the event belongs to
    #[must_use]
    pub const fn link(&self) -> LinkId {
        match self {
            Self::Connected { link }
            | Self::Disconnected { link, .. }
            | Self::ServicesDiscovered { link, .. }
            | Self::ReadComplete { link, .. }
            | Self::WriteComplete { link, .. } => *link,
        }
    }
}

/// Receiving end of a transport's completions
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// GATT client primitives of a radio stack
///
/// Every method submits a request and returns. `Ok` means the request was
/// accepted, not that it completed.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Start establishing a link to `address`
    ///
    /// Must fail with [`crate::CradleError::PeripheralUnresolvable`] when the
    /// address is unknown to the stack.
    async fn connect(&self, link: LinkId, address: &str) -> Result<()>;

    /// Request teardown of `link` and release its handle
    async fn disconnect(&self, link: LinkId) -> Result<()>;

    /// Start service discovery on `link`
    async fn discover_services(&self, link: LinkId) -> Result<()>;

    /// Start reading `characteristic` of `service`
    async fn read(&self, link: LinkId, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Start writing `payload` to `characteristic` of `service`, with response
    async fn write(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        payload: Bytes,
    ) -> Result<()>;
}

/// Out-of-band scan result reported by a [`ScanRadio`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertisement matching the scan filter
    Advertisement(DiscoveredPeripheral),
    /// The radio aborted the scan
    ScanFailed {
        /// Radio stack error code
        code: i32,
    },
}

/// Receiving end of a radio's scan results
pub type RadioEvents = mpsc::UnboundedReceiver<RadioEvent>;

/// Scan error code used when the radio refuses to start without a code of its own
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

/// LE scanning primitives of a radio stack
#[async_trait]
pub trait ScanRadio: Send + Sync + 'static {
    /// Start an active scan filtered to `service`
    async fn start_scan(&self, service: Uuid) -> Result<()>;

    /// Stop scanning; stopping an idle radio is not an error
    async fn stop_scan(&self) -> Result<()>;
}

/// Runtime permission gate checked before scan and connect
pub trait PermissionCheck: Send + Sync {
    /// Whether the required radio permissions are granted
    fn has_required_permissions(&self) -> bool;

    /// Description used in [`crate::CradleError::PermissionDenied`]
    fn describe_missing(&self) -> String {
        "required Bluetooth permissions are not granted".to_string()
    }
}

/// Permission gate for platforms without runtime permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl PermissionCheck for AlwaysGranted {
    fn has_required_permissions(&self) -> bool {
        true
    }
}

impl<F> PermissionCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn has_required_permissions(&self) -> bool {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn test_event_link() {
        let event = TransportEvent::ReadComplete {
            link: LinkId(7),
            uuid: Uuid::nil(),
            result: Ok(vec![0x01]),
        };
        assert_eq!(event.link(), LinkId(7));
        assert_eq!(LinkId(7).to_string(), "link#7");
    }

    #[test]
    fn test_closure_permission_check() {
        let granted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&granted);
        let check = move || flag.load(Ordering::SeqCst);

        assert!(!check.has_required_permissions());
        granted.store(true, Ordering::SeqCst);
        assert!(check.has_required_permissions());
        assert!(AlwaysGranted.has_required_permissions());
    }
}
