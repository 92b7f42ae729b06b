//! Bootloader arrival detection.
//!
//! A PX4 board only exposes its bootloader for a short window after power-up,
//! so the port cannot be chosen up front. The watcher snapshots the visible
//! serial ports, then compares every new enumeration against the previous one.
//! The first port that appears and passes the [`PortFilter`] is the
//! bootloader: the watcher stops and hands the port name over as a
//! [`PortArrival`]. It never opens or touches the port itself.

use std::collections::{HashSet, VecDeque};

use log::{debug, info};

use crate::error::Result;
use crate::port::PortEnumerator;
use crate::protocol::bootloader::DeviceInfoItem;
use crate::uploader::{EventSink, UploadEvent};

/// Port-name policy deciding which new ports may be a bootloader.
///
/// On Linux, ports are known to reorder and re-appear during enumeration, so
/// only CDC ACM devices (`ttyACM*`) count. Other platforms accept any new port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortFilter {
    pattern: Option<String>,
}

impl Default for PortFilter {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::containing("ttyACM")
        } else {
            Self::any()
        }
    }
}

impl PortFilter {
    /// Accept every new port.
    pub fn any() -> Self {
        Self { pattern: None }
    }

    /// Accept ports whose name contains `pattern`.
    pub fn containing(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
        }
    }

    /// The required name fragment, if any.
    pub fn pattern(&self) -> Option<&str> {
        self.pattern
            .as_deref()
    }

    /// Whether `name` may be a bootloader port.
    pub fn matches(&self, name: &str) -> bool {
        self.pattern
            .as_deref()
            .is_none_or(|p| name.contains(p))
    }
}

/// Device info items still to be requested, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoRequest {
    items: VecDeque<DeviceInfoItem>,
}

impl Default for DeviceInfoRequest {
    fn default() -> Self {
        Self {
            items: DeviceInfoItem::QUERY_ORDER
                .into_iter()
                .collect(),
        }
    }
}

impl DeviceInfoRequest {
    /// Queue with explicit items.
    pub fn with_items(items: impl IntoIterator<Item = DeviceInfoItem>) -> Self {
        Self {
            items: items
                .into_iter()
                .collect(),
        }
    }

    /// Remove and return the next item to request.
    pub fn pop_next(&mut self) -> Option<DeviceInfoItem> {
        self.items
            .pop_front()
    }

    /// Whether every item has been requested.
    pub fn is_empty(&self) -> bool {
        self.items
            .is_empty()
    }

    /// Number of items still queued.
    pub fn len(&self) -> usize {
        self.items
            .len()
    }
}

/// A bootloader port that just appeared, ready to be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortArrival {
    /// Port name/path.
    pub port_name: String,
    /// Device info queries to run once synced.
    pub device_info: DeviceInfoRequest,
}

/// Polls port enumerations and detects the bootloader arriving.
pub struct PortWatcher<E: PortEnumerator> {
    enumerator: E,
    filter: PortFilter,
    snapshot: HashSet<String>,
    watching: bool,
}

impl<E: PortEnumerator> PortWatcher<E> {
    /// Start watching, using the current enumeration as the baseline.
    pub fn new(mut enumerator: E, filter: PortFilter) -> Result<Self> {
        let snapshot: HashSet<String> = enumerator
            .list_ports()?
            .into_iter()
            .map(|p| p.name)
            .collect();
        debug!("Initial port snapshot: {snapshot:?}");

        Ok(Self {
            enumerator,
            filter,
            snapshot,
            watching: true,
        })
    }

    /// Whether the watcher still polls.
    pub fn is_watching(&self) -> bool {
        self.watching
    }

    /// Stop polling. Subsequent polls do nothing.
    pub fn stop(&mut self) {
        self.watching = false;
    }

    /// Compare a fresh enumeration against the previous snapshot.
    ///
    /// Returns the arrival on the first qualifying new port, after emitting
    /// [`UploadEvent::DeviceDetected`] and [`UploadEvent::KickedOff`]. Once an
    /// arrival has been returned, the watcher is stopped for good.
    pub fn poll<S>(&mut self, sink: &mut S) -> Result<Option<PortArrival>>
    where
        S: EventSink + ?Sized,
    {
        if !self.watching {
            return Ok(None);
        }

        let ports = self
            .enumerator
            .list_ports()?;
        let mut arrival = None;

        for port in &ports {
            if self
                .snapshot
                .contains(&port.name)
            {
                continue;
            }
            if !self
                .filter
                .matches(&port.name)
            {
                info!("Invalid port found: {}", port.name);
                continue;
            }

            info!("Port found! {}", port.name);
            arrival = Some(PortArrival {
                port_name: port
                    .name
                    .clone(),
                device_info: DeviceInfoRequest::default(),
            });
            break;
        }

        self.snapshot = ports
            .into_iter()
            .map(|p| p.name)
            .collect();

        if let Some(ref found) = arrival {
            self.watching = false;
            sink.emit(UploadEvent::DeviceDetected {
                port: found
                    .port_name
                    .clone(),
            });
            sink.emit(UploadEvent::KickedOff {
                port: found
                    .port_name
                    .clone(),
            });
        }

        Ok(arrival)
    }
}
