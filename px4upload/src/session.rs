//! Single-threaded driver tying the watcher and the uploader together.
//!
//! The state machine in [`crate::uploader`] never blocks and owns no timers.
//! This module supplies them from one control thread:
//!
//! 1. poll the [`PortWatcher`] every [`UploadOptions::poll_interval`],
//! 2. open the detected port, retrying up to [`UploadOptions::open_attempts`] times,
//! 3. deliver data-arrived notifications and erase ticks to the [`Uploader`].
//!
//! The interrupt checker registered with [`crate::set_interrupt_checker`] is
//! consulted between notifications.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
#[cfg(feature = "native")]
use crate::image::FirmwareImage;
use crate::port::{Port, PortEnumerator, SerialConfig};
use crate::uploader::{
    DeviceDescriptor, ERASE_TIMEOUT_TICKS, EventSink, UploadEvent, UploadOutcome, UploadFailure,
    Uploader,
};
use crate::watcher::{PortArrival, PortFilter, PortWatcher};

/// Default interval between port enumerations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default interval between erase checks.
pub const DEFAULT_ERASE_TICK: Duration = Duration::from_millis(250);

/// Default number of attempts to open the detected port.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 100;

/// Default pause between two open attempts.
pub const DEFAULT_OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Longest pause between two looks at an idle port.
const SERVICE_INTERVAL: Duration = Duration::from_millis(5);

/// Knobs for one upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadOptions {
    /// Serial settings; the port name is filled in on detection.
    pub serial: SerialConfig,
    /// Interval between port enumerations.
    pub poll_interval: Duration,
    /// Interval between erase checks.
    pub erase_tick: Duration,
    /// Erase checks before giving up.
    pub erase_timeout_ticks: u32,
    /// Attempts to open the detected port.
    pub open_attempts: u32,
    /// Pause between open attempts.
    pub open_retry_delay: Duration,
    /// Give up waiting for a bootloader after this long. `None` waits forever.
    pub detect_timeout: Option<Duration>,
    /// Which new ports may be the bootloader.
    pub port_filter: PortFilter,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            erase_tick: DEFAULT_ERASE_TICK,
            erase_timeout_ticks: ERASE_TIMEOUT_TICKS,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_retry_delay: DEFAULT_OPEN_RETRY_DELAY,
            detect_timeout: None,
            port_filter: PortFilter::default(),
        }
    }
}

/// What a successful session learned about the board.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadReport {
    /// Port the bootloader appeared on.
    pub port: String,
    /// Device info reported by the bootloader.
    pub device: DeviceDescriptor,
    /// Board serial number.
    pub serial_number: Option<String>,
    /// Bytes written (padded image size).
    pub bytes_written: usize,
}

/// Call `open` until it succeeds, at most `attempts` times.
///
/// Sleeps `delay` between attempts. Fails with [`Error::PortOpen`] once the
/// budget is spent, or [`Error::Cancelled`] if interrupted meanwhile.
pub fn retry_open<P, F>(port_name: &str, attempts: u32, delay: Duration, mut open: F) -> Result<P>
where
    F: FnMut() -> Result<P>,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match open() {
            Ok(port) => {
                if attempt > 1 {
                    debug!("Port opened on attempt {attempt}");
                }
                return Ok(port);
            },
            Err(e) => {
                warn!("Unable to open port {port_name}, attempt {attempt}/{attempts}: {e}");
                if attempt < attempts {
                    if crate::is_interrupted_requested() {
                        return Err(Error::Cancelled);
                    }
                    thread::sleep(delay);
                }
            },
        }
    }

    Err(Error::PortOpen {
        port: port_name.to_string(),
        attempts,
    })
}

/// Poll `watcher` until a bootloader port arrives.
///
/// Stops the watcher and fails with [`Error::Cancelled`] when interrupted, or
/// with [`Error::Timeout`] once [`UploadOptions::detect_timeout`] elapses.
pub fn wait_for_bootloader<E, S>(
    watcher: &mut PortWatcher<E>,
    options: &UploadOptions,
    sink: &mut S,
) -> Result<PortArrival>
where
    E: PortEnumerator,
    S: EventSink + ?Sized,
{
    let started = Instant::now();

    loop {
        if crate::is_interrupted_requested() {
            watcher.stop();
            return Err(Error::Cancelled);
        }

        if let Some(arrival) = watcher.poll(sink)? {
            return Ok(arrival);
        }

        if let Some(limit) = options.detect_timeout {
            if started.elapsed() >= limit {
                watcher.stop();
                return Err(Error::Timeout(format!(
                    "no bootloader appeared within {}s",
                    limit.as_secs()
                )));
            }
        }

        thread::sleep(options.poll_interval);
    }
}

/// Feed notifications to a kicked-off uploader until it finishes.
///
/// A data-arrived notification is delivered on every service pass that finds
/// unread bytes; the uploader ignores bytes it cannot use yet. Erase ticks fire
/// every [`UploadOptions::erase_tick`] while the uploader erases. The driver
/// only pauses after a pass that consumed nothing, so replies are answered as
/// soon as they are complete. On interruption the uploader is stopped and
/// [`Error::Cancelled`] returned.
pub fn drive_upload<P, S>(uploader: &mut Uploader<P>, options: &UploadOptions, sink: &mut S) -> Result<()>
where
    P: Port,
    S: EventSink + ?Sized,
{
    let mut next_tick: Option<Instant> = None;

    while !uploader.is_finished() {
        if crate::is_interrupted_requested() {
            info!("Upload interrupted");
            uploader.stop();
            break;
        }

        let waiting = match uploader.bytes_waiting() {
            Ok(n) => n,
            Err(e) => {
                uploader.abort(e, sink);
                break;
            },
        };
        let mut progressed = false;
        if waiting > 0 {
            let before = uploader.bytes_read();
            uploader.on_data_arrived(sink);
            progressed = uploader.bytes_read() != before;
        }

        let mut pause = SERVICE_INTERVAL;
        if uploader.erase_timer_active() {
            let now = Instant::now();
            let due = *next_tick.get_or_insert(now + options.erase_tick);
            if now >= due {
                uploader.on_erase_tick(sink);
                next_tick = Some(due + options.erase_tick);
                progressed = true;
            } else {
                pause = pause.min(due - now);
            }
        } else {
            next_tick = None;
        }

        if !progressed && !uploader.is_finished() {
            thread::sleep(pause);
        }
    }

    match uploader.take_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run a full session on real serial ports.
///
/// Asks for a replug, waits for a new bootloader port, opens it with retry,
/// and drives the upload to completion. Every failure after the replug
/// request other than cancellation is also reported to `sink` as
/// [`UploadEvent::Error`] followed by [`UploadEvent::Complete`].
#[cfg(feature = "native")]
pub fn upload<S>(image: FirmwareImage, options: &UploadOptions, sink: &mut S) -> Result<UploadReport>
where
    S: EventSink + ?Sized,
{
    use crate::port::{NativePort, NativePortEnumerator};

    info!(
        "Firmware for board {} ready, {} bytes (CRC {:#010x})",
        image.board_id(),
        image.len(),
        image.crc()
    );
    sink.emit(UploadEvent::ReplugRequested);

    let arrival = match PortWatcher::new(NativePortEnumerator, options.port_filter.clone())
        .and_then(|mut watcher| wait_for_bootloader(&mut watcher, options, sink))
    {
        Ok(arrival) => arrival,
        Err(e) => return Err(report_failure(e, sink)),
    };

    let config = options
        .serial
        .clone()
        .with_port_name(&arrival.port_name);
    let port = match retry_open(
        &arrival.port_name,
        options.open_attempts,
        options.open_retry_delay,
        || NativePort::open(&config),
    ) {
        Ok(port) => port,
        Err(e) => return Err(report_failure(e, sink)),
    };

    let mut uploader =
        Uploader::new(port, image).with_erase_timeout_ticks(options.erase_timeout_ticks);
    uploader.kick_off(arrival.device_info, sink);
    drive_upload(&mut uploader, options, sink)?;

    Ok(UploadReport {
        port: arrival.port_name,
        device: uploader
            .device()
            .clone(),
        serial_number: uploader
            .serial_number()
            .map(str::to_string),
        bytes_written: uploader
            .image()
            .len(),
    })
}

/// Emit the terminal event pair for a failure outside the uploader.
///
/// Cancellation stays silent, matching [`Uploader::stop`].
#[cfg_attr(not(feature = "native"), allow(dead_code))]
fn report_failure<S>(err: Error, sink: &mut S) -> Error
where
    S: EventSink + ?Sized,
{
    if matches!(err, Error::Cancelled) {
        return err;
    }
    sink.emit(UploadEvent::Error(UploadFailure::from(&err)));
    sink.emit(UploadEvent::Complete(UploadOutcome::Failure));
    err
}
