//! Slow side inputs: GPS position/time, the environmental sensor and the
//! battery. Each source has its own poller thread that keeps overwriting a
//! [`Latest`] cell. The acquisition loop only ever takes a snapshot of
//! whatever is there, so a stalled sensor shows up as stale or missing
//! fields, never as a late cycle.

use std::{
    fs::File,
    io::{self, Read},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::{device::poll_readable, shutdown::ShutdownToken, Config, Error, Result};

const GPS_POLL_INTERVAL: Duration = Duration::from_millis(200);
// NMEA sentences are at most 82 characters, anything longer is line noise
const MAX_SENTENCE: usize = 128;

/// Single writer, many reader cell holding the most recent value
#[derive(Debug)]
pub struct Latest<T> {
    cell: ArcSwapOption<T>,
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self {
            cell: ArcSwapOption::empty(),
        }
    }
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, value: T) {
        self.cell.store(Some(Arc::new(value)));
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.cell.load_full()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpsFix {
    /// UTC time of the last valid RMC sentence
    pub time: Option<DateTime<Utc>>,
    pub valid: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_m: Option<f64>,
    /// GGA fix quality, 0 = no fix
    pub fix_quality: u8,
    pub satellites: u8,
}

/// The NMEA sentences we care about
#[derive(Clone, Debug, PartialEq)]
pub enum Sentence {
    Rmc {
        time: Option<DateTime<Utc>>,
        valid: bool,
        latitude: Option<f64>,
        longitude: Option<f64>,
    },
    Gga {
        latitude: Option<f64>,
        longitude: Option<f64>,
        fix_quality: u8,
        satellites: u8,
        altitude_m: Option<f64>,
    },
}

fn parse_err(field: &str, value: &str) -> Error {
    Error::Parse {
        field: field.to_owned(),
        value: value.to_owned(),
    }
}

fn opt_num<T: std::str::FromStr>(field: &str, value: &str) -> Result<Option<T>> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| parse_err(field, value))
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed degrees
fn coordinate(value: &str, hemisphere: &str) -> Result<Option<f64>> {
    let Some(raw) = opt_num::<f64>("coordinate", value)? else {
        return Ok(None);
    };
    let degrees = (raw / 100.0).trunc();
    let decimal = degrees + (raw - degrees * 100.0) / 60.0;
    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(parse_err("hemisphere", hemisphere)),
    }
}

fn time_of_day(value: &str) -> Option<NaiveTime> {
    if value.len() < 6 || !value.is_ascii() {
        return None;
    }
    let h = value[0..2].parse().ok()?;
    let m = value[2..4].parse().ok()?;
    let s: f64 = value[4..].parse().ok()?;
    let micro = ((s.fract() * 1e6).round() as u32).min(999_999);
    NaiveTime::from_hms_micro_opt(h, m, s.trunc() as u32, micro)
}

fn date(value: &str) -> Option<NaiveDate> {
    if value.len() != 6 || !value.is_ascii() {
        return None;
    }
    let d = value[0..2].parse().ok()?;
    let m = value[2..4].parse().ok()?;
    let y: i32 = value[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + y, m, d)
}

/// Parse one NMEA line. `Ok(None)` for well formed sentences we do not use.
pub fn parse_sentence(line: &str) -> Result<Option<Sentence>> {
    let line = line.trim();
    let body = line
        .strip_prefix('$')
        .ok_or_else(|| parse_err("sentence", line))?;
    let (body, checksum) = body
        .split_once('*')
        .ok_or_else(|| parse_err("checksum", line))?;
    let expected = u8::from_str_radix(checksum, 16).map_err(|_| parse_err("checksum", checksum))?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return Err(parse_err("checksum", line));
    }

    let fields: Vec<&str> = body.split(',').collect();
    // Talker id (GP, GN, ...) is ignored
    let kind = fields[0].get(2..).unwrap_or_default();
    let field = |i: usize| fields.get(i).copied().unwrap_or_default();
    match kind {
        "RMC" => {
            let time = match (time_of_day(field(1)), date(field(9))) {
                (Some(t), Some(d)) => Some(Utc.from_utc_datetime(&d.and_time(t))),
                _ => None,
            };
            Ok(Some(Sentence::Rmc {
                time,
                valid: field(2) == "A",
                latitude: coordinate(field(3), field(4))?,
                longitude: coordinate(field(5), field(6))?,
            }))
        }
        "GGA" => Ok(Some(Sentence::Gga {
            latitude: coordinate(field(2), field(3))?,
            longitude: coordinate(field(4), field(5))?,
            fix_quality: opt_num("fix_quality", field(6))?.unwrap_or(0),
            satellites: opt_num("satellites", field(7))?.unwrap_or(0),
            altitude_m: opt_num("altitude", field(9))?,
        })),
        _ => Ok(None),
    }
}

impl GpsFix {
    pub fn apply(&mut self, sentence: Sentence) {
        match sentence {
            Sentence::Rmc {
                time,
                valid,
                latitude,
                longitude,
            } => {
                self.valid = valid;
                if valid {
                    self.time = time.or(self.time);
                    self.latitude = latitude.or(self.latitude);
                    self.longitude = longitude.or(self.longitude);
                }
            }
            Sentence::Gga {
                latitude,
                longitude,
                fix_quality,
                satellites,
                altitude_m,
            } => {
                self.fix_quality = fix_quality;
                self.satellites = satellites;
                if fix_quality > 0 {
                    self.latitude = latitude.or(self.latitude);
                    self.longitude = longitude.or(self.longitude);
                    self.altitude_m = altitude_m.or(self.altitude_m);
                }
            }
        }
    }
}

/// Accumulates raw serial bytes and hands out complete lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8], mut on_line: impl FnMut(&str)) {
        for &b in bytes {
            match b {
                b'\n' | b'\r' => {
                    if !self.pending.is_empty() {
                        if let Ok(line) = std::str::from_utf8(&self.pending) {
                            on_line(line);
                        }
                        self.pending.clear();
                    }
                }
                _ if self.pending.len() < MAX_SENTENCE => self.pending.push(b),
                // Overlong garbage, drop it and resync on the next newline
                _ => self.pending.clear(),
            }
        }
    }
}

/// Read NMEA from `path` until shutdown, publishing every update to `latest`
pub fn run_gps_poller(path: &Path, latest: &Latest<GpsFix>, shutdown: &ShutdownToken) -> Result<()> {
    let mut file = File::open(path)?;
    info!(path = %path.display(), "GPS poller started");
    let fd = file.as_raw_fd();
    let mut fix = GpsFix::default();
    let mut lines = LineBuffer::default();
    let mut buf = [0u8; 512];
    while !shutdown.is_triggered() {
        if !poll_readable(fd, GPS_POLL_INTERVAL)? {
            continue;
        }
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            // Nothing more for now (e.g. a replayed log file)
            thread::sleep(GPS_POLL_INTERVAL);
            continue;
        }
        let mut updated = false;
        lines.push(&buf[..n], |line| match parse_sentence(line) {
            Ok(Some(sentence)) => {
                fix.apply(sentence);
                updated = true;
            }
            Ok(None) => {}
            Err(e) => debug!(%e, "Dropping NMEA sentence"),
        });
        if updated {
            latest.store(fix.clone());
        }
    }
    info!("GPS poller stopped");
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Environment {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PowerSample {
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub capacity_pct: Option<i64>,
}

/// A sysfs attribute as a number, `None` when the attribute does not exist
fn sysfs_value<T: std::str::FromStr>(dir: &Path, name: &str) -> Result<Option<T>> {
    match std::fs::read_to_string(dir.join(name)) {
        Ok(s) => {
            let s = s.trim();
            s.parse().map(Some).map_err(|_| parse_err(name, s))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Environment {
    /// Read an IIO humidity/pressure/temperature sensor
    pub fn read(dir: &Path) -> Result<Self> {
        Ok(Self {
            temperature_c: sysfs_value::<f64>(dir, "in_temp_input")?.map(|m| m / 1000.0),
            humidity_pct: sysfs_value::<f64>(dir, "in_humidityrelative_input")?
                .map(|m| m / 1000.0),
            pressure_hpa: sysfs_value::<f64>(dir, "in_pressure_input")?.map(|kpa| kpa * 10.0),
        })
    }
}

impl PowerSample {
    /// Read a `power_supply` class device
    pub fn read(dir: &Path) -> Result<Self> {
        Ok(Self {
            voltage_v: sysfs_value::<f64>(dir, "voltage_now")?.map(|uv| uv / 1e6),
            current_a: sysfs_value::<f64>(dir, "current_now")?.map(|ua| ua / 1e6),
            capacity_pct: sysfs_value(dir, "capacity")?,
        })
    }
}

/// Periodically sample the environmental sensor and battery until shutdown
pub fn run_env_poller(
    env_dir: Option<&Path>,
    power_dir: Option<&Path>,
    interval: Duration,
    env: &Latest<Environment>,
    power: &Latest<PowerSample>,
    shutdown: &ShutdownToken,
) {
    info!("Environment poller started");
    loop {
        if let Some(dir) = env_dir {
            match Environment::read(dir) {
                Ok(sample) => env.store(sample),
                Err(e) => warn!(%e, dir = %dir.display(), "Environmental sensor read failed"),
            }
        }
        if let Some(dir) = power_dir {
            match PowerSample::read(dir) {
                Ok(sample) => power.store(sample),
                Err(e) => warn!(%e, dir = %dir.display(), "Power supply read failed"),
            }
        }
        match shutdown.signal().recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    info!("Environment poller stopped");
}

/// What the assembler sees of the telemetry at one instant
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub gps: Option<Arc<GpsFix>>,
    pub environment: Option<Arc<Environment>>,
    pub power: Option<Arc<PowerSample>>,
}

/// Reader side of every telemetry cell
#[derive(Clone, Debug, Default)]
pub struct TelemetryReaders {
    pub gps: Arc<Latest<GpsFix>>,
    pub environment: Arc<Latest<Environment>>,
    pub power: Arc<Latest<PowerSample>>,
}

impl TelemetryReaders {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            gps: self.gps.load(),
            environment: self.environment.load(),
            power: self.power.load(),
        }
    }
}

/// Start the pollers the config asks for
pub fn spawn(
    config: &Config,
    shutdown: &ShutdownToken,
) -> Result<(TelemetryReaders, Vec<JoinHandle<()>>)> {
    let readers = TelemetryReaders::default();
    let mut handles = Vec::new();

    if let Some(path) = config.telemetry.gps_device.clone() {
        let latest = readers.gps.clone();
        let token = shutdown.clone();
        handles.push(thread::Builder::new().name("gps".into()).spawn(move || {
            if let Err(e) = run_gps_poller(&path, &latest, &token) {
                warn!(%e, path = %path.display(), "GPS poller exited");
            }
        })?);
    }

    let env_dir: Option<PathBuf> = config.telemetry.env_device.clone();
    let power_dir: Option<PathBuf> = config.telemetry.power_supply.clone();
    if env_dir.is_some() || power_dir.is_some() {
        let env = readers.environment.clone();
        let power = readers.power.clone();
        let token = shutdown.clone();
        let interval = Duration::from_millis(config.telemetry.env_interval_ms);
        handles.push(thread::Builder::new().name("environment".into()).spawn(move || {
            run_env_poller(
                env_dir.as_deref(),
                power_dir.as_deref(),
                interval,
                &env,
                &power,
                &token,
            )
        })?);
    }
    Ok((readers, handles))
}

/// Join `handle` if it finishes within `timeout`; otherwise leave it detached.
/// Returns whether the thread was joined.
pub fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            let name = handle.thread().name().unwrap_or("unnamed").to_owned();
            warn!(thread = %name, ?timeout, "Thread did not stop in time, detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!("Joined thread had panicked");
    }
    true
}
