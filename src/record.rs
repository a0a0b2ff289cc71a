//! Per-cycle measurement records
//!
//! The set of columns is fixed for a run and derived once from the config
//! as a [`Schema`]. Records are plain value vectors in schema order, so
//! assembling and rendering a row never looks anything up by name.

use std::{collections::HashSet, fmt};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    peak::PhasePeaks, telemetry::TelemetrySnapshot, tfmap::TfMap, Config, Error, Phase, Result,
    MAX_CHANNELS,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Timestamp,
    UnixTime,
    AdcClockCountPerPps,
    MaxVolt(Phase),
    MaxTimeOff(Phase),
    MinVolt(Phase),
    MinTimeOff(Phase),
    T2(Phase),
    W2(Phase),
    SqPeak(Phase),
    SqPeakTimeOff(Phase),
    TemperatureC,
    HumidityPct,
    PressureHpa,
    GpsTime,
    Latitude,
    Longitude,
    AltitudeM,
    GpsFix,
    GpsSatellites,
    BatteryVolt,
    BatteryCurrent,
    BatteryCapacity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Float,
    Int,
    Text,
}

impl Field {
    pub fn phase(&self) -> Option<Phase> {
        match *self {
            Field::MaxVolt(p)
            | Field::MaxTimeOff(p)
            | Field::MinVolt(p)
            | Field::MinTimeOff(p)
            | Field::T2(p)
            | Field::W2(p)
            | Field::SqPeak(p)
            | Field::SqPeakTimeOff(p) => Some(p),
            _ => None,
        }
    }

    /// Column name in the log header
    pub fn name(&self) -> String {
        let per_phase = |p: Phase, suffix: &str| format!("{}_{suffix}", p.name());
        match *self {
            Field::Timestamp => "timestamp".to_owned(),
            Field::UnixTime => "unix_time".to_owned(),
            Field::AdcClockCountPerPps => "adc_clock_count_per_pps".to_owned(),
            Field::MaxVolt(p) => per_phase(p, "max_volt"),
            Field::MaxTimeOff(p) => per_phase(p, "max_time_off"),
            Field::MinVolt(p) => per_phase(p, "min_volt"),
            Field::MinTimeOff(p) => per_phase(p, "min_time_off"),
            Field::T2(p) => per_phase(p, "t2"),
            Field::W2(p) => per_phase(p, "w2"),
            Field::SqPeak(p) => per_phase(p, "sq_peak"),
            Field::SqPeakTimeOff(p) => per_phase(p, "sq_peak_time_off"),
            Field::TemperatureC => "temperature_c".to_owned(),
            Field::HumidityPct => "humidity_pct".to_owned(),
            Field::PressureHpa => "pressure_hpa".to_owned(),
            Field::GpsTime => "gps_time".to_owned(),
            Field::Latitude => "latitude".to_owned(),
            Field::Longitude => "longitude".to_owned(),
            Field::AltitudeM => "altitude_m".to_owned(),
            Field::GpsFix => "gps_fix".to_owned(),
            Field::GpsSatellites => "gps_satellites".to_owned(),
            Field::BatteryVolt => "battery_volt".to_owned(),
            Field::BatteryCurrent => "battery_current".to_owned(),
            Field::BatteryCapacity => "battery_capacity".to_owned(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Field::Timestamp | Field::GpsTime => Kind::Text,
            Field::AdcClockCountPerPps
            | Field::GpsFix
            | Field::GpsSatellites
            | Field::BatteryCapacity => Kind::Int,
            _ => Kind::Float,
        }
    }
}

/// Ordered, validated list of log columns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Reject duplicate columns and phases that are not captured
    pub fn new(fields: Vec<Field>, channel_count: usize) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(*field) {
                return Err(Error::Schema(format!("duplicate field {}", field.name())));
            }
            if let Some(phase) = field.phase() {
                if phase.index() >= channel_count {
                    return Err(Error::Schema(format!(
                        "field {} refers to phase {phase} but only {channel_count} channels are captured",
                        field.name()
                    )));
                }
            }
        }
        if fields.first() != Some(&Field::Timestamp) {
            return Err(Error::Schema("the first field must be the timestamp".to_owned()));
        }
        Ok(Self { fields })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut fields = vec![
            Field::Timestamp,
            Field::UnixTime,
            Field::AdcClockCountPerPps,
        ];
        for &p in Phase::active(config.acquisition.channel_count) {
            fields.extend([
                Field::MaxVolt(p),
                Field::MaxTimeOff(p),
                Field::MinVolt(p),
                Field::MinTimeOff(p),
                Field::T2(p),
                Field::W2(p),
            ]);
            if config.peak.squared {
                fields.extend([Field::SqPeak(p), Field::SqPeakTimeOff(p)]);
            }
        }
        fields.extend([Field::TemperatureC, Field::HumidityPct, Field::PressureHpa]);
        if config.telemetry.gps_device.is_some() {
            fields.extend([
                Field::GpsTime,
                Field::Latitude,
                Field::Longitude,
                Field::AltitudeM,
                Field::GpsFix,
                Field::GpsSatellites,
            ]);
        }
        if config.telemetry.power_supply.is_some() {
            fields.extend([
                Field::BatteryVolt,
                Field::BatteryCurrent,
                Field::BatteryCapacity,
            ]);
        }
        Self::new(fields, config.acquisition.channel_count)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn position(&self, field: Field) -> Option<usize> {
        self.fields.iter().position(|f| *f == field)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(f64),
    Int(i64),
    Text(String),
    /// Rendered as an empty cell
    Missing,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Display for f64 is the shortest string that parses back exactly
            Value::Float(x) => write!(f, "{x}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(s) => f.write_str(s),
            Value::Missing => Ok(()),
        }
    }
}

impl Value {
    fn parse(field: Field, cell: &str) -> Result<Value> {
        if cell.is_empty() {
            return Ok(Value::Missing);
        }
        let err = || Error::Parse {
            field: field.name(),
            value: cell.to_owned(),
        };
        Ok(match field.kind() {
            Kind::Float => Value::Float(cell.parse().map_err(|_| err())?),
            Kind::Int => Value::Int(cell.parse().map_err(|_| err())?),
            Kind::Text => Value::Text(cell.to_owned()),
        })
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Missing, Into::into)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

/// Per-phase results of one cycle
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseFeatures {
    pub peaks: PhasePeaks,
    pub tf: TfMap,
}

/// Everything the acquisition side contributes to a record
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CycleFeatures {
    /// `None` when the status register could not be read
    pub adc_clock_count_per_pps: Option<u32>,
    pub phases: [Option<PhaseFeatures>; MAX_CHANNELS],
}

/// Capture timestamps are rendered in UTC with microseconds
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRecord {
    timestamp: DateTime<Utc>,
    values: Vec<Value>,
}

fn phase_value(features: &CycleFeatures, field: Field) -> Value {
    let Some(p) = field.phase() else {
        return Value::Missing;
    };
    let Some(ph) = features.phases[p.index()] else {
        return Value::Missing;
    };
    let dominant = ph.peaks.dominant();
    match field {
        Field::MaxVolt(_) => ph.peaks.max.voltage.into(),
        Field::MaxTimeOff(_) => ph.peaks.max.time_offset.into(),
        Field::MinVolt(_) => ph.peaks.min.voltage.into(),
        Field::MinTimeOff(_) => ph.peaks.min.time_offset.into(),
        Field::T2(_) => ph.tf.t2.into(),
        Field::W2(_) => ph.tf.f2.into(),
        Field::SqPeak(_) => (dominant.voltage * dominant.voltage).into(),
        Field::SqPeakTimeOff(_) => dominant.time_offset.into(),
        _ => Value::Missing,
    }
}

/// Build the record for one cycle. No I/O.
pub fn assemble(
    schema: &Schema,
    features: &CycleFeatures,
    telemetry: &TelemetrySnapshot,
    timestamp: DateTime<Utc>,
) -> MeasurementRecord {
    let env = telemetry.environment.as_deref();
    let gps = telemetry.gps.as_deref();
    let power = telemetry.power.as_deref();
    let values = schema
        .fields()
        .iter()
        .map(|&field| match field {
            Field::Timestamp => Value::Text(format_timestamp(&timestamp)),
            Field::UnixTime => {
                Value::Float(timestamp.timestamp() as f64 + f64::from(timestamp.timestamp_subsec_micros()) / 1e6)
            }
            Field::AdcClockCountPerPps => features.adc_clock_count_per_pps.map(i64::from).into(),
            Field::TemperatureC => env.and_then(|e| e.temperature_c).into(),
            Field::HumidityPct => env.and_then(|e| e.humidity_pct).into(),
            Field::PressureHpa => env.and_then(|e| e.pressure_hpa).into(),
            Field::GpsTime => gps
                .and_then(|g| g.time)
                .map_or(Value::Missing, |t| Value::Text(format_timestamp(&t))),
            Field::Latitude => gps.and_then(|g| g.latitude).into(),
            Field::Longitude => gps.and_then(|g| g.longitude).into(),
            Field::AltitudeM => gps.and_then(|g| g.altitude_m).into(),
            Field::GpsFix => gps.map(|g| i64::from(g.fix_quality)).into(),
            Field::GpsSatellites => gps.map(|g| i64::from(g.satellites)).into(),
            Field::BatteryVolt => power.and_then(|p| p.voltage_v).into(),
            Field::BatteryCurrent => power.and_then(|p| p.current_a).into(),
            Field::BatteryCapacity => power.and_then(|p| p.capacity_pct).into(),
            phase_field => phase_value(features, phase_field),
        })
        .collect();
    MeasurementRecord { timestamp, values }
}

fn csv_line<I, S>(cells: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(cells)?;
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))
}

/// The header line for `schema`, newline terminated
pub fn header_row(schema: &Schema) -> Result<Vec<u8>> {
    csv_line(schema.fields().iter().map(Field::name))
}

impl MeasurementRecord {
    /// Capture time of the bank this record describes
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, schema: &Schema, field: Field) -> Option<&Value> {
        schema.position(field).and_then(|i| self.values.get(i))
    }

    /// One newline terminated CSV row
    pub fn to_row(&self) -> Result<Vec<u8>> {
        csv_line(self.values.iter().map(|v| v.to_string()))
    }

    /// Inverse of [`MeasurementRecord::to_row`] for the same schema
    pub fn parse_row(schema: &Schema, row: &[u8]) -> Result<MeasurementRecord> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(row);
        let mut record = csv::StringRecord::new();
        if !reader.read_record(&mut record)? {
            return Err(Error::Schema("empty row".to_owned()));
        }
        if record.len() != schema.len() {
            return Err(Error::Schema(format!(
                "row has {} cells, schema has {} fields",
                record.len(),
                schema.len()
            )));
        }
        let values = schema
            .fields()
            .iter()
            .zip(record.iter())
            .map(|(&field, cell)| Value::parse(field, cell))
            .collect::<Result<Vec<_>>>()?;
        let timestamp = match values.first() {
            Some(Value::Text(ts)) => DateTime::parse_from_rfc3339(ts)
                .map_err(|_| Error::Parse {
                    field: Field::Timestamp.name(),
                    value: ts.clone(),
                })?
                .with_timezone(&Utc),
            _ => return Err(Error::Schema("row has no timestamp".to_owned())),
        };
        Ok(MeasurementRecord { timestamp, values })
    }
}
