//! PD event trigger and raw snapshot export
//!
//! The acquisition thread only decides and copies: a triggering phase's
//! slice is copied out of the completed bank into an `rtrb` ring, and a
//! helper thread does the file I/O. A full ring drops the snapshot rather
//! than delaying the next readiness wait.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, info, warn};

use crate::{
    capture::CaptureBuffer,
    monitoring::{bump, Counters},
    peak::PeakSet,
    shutdown::ShutdownToken,
    Phase, Result,
};

const SAVER_IDLE: Duration = Duration::from_millis(20);

/// The phase with the strictly largest max voltage above `threshold`.
/// Ties go to the earlier phase in red, white, blue order.
pub fn evaluate(peaks: &PeakSet, threshold: f64) -> Option<Phase> {
    let mut best: Option<(Phase, f64)> = None;
    for phase in Phase::ALL {
        let Some(p) = &peaks[phase.index()] else {
            continue;
        };
        let v = p.max.voltage;
        if v > threshold && best.map_or(true, |(_, b)| v > b) {
            best = Some((phase, v));
        }
    }
    best.map(|(phase, _)| phase)
}

/// Raw samples of one triggering capture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    /// Little-endian 16-bit samples as they sat in the capture region
    pub samples: Vec<u8>,
    /// The other phases of the same capture, when audit copies are enabled
    pub audit: Vec<(Phase, Vec<u8>)>,
}

pub struct SnapshotQueue {
    producer: Producer<SnapshotRequest>,
    all_phases: bool,
    counters: Arc<Counters>,
}

pub fn snapshot_channel(
    capacity: usize,
    all_phases: bool,
    counters: Arc<Counters>,
) -> (SnapshotQueue, Consumer<SnapshotRequest>) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        SnapshotQueue {
            producer,
            all_phases,
            counters,
        },
        consumer,
    )
}

impl SnapshotQueue {
    /// Copy `phase` of the completed `bank` out for saving. Returns whether
    /// the request was queued.
    pub fn request(
        &mut self,
        buffer: &CaptureBuffer,
        bank: usize,
        phase: Phase,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        if self.producer.is_full() {
            let dropped = bump(&self.counters.snapshots_dropped);
            warn!(%phase, dropped, "Snapshot queue full, dropping snapshot");
            return Ok(false);
        }
        let samples = buffer.phase_slice(bank, phase)?.as_bytes().to_vec();
        let mut audit = Vec::new();
        if self.all_phases {
            for &other in Phase::active(buffer.layout().channel_count) {
                if other != phase {
                    audit.push((other, buffer.phase_slice(bank, other)?.as_bytes().to_vec()));
                }
            }
        }
        let request = SnapshotRequest {
            timestamp,
            phase,
            samples,
            audit,
        };
        match self.producer.push(request) {
            Ok(()) => Ok(true),
            Err(_) => {
                bump(&self.counters.snapshots_dropped);
                Ok(false)
            }
        }
    }
}

/// `<dir>/sampledata-<YYYYMMDDTHHMMSS.ffffff>Z`, with `-<phase>` for audit copies
pub fn snapshot_path(dir: &Path, timestamp: &DateTime<Utc>, audit: Option<Phase>) -> PathBuf {
    let mut name = format!("sampledata-{}Z", timestamp.format("%Y%m%dT%H%M%S%.6f"));
    if let Some(phase) = audit {
        name.push('-');
        name.push_str(phase.name());
    }
    dir.join(name)
}

/// Write a snapshot and its audit copies, returning the files written
pub fn save_snapshot(dir: &Path, request: &SnapshotRequest) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let main = snapshot_path(dir, &request.timestamp, None);
    fs::write(&main, &request.samples)?;
    let mut written = vec![main];
    for (phase, samples) in &request.audit {
        let path = snapshot_path(dir, &request.timestamp, Some(*phase));
        fs::write(&path, samples)?;
        written.push(path);
    }
    Ok(written)
}

/// Save queued snapshots until shutdown, then drain what is left
pub fn run_snapshot_saver(
    mut consumer: Consumer<SnapshotRequest>,
    dir: &Path,
    shutdown: &ShutdownToken,
    counters: &Counters,
) {
    info!(dir = %dir.display(), "Snapshot saver started");
    loop {
        match consumer.pop() {
            Ok(request) => match save_snapshot(dir, &request) {
                Ok(files) => {
                    bump(&counters.snapshots_saved);
                    debug!(phase = %request.phase, ?files, "Saved snapshot");
                }
                Err(e) => error!(%e, phase = %request.phase, "Failed to save snapshot"),
            },
            Err(_) => {
                if shutdown.is_triggered() || consumer.is_abandoned() {
                    break;
                }
                // Sleeps the idle interval, or wakes immediately on shutdown
                let _ = shutdown.signal().recv_timeout(SAVER_IDLE);
            }
        }
    }
    info!("Snapshot saver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::BankLayout,
        peak::{Peak, PhasePeaks},
        region::CaptureRegion,
        shutdown::Shutdown,
        AdcPolarity,
    };
    use chrono::TimeZone;
    use std::thread;

    fn peaks(volts: [Option<f64>; 3]) -> PeakSet {
        volts.map(|v| {
            v.map(|voltage| PhasePeaks {
                max: Peak {
                    voltage,
                    ..Default::default()
                },
                min: Peak::default(),
            })
        })
    }

    #[test]
    fn test_evaluate_threshold_and_ties() {
        assert_eq!(evaluate(&peaks([Some(0.1), Some(0.2), Some(0.3)]), 0.5), None);
        assert_eq!(evaluate(&peaks([Some(0.5), None, None]), 0.5), None);
        assert_eq!(
            evaluate(&peaks([Some(0.6), Some(0.9), Some(0.7)]), 0.5),
            Some(Phase::White)
        );
        assert_eq!(
            evaluate(&peaks([Some(0.1), Some(0.8), Some(0.8)]), 0.5),
            Some(Phase::White)
        );
        assert_eq!(evaluate(&peaks([None, None, Some(1.0)]), 0.5), Some(Phase::Blue));
    }

    fn buffer() -> CaptureBuffer {
        let layout = BankLayout {
            bank_count: 2,
            channel_count: 3,
            capture_count: 4,
        };
        let region = CaptureRegion::anonymous(4096, 0x1000_0000).unwrap();
        for (i, phase) in Phase::ALL.iter().enumerate() {
            let offset = layout.slice_offset(1, phase.index()).unwrap();
            region.write_samples(offset, &[i as u16 + 1; 4]).unwrap();
        }
        CaptureBuffer::with_layout(region, layout, AdcPolarity::Signed, None).unwrap()
    }

    #[test]
    fn test_request_copies_and_drops_when_full() {
        let buffer = buffer();
        let counters = Arc::new(Counters::default());
        let (mut queue, mut consumer) = snapshot_channel(1, true, counters.clone());
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert!(queue.request(&buffer, 1, Phase::White, ts).unwrap());
        assert!(!queue.request(&buffer, 1, Phase::Red, ts).unwrap());
        assert_eq!(counters.snapshot().snapshots_dropped, 1);

        let req = consumer.pop().unwrap();
        assert_eq!(req.phase, Phase::White);
        assert_eq!(req.samples, [2, 0, 2, 0, 2, 0, 2, 0]);
        let audit: Vec<Phase> = req.audit.iter().map(|(p, _)| *p).collect();
        assert_eq!(audit, [Phase::Red, Phase::Blue]);
        assert_eq!(req.audit[1].1[0], 3);
    }

    #[test]
    fn test_snapshot_names() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::microseconds(42);
        let dir = Path::new("/data/samples");
        assert_eq!(
            snapshot_path(dir, &ts, None),
            Path::new("/data/samples/sampledata-20240102T030405.000042Z")
        );
        assert_eq!(
            snapshot_path(dir, &ts, Some(Phase::Blue)),
            Path::new("/data/samples/sampledata-20240102T030405.000042Z-blue")
        );
    }

    #[test]
    fn test_saver_writes_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer();
        let counters = Arc::new(Counters::default());
        let (mut queue, consumer) = snapshot_channel(4, false, counters.clone());
        let ts = Utc.with_ymd_and_hms(2024, 7, 8, 9, 10, 11).unwrap();
        queue.request(&buffer, 1, Phase::Blue, ts).unwrap();

        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let path = dir.path().to_path_buf();
        let saver_counters = counters.clone();
        let handle =
            thread::spawn(move || run_snapshot_saver(consumer, &path, &token, &saver_counters));
        shutdown.trigger();
        handle.join().unwrap();

        let bytes = fs::read(snapshot_path(dir.path(), &ts, None)).unwrap();
        assert_eq!(bytes, [3, 0, 3, 0, 3, 0, 3, 0]);
        assert_eq!(counters.snapshot().snapshots_saved, 1);
    }
}
