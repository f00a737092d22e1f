//! Forwards the node's telemetry ring to the log.
//!
//! The node keeps its events in a fixed ring; the bus task drains new
//! records after every loop pass and mirrors them to defmt on the target or
//! stdout on the host.

use node_core::telemetry::{EventId, TelemetryEventKind, TelemetryRecord, TelemetryRecorder};

/// Tracks which telemetry records have already been logged.
#[derive(Debug, Default)]
pub struct TelemetryDrain {
    next: EventId,
}

impl TelemetryDrain {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Passes every record not seen yet to `emit`, oldest first.
    ///
    /// Returns the number of records the ring overwrote before they could be
    /// drained.
    pub fn drain<const N: usize>(
        &mut self,
        recorder: &TelemetryRecorder<N>,
        mut emit: impl FnMut(&TelemetryRecord),
    ) -> u32 {
        let missed = recorder.oldest_first().next().map_or(0, |oldest| {
            let gap = oldest.id.wrapping_sub(self.next);
            if gap < 0x8000_0000 { gap } else { 0 }
        });

        for record in recorder.since(self.next) {
            emit(record);
        }
        self.next = recorder.next_id();
        missed
    }
}

/// Severity a record is logged at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
}

/// Faults on the bus or with clients are warnings, everything else is info.
#[must_use]
pub const fn severity(event: &TelemetryEventKind) -> Severity {
    match event {
        TelemetryEventKind::FramingError(_)
        | TelemetryEventKind::Rejected { .. }
        | TelemetryEventKind::ClientGaveUp { .. }
        | TelemetryEventKind::ConfirmWalkAborted
        | TelemetryEventKind::TransmitOverflow => Severity::Warn,
        _ => Severity::Info,
    }
}

/// Logs one record.
pub fn emit_record(record: &TelemetryRecord) {
    emit_log(severity(&record.event), record.timestamp_ms, &record.event);
}

/// Logs how many records were lost to ring overwrite.
pub fn emit_missed(count: u32) {
    if count > 0 {
        emit_gap(count);
    }
}

#[cfg(target_os = "none")]
fn emit_log(severity: Severity, timestamp_ms: u32, event: &TelemetryEventKind) {
    match severity {
        Severity::Info => defmt::info!(
            "telemetry t={}ms {}",
            timestamp_ms,
            defmt::Display2Format(event)
        ),
        Severity::Warn => defmt::warn!(
            "telemetry t={}ms {}",
            timestamp_ms,
            defmt::Display2Format(event)
        ),
    }
}

#[cfg(not(target_os = "none"))]
fn emit_log(severity: Severity, timestamp_ms: u32, event: &TelemetryEventKind) {
    let label = match severity {
        Severity::Info => "info",
        Severity::Warn => "warn",
    };
    println!("{label} telemetry t={timestamp_ms}ms {event}");
}

#[cfg(target_os = "none")]
fn emit_gap(count: u32) {
    defmt::warn!("telemetry: {} records overwritten", count);
}

#[cfg(not(target_os = "none"))]
fn emit_gap(count: u32) {
    println!("warn telemetry: {count} records overwritten");
}
