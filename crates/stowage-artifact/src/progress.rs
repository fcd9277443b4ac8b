//! Parsing of task log output
//!
//! The download pod's `progress-monitor` sidecar prints one JSON record per
//! line; the check-size container prints a single JSON line with the
//! discovered size. Only the last line of each log is ever read.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Largest size a check-size run may report (1 PiB)
pub const MAX_REASONABLE_SIZE_BYTES: i64 = 1 << 50;

/// Display value used once a download has failed
pub const DISPLAY_NOT_AVAILABLE: &str = "N/A";

/// Kind of progress record emitted by the monitor sidecar
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Monitoring started
    Start,
    /// Periodic size sample
    Progress,
    /// The monitor saw the expected size reached
    Complete,
    /// The monitor was stopped; says nothing about the download outcome
    Terminated,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressRecord {
    #[serde(rename = "type")]
    kind: RecordKind,
    #[serde(default)]
    current_bytes: i64,
    #[serde(default)]
    expected_bytes: i64,
}

/// Download progress derived from a single record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Bytes present in the cache
    pub downloaded_bytes: i64,
    /// Bytes expected in total
    pub total_bytes: i64,
    /// Completion percentage in `[0, 100]`
    pub percentage: i32,
}

impl Progress {
    /// Progress of a finished download of `total_bytes`
    pub fn complete(total_bytes: i64) -> Self {
        Self {
            downloaded_bytes: total_bytes,
            total_bytes,
            percentage: 100,
        }
    }

    /// Display form, e.g. `"45 %"`
    pub fn display(&self) -> String {
        format!("{} %", self.percentage)
    }
}

/// `floor(current * 100 / expected)` clamped to `[0, 100]`.
///
/// Multiplication happens first, in 128-bit, so small fractions of very
/// large artifacts are not truncated to zero.
pub fn compute_percentage(current_bytes: i64, expected_bytes: i64) -> i32 {
    if expected_bytes <= 0 || current_bytes <= 0 {
        return 0;
    }
    let pct = i128::from(current_bytes) * 100 / i128::from(expected_bytes);
    // clamped to 0..=100 so the cast is lossless
    pct.clamp(0, 100) as i32
}

/// Parse the last line of the progress monitor's log.
///
/// Empty input, malformed JSON and `terminated` records yield `None`.
/// `complete` forces 100% regardless of the byte counters.
pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let record: ProgressRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, line, "Ignoring unparseable progress line");
            return None;
        }
    };

    let percentage = match record.kind {
        RecordKind::Terminated => return None,
        RecordKind::Complete => 100,
        RecordKind::Start | RecordKind::Progress => {
            compute_percentage(record.current_bytes, record.expected_bytes)
        }
    };

    Some(Progress {
        downloaded_bytes: record.current_bytes.max(0),
        total_bytes: record.expected_bytes.max(0),
        percentage,
    })
}

/// Why a check-size line was rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SizeOutputError {
    /// The container printed nothing
    #[error("no output from check-size task")]
    Empty,
    /// The line is not the expected JSON object
    #[error("failed to parse check-size output: {0}")]
    Malformed(String),
    /// The reported size is non-positive or above the ceiling
    #[error("check-size reported implausible size {0} bytes")]
    OutOfRange(i64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SizeOutput {
    size_bytes: i64,
}

/// Parse the check-size container's `{"url": .., "sizeBytes": ..}` line
pub fn parse_size_output(line: &str) -> Result<i64, SizeOutputError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(SizeOutputError::Empty);
    }
    let output: SizeOutput =
        serde_json::from_str(line).map_err(|e| SizeOutputError::Malformed(e.to_string()))?;
    if output.size_bytes <= 0 || output.size_bytes > MAX_REASONABLE_SIZE_BYTES {
        return Err(SizeOutputError::OutOfRange(output.size_bytes));
    }
    Ok(output.size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_record_yields_floor_percentage() {
        let p = parse_progress_line(
            r#"{"type":"progress","currentBytes":455,"expectedBytes":1000}"#,
        )
        .unwrap();
        assert_eq!(p.percentage, 45);
        assert_eq!(p.downloaded_bytes, 455);
        assert_eq!(p.total_bytes, 1000);
        assert_eq!(p.display(), "45 %");
    }

    #[test]
    fn start_record_counts_as_progress() {
        let p = parse_progress_line(r#"{"type":"start","currentBytes":0,"expectedBytes":10}"#)
            .unwrap();
        assert_eq!(p.percentage, 0);
    }

    #[test]
    fn complete_forces_one_hundred() {
        let p = parse_progress_line(
            r#"{"type":"complete","currentBytes":990,"expectedBytes":1000}"#,
        )
        .unwrap();
        assert_eq!(p.percentage, 100);
    }

    #[test]
    fn terminated_is_discarded() {
        assert!(parse_progress_line(
            r#"{"type":"terminated","currentBytes":1000,"expectedBytes":1000}"#
        )
        .is_none());
    }

    #[test]
    fn garbage_is_discarded() {
        assert!(parse_progress_line("").is_none());
        assert!(parse_progress_line("   ").is_none());
        assert!(parse_progress_line("Downloading shard 3/7").is_none());
        assert!(parse_progress_line(r#"{"type":"bogus","currentBytes":1}"#).is_none());
    }

    #[test]
    fn percentage_stays_in_bounds() {
        assert_eq!(compute_percentage(2000, 1000), 100);
        assert_eq!(compute_percentage(-5, 1000), 0);
        assert_eq!(compute_percentage(5, 0), 0);
        assert_eq!(compute_percentage(5, -1), 0);
        assert_eq!(compute_percentage(i64::MAX, i64::MAX), 100);
        for current in [0_i64, 1, 9, 10, 499, 500, 999, 1000, 1001, 5000] {
            let pct = compute_percentage(current, 1000);
            assert!((0..=100).contains(&pct), "{current} gave {pct}");
        }
    }

    #[test]
    fn small_progress_on_huge_artifacts_is_not_lost() {
        let expected = 500_i64 << 30;
        assert_eq!(compute_percentage(expected / 50, expected), 2);
    }

    #[test]
    fn size_output_parses_valid_line() {
        let size = parse_size_output(r#"{"url":"hf://org/model","sizeBytes":16106127360}"#);
        assert_eq!(size, Ok(16_106_127_360));
    }

    #[test]
    fn size_output_rejects_bad_values() {
        assert_eq!(parse_size_output(""), Err(SizeOutputError::Empty));
        assert!(matches!(
            parse_size_output("Traceback (most recent call last):"),
            Err(SizeOutputError::Malformed(_))
        ));
        assert_eq!(
            parse_size_output(r#"{"url":"hf://a/b","sizeBytes":0}"#),
            Err(SizeOutputError::OutOfRange(0))
        );
        assert_eq!(
            parse_size_output(r#"{"url":"hf://a/b","sizeBytes":-4}"#),
            Err(SizeOutputError::OutOfRange(-4))
        );
        let too_big = MAX_REASONABLE_SIZE_BYTES + 1;
        assert_eq!(
            parse_size_output(&format!(r#"{{"url":"hf://a/b","sizeBytes":{too_big}}}"#)),
            Err(SizeOutputError::OutOfRange(too_big))
        );
    }
}
