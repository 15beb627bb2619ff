use std::time::{Duration, SystemTime};

/// Parses a human friendly byte size such as `"10MB"` or `"512 kb"`.
///
/// Plain integers are taken as bytes. Units are powers of 1024.
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(format!("invalid size value: {input:?}"));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid size value: {input:?}"))?;

    let factor: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        "TB" => 1024u64.pow(4),
        other => return Err(format!("invalid size unit: {other:?}")),
    };

    Ok((number * factor as f64) as u64)
}

/// Returns the age of `timestamp` relative to `now`.
///
/// A timestamp in the future counts as zero age rather than an error, since
/// wall clocks on different hosts sharing a backend may disagree slightly.
pub(crate) fn age_of(timestamp: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(timestamp).unwrap_or(Duration::ZERO)
}

/// Invokes the provided callback on drop.
///
/// Used to release claims and bookkeeping on every exit path, including
/// panics and early returns.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Disarms the guard; the callback will not run.
    pub fn disarm(mut self) {
        self.f.take();
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}
