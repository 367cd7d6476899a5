use chrono::Utc;
use log::{debug, warn};

use crate::error::RigError;
use crate::types::RawSample;

/// Parse one streamed line: `u,v,w,snr,correlation,depth,amplitude,temperature`.
///
/// Blank fields are dropped before counting, so trailing commas are harmless.
/// Fields beyond the eighth are ignored.
pub fn parse_sample_line(text: &str, expected_fields: usize) -> Result<RawSample, RigError> {
    let parts: Vec<&str> = text
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let required = expected_fields.max(8);
    if parts.len() < required {
        return Err(RigError::ProtocolParse(format!(
            "incomplete sample line ({} of {} fields): {:?}",
            parts.len(),
            required,
            text
        )));
    }

    let mut values = [0.0f64; 8];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| {
                RigError::ProtocolParse(format!("non-numeric field {:?} in {:?}", part, text))
            })?;
    }
    let [u, v, w, snr, correlation, depth, amplitude, temperature] = values;

    debug!("Parsed sample: u={u:.3}, v={v:.3}, w={w:.3}, SNR={snr:.1}");
    Ok(RawSample {
        u,
        v,
        w,
        snr,
        correlation,
        depth,
        amplitude,
        temperature,
        valid: true,
        timestamp: Utc::now(),
    })
}

/// Apply the SNR/correlation gate and record the verdict on the sample.
///
/// Excessive velocity is only reported; it does not invalidate the sample.
pub fn validate_sample(sample: &mut RawSample, min_snr: f64, min_correlation: f64) -> bool {
    sample.valid = if sample.snr < min_snr {
        debug!("Sample SNR too low: {:.1} < {}", sample.snr, min_snr);
        false
    } else if sample.correlation < min_correlation {
        debug!(
            "Sample correlation too low: {:.1} < {}",
            sample.correlation, min_correlation
        );
        false
    } else {
        true
    };

    if sample.is_anomalous() {
        warn!(
            "Velocity magnitude unusually high: {:.2} m/s",
            sample.velocity_magnitude()
        );
    }
    sample.valid
}
