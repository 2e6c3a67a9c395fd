//! Replay gain helpers and the non-owning decoder → session gain link.

use std::sync::Weak;

/// Receiver of live gain updates.
///
/// Implemented by a streaming session so a decoder can forward the gain it
/// carries without holding the session alive.
pub trait GainControl: Send + Sync {
    /// Applies a new gain in dB, effective from the next packet boundary.
    fn set_gain_db(&self, db: f32);

    /// Returns the gain currently in effect, in dB.
    fn gain_db(&self) -> f32;
}

/// Non-owning handle to whatever applies gain for a decoded track.
pub type SessionLink = Weak<dyn GainControl>;

/// Converts a decibel gain to a linear amplitude factor.
pub fn db_to_linear(db: f32) -> f32 {
    // ---
    10f32.powf(db / 20.0)
}

/// Scales samples in place by `factor`, saturating at the i16 range.
pub fn scale_samples(samples: &mut [i16], factor: f32) {
    // ---
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }

    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * factor).round();
        *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}
