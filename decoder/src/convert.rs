//! PCM format conversion to what RAOP receivers play (44.1 kHz stereo).

use tracing::debug;

/// Duplicates a mono channel into an interleaved stereo pair.
pub fn mono_to_stereo(samples: &[i16]) -> Vec<i16> {
    // ---
    let mut stereo = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        stereo.push(s);
        stereo.push(s);
    }
    stereo
}

/// Resamples interleaved audio using linear interpolation.
///
/// Each channel is interpolated independently. Good enough for the
/// 48 kHz → 44.1 kHz step every Opus track takes; a windowed-sinc
/// resampler would do better on content near Nyquist.
pub fn resample_linear(samples: &[i16], channels: usize, from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let in_frames = samples.len() / channels;
    let ratio = from_rate as f64 / to_rate as f64;
    let out_frames = (in_frames as f64 / ratio) as usize;
    let mut resampled = Vec::with_capacity(out_frames * channels);

    debug!(
        "Resampling {} frames from {}Hz to {}Hz ({} frames)",
        in_frames, from_rate, to_rate, out_frames
    );

    for i in 0..out_frames {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos as usize;

        if src_idx + 1 >= in_frames {
            // Near end, hold the last frame
            let last = (in_frames - 1) * channels;
            resampled.extend_from_slice(&samples[last..last + channels]);
            continue;
        }

        let frac = src_pos - src_idx as f64;
        for ch in 0..channels {
            let s0 = samples[src_idx * channels + ch] as f64;
            let s1 = samples[(src_idx + 1) * channels + ch] as f64;
            resampled.push((s0 + (s1 - s0) * frac).round() as i16);
        }
    }

    resampled
}
