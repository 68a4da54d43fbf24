/// Average planar channels into one mono channel.
///
/// Channels of unequal length are cut to the shortest.
pub fn downmix(channels: &[&[f32]]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.to_vec(),
        _ => {
            let len = channels.iter().map(|c| c.len()).min().unwrap_or(0);
            let scale = 1.0 / channels.len() as f32;
            (0..len)
                .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() * scale)
                .collect()
        }
    }
}

/// Average interleaved frames into one mono channel; a trailing partial frame is ignored
pub fn downmix_interleaved(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let scale = 1.0 / channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Block-average resampling from `native_rate` to `target_rate`.
///
/// Output sample `i` is the mean of input samples in
/// `[round(i * r), round((i + 1) * r))` with `r = native_rate / target_rate`.
/// No anti-alias filter; good enough for speech. Equal rates pass through.
pub fn resample(input: &[f32], native_rate: u32, target_rate: u32) -> Vec<f32> {
    if native_rate == target_rate || input.is_empty() || target_rate == 0 {
        return input.to_vec();
    }

    let ratio = native_rate as f64 / target_rate as f64;
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let last = input.len() - 1;

    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let start = ((i as f64 * ratio).round() as usize).min(input.len());
        let end = (((i + 1) as f64 * ratio).round() as usize).min(input.len());

        if start < end {
            let window = &input[start..end];
            output.push(window.iter().sum::<f32>() / window.len() as f32);
        } else {
            // Upsampling: empty window, repeat the nearest sample
            output.push(input[start.min(last)]);
        }
    }
    output
}

/// Convert one float sample to signed 16-bit, using the full range on both sides
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode float samples as little-endian 16-bit PCM
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&to_pcm16(sample).to_le_bytes());
    }
    bytes
}

/// Peak absolute amplitude
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}
