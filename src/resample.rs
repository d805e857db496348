//! Converts decoded source frames to the output device's channel count and sample rate.

use rubato::{FftFixedIn, Resampler};

use crate::error::DeviceError;

/// Input frames per resampler chunk.
const CHUNK_FRAMES: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Maps one interleaved source frame onto `output_channels` channels.
///
/// Mono fans out to every output channel, a mono output averages every source channel,
/// and otherwise source channels are taken in order, wrapping when the output is wider.
pub fn map_frame(frame: &[f32], output: &mut [f32]) {
    if frame.is_empty() {
        output.fill(0.0);
        return;
    }
    if output.len() == 1 && frame.len() > 1 {
        output[0] = frame.iter().sum::<f32>() / frame.len() as f32;
        return;
    }
    for (channel, sample) in output.iter_mut().enumerate() {
        *sample = frame[channel % frame.len()];
    }
}

/// Streaming converter: channel mapping first, then `rubato` when the rates differ.
pub struct FrameConverter {
    source_channels: usize,
    output_channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    /// Planar frames waiting for a full resampler chunk.
    pending: Vec<Vec<f32>>,
    delay_remaining: usize,
}

impl FrameConverter {
    pub fn new(
        source_rate: u32,
        source_channels: usize,
        output_rate: u32,
        output_channels: usize,
    ) -> Result<Self, DeviceError> {
        let resampler = if source_rate != output_rate {
            let resampler = FftFixedIn::<f32>::new(
                source_rate as usize,
                output_rate as usize,
                CHUNK_FRAMES,
                SUB_CHUNKS,
                output_channels,
            )
            .map_err(|err| DeviceError::Resample(err.to_string()))?;
            Some(resampler)
        } else {
            None
        };
        let delay_remaining = resampler
            .as_ref()
            .map_or(0, |resampler| resampler.output_delay());
        Ok(Self {
            source_channels: source_channels.max(1),
            output_channels: output_channels.max(1),
            resampler,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES); output_channels.max(1)],
            delay_remaining,
        })
    }

    /// Accepts interleaved source samples and returns whatever interleaved output is
    /// ready. Frames short of a full resampler chunk stay queued.
    pub fn push(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, DeviceError> {
        let mut mapped = vec![0.0; self.output_channels];
        for frame in interleaved.chunks_exact(self.source_channels) {
            map_frame(frame, &mut mapped);
            for (channel, sample) in mapped.iter().enumerate() {
                self.pending[channel].push(*sample);
            }
        }

        let Some(resampler) = self.resampler.as_mut() else {
            let planar = std::mem::replace(
                &mut self.pending,
                vec![Vec::new(); self.output_channels],
            );
            return Ok(interleave(&planar, &mut self.delay_remaining));
        };

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let planar = resampler
                .process(&chunk, None)
                .map_err(|err| DeviceError::Resample(err.to_string()))?;
            output.extend(interleave(&planar, &mut self.delay_remaining));
        }
        Ok(output)
    }

    /// Flushes queued frames and the resampler's internal delay at end of stream.
    pub fn finish(&mut self) -> Result<Vec<f32>, DeviceError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return self.push(&[]);
        };
        let mut output = Vec::new();
        if !self.pending[0].is_empty() {
            let chunk = std::mem::replace(
                &mut self.pending,
                vec![Vec::new(); self.output_channels],
            );
            let planar = resampler
                .process_partial(Some(chunk.as_slice()), None)
                .map_err(|err| DeviceError::Resample(err.to_string()))?;
            output.extend(interleave(&planar, &mut self.delay_remaining));
        }
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|err| DeviceError::Resample(err.to_string()))?;
        output.extend(interleave(&tail, &mut self.delay_remaining));
        Ok(output)
    }
}

/// Interleaves planar output, dropping the first `delay_remaining` frames overall.
fn interleave(planar: &[Vec<f32>], delay_remaining: &mut usize) -> Vec<f32> {
    let frames = planar.first().map_or(0, Vec::len);
    let skip = (*delay_remaining).min(frames);
    *delay_remaining -= skip;
    let mut interleaved = Vec::with_capacity((frames - skip) * planar.len());
    for frame in skip..frames {
        for channel in planar {
            interleaved.push(channel[frame]);
        }
    }
    interleaved
}
