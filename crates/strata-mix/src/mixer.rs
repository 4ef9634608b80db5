//! The pull-based mixer.

use std::sync::Arc;

use strata_core::{
    i16_from_f32, i24_from_f32, time_to_samples, Result, SampleCount, SampleFormat,
};
use strata_resample::Resampler;
use strata_track::{Channel, TrackCache, WaveTrack};

// Samples grabbed from a track in one go and placed in the queue
// when mixing with resampling.
const QUEUE_MAX_LEN: usize = 65536;
// The queue is cut into blocks of this finer size for resampling;
// each block runs at some constant ratio.
const PROCESS_LEN: usize = 1024;

/// Boolean routing matrix indexed by (input track, output channel).
#[derive(Debug, Clone)]
pub struct MixerSpec {
    map: Vec<Vec<bool>>,
    num_tracks: usize,
    num_channels: usize,
    max_num_channels: usize,
}

impl MixerSpec {
    /// Identity-diagonal routing of `num_tracks` inputs into at most
    /// `max_num_channels` outputs.
    pub fn new(num_tracks: usize, max_num_channels: usize) -> MixerSpec {
        let num_channels = num_tracks.min(max_num_channels);
        let map = (0..num_tracks)
            .map(|i| (0..max_num_channels).map(|j| i == j).collect())
            .collect();
        MixerSpec { map, num_tracks, num_channels, max_num_channels }
    }

    pub fn num_tracks(&self) -> usize {
        self.num_tracks
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn max_num_channels(&self) -> usize {
        self.max_num_channels
    }

    pub fn set_num_channels(&mut self, num_channels: usize) -> bool {
        if num_channels > self.max_num_channels {
            return false;
        }
        self.num_channels = num_channels;
        true
    }

    pub fn get(&self, track: usize, channel: usize) -> bool {
        self.map[track][channel]
    }

    pub fn set(&mut self, track: usize, channel: usize, value: bool) {
        self.map[track][channel] = value;
    }
}

struct MixerInput {
    cache: TrackCache,
    /// Next sample position not yet processed.
    pos: SampleCount,
    queue: Vec<f32>,
    queue_start: usize,
    queue_len: usize,
    resampler: Resampler,
}

/// Pull-based multi-track mixer.
///
/// Call [`Mixer::process`] repeatedly; each call fills the output
/// buffer with up to the requested number of frames and returns how
/// many were produced, or zero when the interval is exhausted.
/// `start_time > stop_time` plays the interval backwards.
pub struct Mixer {
    inputs: Vec<MixerInput>,
    variable_rates: bool,
    apply_track_gains: bool,
    t0: f64,
    t1: f64,
    time: f64,
    speed: f64,
    rate: f64,
    format: SampleFormat,
    interleaved: bool,
    may_throw: bool,
    spec: Option<MixerSpec>,
    num_channels: usize,
    num_buffers: usize,
    buffer_size: usize,
    interleaved_buffer_size: usize,
    /// Public output, converted to `format`.
    buffer: Vec<Vec<u8>>,
    /// Float accumulators, one per output buffer.
    temp: Vec<Vec<f32>>,
    float_buffer: Vec<f32>,
    env_values: Vec<f64>,
    gains: Vec<f32>,
    max_out: usize,
    last_out: usize,
}

impl Mixer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_tracks: Vec<Arc<WaveTrack>>,
        may_throw: bool,
        start_time: f64,
        stop_time: f64,
        num_out_channels: usize,
        out_buffer_size: usize,
        out_interleaved: bool,
        out_rate: f64,
        out_format: SampleFormat,
        high_quality: bool,
        mixer_spec: Option<MixerSpec>,
    ) -> Result<Mixer> {
        let num_tracks = input_tracks.len();

        let spec = mixer_spec.filter(|spec| {
            spec.num_channels() == num_out_channels && spec.num_tracks() == num_tracks
        });

        let (num_buffers, interleaved_buffer_size) = if out_interleaved {
            (1, out_buffer_size * num_out_channels)
        } else {
            (num_out_channels, out_buffer_size)
        };

        let mut inputs = Vec::with_capacity(num_tracks);
        for track in input_tracks {
            let pos = time_to_samples(start_time, track.rate());
            let factor = out_rate / track.rate() as f64;
            // Constant rate per track; variable mode would come from
            // a warping time track.
            let resampler = Resampler::new(high_quality, factor, factor)
                .map_err(|_| strata_core::Error::inconsistency("mixer resampler"))?;
            inputs.push(MixerInput {
                cache: TrackCache::new(track),
                pos,
                queue: vec![0.0; QUEUE_MAX_LEN],
                queue_start: 0,
                queue_len: 0,
                resampler,
            });
        }

        let env_len = QUEUE_MAX_LEN.max(interleaved_buffer_size);

        Ok(Mixer {
            inputs,
            variable_rates: false,
            apply_track_gains: true,
            t0: start_time,
            t1: stop_time,
            time: start_time,
            speed: 1.0,
            rate: out_rate,
            format: out_format,
            interleaved: out_interleaved,
            may_throw,
            spec,
            num_channels: num_out_channels,
            num_buffers,
            buffer_size: out_buffer_size,
            interleaved_buffer_size,
            buffer: vec![Vec::new(); num_buffers],
            temp: vec![vec![0.0; interleaved_buffer_size]; num_buffers],
            float_buffer: vec![0.0; interleaved_buffer_size],
            env_values: vec![0.0; env_len],
            gains: vec![0.0; num_out_channels],
            max_out: 0,
            last_out: 0,
        })
    }

    pub fn set_apply_track_gains(&mut self, apply: bool) {
        self.apply_track_gains = apply;
    }

    /// Current playback time within the mix interval.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// The main (or interleaved) output buffer in the output format.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer[0]
    }

    /// One channel's output buffer in planar mode.
    pub fn channel_buffer(&self, channel: usize) -> &[u8] {
        &self.buffer[if self.interleaved { 0 } else { channel }]
    }

    /// The float accumulator behind [`buffer`], before format
    /// conversion: `last_out * num_channels` interleaved samples, or
    /// `last_out` per channel in planar mode.
    pub fn float_output(&self, channel: usize) -> &[f32] {
        if self.interleaved {
            &self.temp[0][..self.last_out * self.num_channels]
        } else {
            &self.temp[channel][..self.last_out]
        }
    }

    /// Produce up to `max_to_process` output frames. Returns the
    /// number of frames written, 0 when nothing remains.
    pub fn process(&mut self, max_to_process: usize) -> Result<usize> {
        self.max_out = max_to_process.min(self.buffer_size);
        let mut max_out = 0usize;

        for temp in &mut self.temp {
            temp.fill(0.0);
        }

        let backwards = self.t1 < self.t0;
        let mut flags = vec![false; self.num_channels];

        for i in 0..self.inputs.len() {
            let track = Arc::clone(self.inputs[i].cache.track());

            // Channel routing: the matrix wins when present, else the
            // track's channel designation decides.
            match &self.spec {
                Some(spec) => {
                    for (j, flag) in flags.iter_mut().enumerate() {
                        *flag = spec.get(i, j);
                    }
                }
                None => {
                    flags.fill(false);
                    match track.channel() {
                        Channel::Mono => flags.fill(true),
                        Channel::Left => flags[0] = true,
                        Channel::Right => {
                            if self.num_channels >= 2 {
                                flags[1] = true;
                            } else {
                                flags[0] = true;
                            }
                        }
                    }
                }
            }

            let out = if self.variable_rates || track.rate() as f64 != self.rate {
                self.mix_variable_rates(i)?
            } else {
                self.mix_same_rate(i)?
            };
            max_out = max_out.max(out);

            for c in 0..self.num_channels {
                self.gains[c] = if self.apply_track_gains {
                    track.channel_gain(c)
                } else {
                    1.0
                };
            }
            mix_buffers(
                self.num_channels,
                &flags,
                &self.gains,
                &self.float_buffer,
                &mut self.temp,
                out,
                self.interleaved,
            );

            let t = self.inputs[i].pos as f64 / track.rate() as f64;
            if backwards {
                self.time = t.min(self.time).max(self.t1);
            } else {
                self.time = t.max(self.time).min(self.t1);
            }
        }

        // Convert the float accumulators into the public buffers.
        if self.interleaved {
            let frames = max_out * self.num_channels;
            convert_samples(&mut self.buffer[0], &self.temp[0][..frames], self.format);
        } else {
            for c in 0..self.num_buffers {
                convert_samples(&mut self.buffer[c], &self.temp[c][..max_out], self.format);
            }
        }

        self.last_out = max_out;
        Ok(max_out)
    }

    /// Pull through the queue and the per-track resampler: fill the
    /// queue from the cache, weight it by the envelope in place,
    /// reverse when playing backwards, then feed the converter in
    /// `PROCESS_LEN` blocks.
    fn mix_variable_rates(&mut self, index: usize) -> Result<usize> {
        let input = &mut self.inputs[index];
        let track = Arc::clone(input.cache.track());
        let track_rate = track.rate() as f64;
        let initial_warp = self.rate / self.speed / track_rate;
        let backwards = self.t1 < self.t0;

        let t_end = if backwards {
            track.start_time().max(self.t1)
        } else {
            track.end_time().min(self.t1)
        };
        let end_pos = time_to_samples(t_end, track.rate());

        let mut out = 0usize;
        while out < self.max_out {
            if input.queue_len < PROCESS_LEN {
                // Shift the pending portion to the front.
                input
                    .queue
                    .copy_within(input.queue_start..input.queue_start + input.queue_len, 0);
                input.queue_start = 0;

                let available = if backwards {
                    input.pos - end_pos
                } else {
                    end_pos - input.pos
                };
                let get_len = (QUEUE_MAX_LEN - input.queue_len)
                    .min(available.max(0) as usize);

                // Nothing to fetch past the end of the play interval.
                if get_len > 0 {
                    let fetch_pos = if backwards {
                        input.pos - (get_len as SampleCount - 1)
                    } else {
                        input.pos
                    };

                    let at = input.queue_len;
                    match input.cache.get(fetch_pos, get_len, self.may_throw)? {
                        Some(results) => {
                            input.queue[at..at + get_len].copy_from_slice(results)
                        }
                        None => input.queue[at..at + get_len].fill(0.0),
                    }

                    track.get_envelope_values(
                        &mut self.env_values[..get_len],
                        fetch_pos as f64 / track_rate,
                    );
                    for (sample, env) in input.queue[at..at + get_len]
                        .iter_mut()
                        .zip(&self.env_values[..get_len])
                    {
                        *sample *= *env as f32;
                    }

                    if backwards {
                        input.pos -= get_len as SampleCount;
                        input.queue[at..at + get_len].reverse();
                    } else {
                        input.pos += get_len as SampleCount;
                    }

                    input.queue_len += get_len;
                }
            }

            let last = input.queue_len < PROCESS_LEN;
            let this_process_len = if last { input.queue_len } else { PROCESS_LEN };

            let factor = initial_warp;
            let (used, written) = input
                .resampler
                .process(
                    factor,
                    &input.queue[input.queue_start..input.queue_start + this_process_len],
                    last,
                    &mut self.float_buffer[out..self.max_out],
                )
                .map_err(|_| strata_core::Error::inconsistency("mix resampling"))?;

            input.queue_start += used;
            input.queue_len -= used;
            out += written;

            if last {
                break;
            }
        }

        Ok(out)
    }

    /// Straight read at output rate: fetch, weight by the envelope,
    /// reverse if needed.
    fn mix_same_rate(&mut self, index: usize) -> Result<usize> {
        let input = &mut self.inputs[index];
        let track = Arc::clone(input.cache.track());
        let track_rate = track.rate() as f64;
        let backwards = self.t1 < self.t0;

        let t = input.pos as f64 / track_rate;
        let t_end = if backwards {
            track.start_time().max(self.t1)
        } else {
            track.end_time().min(self.t1)
        };

        // At the end of the selection or the track: done.
        if backwards {
            if t <= t_end {
                return Ok(0);
            }
        } else if t >= t_end {
            return Ok(0);
        }

        let span = if backwards { t - t_end } else { t_end - t };
        let slen = self.max_out.min((span * track_rate + 0.5) as usize);
        if slen == 0 {
            return Ok(0);
        }

        let fetch_pos = if backwards {
            input.pos - (slen as SampleCount - 1)
        } else {
            input.pos
        };
        match input.cache.get(fetch_pos, slen, self.may_throw)? {
            Some(results) => self.float_buffer[..slen].copy_from_slice(results),
            None => self.float_buffer[..slen].fill(0.0),
        }

        let env_t0 = if backwards {
            t - (slen as f64 - 1.0) / track_rate
        } else {
            t
        };
        track.get_envelope_values(&mut self.env_values[..slen], env_t0);
        for (sample, env) in self.float_buffer[..slen]
            .iter_mut()
            .zip(&self.env_values[..slen])
        {
            *sample *= *env as f32;
        }

        if backwards {
            self.float_buffer[..slen].reverse();
            input.pos -= slen as SampleCount;
        } else {
            input.pos += slen as SampleCount;
        }

        Ok(slen)
    }
}

/// Sum a track's scratch into the accumulators at the positions the
/// routing flags select.
fn mix_buffers(
    num_channels: usize,
    flags: &[bool],
    gains: &[f32],
    src: &[f32],
    dests: &mut [Vec<f32>],
    len: usize,
    interleaved: bool,
) {
    for c in 0..num_channels {
        if !flags[c] {
            continue;
        }
        let gain = gains[c];
        if interleaved {
            let dest = &mut dests[0];
            for (j, &sample) in src[..len].iter().enumerate() {
                dest[j * num_channels + c] += sample * gain;
            }
        } else {
            let dest = &mut dests[c];
            for (j, &sample) in src[..len].iter().enumerate() {
                dest[j] += sample * gain;
            }
        }
    }
}

fn convert_samples(dst: &mut Vec<u8>, src: &[f32], format: SampleFormat) {
    dst.clear();
    dst.reserve(src.len() * format.sample_size());
    match format {
        SampleFormat::Int16 => {
            for &s in src {
                dst.extend_from_slice(&i16_from_f32(s).to_ne_bytes());
            }
        }
        SampleFormat::Int24 => {
            for &s in src {
                dst.extend_from_slice(&i24_from_f32(s).to_ne_bytes());
            }
        }
        SampleFormat::Float => {
            for &s in src {
                dst.extend_from_slice(&s.to_ne_bytes());
            }
        }
    }
}
