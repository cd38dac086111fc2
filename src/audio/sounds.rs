use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rodio::Source;
use std::f32::consts::TAU;
use std::time::Duration;

const SAMPLE_RATE: u32 = 44_100;

/// Integrated white noise with a leak so it never drifts off centre.
struct BrownWalk {
    value: f32,
    rng: StdRng,
}

impl BrownWalk {
    fn new() -> Self {
        Self {
            value: 0.0,
            rng: StdRng::from_entropy(),
        }
    }

    fn next_sample(&mut self) -> f32 {
        let white: f32 = self.rng.gen_range(-1.0..1.0);
        self.value = ((self.value + white * 0.02) * 0.9999).clamp(-1.0, 1.0);
        self.value
    }
}

/// Endless low rumble for falling asleep.
pub struct BrownNoise {
    walk: BrownWalk,
}

impl BrownNoise {
    pub fn new() -> Self {
        Self {
            walk: BrownWalk::new(),
        }
    }
}

impl Iterator for BrownNoise {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        Some(self.walk.next_sample() * 0.3)
    }
}

impl Source for BrownNoise {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Endless rain: high-passed brown noise, slowly swelling, with sparse
/// droplet clicks on top.
pub struct Rain {
    walk: BrownWalk,
    previous_input: f32,
    previous_output: f32,
    droplet: f32,
    swell_phase: f32,
}

impl Rain {
    pub fn new() -> Self {
        Self {
            walk: BrownWalk::new(),
            previous_input: 0.0,
            previous_output: 0.0,
            droplet: 0.0,
            swell_phase: 0.0,
        }
    }

    fn high_pass(&mut self, input: f32) -> f32 {
        let output = 0.95 * (self.previous_output + input - self.previous_input);
        self.previous_input = input;
        self.previous_output = output;
        output
    }
}

impl Iterator for Rain {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.walk.next_sample();
        let hiss = self.high_pass(sample);

        if self.walk.rng.gen_bool(0.0004) {
            self.droplet = self.walk.rng.gen_range(0.2..0.6);
        }
        self.droplet *= 0.995;
        let click = self.droplet * self.walk.rng.gen_range(-1.0..1.0_f32);

        self.swell_phase = (self.swell_phase + 0.25 / SAMPLE_RATE as f32) % TAU;
        let swell = 0.75 + 0.25 * self.swell_phase.sin();

        Some(((hiss * 2.5 + click * 0.3) * swell).clamp(-1.0, 1.0) * 0.35)
    }
}

impl Source for Rain {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

const CHIME_TONES_HZ: [f32; 3] = [880.0, 1_108.7, 1_318.5];
const CHIME_TONE_SECS: f32 = 0.35;
const CHIME_PAUSE_SECS: f32 = 0.9;

/// One alarm phrase: three rising tones then silence. Finite, so it can be
/// repeated for as long as the alarm sounds.
pub struct AlarmChime {
    position: usize,
    tone_len: usize,
    total_len: usize,
}

impl AlarmChime {
    pub fn new() -> Self {
        let tone_len = (CHIME_TONE_SECS * SAMPLE_RATE as f32) as usize;
        let pause_len = (CHIME_PAUSE_SECS * SAMPLE_RATE as f32) as usize;
        Self {
            position: 0,
            tone_len,
            total_len: tone_len * CHIME_TONES_HZ.len() + pause_len,
        }
    }
}

impl Iterator for AlarmChime {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.position >= self.total_len {
            return None;
        }
        let index = self.position / self.tone_len;
        let offset = self.position % self.tone_len;
        self.position += 1;

        let Some(frequency) = CHIME_TONES_HZ.get(index) else {
            return Some(0.0);
        };
        let t = offset as f32 / SAMPLE_RATE as f32;
        let envelope = (1.0 - offset as f32 / self.tone_len as f32).powi(2);
        Some((TAU * frequency * t).sin() * envelope * 0.5)
    }
}

impl Source for AlarmChime {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.total_len - self.position.min(self.total_len))
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs_f32(
            self.total_len as f32 / SAMPLE_RATE as f32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_stays_in_range() {
        let mut noise = BrownNoise::new();
        let mut rain = Rain::new();
        for _ in 0..SAMPLE_RATE {
            let sample = noise.next().unwrap();
            assert!((-1.0..=1.0).contains(&sample));
            let sample = rain.next().unwrap();
            assert!((-1.0..=1.0).contains(&sample));
        }
    }

    #[test]
    fn chime_is_finite_and_ends_in_silence() {
        let chime = AlarmChime::new();
        let expected = chime.total_len;
        let samples: Vec<f32> = chime.collect();

        assert_eq!(samples.len(), expected);
        assert!(samples.iter().any(|sample| sample.abs() > 0.1));
        assert!(samples.iter().rev().take(1_000).all(|sample| *sample == 0.0));
    }
}
