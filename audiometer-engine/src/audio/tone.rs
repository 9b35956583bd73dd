//! Sine tone generator
//!
//! Produces stereo frames for the output callback. A tone is written to
//! exactly one channel; the other channel is always 0.0. Onset and offset
//! use linear ramps to avoid audible clicks.

use audiometer_common::Ear;
use std::f64::consts::TAU;

/// One stereo sample pair
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioFrame {
    pub left: f32,
    pub right: f32,
}

impl AudioFrame {
    /// Silent frame (0.0, 0.0)
    pub fn zero() -> Self {
        AudioFrame::default()
    }

    /// Frame carrying `sample` on the channel of `ear` only
    pub fn for_ear(ear: Ear, sample: f32) -> Self {
        match ear {
            Ear::Left => AudioFrame { left: sample, right: 0.0 },
            Ear::Right => AudioFrame { left: 0.0, right: sample },
        }
    }
}

/// Convert a dBFS gain to a linear amplitude
pub fn dbfs_to_amplitude(dbfs: f64) -> f32 {
    10f64.powf(dbfs / 20.0) as f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Envelope {
    Idle,
    Attack,
    Sustain,
    Release,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTone {
    ear: Ear,
    phase_step: f64,
    amplitude: f32,
}

/// Tone generator with attack/release envelope
#[derive(Debug)]
pub struct ToneGenerator {
    attack_step: f32,
    release_step: f32,
    sample_rate: u32,
    tone: Option<ActiveTone>,
    envelope: Envelope,
    gain: f32,
    phase: f64,
}

impl ToneGenerator {
    pub fn new(sample_rate: u32, attack_ms: f64, release_ms: f64) -> Self {
        Self {
            attack_step: ramp_step(sample_rate, attack_ms),
            release_step: ramp_step(sample_rate, release_ms),
            sample_rate,
            tone: None,
            envelope: Envelope::Idle,
            gain: 0.0,
            phase: 0.0,
        }
    }

    /// Start a tone, restarting phase and envelope
    pub fn start(&mut self, ear: Ear, frequency_hz: u32, amplitude: f32) {
        self.tone = Some(ActiveTone {
            ear,
            phase_step: TAU * frequency_hz as f64 / self.sample_rate as f64,
            amplitude: amplitude.clamp(0.0, 1.0),
        });
        self.envelope = Envelope::Attack;
        self.gain = 0.0;
        self.phase = 0.0;
    }

    /// Begin the release ramp
    pub fn release(&mut self) {
        if self.tone.is_some() && self.envelope != Envelope::Idle {
            self.envelope = Envelope::Release;
        }
    }

    /// Cut the tone immediately, skipping the release ramp
    pub fn silence(&mut self) {
        self.tone = None;
        self.envelope = Envelope::Idle;
        self.gain = 0.0;
    }

    /// True once the release ramp has finished
    pub fn is_silent(&self) -> bool {
        self.envelope == Envelope::Idle
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next output frame
    pub fn next_frame(&mut self) -> AudioFrame {
        let tone = match self.tone {
            Some(tone) if self.envelope != Envelope::Idle => tone,
            _ => return AudioFrame::zero(),
        };

        match self.envelope {
            Envelope::Attack => {
                self.gain += self.attack_step;
                if self.gain >= 1.0 {
                    self.gain = 1.0;
                    self.envelope = Envelope::Sustain;
                }
            }
            Envelope::Release => {
                self.gain -= self.release_step;
                if self.gain <= 0.0 {
                    self.gain = 0.0;
                    self.envelope = Envelope::Idle;
                    self.tone = None;
                    return AudioFrame::zero();
                }
            }
            Envelope::Sustain | Envelope::Idle => {}
        }

        let sample = (self.phase.sin() as f32) * tone.amplitude * self.gain;
        self.phase = (self.phase + tone.phase_step) % TAU;
        AudioFrame::for_ear(tone.ear, sample)
    }
}

fn ramp_step(sample_rate: u32, ramp_ms: f64) -> f32 {
    let samples = (sample_rate as f64 * ramp_ms / 1000.0).max(1.0);
    (1.0 / samples) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_when_idle() {
        let mut generator = ToneGenerator::new(44100, 30.0, 40.0);
        assert!(generator.is_silent());
        assert_eq!(generator.next_frame(), AudioFrame::zero());
    }

    #[test]
    fn test_channel_isolation() {
        for ear in [Ear::Left, Ear::Right] {
            let mut generator = ToneGenerator::new(44100, 1.0, 1.0);
            generator.start(ear, 1000, 0.5);
            let mut energy = 0.0f32;
            for _ in 0..4410 {
                let frame = generator.next_frame();
                match ear {
                    Ear::Left => {
                        assert_eq!(frame.right, 0.0);
                        energy += frame.left.abs();
                    }
                    Ear::Right => {
                        assert_eq!(frame.left, 0.0);
                        energy += frame.right.abs();
                    }
                }
            }
            assert!(energy > 0.0);
        }
    }

    #[test]
    fn test_attack_ramp_bounds_amplitude() {
        let mut generator = ToneGenerator::new(1000, 10.0, 10.0);
        generator.start(Ear::Right, 250, 1.0);
        // 10 ms attack at 1 kHz = 10 samples; the first frames stay below full gain
        let first = generator.next_frame();
        assert!(first.right.abs() <= 0.1 + f32::EPSILON);
        for _ in 0..100 {
            assert!(generator.next_frame().right.abs() <= 1.0);
        }
    }

    #[test]
    fn test_release_reaches_silence() {
        let mut generator = ToneGenerator::new(1000, 5.0, 20.0);
        generator.start(Ear::Left, 100, 0.8);
        for _ in 0..50 {
            generator.next_frame();
        }
        generator.release();
        assert!(!generator.is_silent());
        for _ in 0..25 {
            generator.next_frame();
        }
        assert!(generator.is_silent());
        assert_eq!(generator.next_frame(), AudioFrame::zero());
    }

    #[test]
    fn test_dbfs_to_amplitude() {
        assert!((dbfs_to_amplitude(0.0) - 1.0).abs() < 1e-6);
        assert!((dbfs_to_amplitude(-20.0) - 0.1).abs() < 1e-6);
    }
}
