//! Tone output using cpal
//!
//! Opens one stereo output stream per session and keeps it running; tones
//! are switched on and off in the shared [`ToneGenerator`] rather than by
//! starting and pausing the device, so onset latency stays constant.
//!
//! Stream errors raised on the audio thread set an error flag that is
//! reported as [`Error::Device`] on the next `start` or `stop`.

use crate::audio::tone::{dbfs_to_amplitude, ToneGenerator};
use crate::audio::AudioStream;
use crate::error::{Error, Result};
use audiometer_common::config::OutputSettings;
use audiometer_common::Ear;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Preferred output sample rate
const PREFERRED_SAMPLE_RATE: u32 = 44100;

/// Extra time granted to the release ramp before `stop` gives up waiting
const RELEASE_GRACE: Duration = Duration::from_millis(100);

/// cpal-backed [`AudioStream`]
pub struct ToneOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    generator: Arc<Mutex<ToneGenerator>>,
    settings: OutputSettings,
    /// Set by the stream error callback
    error_flag: Arc<AtomicBool>,
    error_count: Arc<AtomicU32>,
    tone_active: bool,
}

impl ToneOutput {
    /// List available audio output devices.
    ///
    /// Used by GET /audio/devices and `--list-devices`.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();

        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open the configured device and start a silent stream
    ///
    /// A named device that cannot be found falls back to the default
    /// output device with a warning.
    pub fn open(settings: &OutputSettings) -> Result<Self> {
        let device = Self::select_device(settings.device.as_deref())?;
        let (config, sample_format) = Self::get_best_config(&device)?;

        if config.channels < 2 {
            return Err(Error::Device(format!(
                "Device offers {} channel(s); stereo output is required",
                config.channels
            )));
        }

        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        let generator = ToneGenerator::new(
            config.sample_rate.0,
            settings.attack_ms,
            settings.release_ms,
        );

        let mut output = Self {
            device,
            config,
            sample_format,
            stream: None,
            generator: Arc::new(Mutex::new(generator)),
            settings: settings.clone(),
            error_flag: Arc::new(AtomicBool::new(false)),
            error_count: Arc::new(AtomicU32::new(0)),
            tone_active: false,
        };
        output.start_stream()?;
        Ok(output)
    }

    fn select_device(name: Option<&str>) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?;

            if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!("Found requested audio device: {}", name);
                return Ok(dev);
            }
            warn!("Requested device '{}' not found, falling back to default device", name);
        }

        let dev = host
            .default_output_device()
            .ok_or_else(|| Error::Device("No default output device found".to_string()))?;
        info!(
            "Using default audio device: {}",
            dev.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(dev)
    }

    /// Prefer 44.1 kHz stereo f32, else the device default
    fn get_best_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported_configs = device
            .supported_output_configs()
            .map_err(|e| Error::Device(format!("Failed to get device configs: {}", e)))?;

        let preferred = supported_configs.find(|config| {
            config.channels() == 2
                && config.min_sample_rate().0 <= PREFERRED_SAMPLE_RATE
                && config.max_sample_rate().0 >= PREFERRED_SAMPLE_RATE
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(supported_config) = preferred {
            let sample_format = supported_config.sample_format();
            let config = supported_config
                .with_sample_rate(cpal::SampleRate(PREFERRED_SAMPLE_RATE))
                .config();
            return Ok((config, sample_format));
        }

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::Device(format!("Failed to get default config: {}", e)))?;

        let sample_format = supported_config.sample_format();
        Ok((supported_config.config(), sample_format))
    }

    fn start_stream(&mut self) -> Result<()> {
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream::<f32>()?,
            SampleFormat::I16 => self.build_stream::<i16>()?,
            SampleFormat::U16 => self.build_stream::<u16>()?,
            sample_format => {
                return Err(Error::Device(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::Device(format!("Failed to start stream: {}", e)))?;
        self.stream = Some(stream);

        info!("Tone output stream started ({})", self.device_name());
        Ok(())
    }

    fn build_stream<T>(&self) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = self.config.channels as usize;
        let generator = Arc::clone(&self.generator);
        let error_flag = Arc::clone(&self.error_flag);
        let error_count = Arc::clone(&self.error_count);

        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let mut generator = lock_generator(&generator);
                    for frame in data.chunks_mut(channels) {
                        let tone = generator.next_frame();
                        frame[0] = T::from_sample(tone.left);
                        frame[1] = T::from_sample(tone.right);
                        // Channels beyond stereo stay silent
                        for extra in frame.iter_mut().skip(2) {
                            *extra = T::from_sample(0.0f32);
                        }
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    error_flag.store(true, Ordering::SeqCst);
                    error_count.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::Device(format!("Failed to build stream: {}", e)))
    }

    fn check_stream(&self) -> Result<()> {
        if self.error_flag.load(Ordering::SeqCst) {
            return Err(Error::Device(format!(
                "Output stream reported {} error(s)",
                self.error_count.load(Ordering::SeqCst)
            )));
        }
        if self.stream.is_none() {
            return Err(Error::Device("Output stream is not running".to_string()));
        }
        Ok(())
    }

    /// Get device name.
    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown".to_string())
    }

    /// Get sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// True if the stream error callback has fired
    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| Error::Device(format!("Failed to pause stream: {}", e)))?;
            info!("Tone output stream stopped");
        }
        Ok(())
    }
}

fn lock_generator(generator: &Mutex<ToneGenerator>) -> MutexGuard<'_, ToneGenerator> {
    generator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AudioStream for ToneOutput {
    fn start(&mut self, ear: Ear, frequency_hz: u32, level_db: i32) -> Result<()> {
        self.check_stream()?;

        let mut dbfs = self
            .settings
            .dbhl_to_dbfs(frequency_hz, level_db)
            .ok_or_else(|| Error::Config(format!("no output reference level for {} Hz", frequency_hz)))?;
        if dbfs > 0.0 {
            warn!(
                "{} dBHL at {} Hz maps to {:.1} dBFS, capping at 0 dBFS",
                level_db, frequency_hz, dbfs
            );
            dbfs = 0.0;
        }

        lock_generator(&self.generator).start(ear, frequency_hz, dbfs_to_amplitude(dbfs));
        self.tone_active = true;
        debug!("Tone on: {} ear, {} Hz, {} dBHL ({:.1} dBFS)", ear, frequency_hz, level_db, dbfs);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.tone_active {
            return Ok(());
        }
        self.tone_active = false;
        lock_generator(&self.generator).release();

        // Wait for the release ramp so the tone is silent when stop returns
        let deadline = Instant::now()
            + Duration::from_secs_f64(self.settings.release_ms / 1000.0)
            + RELEASE_GRACE;
        while !lock_generator(&self.generator).is_silent() {
            self.check_stream()?;
            if Instant::now() >= deadline {
                warn!("Release ramp did not finish in time, muting");
                lock_generator(&self.generator).silence();
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        self.check_stream()
    }
}

impl Drop for ToneOutput {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
