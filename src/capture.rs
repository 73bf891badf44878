use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Rate the remote service expects; capture resamples down to this.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Callbacks through which capture delivers frames and its effective config.
#[derive(Clone)]
pub struct FrameSink {
    pub on_frame: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    pub on_config: Arc<dyn Fn(u32) + Send + Sync>,
}

/// Capture collaborator: delivers discrete PCM frames and one effective
/// sample rate notification, asynchronously on its own cadence.
pub trait CaptureSource: Send + Sync {
    fn start(&self, device_name: Option<String>, sink: FrameSink) -> Result<(), String>;
    fn stop(&self);
}

/// cpal-backed microphone capture. The stream lives on a dedicated thread
/// (cpal streams are not `Send`); frames are downmixed to mono, resampled to
/// the target rate, converted to 16-bit PCM, and handed to the sink.
pub struct MicCapture {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MicCapture {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl Default for MicCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MicCapture {
    fn start(&self, device_name: Option<String>, sink: FrameSink) -> Result<(), String> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err("capture already running".into());
        }
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            if let Err(e) = run_capture(device_name.as_deref(), sink, running.clone()) {
                log::error!("[capture] {}", e);
            }
            running.store(false, Ordering::SeqCst);
        });
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_capture(
    device_name: Option<&str>,
    sink: FrameSink,
    running: Arc<AtomicBool>,
) -> Result<(), String> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| format!("failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("device '{}' not found", name))?
    } else {
        host.default_input_device()
            .ok_or("no default input device")?
    };
    log::info!(
        "[capture] using device: {}",
        device.name().unwrap_or_else(|_| "unknown".into())
    );

    let config = match try_config(&device, TARGET_SAMPLE_RATE) {
        Some(cfg) => cfg,
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| format!("no input config: {}", e))?;
            StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        }
    };
    let input_rate = config.sample_rate.0;
    log::info!(
        "[capture] stream config: {}Hz {}ch -> {}Hz mono",
        input_rate,
        config.channels,
        TARGET_SAMPLE_RATE
    );

    // The session does its duration math with the rate frames actually
    // carry, so report it before the first frame.
    (sink.on_config)(TARGET_SAMPLE_RATE);

    let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(128);
    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };
                let _ = raw_tx.try_send(mono);
            },
            |err| {
                log::error!("[capture] stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("failed to build stream: {}", e))?;
    stream
        .play()
        .map_err(|e| format!("failed to start stream: {}", e))?;

    let mut resampler = ResamplerState::default();
    while running.load(Ordering::SeqCst) {
        let samples = match raw_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(s) => s,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };
        let resampled = if input_rate == TARGET_SAMPLE_RATE {
            samples
        } else {
            resample_linear(&samples, input_rate, TARGET_SAMPLE_RATE, &mut resampler)
        };
        if resampled.is_empty() {
            continue;
        }
        let pcm: Vec<u8> = resampled
            .iter()
            .flat_map(|&s| {
                let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                clamped.to_le_bytes()
            })
            .collect();
        (sink.on_frame)(pcm);
    }
    log::info!("[capture] stopped");
    Ok(())
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.channels() == 1
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(StreamConfig {
                channels: 1,
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    // Stereo configs work too; the callback downmixes.
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            return Some(StreamConfig {
                channels: range.channels(),
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    None
}

#[derive(Default)]
struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

/// Streaming linear resampler; keeps one sample of history so chunk
/// boundaries do not click.
fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
        if i + 1 >= buf.len() {
            break;
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_halves_sample_count_for_2x_rate() {
        let mut state = ResamplerState::default();
        let input: Vec<f32> = (0..320).map(|i| (i as f32) / 320.0).collect();
        let out = resample_linear(&input, 32000, 16000, &mut state);
        // Roughly half, allowing for boundary handling.
        assert!((out.len() as i64 - 160).abs() <= 2, "got {}", out.len());
    }

    #[test]
    fn resample_passthrough_at_equal_rates() {
        let mut state = ResamplerState::default();
        let input = vec![0.1f32, 0.2, 0.3];
        assert_eq!(
            resample_linear(&input, 16000, 16000, &mut state),
            input
        );
    }
}
