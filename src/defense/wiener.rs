//! A-priori-SNR Wiener filtering.
//!
//! ```text
//! x ─→ STFT (Hamming, fft_size, hop_size)
//!   ─→ per frame:  γ = |X|² / N              a posteriori SNR
//!                  ξ = α·G²ₚᵣₑᵥ·γₚᵣₑᵥ + (1−α)·max(γ−1, 0)
//!                  G = ξ / (1 + ξ)
//!                  mean(γξ/(1+ξ) − ln(1+ξ)) < θ  ⇒  N ← β·N + (1−β)·|X|²
//!   ─→ G·X ─→ overlap-add ─→ pad with mean / truncate to len(x)
//! ```
//!
//! `α = 0.98` (SNR smoothing), `β = 0.98` (noise smoothing), `θ = 0.15`.
//! The noise PSD `N` starts from a synthetic Gaussian noise reference when
//! `gaussian_sigma > 0`, otherwise from the first 100 ms of the item.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::SignalFilter;
use crate::audio::Stft;
use crate::audio::stft::power_spectrum;
use crate::{Error, Result};

const SNR_SMOOTH: f64 = 0.98;
const NOISE_SMOOTH: f64 = 0.98;
const LLK_THRESHOLD: f64 = 0.15;
const NOISE_INIT_SECONDS: f64 = 0.1;
const PSD_FLOOR: f64 = 1e-12;

/// Filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    pub hop_size: usize,
    /// Std of the synthetic noise reference; 0 disables it.
    #[serde(default)]
    pub gaussian_sigma: f64,
    /// Use first-differenced (high-pass) noise for the reference.
    #[serde(default = "default_high_freq")]
    pub high_freq: bool,
    /// LPC order of the noise model. Stored and round-tripped with the
    /// configuration; the Wiener gain does not read it.
    #[serde(default = "default_lpc_order")]
    pub lpc_order: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_high_freq() -> bool {
    true
}

fn default_lpc_order() -> usize {
    12
}

impl FilterConfig {
    /// Build from string key/values (`sr`, `nfft`, `hop`, and optionally
    /// `gaussian_sigma`, `high_freq`, `lpc_order`, `seed`). Long names
    /// (`sample_rate`, `fft_size`, `hop_size`) are accepted as well.
    /// `lpc_order` (default 12) is parsed and kept but does not change
    /// the filter output.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        fn lookup<'a>(map: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
            keys.iter().find_map(|k| map.get(*k)).map(String::as_str)
        }
        fn required<T: std::str::FromStr>(
            map: &HashMap<String, String>,
            keys: &[&str],
        ) -> Result<T> {
            let raw = lookup(map, keys)
                .ok_or_else(|| Error::Config(format!("{} not in filter config", keys[0])))?;
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{}: cannot parse {raw:?}", keys[0])))
        }
        fn optional<T: std::str::FromStr>(
            map: &HashMap<String, String>,
            keys: &[&str],
            default: T,
        ) -> Result<T> {
            match lookup(map, keys) {
                Some(_) => required(map, keys),
                None => Ok(default),
            }
        }

        let config = Self {
            sample_rate: required(map, &["sr", "sample_rate"])?,
            fft_size: required(map, &["nfft", "fft_size"])?,
            hop_size: required(map, &["hop", "hop_size"])?,
            gaussian_sigma: optional(map, &["gaussian_sigma"], 0.0)?,
            high_freq: parse_bool(lookup(map, &["high_freq"]), true)?,
            lpc_order: optional(map, &["lpc_order"], default_lpc_order())?,
            seed: optional(map, &["seed"], 0)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.fft_size < 2 {
            return Err(Error::Config("fft_size must be >= 2".into()));
        }
        if self.hop_size == 0 || self.hop_size > self.fft_size {
            return Err(Error::Config(format!(
                "hop_size must be in 1..={}, got {}",
                self.fft_size, self.hop_size
            )));
        }
        if self.gaussian_sigma < 0.0 {
            return Err(Error::Config("gaussian_sigma must be >= 0".into()));
        }
        Ok(())
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> Result<bool> {
    match raw.map(|r| r.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(r) => match r.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(Error::Config(format!("high_freq: cannot parse {r:?}"))),
        },
    }
}

/// Wiener noise reduction with decision-directed a-priori SNR estimation.
pub struct AsnrWiener {
    config: FilterConfig,
    stft: Stft,
    rng: ChaCha8Rng,
}

impl AsnrWiener {
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            sr = config.sample_rate,
            nfft = config.fft_size,
            hop = config.hop_size,
            sigma = config.gaussian_sigma,
            "asnr wiener filter"
        );
        Ok(Self {
            stft: Stft::new(config.fft_size, config.hop_size)?,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        Self::new(FilterConfig::from_map(map)?)
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Synthetic noise reference of `len` samples, if enabled.
    fn noise_reference(&mut self, len: usize) -> Result<Option<Vec<f64>>> {
        if self.config.gaussian_sigma <= 0.0 {
            return Ok(None);
        }
        let normal = Normal::new(0.0, self.config.gaussian_sigma)
            .map_err(|e| Error::Config(format!("gaussian_sigma: {e}")))?;
        let noise = if self.config.high_freq {
            let raw: Vec<f64> = (0..=len).map(|_| normal.sample(&mut self.rng)).collect();
            raw.windows(2).map(|w| 0.5 * (w[1] - w[0])).collect()
        } else {
            (0..len).map(|_| normal.sample(&mut self.rng)).collect()
        };
        Ok(Some(noise))
    }

    /// Mean power spectrum over the frames of `signal`.
    fn mean_psd(&self, signal: &[f64]) -> Vec<f64> {
        let bins = self.stft.num_bins();
        let spectra = self.stft.analyze(signal);
        let mut mean = vec![0.0; bins];
        for spectrum in &spectra {
            for (m, p) in mean.iter_mut().zip(power_spectrum(spectrum, bins)) {
                *m += p;
            }
        }
        let frames = spectra.len().max(1) as f64;
        mean.iter_mut().for_each(|m| *m /= frames);
        mean
    }

    /// Enhance one signal. The result is not yet length-matched.
    pub fn enhance(&self, signal: &[f64], noise: Option<&[f64]>) -> Vec<f64> {
        let bins = self.stft.num_bins();
        let n = self.stft.fft_size();
        let init_len = ((self.config.sample_rate as f64 * NOISE_INIT_SECONDS) as usize)
            .clamp(1, signal.len().max(1));
        let mut noise_psd = match noise {
            Some(noise) => self.mean_psd(noise),
            None => self.mean_psd(&signal[..init_len.min(signal.len())]),
        };

        let mut spectra = self.stft.analyze(signal);
        let mut prev: Option<(Vec<f64>, Vec<f64>)> = None; // (gain, post snr)
        for spectrum in spectra.iter_mut() {
            let psd = power_spectrum(spectrum, bins);
            let post: Vec<f64> = psd
                .iter()
                .zip(&noise_psd)
                .map(|(p, np)| p / np.max(PSD_FLOOR))
                .collect();
            let prior: Vec<f64> = match &prev {
                None => post.iter().map(|g| (g - 1.0).max(0.0)).collect(),
                Some((gain, prev_post)) => post
                    .iter()
                    .zip(gain.iter().zip(prev_post))
                    .map(|(g, (pg, pp))| {
                        SNR_SMOOTH * pg * pg * pp + (1.0 - SNR_SMOOTH) * (g - 1.0).max(0.0)
                    })
                    .collect(),
            };
            let gain: Vec<f64> = prior.iter().map(|xi| xi / (1.0 + xi)).collect();

            // Speech-presence log-likelihood; update the noise estimate in pauses.
            let llk = post
                .iter()
                .zip(&prior)
                .map(|(g, xi)| g * xi / (1.0 + xi) - (1.0 + xi).ln())
                .sum::<f64>()
                / bins as f64;
            if llk < LLK_THRESHOLD {
                for (np, p) in noise_psd.iter_mut().zip(&psd) {
                    *np = NOISE_SMOOTH * *np + (1.0 - NOISE_SMOOTH) * p;
                }
            }

            // Real gain keeps the noisy phase; mirror onto the negative bins.
            for (k, c) in spectrum.iter_mut().enumerate() {
                *c *= gain[k.min(n - k)];
            }
            prev = Some((gain, post));
        }

        self.stft.synthesize(&spectra)
    }
}

/// Pad with the mean of `output` or truncate so it has exactly `len` samples.
pub fn fit_length(mut output: Vec<f64>, len: usize) -> Vec<f64> {
    if output.len() < len {
        let mean = if output.is_empty() {
            0.0
        } else {
            output.iter().sum::<f64>() / output.len() as f64
        };
        output.resize(len, mean);
    } else {
        output.truncate(len);
    }
    output
}

impl SignalFilter for AsnrWiener {
    fn apply(&mut self, signals: &Tensor) -> Result<Tensor> {
        let (batch, len) = signals.dims2()?;
        let rows: Vec<Vec<f32>> = signals
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .to_vec2()?;

        let mut out = Vec::with_capacity(batch * len);
        let mut skipped = 0usize;
        for row in &rows {
            let signal: Vec<f64> = row.iter().map(|&s| f64::from(s)).collect();
            let noise = self.noise_reference(len)?;
            let filtered = fit_length(self.enhance(&signal, noise.as_deref()), len);
            if filtered.iter().all(|v| v.is_finite()) {
                out.extend(filtered.into_iter().map(|v| v as f32));
            } else {
                skipped += 1;
                out.extend_from_slice(row);
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, batch, "non-finite filter output, kept input");
        }

        Ok(Tensor::from_vec(out, (batch, len), signals.device())?.to_dtype(signals.dtype())?)
    }
}
