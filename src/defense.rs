//! Input-side defenses applied to waveform batches before the model.
//!
//! A [`SignalFilter`] is a batch transform `[N, L] → [N, L]`. Filters here are
//! not differentiable; attacks that must see through them use the
//! straight-through form `x + (filter(x) − x).detach()`.

pub mod wiener;

use candle_core::Tensor;

use crate::Result;

pub use wiener::{AsnrWiener, FilterConfig};

/// Noise-reduction transform over a batch of signals.
pub trait SignalFilter: Send {
    /// Filter `[N, L]` signals. The output has exactly the input's shape.
    fn apply(&mut self, signals: &Tensor) -> Result<Tensor>;
}
