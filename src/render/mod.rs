//! Event routing and audio rendering.
//!
//! - [`router`] fans decoded events out to instances, gated by [`nps`]
//! - [`manager`] renders many instances on a worker pool
//! - [`buffered`] renders ahead of the audio callback on its own thread

pub mod buffered;
pub mod manager;
pub mod nps;
pub mod router;

pub use buffered::{AudioReader, BufferedRenderer, RendererStats};
pub use manager::RenderManager;
pub use nps::{ChannelNpsLimiter, ClockTimer, RoughClock};
pub use router::{EventRouter, Topology};

/// Produces one merged block of interleaved audio per call.
pub trait Renderer: Send + Sync {
    /// Fills `out` completely and returns its length.
    fn render(&self, out: &mut [f32]) -> usize;

    /// Voices sounding as of the last render.
    fn active_voice_count(&self) -> u32;
}
