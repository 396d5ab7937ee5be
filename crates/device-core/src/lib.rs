//! nvcap device contracts.
//!
//! This crate describes the hardware the capture engine drives without
//! binding to a vendor SDK:
//! - **Graphics:** display connection, framebuffer configs, rendering context
//! - **Capture:** screen capture into rendering-context textures
//! - **Encoder:** texture-input hardware video encoder
//!
//! None of the API objects are required to be `Send`. A [`DeviceFactory`]
//! is moved to the worker thread and creates them there, so every call
//! comes from the thread that made the rendering context current.

pub mod capture;
pub mod config;
pub mod encoder;
pub mod graphics;
pub mod handle;

pub use capture::*;
pub use config::*;
pub use encoder::*;
pub use graphics::*;
pub use handle::*;

use nvcap_common::error::NvcapResult;

/// Creates device API objects on the thread that will use them.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &str;

    fn graphics(&self) -> NvcapResult<Box<dyn GraphicsApi>>;

    /// Instantiate the capture-device interface.
    fn capture(&self) -> NvcapResult<Box<dyn CaptureApi>>;

    /// Instantiate the encoder-device interface.
    fn encoder(&self) -> NvcapResult<Box<dyn EncoderApi>>;
}
