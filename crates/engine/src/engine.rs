use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pixel or encoded image data handed to a vision-enabled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Encoded image file contents (PNG, JPEG, ...).
    Encoded(Arc<[u8]>),
    /// Raw RGBA8 pixels, row-major.
    Rgba8 {
        width: u32,
        height: u32,
        pixels: Arc<[u8]>,
    },
}

impl ImageInput {
    pub fn encoded(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Encoded(bytes.into())
    }

    /// Raw RGBA8 pixels. Fails if `pixels` is not exactly `width * height * 4` bytes.
    pub fn rgba8(width: u32, height: u32, pixels: impl Into<Arc<[u8]>>) -> crate::Result<Self> {
        let pixels = pixels.into();
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(crate::EngineError::InvalidImage(format!(
                "expected {expected} bytes for {width}x{height} RGBA, got {}",
                pixels.len()
            )));
        }
        Ok(Self::Rgba8 {
            width,
            height,
            pixels,
        })
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Self::Encoded(bytes) => bytes.len(),
            Self::Rgba8 { pixels, .. } => pixels.len(),
        }
    }
}

/// Receives streamed output: zero or more `(chunk, false)` calls followed by
/// exactly one `(chunk, true)` call whose chunk may be empty.
pub type PartialSink<'a> = &'a mut dyn FnMut(&str, bool);

/// An initialized native inference engine.
///
/// All methods take `&self`: `reset_session` must be callable from another
/// thread while `run_inference` is blocked inside the engine, because that is
/// how an in-flight generation gets interrupted.
pub trait InferenceEngine: Send + Sync {
    fn model_name(&self) -> &str;

    /// Tear down and recreate the conversational session without releasing
    /// the model itself.
    fn reset_session(&self, vision_enabled: bool) -> crate::Result<()>;

    /// Run one blocking, streaming inference call.
    ///
    /// Implementations should check `cancel` between tokens and return early
    /// once it fires. Output produced after that point is ignored by callers.
    fn run_inference(
        &self,
        prompt: &str,
        images: &[ImageInput],
        cancel: &CancellationToken,
        on_partial: PartialSink<'_>,
    ) -> crate::Result<()>;

    /// Release native resources. Must tolerate repeated calls.
    fn dispose(&self);
}

impl<T: InferenceEngine + ?Sized> InferenceEngine for Arc<T> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn reset_session(&self, vision_enabled: bool) -> crate::Result<()> {
        (**self).reset_session(vision_enabled)
    }

    fn run_inference(
        &self,
        prompt: &str,
        images: &[ImageInput],
        cancel: &CancellationToken,
        on_partial: PartialSink<'_>,
    ) -> crate::Result<()> {
        (**self).run_inference(prompt, images, cancel, on_partial)
    }

    fn dispose(&self) {
        (**self).dispose()
    }
}

/// Factory for engines.
///
/// The platform layer registers its native loader; the orchestrator only ever
/// sees this trait.
pub trait EngineLoader: Send + Sync {
    /// Human-readable backend name (e.g. "MediaPipe LLM Inference").
    fn name(&self) -> &str;

    /// Load the artifact at `model_path`. Blocking and potentially slow.
    fn load(
        &self,
        model_path: &Path,
        vision_enabled: bool,
    ) -> crate::Result<Box<dyn InferenceEngine>>;
}
