//! # Transform Engine Module
//!
//! Questo modulo definisce il punto di estensione della pipeline: il transform engine
//! che trasforma i byte di un singolo file.
//!
//! ## Responsabilità:
//! - Trait `TransformEngine`, indipendente da qualsiasi codec specifico
//! - Adattatore `from_fn` per usare una closure come engine
//! - `ImageReencoder`: engine di default basato sul crate `image`
//!
//! ## ImageReencoder:
//! | Formato | Azione |
//! |---------|--------|
//! | JPEG    | Ricodifica con qualità configurabile |
//! | PNG     | Ricodifica con compressione massima |
//! | Altri   | `TransformError::UnsupportedFormat` |
//!
//! - Ridimensiona (Lanczos3) se supera `max_dimension`
//! - Se la ricodifica non riduce la dimensione, restituisce i byte originali
//! - Il lavoro CPU-bound gira su `spawn_blocking`, mai sul thread del runtime
//!
//! ## Esempio:
//! ```rust,ignore
//! let halve = from_fn("halve", |input, _options, progress| async move {
//!     progress.report(50.0);
//!     Ok(TransformOutput::new(input.slice(..input.len() / 2)))
//! });
//! ```

use bytes::Bytes;
use futures::future::BoxFuture;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder, ImageFormat};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::debug;

use crate::error::TransformError;
use crate::orchestrator::ProgressSink;

/// Options handed to the engine for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOptions {
    /// Lossy quality (1-100)
    pub quality: u8,
    /// Downscale so that neither side exceeds this many pixels
    pub max_dimension: Option<u32>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            max_dimension: None,
        }
    }
}

/// Engine-reported details about an output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformMetrics {
    pub output_format: Option<String>,
    /// Filled in by the orchestrator
    pub elapsed_ms: u64,
    /// False when the engine handed back the original bytes
    pub reencoded: bool,
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub metrics: TransformMetrics,
}

impl TransformOutput {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            metrics: TransformMetrics {
                reencoded: true,
                ..Default::default()
            },
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.metrics.output_format = Some(format.into());
        self
    }
}

/// Pluggable per-item transform
///
/// `progress` only reaches the pipeline while the item is in flight; clones
/// kept past the returned future report nowhere.
pub trait TransformEngine: Send + Sync {
    fn name(&self) -> &str;

    fn transform(
        &self,
        input: Bytes,
        options: TransformOptions,
        progress: ProgressSink,
    ) -> BoxFuture<'static, Result<TransformOutput, TransformError>>;
}

/// Engine backed by a closure
pub struct FnTransform<F> {
    name: String,
    f: F,
}

/// Wrap `f(input, options, progress)` as a `TransformEngine`
pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> FnTransform<F>
where
    F: Fn(Bytes, TransformOptions, ProgressSink) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransformOutput, TransformError>> + Send + 'static,
{
    FnTransform { name: name.into(), f }
}

impl<F, Fut> TransformEngine for FnTransform<F>
where
    F: Fn(Bytes, TransformOptions, ProgressSink) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransformOutput, TransformError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        input: Bytes,
        options: TransformOptions,
        progress: ProgressSink,
    ) -> BoxFuture<'static, Result<TransformOutput, TransformError>> {
        Box::pin((self.f)(input, options, progress))
    }
}

/// Default engine: re-encodes JPEG and PNG images with the `image` crate
#[derive(Debug, Default, Clone)]
pub struct ImageReencoder;

impl ImageReencoder {
    pub fn new() -> Self {
        Self
    }

    fn reencode(input: &[u8], options: &TransformOptions, progress: &ProgressSink) -> Result<TransformOutput, TransformError> {
        let format = image::guess_format(input)?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
            return Err(TransformError::UnsupportedFormat(format!("{:?}", format)));
        }

        let mut img = image::load_from_memory_with_format(input, format)?;
        progress.report(40.0);

        if let Some(max) = options.max_dimension {
            let (width, height) = img.dimensions();
            if width > max || height > max {
                debug!("Downscaling {}x{} to fit {}", width, height, max);
                img = img.resize(max, max, FilterType::Lanczos3);
            }
        }
        progress.report(60.0);

        let (encoded, label) = match format {
            ImageFormat::Jpeg => (Self::encode_jpeg(&img, options.quality)?, "jpeg"),
            _ => (Self::encode_png(&img)?, "png"),
        };
        progress.report(90.0);

        if encoded.len() >= input.len() {
            debug!("Re-encoding did not shrink ({} >= {} bytes), keeping original", encoded.len(), input.len());
            let mut output = TransformOutput::new(Bytes::copy_from_slice(input)).with_format(label);
            output.metrics.reencoded = false;
            return Ok(output);
        }

        Ok(TransformOutput::new(Bytes::from(encoded)).with_format(label))
    }

    fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
        let rgb = img.to_rgb8();
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
        encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
        Ok(buffer)
    }

    fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, TransformError> {
        let rgba = img.to_rgba8();
        let mut buffer = Vec::new();
        let encoder = PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, PngFilter::Adaptive);
        encoder.write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)?;
        Ok(buffer)
    }
}

impl TransformEngine for ImageReencoder {
    fn name(&self) -> &str {
        "image-reencoder"
    }

    fn transform(
        &self,
        input: Bytes,
        options: TransformOptions,
        progress: ProgressSink,
    ) -> BoxFuture<'static, Result<TransformOutput, TransformError>> {
        Box::pin(async move {
            progress.report(5.0);
            tokio::task::spawn_blocking(move || Self::reencode(&input, &options, &progress))
                .await
                .map_err(|e| TransformError::Panicked(e.to_string()))?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, RgbImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32, format: ImageOutputFormat) -> Bytes {
        let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buffer, format).unwrap();
        Bytes::from(buffer.into_inner())
    }

    #[tokio::test]
    async fn test_reencoder_shrinks_high_quality_jpeg() {
        let input = gradient(64, 64, ImageOutputFormat::Jpeg(100));
        let options = TransformOptions { quality: 30, max_dimension: None };

        let output = ImageReencoder::new()
            .transform(input.clone(), options, ProgressSink::detached())
            .await
            .unwrap();

        assert!(output.bytes.len() < input.len());
        assert!(output.metrics.reencoded);
        assert_eq!(output.metrics.output_format.as_deref(), Some("jpeg"));
    }

    #[tokio::test]
    async fn test_reencoder_downscales() {
        let input = gradient(128, 64, ImageOutputFormat::Jpeg(100));
        let options = TransformOptions { quality: 80, max_dimension: Some(32) };

        let output = ImageReencoder::new()
            .transform(input, options, ProgressSink::detached())
            .await
            .unwrap();

        let decoded = image::load_from_memory(&output.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (32, 16));
    }

    #[tokio::test]
    async fn test_reencoder_rejects_garbage() {
        let err = ImageReencoder::new()
            .transform(Bytes::from_static(b"not an image"), TransformOptions::default(), ProgressSink::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedFormat(_) | TransformError::Other(_)));
    }

    #[test]
    fn test_from_fn_engine() {
        let engine = from_fn("halve", |input: Bytes, _options, _progress| async move {
            Ok(TransformOutput::new(input.slice(..input.len() / 2)))
        });
        let output = tokio_test::block_on(engine.transform(
            Bytes::from(vec![0u8; 10]),
            TransformOptions::default(),
            ProgressSink::detached(),
        ))
        .unwrap();
        assert_eq!(engine.name(), "halve");
        assert_eq!(output.bytes.len(), 5);
    }
}
