//! Image cost model for vision requests.

use std::io::Cursor;
use std::time::Duration;

use base64::Engine as _;
use futures_util::StreamExt;
use image::ImageDecoder as _;
use image::codecs::webp::WebPDecoder;

use super::metering::MeteringError;

pub const LOW_DETAIL_COST: u32 = 85;
const TILE_COST: u64 = 170;
const TILE_SIZE: u64 = 512;
const MAX_SIDE: u64 = 2048;
const SHORT_SIDE: u64 = 768;
/// Bytes of a remote image read before decoding; dimensions live in the header.
pub const DEFAULT_MAX_IMAGE_PREFIX_BYTES: usize = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageDetail {
    Low,
    High,
    Auto,
}

impl ImageDetail {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            _ => Self::Auto,
        }
    }
}

/// Models whose requests are billed for image inputs.
pub fn is_vision_model(model: &str) -> bool {
    model.contains("vision") || model.starts_with("gpt-4o") || model.starts_with("gpt-4-turbo")
}

/// Token cost of one image. Every scaled dimension is truncated to an integer.
pub fn image_token_cost(width: u32, height: u32, detail: ImageDetail) -> u32 {
    if detail == ImageDetail::Low || width == 0 || height == 0 {
        return LOW_DETAIL_COST;
    }

    let (mut width, mut height) = (u64::from(width), u64::from(height));
    if width > MAX_SIDE || height > MAX_SIDE {
        let ratio = width as f64 / height as f64;
        if width > height {
            width = MAX_SIDE;
            height = ((MAX_SIDE as f64 / ratio) as u64).max(1);
        } else {
            height = MAX_SIDE;
            width = ((MAX_SIDE as f64 * ratio) as u64).max(1);
        }
    }

    if width > SHORT_SIDE || height > SHORT_SIDE {
        if width < height {
            height = (height as f64 / width as f64 * SHORT_SIDE as f64) as u64;
            width = SHORT_SIDE;
        } else {
            width = (width as f64 / height as f64 * SHORT_SIDE as f64) as u64;
            height = SHORT_SIDE;
        }
    }

    let tiles = width.div_ceil(TILE_SIZE) * height.div_ceil(TILE_SIZE);
    let cost = tiles * TILE_COST + u64::from(LOW_DETAIL_COST);
    u32::try_from(cost).unwrap_or(u32::MAX)
}

/// Resolves image dimensions from data URLs or remote http(s) URLs.
#[derive(Clone, Debug)]
pub struct ImageInspector {
    client: reqwest::Client,
    max_prefix_bytes: usize,
}

impl ImageInspector {
    pub fn new() -> Result<Self, MeteringError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| MeteringError::ImageFetch(err.to_string()))?;
        Ok(Self {
            client,
            max_prefix_bytes: DEFAULT_MAX_IMAGE_PREFIX_BYTES,
        })
    }

    pub fn with_max_prefix_bytes(mut self, max: usize) -> Self {
        self.max_prefix_bytes = max.max(64);
        self
    }

    pub async fn dimensions(&self, url: &str, timeout: Duration) -> Result<(u32, u32), MeteringError> {
        if let Some(rest) = url.strip_prefix("data:") {
            let (is_webp, bytes) = decode_data_url(rest)?;
            return read_dimensions(&bytes, is_webp);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(MeteringError::InvalidImageUrl(truncate(url)));
        }

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| MeteringError::ImageFetch(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MeteringError::ImageFetch(format!(
                "image url responded with status {}",
                status.as_u16()
            )));
        }
        let content_type_webp = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("image/webp"));
        let bytes = self.read_prefix(response).await?;
        read_dimensions(&bytes, content_type_webp || looks_like_webp(&bytes))
    }

    // Stops reading once the prefix is full; the rest of the body is never buffered.
    async fn read_prefix(&self, response: reqwest::Response) -> Result<Vec<u8>, MeteringError> {
        let limit = self.max_prefix_bytes;
        let capacity = response
            .content_length()
            .map_or(limit, |len| (len as usize).min(limit));
        let mut prefix = Vec::with_capacity(capacity);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| MeteringError::ImageFetch(err.to_string()))?;
            let take = chunk.len().min(limit - prefix.len());
            prefix.extend_from_slice(&chunk[..take]);
            if prefix.len() >= limit {
                break;
            }
        }
        Ok(prefix)
    }
}

// `rest` is everything after `data:`, e.g. `image/png;base64,iVBOR...`.
fn decode_data_url(rest: &str) -> Result<(bool, Vec<u8>), MeteringError> {
    let Some((meta, payload)) = rest.split_once(',') else {
        return Err(MeteringError::InvalidImageUrl("data url without payload".to_string()));
    };
    if !meta.ends_with(";base64") {
        return Err(MeteringError::InvalidImageUrl(
            "data url is not base64 encoded".to_string(),
        ));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| MeteringError::InvalidBase64(err.to_string()))?;
    let is_webp = meta.starts_with("image/webp") || looks_like_webp(&bytes);
    Ok((is_webp, bytes))
}

fn looks_like_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

fn read_dimensions(bytes: &[u8], is_webp: bool) -> Result<(u32, u32), MeteringError> {
    if is_webp {
        let decoder = WebPDecoder::new(Cursor::new(bytes))
            .map_err(|err| MeteringError::ImageDecode(err.to_string()))?;
        return Ok(decoder.dimensions());
    }
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| MeteringError::ImageDecode(err.to_string()))?
        .into_dimensions()
        .map_err(|err| MeteringError::ImageDecode(err.to_string()))
}

fn truncate(url: &str) -> String {
    url.chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn encoded(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
        let image = image::DynamicImage::ImageRgba8(image::RgbaImage::new(width, height));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn data_url(mime: &str, bytes: &[u8]) -> String {
        format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    #[test]
    fn low_detail_is_flat() {
        assert_eq!(image_token_cost(4096, 4096, ImageDetail::Low), 85);
        assert_eq!(image_token_cost(10, 10, ImageDetail::Low), 85);
    }

    #[test]
    fn wide_image_scales_short_side_to_768() {
        assert_eq!(image_token_cost(1024, 512, ImageDetail::Auto), 1105);
        assert_eq!(image_token_cost(1024, 512, ImageDetail::High), 1105);
    }

    #[test]
    fn oversized_image_is_capped_first() {
        assert_eq!(image_token_cost(4096, 2048, ImageDetail::Auto), 1105);
    }

    #[test]
    fn small_image_is_one_tile() {
        assert_eq!(image_token_cost(512, 512, ImageDetail::Auto), 255);
        assert_eq!(image_token_cost(768, 768, ImageDetail::Auto), 765);
    }

    #[test]
    fn tall_image_scales_width() {
        // 600x1200: 768 wide, 1536 tall -> 2x3 tiles.
        assert_eq!(image_token_cost(600, 1200, ImageDetail::Auto), 6 * 170 + 85);
    }

    #[test]
    fn extreme_ratio_never_divides_by_zero() {
        assert!(image_token_cost(100_000, 1, ImageDetail::Auto) > 85);
    }

    #[test]
    fn vision_models() {
        assert!(is_vision_model("gpt-4-vision-preview"));
        assert!(is_vision_model("gpt-4o-mini"));
        assert!(!is_vision_model("gpt-3.5-turbo"));
    }

    #[tokio::test]
    async fn reads_png_from_data_url() {
        let inspector = ImageInspector::new().unwrap();
        let url = data_url("image/png", &encoded(3, 2, image::ImageFormat::Png));
        let dims = inspector.dimensions(&url, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dims, (3, 2));
    }

    #[tokio::test]
    async fn reads_webp_header() {
        let inspector = ImageInspector::new().unwrap();
        let url = data_url("image/webp", &encoded(7, 5, image::ImageFormat::WebP));
        let dims = inspector.dimensions(&url, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dims, (7, 5));
    }

    #[tokio::test]
    async fn data_url_errors_are_distinct() {
        let inspector = ImageInspector::new().unwrap();
        let err = inspector
            .dimensions("data:image/png;base64,@@@", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::InvalidBase64(_)));

        let garbage = data_url("image/png", b"definitely not an image");
        let err = inspector
            .dimensions(&garbage, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::ImageDecode(_)));

        let err = inspector
            .dimensions("ftp://example.com/cat.png", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::InvalidImageUrl(_)));
    }

    #[tokio::test]
    async fn fetches_remote_image() {
        let server = MockServer::start();
        let png = encoded(640, 480, image::ImageFormat::Png);
        let mock = server.mock(|when, then| {
            when.method(GET).path("/cat.png");
            then.status(200).header("content-type", "image/png").body(png.clone());
        });

        let inspector = ImageInspector::new().unwrap();
        let dims = inspector
            .dimensions(&server.url("/cat.png"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(dims, (640, 480));
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn remote_image_is_read_up_to_the_prefix_limit() {
        let server = MockServer::start();
        let mut padded = encoded(320, 200, image::ImageFormat::Png);
        padded.extend(std::iter::repeat_n(0u8, 256 * 1024));
        server.mock(|when, then| {
            when.method(GET).path("/padded.png");
            then.status(200).header("content-type", "image/png").body(padded.clone());
        });
        server.mock(|when, then| {
            when.method(GET).path("/noise.bin");
            then.status(200).body(vec![7u8; 256 * 1024]);
        });

        let inspector = ImageInspector::new().unwrap().with_max_prefix_bytes(4096);
        let prefix = inspector
            .read_prefix(reqwest::get(server.url("/padded.png")).await.unwrap())
            .await
            .unwrap();
        assert_eq!(prefix.len(), 4096);

        let dims = inspector
            .dimensions(&server.url("/padded.png"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(dims, (320, 200));

        let err = inspector
            .dimensions(&server.url("/noise.bin"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::ImageDecode(_)));
    }

    #[tokio::test]
    async fn remote_error_status_is_fetch_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gone.png");
            then.status(404);
        });
        let inspector = ImageInspector::new().unwrap();
        let err = inspector
            .dimensions(&server.url("/gone.png"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::ImageFetch(_)));
    }
}
