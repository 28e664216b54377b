use serde::Serialize;

pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_TOP_P: f64 = 1.0;
pub const DEFAULT_MIN_P: f64 = 0.0;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Image attachment for a multimodal prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAttachment {
    #[serde(rename = "img_id")]
    pub image_id: String,
    #[serde(rename = "base64_img")]
    pub base64_data: String,
}

impl ImageAttachment {
    pub fn new(image_id: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            base64_data: base64_data.into(),
        }
    }
}

/// Chat request payload for the inference server's streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub text: String,
    pub top_k: u32,
    pub top_p: f64,
    pub min_p: f64,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageAttachment>>,
}

impl ChatRequest {
    /// Creates a request with the server's default sampling parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            min_p: DEFAULT_MIN_P,
            temperature: DEFAULT_TEMPERATURE,
            seed: None,
            images: None,
        }
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_min_p(mut self, min_p: f64) -> Self {
        self.min_p = min_p;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = Some(images);
        self
    }
}
