//! Product extraction for WooCommerce-style listing pages.
//!
//! Every product container on a page is handled on its own: a container with a
//! missing title or an unparsable price is reported as skipped and the rest of
//! the page is still returned.

use crate::images::ImageStore;
use crate::models::{ProductKey, ProductRecord};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

const CONTAINER: &str = "div.product-inner";
const TITLE: &str = "h2.woo-loop-product__title";
const PRICE: &str = "span.woocommerce-Price-amount";
const SALE_PRICE: &str = "ins span.woocommerce-Price-amount";
const IMAGE: &str = "img.attachment-woocommerce_thumbnail";
const IMAGE_ATTRS: [&str; 2] = ["data-lazy-src", "src"];

// Mis-decoded UTF-8 rupee sign seen in some upstream responses.
const MOJIBAKE_RUPEE: &str = "â‚¹";
const CURRENCY_SYMBOLS: [char; 6] = ['₹', '$', '€', '£', '¥', '₩'];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("product title is missing")]
    MissingTitle,
    #[error("product price is missing")]
    MissingPrice,
    #[error("unparsable price `{0}`")]
    InvalidPrice(String),
    #[error("negative price `{0}`")]
    NegativePrice(String),
}

/// A product as read from the page, before its image is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftProduct {
    pub key: ProductKey,
    pub title: String,
    pub price: f64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SkippedProduct {
    pub index: usize,
    pub reason: ExtractError,
}

#[derive(Debug, Default)]
pub struct PageExtraction {
    pub records: Vec<ProductRecord>,
    pub skipped: Vec<SkippedProduct>,
}

pub struct ProductExtractor {
    container: Selector,
    title: Selector,
    price: Selector,
    sale_price: Selector,
    image: Selector,
}

impl ProductExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            container: compile(CONTAINER)?,
            title: compile(TITLE)?,
            price: compile(PRICE)?,
            sale_price: compile(SALE_PRICE)?,
            image: compile(IMAGE)?,
        })
    }

    /// Candidates in document order, each either a draft or the reason it
    /// was rejected.
    pub fn parse_drafts(&self, document: &str) -> Vec<Result<DraftProduct, ExtractError>> {
        let html = Html::parse_document(document);
        html.select(&self.container)
            .map(|element| self.draft_from_element(element))
            .collect()
    }

    /// Parses the page and stores an image for every accepted product. A
    /// failed or missing image leaves `image_path` empty; the record is kept.
    pub async fn extract<I: ImageStore>(&self, document: &str, images: &I) -> PageExtraction {
        let mut extraction = PageExtraction::default();

        for (index, candidate) in self.parse_drafts(document).into_iter().enumerate() {
            let draft = match candidate {
                Ok(draft) => draft,
                Err(reason) => {
                    extraction.skipped.push(SkippedProduct { index, reason });
                    continue;
                }
            };

            let image_path = match draft.image_url.as_deref() {
                Some(url) => match images.store(&draft.key, url).await {
                    Ok(path) => Some(path),
                    Err(err) => {
                        warn!(
                            target = "catalog.extract",
                            key = %draft.key,
                            url,
                            error = %err,
                            "image fetch failed; keeping record without image"
                        );
                        None
                    }
                },
                None => {
                    debug!(target = "catalog.extract", key = %draft.key, "product has no image url");
                    None
                }
            };

            extraction.records.push(ProductRecord {
                title: draft.title,
                price: draft.price,
                image_path,
            });
        }

        extraction
    }

    fn draft_from_element(&self, element: ElementRef<'_>) -> Result<DraftProduct, ExtractError> {
        let title = element
            .select(&self.title)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .ok_or(ExtractError::MissingTitle)?;

        let price_text = element
            .select(&self.sale_price)
            .next()
            .or_else(|| element.select(&self.price).next())
            .map(element_text)
            .filter(|t| !t.is_empty())
            .ok_or(ExtractError::MissingPrice)?;
        let price = parse_price(&price_text)?;

        let image_url = element.select(&self.image).next().and_then(|img| {
            IMAGE_ATTRS
                .iter()
                .filter_map(|attr| img.value().attr(attr))
                .map(str::trim)
                .find(|url| !url.is_empty())
                .map(str::to_string)
        });

        Ok(DraftProduct {
            key: ProductKey::from_title(&title),
            title,
            price,
            image_url,
        })
    }
}

/// Parses locale-formatted currency text such as `₹1,234.50`.
pub fn parse_price(raw: &str) -> Result<f64, ExtractError> {
    let cleaned: String = raw
        .replace(MOJIBAKE_RUPEE, "")
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace() && !CURRENCY_SYMBOLS.contains(c))
        .collect();

    let value: f64 = cleaned
        .parse()
        .map_err(|_| ExtractError::InvalidPrice(raw.to_string()))?;
    if !value.is_finite() {
        return Err(ExtractError::InvalidPrice(raw.to_string()));
    }
    if value < 0.0 {
        return Err(ExtractError::NegativePrice(raw.to_string()));
    }
    Ok(value)
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}
