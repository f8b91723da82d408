//! Request and response records exchanged with the pricing service.
//!
//! Writes go to `POST <endpoint>/admin/price/<id>/adjustments` with either a
//! single adjustment object or an array of them. Reads come back from
//! `GET <endpoint>/price/<id>` as a [`PriceView`]. Anything that does not
//! decode into these records is treated as unavailable.

use crate::error::ProbeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of the product a probe iteration reads and writes.
pub type ProductId = u64;

/// How an adjustment value is applied to the base price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentMode {
    /// Added to the base price as-is.
    #[default]
    #[serde(alias = "absolute")]
    Absolute,
    /// Applied as a percentage of the base price.
    #[serde(alias = "relative", alias = "PERCENT", alias = "percent")]
    Relative,
}

/// One price adjustment as accepted by the admin endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub mode: AdjustmentMode,
}

/// Write body: the admin endpoint takes one object or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdjustmentBody {
    Single(Adjustment),
    Batch(Vec<Adjustment>),
}

impl AdjustmentBody {
    /// Number of adjustments carried by this body.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize to the JSON bytes sent on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProbeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Produces randomized adjustment bodies within a configured value range.
#[derive(Debug, Clone)]
pub struct AdjustmentGenerator {
    kind: String,
    mode: AdjustmentMode,
    value_min: u32,
    value_max: u32,
    batch_size: usize,
}

impl AdjustmentGenerator {
    pub fn new(
        kind: impl Into<String>,
        mode: AdjustmentMode,
        value_min: u32,
        value_max: u32,
        batch_size: usize,
    ) -> Self {
        let (value_min, value_max) = if value_min <= value_max {
            (value_min, value_max)
        } else {
            (value_max, value_min)
        };
        Self {
            kind: kind.into(),
            mode,
            value_min,
            value_max,
            batch_size: batch_size.max(1),
        }
    }

    /// Draw one adjustment with an integral value in `[value_min, value_max]`.
    pub fn adjustment<R: Rng + ?Sized>(&self, rng: &mut R) -> Adjustment {
        Adjustment {
            kind: self.kind.clone(),
            value: f64::from(rng.gen_range(self.value_min..=self.value_max)),
            mode: self.mode,
        }
    }

    /// Draw a full write body. A batch size of one yields a single object.
    pub fn body<R: Rng + ?Sized>(&self, rng: &mut R) -> AdjustmentBody {
        if self.batch_size == 1 {
            AdjustmentBody::Single(self.adjustment(rng))
        } else {
            AdjustmentBody::Batch((0..self.batch_size).map(|_| self.adjustment(rng)).collect())
        }
    }
}

impl Default for AdjustmentGenerator {
    fn default() -> Self {
        Self::new("PROMO", AdjustmentMode::Absolute, 1, 10, 1)
    }
}

/// Read response of the price endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceView {
    #[serde(default)]
    pub product_id: Option<ProductId>,
    #[serde(default)]
    pub base_price: Option<f64>,
    pub final_price: f64,
    #[serde(default)]
    pub old_value: Option<f64>,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
}

impl PriceView {
    /// Decode a response body, failing closed on any shape mismatch.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let view: Self = serde_json::from_slice(body).ok()?;
        view.final_price.is_finite().then_some(view)
    }
}

/// Endpoint paths exercised by the probes and read benchmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Route {
    /// Cached price read.
    Price,
    /// Uncached database read.
    PriceDb,
    /// Product catalogue read.
    Products,
    /// Admin write of price adjustments.
    Adjustments,
}

impl Route {
    /// Build the full URL for this route on `base` for `product_id`.
    pub fn url(&self, base: &str, product_id: ProductId) -> String {
        let base = base.trim_end_matches('/');
        match self {
            Self::Price => format!("{base}/price/{product_id}"),
            Self::PriceDb => format!("{base}/price-db/{product_id}"),
            Self::Products => format!("{base}/products/{product_id}"),
            Self::Adjustments => format!("{base}/admin/price/{product_id}/adjustments"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::PriceDb => "price-db",
            Self::Products => "products",
            Self::Adjustments => "adjustments",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "price" => Ok(Self::Price),
            "price-db" | "price_db" => Ok(Self::PriceDb),
            "products" => Ok(Self::Products),
            "adjustments" => Ok(Self::Adjustments),
            other => Err(ProbeError::invalid_config(format!(
                "unknown route '{other}', expected price, price-db, products or adjustments"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_single_body_is_an_object() {
        let body = AdjustmentBody::Single(Adjustment {
            kind: "PROMO".to_string(),
            value: 5.0,
            mode: AdjustmentMode::Absolute,
        });

        let json: serde_json::Value = serde_json::from_slice(&body.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "PROMO");
        assert_eq!(json["value"], 5.0);
        assert_eq!(json["mode"], "ABSOLUTE");
    }

    #[test]
    fn test_batch_body_is_an_array() {
        let generator = AdjustmentGenerator::new("TAX", AdjustmentMode::Relative, 1, 3, 4);
        let body = generator.body(&mut StdRng::seed_from_u64(7));

        let json: serde_json::Value = serde_json::from_slice(&body.to_bytes().unwrap()).unwrap();
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert!(items.iter().all(|item| item["mode"] == "RELATIVE"));
    }

    #[test]
    fn test_generator_stays_in_range() {
        let generator = AdjustmentGenerator::new("PROMO", AdjustmentMode::Absolute, 10, 1, 1);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..500 {
            let adjustment = generator.adjustment(&mut rng);
            assert!((1.0..=10.0).contains(&adjustment.value));
            assert_eq!(adjustment.value.fract(), 0.0);
        }
    }

    #[test]
    fn test_percent_is_an_alias_for_relative() {
        let adjustment: Adjustment =
            serde_json::from_str(r#"{"type":"PROMO","value":10,"mode":"PERCENT"}"#).unwrap();
        assert_eq!(adjustment.mode, AdjustmentMode::Relative);
    }

    #[test]
    fn test_price_view_parses_service_response() {
        let body = br#"{
            "productId": 9999,
            "basePrice": 100.00,
            "finalPrice": 105.00,
            "adjustments": [{"type": "PROMO", "value": 5, "mode": "ABSOLUTE"}]
        }"#;

        let view = PriceView::parse(body).unwrap();
        assert_eq!(view.product_id, Some(9999));
        assert_eq!(view.final_price, 105.0);
        assert_eq!(view.old_value, None);
        assert_eq!(view.adjustments.len(), 1);
    }

    #[test]
    fn test_price_view_fails_closed() {
        assert!(PriceView::parse(b"not json").is_none());
        assert!(PriceView::parse(br#"{"basePrice": 100}"#).is_none());
        assert!(PriceView::parse(br#"{"finalPrice": "100"}"#).is_none());
        assert!(PriceView::parse(br#"{"finalPrice": 1, "adjustments": [{"type": "X"}]}"#).is_none());
        assert!(PriceView::parse(b"").is_none());
    }

    #[test]
    fn test_route_urls() {
        assert_eq!(Route::Price.url("http://a:8080/", 7), "http://a:8080/price/7");
        assert_eq!(Route::PriceDb.url("http://a:8080", 7), "http://a:8080/price-db/7");
        assert_eq!(Route::Products.url("http://a:8080", 7), "http://a:8080/products/7");
        assert_eq!(
            Route::Adjustments.url("http://a:8080", 7),
            "http://a:8080/admin/price/7/adjustments"
        );
        assert_eq!("price-db".parse::<Route>().unwrap(), Route::PriceDb);
        assert!("nope".parse::<Route>().is_err());
    }
}
