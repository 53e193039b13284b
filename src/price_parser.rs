use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::config::PriceConfig;
use crate::utils::error::{AppError, Result};

const CURRENCY_MARKER: &str = "R$";

/// Why a price text did not yield a usable value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PriceError {
    #[error("Unparseable price text: {0:?}")]
    Unparseable(String),

    #[error("Price {value} outside accepted range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

impl From<PriceError> for AppError {
    fn from(err: PriceError) -> Self {
        match err {
            PriceError::Unparseable(_) => AppError::Parse { message: err.to_string() },
            PriceError::OutOfRange { .. } => AppError::Validation(err.to_string()),
        }
    }
}

/// Turns Brazilian-formatted price text (`R$ 1.234,56`, `3x de R$ 333,33`) into a number.
pub struct PriceParser {
    installment_regex: Regex,
    numeric_run_regex: Regex,
    min_price: f64,
    max_price: f64,
}

impl PriceParser {
    pub fn new(config: &PriceConfig) -> Result<Self> {
        Self::with_range(config.min_price, config.max_price)
    }

    pub fn with_range(min_price: f64, max_price: f64) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::Internal(format!("Invalid price pattern: {}", e)))
        };

        Ok(Self {
            installment_regex: compile(r"(?i)^\s*(\d+)\s*x\s*de\s*R\$\s*([\d.,]+)\s*$")?,
            numeric_run_regex: compile(r"\d+(?:\.\d+)?")?,
            min_price,
            max_price,
        })
    }

    pub fn min_price(&self) -> f64 {
        self.min_price
    }

    pub fn max_price(&self) -> f64 {
        self.max_price
    }

    pub fn parse(&self, text: &str) -> std::result::Result<f64, PriceError> {
        let unparseable = || PriceError::Unparseable(text.to_string());

        if text.trim().is_empty() {
            return Err(unparseable());
        }

        if let Some(total) = self.parse_installments(text) {
            return total.to_f64().ok_or_else(unparseable);
        }

        if !Self::is_allowed(text) {
            debug!("Rejecting price text with foreign characters: {:?}", text);
            return Err(unparseable());
        }

        self.parse_structured(text)
            .or_else(|| {
                debug!("Structured parse failed for {:?}, trying permissive pass", text);
                Self::parse_permissive(text)
            })
            .and_then(|value| value.to_f64())
            .ok_or_else(unparseable)
    }

    /// Inclusive range check.
    pub fn validate(&self, value: f64) -> std::result::Result<f64, PriceError> {
        if value.is_finite() && value >= self.min_price && value <= self.max_price {
            Ok(value)
        } else {
            Err(PriceError::OutOfRange {
                value,
                min: self.min_price,
                max: self.max_price,
            })
        }
    }

    pub fn parse_and_validate(&self, text: &str) -> std::result::Result<f64, PriceError> {
        self.parse(text).and_then(|value| self.validate(value))
    }

    /// `Nx de R$ Y` means N installments of Y.
    fn parse_installments(&self, text: &str) -> Option<Decimal> {
        let captures = self.installment_regex.captures(text)?;
        let count = Decimal::from_str(captures.get(1)?.as_str()).ok()?;
        if count.is_zero() {
            return None;
        }
        let per_installment = Decimal::from_str(&normalize_separators(captures.get(2)?.as_str())).ok()?;
        count.checked_mul(per_installment)
    }

    fn is_allowed(text: &str) -> bool {
        text.replace(CURRENCY_MARKER, "")
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == ',' || c.is_whitespace())
    }

    fn parse_structured(&self, text: &str) -> Option<Decimal> {
        let cleaned: String = normalize_separators(&text.replace(CURRENCY_MARKER, ""))
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let run = self.numeric_run_regex.find(&cleaned)?;
        Decimal::from_str(run.as_str()).ok()
    }

    /// Keeps digits and separators; the last separator is the decimal point.
    fn parse_permissive(text: &str) -> Option<Decimal> {
        let kept: String = text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
            .map(|c| if c == ',' { '.' } else { c })
            .collect();

        let canonical = match kept.rfind('.') {
            Some(idx) => format!("{}.{}", kept[..idx].replace('.', ""), &kept[idx + 1..]),
            None => kept,
        };
        let canonical = canonical.trim_end_matches('.');
        let canonical = if canonical.starts_with('.') {
            format!("0{}", canonical)
        } else {
            canonical.to_string()
        };

        Decimal::from_str(&canonical).ok()
    }
}

/// `.` is the thousands separator and `,` the decimal separator.
fn normalize_separators(text: &str) -> String {
    text.replace('.', "").replace(',', ".")
}
