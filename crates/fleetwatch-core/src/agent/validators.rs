//! Domain response validators for the HTTP worker.
//!
//! Validators only run on 2xx responses and their findings are advisory:
//! the step's pass/fail is decided by the HTTP status alone.

use std::str::FromStr;

use serde_json::Value;

use crate::evidence::ValidationFinding;

/// How deep the structural searches descend into a response.
const MAX_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseValidator {
    /// CRM/Books record carrying an identifier
    ZohoRecord,
    /// Shop-management lookup returning a list
    FullbayRecord,
    /// Place lookup returning a formatted address
    PlacesResult,
    /// Quote calculation returning a numeric total
    CalculationTotal,
    /// Generated PDF (inline bytes, base64 payload or file reference)
    PdfDocument,
    JsonObject,
    NonEmpty,
}

impl FromStr for ResponseValidator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zoho_record" => Ok(Self::ZohoRecord),
            "fullbay_record" => Ok(Self::FullbayRecord),
            "places_result" => Ok(Self::PlacesResult),
            "calculation_total" => Ok(Self::CalculationTotal),
            "pdf_document" => Ok(Self::PdfDocument),
            "json_object" => Ok(Self::JsonObject),
            "non_empty" => Ok(Self::NonEmpty),
            other => Err(format!("unknown validation rule '{}'", other)),
        }
    }
}

impl ResponseValidator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ZohoRecord => "zoho_record",
            Self::FullbayRecord => "fullbay_record",
            Self::PlacesResult => "places_result",
            Self::CalculationTotal => "calculation_total",
            Self::PdfDocument => "pdf_document",
            Self::JsonObject => "json_object",
            Self::NonEmpty => "non_empty",
        }
    }

    pub fn check(&self, body: &Value) -> ValidationFinding {
        let (passed, detail) = match self {
            Self::ZohoRecord => match find_id(body, 0) {
                Some(id) => (true, format!("record id {}", id)),
                None => (false, "no record id in response".to_string()),
            },
            Self::FullbayRecord => match find_array(body, 0) {
                Some(len) => (true, format!("{} record(s) returned", len)),
                None => (false, "no record list in response".to_string()),
            },
            Self::PlacesResult => match find_string_field(body, &["formatted_address", "formattedaddress", "address"], 0) {
                Some(addr) => (true, format!("address '{}'", addr)),
                None => (false, "no formatted address in response".to_string()),
            },
            Self::CalculationTotal => match find_total(body, 0) {
                Some(total) => (true, format!("total {}", total)),
                None => (false, "no numeric total in response".to_string()),
            },
            Self::PdfDocument => {
                if looks_like_pdf(body, 0) {
                    (true, "pdf document present".to_string())
                } else {
                    (false, "no pdf document in response".to_string())
                }
            }
            Self::JsonObject => (body.is_object(), describe(body)),
            Self::NonEmpty => (!is_empty(body), describe(body)),
        };
        ValidationFinding {
            rule: self.name().to_string(),
            passed,
            detail,
        }
    }
}

/// Run a named rule. Unknown names produce a failed advisory finding
/// instead of an error.
pub fn check_rule(rule: &str, body: &Value) -> ValidationFinding {
    match rule.parse::<ResponseValidator>() {
        Ok(validator) => validator.check(body),
        Err(message) => ValidationFinding {
            rule: rule.to_string(),
            passed: false,
            detail: message,
        },
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(s) => format!("string ({} chars)", s.chars().count()),
        Value::Array(a) => format!("array ({} items)", a.len()),
        Value::Object(o) => format!("object ({} keys)", o.len()),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn find_id(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let key = key.to_lowercase();
                if key == "id" || key.ends_with("_id") {
                    if let Some(id) = scalar_id(v) {
                        return Some(id);
                    }
                }
            }
            map.values().find_map(|v| find_id(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_id(v, depth + 1)),
        _ => None,
    }
}

fn find_array(value: &Value, depth: usize) -> Option<usize> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => map.values().find_map(|v| find_array(v, depth + 1)),
        _ => None,
    }
}

fn find_string_field(value: &Value, keys: &[&str], depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if keys.contains(&key.to_lowercase().as_str()) {
                    if let Some(s) = v.as_str().filter(|s| !s.trim().is_empty()) {
                        return Some(s.to_string());
                    }
                }
            }
            map.values()
                .find_map(|v| find_string_field(v, keys, depth + 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|v| find_string_field(v, keys, depth + 1)),
        _ => None,
    }
}

fn find_total(value: &Value, depth: usize) -> Option<f64> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key.to_lowercase().contains("total") {
                    let number = match v {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().trim_start_matches('$').replace(',', "").parse().ok(),
                        _ => None,
                    };
                    if number.is_some() {
                        return number;
                    }
                }
            }
            map.values().find_map(|v| find_total(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_total(v, depth + 1)),
        _ => None,
    }
}

fn looks_like_pdf(value: &Value, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    match value {
        Value::String(s) => {
            s.starts_with("%PDF") || s.starts_with("JVBERi") || s.to_lowercase().ends_with(".pdf")
        }
        Value::Object(map) => map.iter().any(|(key, v)| {
            (key.to_lowercase().contains("pdf") && !is_empty(v) && v != &Value::Bool(false))
                || looks_like_pdf(v, depth + 1)
        }),
        Value::Array(items) => items.iter().any(|v| looks_like_pdf(v, depth + 1)),
        _ => false,
    }
}
