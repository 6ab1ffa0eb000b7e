use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub lot_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    pub name: String,
    pub code: String,
    pub cas_number: String,
    pub lot_number: String,
    pub mfg_date: String,
    pub exp_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRow {
    pub test: String,
    pub unit: String,
    pub specification: String,
    pub result: String,
}

/// Which extraction path produced the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    /// A table whose header carried all four expected column labels
    HeaderTable,
    /// Any table row with at least four cells
    AnyTable,
    /// Known test names found in the page text
    TextPatterns,
    /// Canned reference data; never real measurements
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub product: ProductInfo,
    pub tests: Vec<TestRow>,
    pub count: usize,
    pub source: Option<ExtractionSource>,
    pub degraded: bool,
}

impl ExtractionResult {
    pub fn new(
        product: ProductInfo,
        tests: Vec<TestRow>,
        source: Option<ExtractionSource>,
        degraded: bool,
    ) -> Self {
        let count = tests.len();
        Self {
            product,
            tests,
            count,
            source,
            degraded,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeResponse {
    pub success: bool,
    pub product: ProductInfo,
    pub tests: Vec<TestRow>,
    pub count: usize,
    pub source: Option<ExtractionSource>,
    pub degraded: bool,
}

impl From<ExtractionResult> for ScrapeResponse {
    fn from(result: ExtractionResult) -> Self {
        Self {
            success: true,
            product: result.product,
            tests: result.tests,
            count: result.count,
            source: result.source,
            degraded: result.degraded,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_serializes_camel_case() {
        let product = ProductInfo {
            name: "Acetonitrile".into(),
            code: "1698".into(),
            cas_number: "75-05-8".into(),
            lot_number: "A1".into(),
            mfg_date: "2024-01-02".into(),
            exp_date: "2027-01-01".into(),
        };
        let value = serde_json::to_value(&product).unwrap();
        assert_eq!(value["casNumber"], "75-05-8");
        assert_eq!(value["lotNumber"], "A1");
        assert_eq!(value["mfgDate"], "2024-01-02");
        assert_eq!(value["expDate"], "2027-01-01");
    }

    #[test]
    fn test_count_tracks_rows() {
        let product = ProductInfo {
            name: String::new(),
            code: String::new(),
            cas_number: String::new(),
            lot_number: String::new(),
            mfg_date: String::new(),
            exp_date: String::new(),
        };
        let row = TestRow {
            test: "Assay".into(),
            unit: "%".into(),
            specification: "min. 99.9".into(),
            result: "99.95".into(),
        };
        let result = ExtractionResult::new(product, vec![row.clone(), row], None, false);
        assert_eq!(result.count, 2);

        let response = ScrapeResponse::from(result);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["count"], 2);
        assert_eq!(value["tests"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let body = ErrorResponse {
            success: false,
            error: "no_test_data".into(),
            message: "No test data found".into(),
            details: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("details").is_none());
    }
}
