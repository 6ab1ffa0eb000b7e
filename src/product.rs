use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::types::ProductInfo;

pub const UNKNOWN_PRODUCT: &str = "Unknown Product";

/// The parts of a parsed page the probes look at.
pub struct PageView<'a> {
    /// Visible text, one block per line
    pub text: &'a str,
    /// h1-h3 texts in document order
    pub headings: &'a [String],
}

enum ProbeKind {
    /// First capture group of the pattern is the value
    Pattern(Regex),
    FirstHeading,
}

/// A single named way of finding one product field.
pub struct FieldProbe {
    pub name: &'static str,
    kind: ProbeKind,
}

impl FieldProbe {
    fn pattern(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            kind: ProbeKind::Pattern(Regex::new(pattern).expect("field probe pattern")),
        }
    }

    pub fn probe(&self, page: &PageView<'_>) -> Option<String> {
        match &self.kind {
            ProbeKind::Pattern(re) => re
                .captures(page.text)
                .and_then(|caps| caps.get(1))
                .map(|m| clean_value(m.as_str()))
                .filter(|v| !v.is_empty()),
            ProbeKind::FirstHeading => page
                .headings
                .iter()
                .map(|h| clean_value(h))
                .find(|h| !h.is_empty() && !is_generic_heading(h)),
        }
    }
}

static NAME_PROBES: Lazy<Vec<FieldProbe>> = Lazy::new(|| {
    vec![
        FieldProbe::pattern(
            "bracketed-cas-suffix",
            r"(?im)^[ \t]*(?:(?:product[ \t]*name|제품명)[ \t]*[:：]?[ \t]*)?([^\n\[\]]{2,120}?)[ \t]*\[[ \t]*\d{2,7}-\d{2}-\d[ \t]*\]",
        ),
        FieldProbe::pattern(
            "coa-title",
            r"(?i)certificate[ \t]+of[ \t]+analysis[ \t]*[-:–—][ \t]*([^\n]+)",
        ),
        FieldProbe::pattern(
            "product-name-label",
            r"(?i)(?:product[ \t]*name|제품명)[ \t]*[:：]?\s*([^\n]+)",
        ),
        FieldProbe {
            name: "first-heading",
            kind: ProbeKind::FirstHeading,
        },
    ]
});

static CODE_PROBES: Lazy<Vec<FieldProbe>> = Lazy::new(|| {
    vec![
        FieldProbe::pattern(
            "product-code-label",
            r"(?i)(?:product[ \t]*code|제품[ \t]*코드)[ \t]*[:：.]?\s*(\d[\d-]*)",
        ),
        FieldProbe::pattern(
            "catalog-no-label",
            r"(?i)\bcat(?:alog(?:ue)?)?\.?[ \t]*no\.?[ \t]*[:：]?\s*([A-Za-z0-9][A-Za-z0-9-]*)",
        ),
    ]
});

static CAS_PROBES: Lazy<Vec<FieldProbe>> = Lazy::new(|| {
    vec![
        FieldProbe::pattern("bracketed-cas", r"\[\s*(\d{2,7}-\d{2}-\d)\s*\]"),
        FieldProbe::pattern(
            "cas-label",
            r"(?i)CAS[ \t]*(?:No\.?|Number|#)?[ \t]*[:：]?\s*(\d{2,7}-\d{2}-\d)",
        ),
    ]
});

static LOT_PROBES: Lazy<Vec<FieldProbe>> = Lazy::new(|| {
    vec![FieldProbe::pattern(
        "lot-no-label",
        r"(?i)\blot[ \t]*(?:no\b\.?|number|#)[ \t]*[:：]?\s*([A-Za-z0-9][A-Za-z0-9._-]*)",
    )]
});

static MFG_PROBES: Lazy<Vec<FieldProbe>> = Lazy::new(|| {
    vec![
        FieldProbe::pattern(
            "mfg-date-label",
            r"(?i)\bmfg\.?[ \t]*date[ \t]*[:：]?\s*(\d{4}[-./]\d{1,2}[-./]\d{1,2})",
        ),
        FieldProbe::pattern(
            "manufacture-date-label",
            r"(?i)(?:manufactur(?:e|ing)[ \t]*date|제조일자?)[ \t]*[:：]?\s*(\d{4}[-./]\d{1,2}[-./]\d{1,2})",
        ),
    ]
});

static EXP_PROBES: Lazy<Vec<FieldProbe>> = Lazy::new(|| {
    vec![
        FieldProbe::pattern("exp-date-label", r"(?i)\bexp\.?[ \t]*date[ \t]*[:：]?\s*([^\n]+)"),
        FieldProbe::pattern(
            "expiry-date-label",
            r"(?i)(?:(?:expiry|expiration|retest)[ \t]*date|유효기간)[ \t]*[:：]?\s*([^\n]+)",
        ),
    ]
});

static DATE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-./](\d{1,2})[-./](\d{1,2})").expect("date pattern"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Runs probes in priority order; the first hit wins.
pub fn first_match(probes: &[FieldProbe], page: &PageView<'_>) -> Option<(&'static str, String)> {
    probes
        .iter()
        .find_map(|probe| probe.probe(page).map(|value| (probe.name, value)))
}

fn field(label: &str, probes: &[FieldProbe], page: &PageView<'_>, default: &str) -> String {
    match first_match(probes, page) {
        Some((probe, value)) => {
            debug!("{} matched by probe '{}': {}", label, probe, value);
            value
        }
        None => {
            debug!("{} not found, using default", label);
            default.to_string()
        }
    }
}

pub fn extract_product(page: &PageView<'_>, lot: &str) -> ProductInfo {
    ProductInfo {
        name: field("name", &NAME_PROBES, page, UNKNOWN_PRODUCT),
        code: field("code", &CODE_PROBES, page, ""),
        cas_number: field("casNumber", &CAS_PROBES, page, ""),
        lot_number: field("lotNumber", &LOT_PROBES, page, lot),
        mfg_date: normalize_date(&field("mfgDate", &MFG_PROBES, page, "")),
        exp_date: normalize_date(&field("expDate", &EXP_PROBES, page, "")),
    }
}

/// Rewrites a leading `YYYY.M.D` style date as `YYYY-MM-DD`; anything else is returned as is.
pub fn normalize_date(value: &str) -> String {
    let Some(caps) = DATE_PREFIX.captures(value) else {
        return value.to_string();
    };
    let parsed = (
        caps[1].parse::<i32>(),
        caps[2].parse::<u32>(),
        caps[3].parse::<u32>(),
    );
    match parsed {
        (Ok(y), Ok(m), Ok(d)) => match NaiveDate::from_ymd_opt(y, m, d) {
            Some(date) => format!("{}{}", date.format("%Y-%m-%d"), &value[caps[0].len()..]),
            None => value.to_string(),
        },
        _ => value.to_string(),
    }
}

fn clean_value(raw: &str) -> String {
    WHITESPACE
        .replace_all(raw, " ")
        .trim()
        .trim_end_matches([',', ';'])
        .trim()
        .to_string()
}

fn is_generic_heading(heading: &str) -> bool {
    let lower = heading.to_lowercase();
    lower == "certificate of analysis" || lower == "coa" || lower == "시험성적서"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(text: &'a str, headings: &'a [String]) -> PageView<'a> {
        PageView { text, headings }
    }

    #[test]
    fn test_full_header_block() {
        let text = "Certificate of Analysis\n\
                    Acetonitrile [75-05-8]\n\
                    Product code : 1698\n\
                    Lot No. : A23B0417\n\
                    Mfg. Date : 2024.1.15\n\
                    Exp. Date : 3 years from Mfg. date";
        let product = extract_product(&view(text, &[]), "QUERY1");
        assert_eq!(product.name, "Acetonitrile");
        assert_eq!(product.code, "1698");
        assert_eq!(product.cas_number, "75-05-8");
        assert_eq!(product.lot_number, "A23B0417");
        assert_eq!(product.mfg_date, "2024-01-15");
        assert_eq!(product.exp_date, "3 years from Mfg. date");
    }

    #[test]
    fn test_bracketed_cas_name_drops_label() {
        let (rule, name) =
            first_match(&NAME_PROBES, &view("Product name: Hexane [110-54-3]", &[])).unwrap();
        assert_eq!(rule, "bracketed-cas-suffix");
        assert_eq!(name, "Hexane");

        let (_, name) = first_match(&NAME_PROBES, &view("제품명 : 메탄올 [67-56-1]", &[])).unwrap();
        assert_eq!(name, "메탄올");
    }

    #[test]
    fn test_labels_and_values_on_separate_lines() {
        let text = "Product code\n1470\nCAS No.\n67-56-1\nMfg. Date\n2023-11-30";
        let product = extract_product(&view(text, &[]), "L1");
        assert_eq!(product.code, "1470");
        assert_eq!(product.cas_number, "67-56-1");
        assert_eq!(product.mfg_date, "2023-11-30");
    }

    #[test]
    fn test_defaults_when_nothing_matches() {
        let product = extract_product(&view("nothing useful here", &[]), "L42");
        assert_eq!(product.name, UNKNOWN_PRODUCT);
        assert_eq!(product.code, "");
        assert_eq!(product.cas_number, "");
        assert_eq!(product.lot_number, "L42");
        assert_eq!(product.mfg_date, "");
        assert_eq!(product.exp_date, "");
    }

    #[test]
    fn test_name_probe_priority() {
        let headings = vec!["Certificate of Analysis".to_string(), "Toluene".to_string()];
        let (probe, name) = first_match(&NAME_PROBES, &view("no names here", &headings)).unwrap();
        assert_eq!(probe, "first-heading");
        assert_eq!(name, "Toluene");

        let (probe, name) = first_match(
            &NAME_PROBES,
            &view("Certificate of Analysis - Methanol, HPLC", &headings),
        )
        .unwrap();
        assert_eq!(probe, "coa-title");
        assert_eq!(name, "Methanol, HPLC");
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2024/03/07"), "2024-03-07");
        assert_eq!(normalize_date("2027.01.31 (retest)"), "2027-01-31 (retest)");
        assert_eq!(normalize_date("2024-13-40"), "2024-13-40");
        assert_eq!(normalize_date("Jan 2027"), "Jan 2027");
    }
}
