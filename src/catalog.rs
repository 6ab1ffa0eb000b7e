//! Reference data for the text-pattern and canned fallbacks.
//!
//! Nothing in here is a measurement. Rows built from these tables are
//! reported with `degraded: true`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ProductInfo, TestRow};

pub struct KnownTest {
    pub name: &'static str,
    /// Words that identify the test in free text, matched case-insensitively
    pub aliases: &'static [&'static str],
    pub unit: &'static str,
    pub specification: &'static str,
}

pub const KNOWN_TESTS: &[KnownTest] = &[
    KnownTest {
        name: "Appearance",
        aliases: &["appearance", "외관"],
        unit: "-",
        specification: "Clear, colorless liquid",
    },
    KnownTest {
        name: "Assay (GC)",
        aliases: &["assay", "purity", "순도", "함량"],
        unit: "%",
        specification: "min. 99.5",
    },
    KnownTest {
        name: "Water (KF)",
        aliases: &["water", "moisture", "수분"],
        unit: "%",
        specification: "max. 0.05",
    },
    KnownTest {
        name: "Density (20℃)",
        aliases: &["density", "밀도"],
        unit: "g/mL",
        specification: "Report",
    },
    KnownTest {
        name: "Refractive index",
        aliases: &["refractive index", "굴절률"],
        unit: "-",
        specification: "Report",
    },
    KnownTest {
        name: "Color (APHA)",
        aliases: &["color", "colour", "색상"],
        unit: "APHA",
        specification: "max. 10",
    },
    KnownTest {
        name: "Residue after evaporation",
        aliases: &["residue after evaporation", "residue on evaporation", "증발잔류물"],
        unit: "%",
        specification: "max. 0.001",
    },
    KnownTest {
        name: "Acidity",
        aliases: &["acidity", "산도"],
        unit: "meq/g",
        specification: "max. 0.0002",
    },
    KnownTest {
        name: "Identification (IR)",
        aliases: &["identification", "확인시험"],
        unit: "-",
        specification: "Conforms",
    },
    KnownTest {
        name: "Heavy metals (as Pb)",
        aliases: &["heavy metals", "중금속"],
        unit: "ppm",
        specification: "max. 1",
    },
];

static ALIAS_PATTERNS: Lazy<Vec<(usize, Regex)>> = Lazy::new(|| {
    KNOWN_TESTS
        .iter()
        .enumerate()
        .flat_map(|(idx, known)| {
            known.aliases.iter().map(move |alias| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(alias));
                (idx, Regex::new(&pattern).expect("alias pattern"))
            })
        })
        .collect()
});

/// Earliest catalog test mentioned in `text`, with the byte span of the match.
pub fn known_test_in(text: &str) -> Option<(&'static KnownTest, usize, usize)> {
    ALIAS_PATTERNS
        .iter()
        .filter_map(|(idx, re)| re.find(text).map(|m| (*idx, m.start(), m.end())))
        .min_by_key(|(idx, start, _)| (*start, *idx))
        .map(|(idx, start, end)| (&KNOWN_TESTS[idx], start, end))
}

pub struct FallbackProfile {
    pub key: &'static str,
    /// Substrings of the lot identifier (uppercase) that select this profile
    pub lot_markers: &'static [&'static str],
    /// Substrings of the page text that select this profile
    pub body_markers: &'static [&'static str],
    pub name: &'static str,
    pub code: &'static str,
    pub cas_number: &'static str,
    pub tests: &'static [(&'static str, &'static str, &'static str, &'static str)],
}

pub const FALLBACK_PROFILES: &[FallbackProfile] = &[
    FallbackProfile {
        key: "acetonitrile-hplc",
        lot_markers: &["ACN"],
        body_markers: &["75-05-8", "Acetonitrile"],
        name: "Acetonitrile, HPLC grade",
        code: "1698",
        cas_number: "75-05-8",
        tests: &[
            ("Appearance", "-", "Clear, colorless liquid", "Conforms"),
            ("Assay (GC)", "%", "min. 99.9", "99.98"),
            ("Water (KF)", "%", "max. 0.02", "0.005"),
            ("UV cutoff", "nm", "max. 190", "189"),
        ],
    },
    FallbackProfile {
        key: "methanol-hplc",
        lot_markers: &["MEOH"],
        body_markers: &["67-56-1", "Methanol"],
        name: "Methanol, HPLC grade",
        code: "1470",
        cas_number: "67-56-1",
        tests: &[
            ("Appearance", "-", "Clear, colorless liquid", "Conforms"),
            ("Assay (GC)", "%", "min. 99.9", "99.97"),
            ("Water (KF)", "%", "max. 0.03", "0.008"),
            ("Residue after evaporation", "%", "max. 0.0005", "0.0001"),
        ],
    },
];

impl FallbackProfile {
    pub fn matches(&self, lot: &str, page_text: &str) -> bool {
        let lot = lot.to_uppercase();
        let lower_text = page_text.to_lowercase();
        self.lot_markers.iter().any(|m| lot.contains(m))
            || self
                .body_markers
                .iter()
                .any(|m| lower_text.contains(&m.to_lowercase()))
    }

    pub fn product(&self, lot: &str) -> ProductInfo {
        ProductInfo {
            name: self.name.to_string(),
            code: self.code.to_string(),
            cas_number: self.cas_number.to_string(),
            lot_number: lot.to_string(),
            mfg_date: String::new(),
            exp_date: String::new(),
        }
    }

    pub fn rows(&self) -> Vec<TestRow> {
        self.tests
            .iter()
            .map(|(test, unit, specification, result)| TestRow {
                test: test.to_string(),
                unit: unit.to_string(),
                specification: specification.to_string(),
                result: result.to_string(),
            })
            .collect()
    }
}

pub fn fallback_profile_for(lot: &str, page_text: &str) -> Option<&'static FallbackProfile> {
    FALLBACK_PROFILES.iter().find(|p| p.matches(lot, page_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_test_lookup_is_case_insensitive() {
        let (known, start, end) = known_test_in("  WATER (KF)   %   max. 0.05   0.01").unwrap();
        assert_eq!(known.name, "Water (KF)");
        assert_eq!(&"  WATER (KF)   %   max. 0.05   0.01"[start..end], "WATER");
        assert!(known_test_in("Storage conditions").is_none());
        // whole words only
        assert!(known_test_in("Clear, colorless").is_none());
    }

    #[test]
    fn test_fallback_profile_selection() {
        assert_eq!(fallback_profile_for("ACN2401", "").unwrap().key, "acetonitrile-hplc");
        assert_eq!(
            fallback_profile_for("X1", "Methanol [67-56-1]").unwrap().key,
            "methanol-hplc"
        );
        assert!(fallback_profile_for("X1", "Toluene").is_none());
    }

    #[test]
    fn test_profile_rows_are_complete() {
        for profile in FALLBACK_PROFILES {
            let rows = profile.rows();
            assert!(!rows.is_empty());
            assert!(rows.iter().all(|r| !r.test.is_empty() && !r.result.is_empty()));
            assert_eq!(profile.product("L1").lot_number, "L1");
        }
    }
}
