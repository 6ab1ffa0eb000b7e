use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::catalog;
use crate::product::{self, PageView, UNKNOWN_PRODUCT};
use crate::types::{ExtractionResult, ExtractionSource, ProductInfo, TestRow};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOptions {
    /// Allow canned catalog profiles when nothing real was found
    pub allow_fallback_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Test,
    Unit,
    Specification,
    Result,
}

/// Header labels per column, already uppercased and without whitespace.
const COLUMN_LABELS: &[(Column, &[&str])] = &[
    (Column::Test, &["TESTS", "TEST", "TESTITEMS", "TESTITEM", "ITEMS", "ITEM", "시험항목", "항목"]),
    (Column::Unit, &["UNITS", "UNIT", "단위"]),
    (
        Column::Specification,
        &["SPECIFICATIONS", "SPECIFICATION", "SPECS", "SPEC", "규격", "기준"],
    ),
    (
        Column::Result,
        &["TESTRESULTS", "TESTRESULT", "RESULTS", "RESULT", "시험결과", "결과"],
    ),
];

/// Header rows are searched for among the first few rows of a table.
const HEADER_SCAN_ROWS: usize = 3;
const MIN_TEST_CHARS: usize = 2;
/// A bare test-name mention with no values is only trusted on a short line.
const BARE_MENTION_MAX_CHARS: usize = 40;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

static HEADER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:tests|specifications?|results)\b|시험항목|시험결과").expect("header token pattern")
});

static FIELD_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\t+|\s*\|\s*|[:：]\s+|\s{2,}").expect("field separator pattern"));

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").expect("table selector"));
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").expect("body selector"));
static HEADINGS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3").expect("heading selector"));

#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    test: usize,
    unit: usize,
    specification: usize,
    result: usize,
}

impl ColumnMap {
    const POSITIONAL: ColumnMap = ColumnMap {
        test: 0,
        unit: 1,
        specification: 2,
        result: 3,
    };

    /// The vendor's five-column layout: item, specification, unit, method, result.
    const VENDOR_POSITIONAL: ColumnMap = ColumnMap {
        test: 0,
        unit: 2,
        specification: 1,
        result: 4,
    };

    fn positional(cells: &[String]) -> Self {
        if cells.len() >= 5 {
            Self::VENDOR_POSITIONAL
        } else {
            Self::POSITIONAL
        }
    }

    fn from_header(cells: &[String]) -> Option<Self> {
        let find = |column: Column| cells.iter().position(|c| label_column(c) == Some(column));
        Some(Self {
            test: find(Column::Test)?,
            unit: find(Column::Unit)?,
            specification: find(Column::Specification)?,
            result: find(Column::Result)?,
        })
    }

    fn row(&self, cells: &[String]) -> Option<TestRow> {
        let get = |idx: usize| cells.get(idx).cloned();
        Some(TestRow {
            test: get(self.test)?,
            unit: get(self.unit)?,
            specification: get(self.specification)?,
            result: get(self.result)?,
        })
    }
}

/// Turns a certificate page into product metadata and test rows.
///
/// Pure and deterministic: the same markup, lot and options always give the
/// same result. Tries, in order, a table with a recognised header, any table
/// with four-cell rows, known test names in the page text and finally (only
/// when enabled) canned catalog data.
pub fn extract(html: &str, lot: &str, options: &ExtractOptions) -> ExtractionResult {
    let document = Html::parse_document(html);
    let lines = page_lines(&document);
    let text = lines.join("\n");
    let headings = extract_headings(&document);
    let product = product::extract_product(
        &PageView {
            text: &text,
            headings: &headings,
        },
        lot,
    );

    if let Some(tests) = header_table_rows(&document) {
        info!("Extracted {} rows from header-matched table", tests.len());
        return ExtractionResult::new(product, tests, Some(ExtractionSource::HeaderTable), false);
    }

    let tests = any_table_rows(&document);
    if !tests.is_empty() {
        info!("No header-matched table; took {} rows from generic tables", tests.len());
        return ExtractionResult::new(product, tests, Some(ExtractionSource::AnyTable), false);
    }

    let (tests, used_reference) = text_pattern_rows(&lines);
    if !tests.is_empty() {
        info!(
            "No usable table; matched {} known tests in page text (reference values: {})",
            tests.len(),
            used_reference
        );
        return ExtractionResult::new(
            product,
            tests,
            Some(ExtractionSource::TextPatterns),
            used_reference,
        );
    }

    if options.allow_fallback_data {
        if let Some(profile) = catalog::fallback_profile_for(lot, &text) {
            info!("Using canned fallback profile '{}' for lot {}", profile.key, lot);
            let product = merge_profile_product(product, profile.product(lot));
            return ExtractionResult::new(
                product,
                profile.rows(),
                Some(ExtractionSource::Fallback),
                true,
            );
        }
    }

    debug!("No test data found in document for lot {}", lot);
    ExtractionResult::new(product, Vec::new(), None, false)
}

fn header_table_rows(document: &Html) -> Option<Vec<TestRow>> {
    for (index, table) in document.select(&TABLE).enumerate() {
        let rows: Vec<Vec<String>> = own_rows(table).into_iter().map(row_cells).collect();

        let header = rows
            .iter()
            .take(HEADER_SCAN_ROWS)
            .enumerate()
            .find_map(|(pos, cells)| ColumnMap::from_header(cells).map(|map| (pos, map)));
        let Some((header_pos, map)) = header else {
            continue;
        };

        let tests: Vec<TestRow> = rows[header_pos + 1..]
            .iter()
            .filter(|cells| cells.len() >= 4)
            .filter_map(|cells| map.row(cells))
            .filter(is_valid_row)
            .collect();

        debug!("Table #{} has a matching header with {} valid rows", index, tests.len());
        if !tests.is_empty() {
            return Some(tests);
        }
    }
    None
}

fn any_table_rows(document: &Html) -> Vec<TestRow> {
    document
        .select(&TABLE)
        .flat_map(own_rows)
        .map(row_cells)
        .filter(|cells| cells.len() >= 4)
        .filter_map(|cells| ColumnMap::positional(&cells).row(&cells))
        .filter(is_valid_row)
        .collect()
}

/// Scans text lines for catalog test names. Returns the rows and whether any
/// of them had to borrow reference values from the catalog.
fn text_pattern_rows(lines: &[String]) -> (Vec<TestRow>, bool) {
    let mut rows = Vec::new();
    let mut seen: Vec<&'static str> = Vec::new();
    let mut used_reference = false;

    for line in lines {
        let Some((known, start, _)) = catalog::known_test_in(line) else {
            continue;
        };
        if seen.contains(&known.name) || !is_list_prefix(&line[..start]) {
            continue;
        }

        let fields: Vec<String> = FIELD_SEPARATOR
            .split(&line[start..])
            .map(clean_cell)
            .filter(|f| !f.is_empty())
            .collect();
        let Some((label, values)) = fields.split_first() else {
            continue;
        };

        let row = match values {
            [unit, specification, result, ..] => TestRow {
                test: label.clone(),
                unit: unit.clone(),
                specification: specification.clone(),
                result: result.clone(),
            },
            [result] => {
                used_reference = true;
                TestRow {
                    test: known.name.to_string(),
                    unit: known.unit.to_string(),
                    specification: known.specification.to_string(),
                    result: result.clone(),
                }
            }
            [] if line.chars().count() <= BARE_MENTION_MAX_CHARS => {
                used_reference = true;
                TestRow {
                    test: known.name.to_string(),
                    unit: known.unit.to_string(),
                    specification: known.specification.to_string(),
                    result: "Not reported".to_string(),
                }
            }
            [specification, result] => {
                used_reference = true;
                TestRow {
                    test: label.clone(),
                    unit: known.unit.to_string(),
                    specification: specification.clone(),
                    result: result.clone(),
                }
            }
            _ => continue,
        };

        if is_valid_row(&row) {
            seen.push(known.name);
            rows.push(row);
        }
    }

    (rows, used_reference)
}

fn merge_profile_product(found: ProductInfo, canned: ProductInfo) -> ProductInfo {
    let pick = |found: String, canned: String| if found.is_empty() { canned } else { found };
    ProductInfo {
        name: if found.name == UNKNOWN_PRODUCT {
            canned.name
        } else {
            found.name
        },
        code: pick(found.code, canned.code),
        cas_number: pick(found.cas_number, canned.cas_number),
        lot_number: found.lot_number,
        mfg_date: found.mfg_date,
        exp_date: found.exp_date,
    }
}

/// Rows belonging to this table only; rows of nested tables are left out.
fn own_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|el| el.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

fn row_cells(row: ElementRef<'_>) -> Vec<String> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "td" | "th"))
        .map(|cell| clean_cell(&cell.text().collect::<Vec<_>>().join(" ")))
        .collect()
}

/// Collapses whitespace (NBSP included) and strips list bullets.
fn clean_cell(raw: &str) -> String {
    let collapsed = WHITESPACE.replace_all(raw, " ");
    let mut value = collapsed.trim();
    loop {
        let mut chars = value.chars();
        let stripped = match (chars.next(), chars.next()) {
            (Some('•' | '·' | '●' | '○' | '▪' | '■' | '□' | '◦' | '‣' | '∙'), _) => {
                &value[value.chars().next().map_or(0, char::len_utf8)..]
            }
            // dashes and asterisks only count as bullets when followed by a space
            (Some('-' | '*'), Some(' ')) => &value[1..],
            _ => break,
        };
        value = stripped.trim_start();
    }
    value.to_string()
}

fn compact_upper(cell: &str) -> String {
    cell.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn label_column(cell: &str) -> Option<Column> {
    let compact = compact_upper(cell);
    COLUMN_LABELS.iter().find_map(|(column, labels)| {
        labels
            .iter()
            .any(|label| {
                compact == *label
                    || compact
                        .strip_prefix(label)
                        .and_then(|rest| rest.chars().next())
                        .is_some_and(|next| !next.is_alphanumeric())
            })
            .then_some(*column)
    })
}

/// Exact header label match, ignoring case and whitespace. Unlike
/// `label_column` no trailing text is tolerated, so "Spec. gravity" is data.
fn is_header_label(cell: &str) -> bool {
    let compact = compact_upper(cell);
    COLUMN_LABELS
        .iter()
        .any(|(_, labels)| labels.contains(&compact.as_str()))
}

fn is_valid_row(row: &TestRow) -> bool {
    let test = row.test.trim();
    if test.chars().count() < MIN_TEST_CHARS {
        return false;
    }
    if is_header_label(test) || HEADER_TOKEN.is_match(test) {
        return false;
    }
    let label_cells = [&row.test, &row.unit, &row.specification, &row.result]
        .iter()
        .filter(|cell| is_header_label(cell))
        .count();
    label_cells < 2
}

/// True when the text before a test name is only list decoration ("1.", "•", "-").
fn is_list_prefix(prefix: &str) -> bool {
    prefix
        .chars()
        .all(|c| c.is_whitespace() || c.is_ascii_digit() || ".)-*•·●▪◦".contains(c))
}

fn extract_headings(document: &Html) -> Vec<String> {
    document
        .select(&HEADINGS)
        .map(|h| clean_cell(&h.text().collect::<Vec<_>>().join(" ")))
        .filter(|h| !h.is_empty())
        .collect()
}

/// Visible page text split into lines at block boundaries.
pub fn page_lines(document: &Html) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    match document.select(&BODY).next() {
        Some(body) => collect_lines(body, false, &mut lines, &mut current),
        None => collect_lines(document.root_element(), false, &mut lines, &mut current),
    }
    flush_line(&mut lines, &mut current);
    lines
}

fn collect_lines(
    element: ElementRef<'_>,
    preformatted: bool,
    lines: &mut Vec<String>,
    current: &mut String,
) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            let tag = el.value().name();
            if matches!(tag, "script" | "style" | "noscript" | "template" | "head") {
                continue;
            }
            if tag == "br" {
                flush_line(lines, current);
                continue;
            }
            let block = is_block(tag);
            if block {
                flush_line(lines, current);
            }
            collect_lines(el, preformatted || tag == "pre", lines, current);
            if block {
                flush_line(lines, current);
            }
        } else if let Some(text) = child.value().as_text() {
            if preformatted {
                current.push_str(text);
            } else {
                current.extend(text.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
            }
        }
    }
}

fn flush_line(lines: &mut Vec<String>, current: &mut String) {
    for line in current.split('\n') {
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    current.clear();
}

fn is_block(tag: &str) -> bool {
    matches!(
        tag,
        "address" | "article" | "aside" | "blockquote" | "caption" | "dd" | "div" | "dl" | "dt"
            | "fieldset" | "figcaption" | "figure" | "footer" | "form" | "h1" | "h2" | "h3"
            | "h4" | "h5" | "h6" | "header" | "hr" | "li" | "main" | "nav" | "ol" | "p"
            | "pre" | "section" | "table" | "tbody" | "td" | "tfoot" | "th" | "thead" | "tr"
            | "ul"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const COA_TABLE: &str = include_str!("../tests/fixtures/coa_table.html");
    const COA_REORDERED: &str = include_str!("../tests/fixtures/coa_reordered_localized.html");
    const COA_NO_TABLE: &str = include_str!("../tests/fixtures/coa_no_table.html");

    fn opts() -> ExtractOptions {
        ExtractOptions::default()
    }

    fn is_column_title(value: &str) -> bool {
        ["TESTS", "UNIT", "SPECIFICATION", "RESULTS"].contains(&value.to_uppercase().as_str())
    }

    #[test]
    fn test_header_table_three_rows() {
        let result = extract(COA_TABLE, "A23B0417", &opts());
        assert_eq!(result.source, Some(ExtractionSource::HeaderTable));
        assert!(!result.degraded);
        assert_eq!(result.count, 3);
        assert_eq!(result.tests.len(), 3);
        assert!(result.tests.iter().all(|row| !is_column_title(&row.test)));

        assert_eq!(
            result.tests[0],
            TestRow {
                test: "Appearance".into(),
                unit: "-".into(),
                specification: "Clear, colorless liquid".into(),
                result: "Conforms".into(),
            }
        );
        assert_eq!(result.tests[1].test, "Assay (GC)");
        assert_eq!(result.tests[1].result, "99.98");
        assert_eq!(result.tests[2].test, "Water (KF)");
    }

    #[test]
    fn test_product_fields_from_fixture() {
        let result = extract(COA_TABLE, "A23B0417", &opts());
        assert_eq!(result.product.name, "Acetonitrile");
        assert_eq!(result.product.code, "1698");
        assert_eq!(result.product.cas_number, "75-05-8");
        assert_eq!(result.product.lot_number, "A23B0417");
        assert_eq!(result.product.mfg_date, "2024-01-15");
        assert_eq!(result.product.exp_date, "2027-01-14");
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let first = extract(COA_TABLE, "A23B0417", &opts());
        let second = extract(COA_TABLE, "A23B0417", &opts());
        assert_eq!(first, second);
    }

    #[test]
    fn test_localized_reordered_columns_map_by_header() {
        let result = extract(COA_REORDERED, "K2405", &opts());
        assert_eq!(result.source, Some(ExtractionSource::HeaderTable));
        // the repeated header row in the body and the nested table are skipped
        assert_eq!(result.count, 2);
        assert_eq!(
            result.tests[0],
            TestRow {
                test: "외관".into(),
                unit: "-".into(),
                specification: "무색투명한 액체".into(),
                result: "적합".into(),
            }
        );
        assert_eq!(result.tests[1].test, "순도 (GC)");
        assert_eq!(result.tests[1].unit, "%");
        assert_eq!(result.tests[1].specification, "99.5 이상");
        assert_eq!(result.tests[1].result, "99.91");
    }

    #[test]
    fn test_any_table_fallback_without_header() {
        let html = "<html><body><table>\
            <tr><td>Lot</td><td>K1</td></tr>\
            <tr><td>• Density</td><td>g/mL</td><td>0.780 - 0.784</td><td>0.782</td></tr>\
            <tr><td>x</td><td>-</td><td>-</td><td>-</td></tr>\
            </table></body></html>";
        let result = extract(html, "K1", &opts());
        assert_eq!(result.source, Some(ExtractionSource::AnyTable));
        assert_eq!(result.count, 1);
        assert_eq!(result.tests[0].test, "Density");
        assert_eq!(result.tests[0].specification, "0.780 - 0.784");
    }

    #[test]
    fn test_any_table_vendor_five_column_layout() {
        let html = "<html><body><table>\
            <tr><td>Density</td><td>0.780 - 0.784</td><td>g/mL</td><td>KS M 0000</td><td>0.782</td></tr>\
            <tr><td>Water (KF)</td><td>max. 0.05</td><td>%</td><td>KF</td><td>0.01</td></tr>\
            </table></body></html>";
        let result = extract(html, "K2", &opts());
        assert_eq!(result.source, Some(ExtractionSource::AnyTable));
        assert_eq!(result.count, 2);
        assert_eq!(
            result.tests[0],
            TestRow {
                test: "Density".into(),
                unit: "g/mL".into(),
                specification: "0.780 - 0.784".into(),
                result: "0.782".into(),
            }
        );
        assert_eq!(result.tests[1].unit, "%");
        assert_eq!(result.tests[1].result, "0.01");
    }

    #[test]
    fn test_data_rows_starting_with_label_words_are_kept() {
        let html = "<html><body><table>\
            <tr><th>TESTS</th><th>UNIT</th><th>SPECIFICATION</th><th>RESULTS</th></tr>\
            <tr><td>Item (a) Appearance</td><td>-</td><td>Clear</td><td>Conforms</td></tr>\
            <tr><td>Test (IR)</td><td>-</td><td>Conforms</td><td>Conforms</td></tr>\
            <tr><td>Spec. gravity</td><td>-</td><td>0.78 - 0.79</td><td>0.786</td></tr>\
            </table></body></html>";
        let result = extract(html, "G1", &opts());
        assert_eq!(result.source, Some(ExtractionSource::HeaderTable));
        let names: Vec<&str> = result.tests.iter().map(|r| r.test.as_str()).collect();
        assert_eq!(names, vec!["Item (a) Appearance", "Test (IR)", "Spec. gravity"]);
    }

    #[test]
    fn test_text_pattern_fallback_without_tables() {
        let result = extract(COA_NO_TABLE, "P7781", &opts());
        assert_eq!(result.source, Some(ExtractionSource::TextPatterns));
        assert_eq!(result.product.name, "Hexane");
        assert_eq!(result.product.cas_number, "110-54-3");
        assert_eq!(result.count, 3);
        assert_eq!(result.tests[0].test, "Appearance");
        assert_eq!(result.tests[0].result, "Conforms");
        assert_eq!(result.tests[1].test, "Assay (GC)");
        assert_eq!(result.tests[1].unit, "%");
        assert_eq!(result.tests[1].result, "99.93");
        // "Water: 0.01" carries only a result; the specification is reference data
        assert_eq!(result.tests[2].test, "Water (KF)");
        assert_eq!(result.tests[2].result, "0.01");
        assert!(result.degraded);
        // prose mentioning water is not a row
        assert!(result.tests.iter().all(|r| !r.test.contains("Keep")));
    }

    #[test]
    fn test_no_table_no_patterns_is_empty_not_a_crash() {
        let html = "<html><body><p>Lot not found. Please check the number.</p></body></html>";
        let result = extract(html, "Z9", &opts());
        assert!(result.tests.is_empty());
        assert_eq!(result.count, 0);
        assert_eq!(result.source, None);
        assert_eq!(result.product.lot_number, "Z9");
    }

    #[test]
    fn test_fallback_profile_only_when_enabled() {
        let html = "<html><body><h1>Acetonitrile</h1><p>No results.</p></body></html>";
        let plain = extract(html, "ACN001", &opts());
        assert!(plain.tests.is_empty());

        let enabled = ExtractOptions {
            allow_fallback_data: true,
        };
        let result = extract(html, "ACN001", &enabled);
        assert_eq!(result.source, Some(ExtractionSource::Fallback));
        assert!(result.degraded);
        assert_eq!(result.count, result.tests.len());
        assert_eq!(result.product.name, "Acetonitrile");
        assert_eq!(result.product.cas_number, "75-05-8");
        assert_eq!(result.product.lot_number, "ACN001");
    }

    #[test]
    fn test_clean_cell_bullets_and_whitespace() {
        assert_eq!(clean_cell("  •  Water\u{a0}\u{a0}(KF)\n "), "Water (KF)");
        assert_eq!(clean_cell("- Appearance"), "Appearance");
        assert_eq!(clean_cell("-"), "-");
        assert_eq!(clean_cell("-5 °C"), "-5 °C");
        assert_eq!(clean_cell("● ▪ Color"), "Color");
    }

    #[test]
    fn test_header_rows_are_rejected() {
        let header = TestRow {
            test: "TESTS".into(),
            unit: "UNIT".into(),
            specification: "SPECIFICATION".into(),
            result: "RESULTS".into(),
        };
        assert!(!is_valid_row(&header));
        let short = TestRow {
            test: "A".into(),
            ..header.clone()
        };
        assert!(!is_valid_row(&short));
        let containing = TestRow {
            test: "Test Results Summary".into(),
            unit: "".into(),
            specification: "".into(),
            result: "".into(),
        };
        assert!(!is_valid_row(&containing));
        let real = TestRow {
            test: "Unit weight".into(),
            unit: "g".into(),
            specification: "Report".into(),
            result: "1.2".into(),
        };
        assert!(is_valid_row(&real));
        let gravity = TestRow {
            test: "Spec. gravity".into(),
            ..real.clone()
        };
        assert!(is_valid_row(&gravity));
        let spaced_label = TestRow {
            test: "Test Items".into(),
            ..real
        };
        assert!(!is_valid_row(&spaced_label));
    }

    #[test]
    fn test_page_lines_respect_blocks_and_pre() {
        let html = "<html><head><title>t</title><style>td{}</style></head><body>\
            <p>Product <b>code</b>: 1698</p><pre>line one\nline  two</pre>\
            <div>a<br>b</div><script>var x = 1;</script></body></html>";
        let document = Html::parse_document(html);
        assert_eq!(
            page_lines(&document),
            vec!["Product code: 1698", "line one", "line  two", "a", "b"]
        );
    }
}
