//! Pure transformation of fetched portal markup into [`RemoteRecord`]s.
//!
//! No network or database access happens here; everything is testable with
//! fixed HTML fixtures. Unknown or missing fields yield an absent value, not
//! an empty string, so the merger sees a single "no information" shape.

use crate::model::{
    FieldKind, ParseWarning, RawPage, RemoteRecord, RemoteVisit, FORM_FIELDS, LABEL_FIELDS,
};
use anyhow::{bail, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// One row of the portal's entity enumeration table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntity {
    pub remote_id: String,
    pub display_name: String,
}

/// Parse result for one detail page: the record plus non-fatal warnings.
#[derive(Debug, Clone)]
pub struct ParsedDetail {
    pub record: RemoteRecord,
    pub warnings: Vec<ParseWarning>,
}

const DOB_LABEL: &str = "Дата рождения:";
const VISA_LABEL: &str = "Номер визы:";

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static LISTING_TABLE: Lazy<Selector> = Lazy::new(|| selector("table#TableCustomer"));
static LISTING_ROWS: Lazy<Selector> = Lazy::new(|| selector("table#TableCustomer tbody tr"));
static VISIT_ROWS: Lazy<Selector> = Lazy::new(|| selector("table#visit tbody tr"));
static INFO_SECTIONS: Lazy<Selector> = Lazy::new(|| selector("div.invoice-col"));
static CELLS: Lazy<Selector> = Lazy::new(|| selector("td"));
static ANCHOR: Lazy<Selector> = Lazy::new(|| selector("a"));
static SELECTED_OPTION: Lazy<Selector> = Lazy::new(|| selector("option[selected]"));

/// Form element selectors, one per mapped field.
static FORM_SELECTORS: Lazy<Vec<(usize, Selector)>> = Lazy::new(|| {
    FORM_FIELDS
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let css = format!(
                "input[name=\"{0}\"], select[name=\"{0}\"], textarea[name=\"{0}\"]",
                spec.portal
            );
            (i, selector(&css))
        })
        .collect()
});

fn label_regex(label: &str) -> Regex {
    Regex::new(&format!(r"{}\s*([^\n]*)", regex::escape(label))).expect("label regex")
}

static LABEL_EXTRACTORS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    LABEL_FIELDS
        .iter()
        .map(|(label, column)| (*column, label_regex(label)))
        .collect()
});
static DOB_RE: Lazy<Regex> = Lazy::new(|| label_regex(DOB_LABEL));
static VISA_RE: Lazy<Regex> = Lazy::new(|| label_regex(VISA_LABEL));

/// Extract `(remote_id, display_name)` pairs from the enumeration page.
/// The listing is the run's work list; a missing table is a layout change we
/// cannot recover from.
pub fn parse_listing(page: &RawPage) -> Result<Vec<ListedEntity>> {
    let doc = Html::parse_document(&page.body);
    if doc.select(&LISTING_TABLE).next().is_none() {
        bail!("client listing table not found in portal response");
    }

    let mut entities = Vec::new();
    for row in doc.select(&LISTING_ROWS) {
        let cells: Vec<ElementRef> = row.select(&CELLS).collect();
        if cells.len() < 2 {
            continue;
        }
        // Second cell links to the detail page; the href's last segment is
        // the portal's id.
        let Some(link) = cells[1].select(&ANCHOR).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let remote_id = href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let display_name = collapse_text(link);
        if remote_id.is_empty() || display_name.is_empty() {
            continue;
        }
        entities.push(ListedEntity {
            remote_id,
            display_name,
        });
    }
    Ok(entities)
}

/// Parse one entity detail page into a [`RemoteRecord`].
///
/// `display_name` comes from the listing row; the detail page does not
/// repeat it in a reliably extractable place.
pub fn parse_detail(remote_id: &str, display_name: &str, page: &RawPage) -> ParsedDetail {
    let doc = Html::parse_document(&page.body);
    let mut record = RemoteRecord::new(remote_id, display_name);
    let mut warnings = Vec::new();

    extract_labeled_sections(&doc, &mut record, &mut warnings);
    extract_form_fields(&doc, &mut record);
    record.visits = extract_visits(&doc, &mut warnings);

    ParsedDetail { record, warnings }
}

/// Walk the summary blocks and pull `label: value` pairs.
fn extract_labeled_sections(doc: &Html, record: &mut RemoteRecord, warnings: &mut Vec<ParseWarning>) {
    for section in doc.select(&INFO_SECTIONS) {
        let text: String = section.text().collect();

        for (column, re) in LABEL_EXTRACTORS.iter() {
            if record.fields.contains_key(column) {
                continue;
            }
            if let Some(value) = labeled_value(&text, re) {
                record.fields.insert(*column, value);
            }
        }

        if record.date_of_birth.is_none() {
            if let Some(raw) = labeled_value(&text, &DOB_RE) {
                match parse_portal_date(&raw) {
                    Some(date) => record.date_of_birth = Some(date),
                    None => warnings.push(ParseWarning::new(
                        "date_of_birth",
                        format!("unparseable date '{raw}'"),
                    )),
                }
            }
        }
        if record.visa_number.is_none() {
            record.visa_number = labeled_value(&text, &VISA_RE);
        }
    }
}

fn labeled_value(text: &str, re: &Regex) -> Option<String> {
    let value = re.captures(text)?.get(1)?.as_str().trim().to_string();
    if value.is_empty() || looks_like_label(&value) {
        return None;
    }
    Some(value)
}

/// An empty value followed by another caption would otherwise be captured as
/// the value of the preceding label.
fn looks_like_label(value: &str) -> bool {
    LABEL_FIELDS.iter().any(|(label, _)| value.starts_with(label))
        || value.starts_with(DOB_LABEL)
        || value.starts_with(VISA_LABEL)
}

/// Read the edit form; its values are authoritative over the summary blocks.
fn extract_form_fields(doc: &Html, record: &mut RemoteRecord) {
    for (idx, sel) in FORM_SELECTORS.iter() {
        let spec = &FORM_FIELDS[*idx];
        let Some(element) = doc.select(sel).next() else {
            continue;
        };
        match spec.kind {
            FieldKind::Flag => {
                // A rendered checkbox is a known value either way; absence of
                // the element means the page carried no information.
                if element.value().attr("type") == Some("checkbox") {
                    record
                        .flags
                        .insert(spec.column, element.value().attr("checked").is_some());
                }
            }
            FieldKind::Text => {
                if let Some(value) = form_text_value(element) {
                    record.fields.insert(spec.column, value);
                }
            }
        }
    }
}

fn form_text_value(element: ElementRef) -> Option<String> {
    let value = match element.value().name() {
        "input" => element.value().attr("value").unwrap_or_default().to_string(),
        "select" => element
            .select(&SELECTED_OPTION)
            .next()
            .map(collapse_text)
            .unwrap_or_default(),
        _ => collapse_text(element),
    };
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Visit-history rows: number, date, reason tags, note, time spent.
fn extract_visits(doc: &Html, warnings: &mut Vec<ParseWarning>) -> Vec<RemoteVisit> {
    let mut visits = Vec::new();
    for row in doc.select(&VISIT_ROWS) {
        let cells: Vec<ElementRef> = row.select(&CELLS).collect();
        if cells.len() < 5 {
            continue;
        }
        let raw_date = collapse_text(cells[1]);
        let Some(date) = parse_portal_date(&raw_date) else {
            warnings.push(ParseWarning::new(
                "visit",
                format!("dropped row with unparseable date '{raw_date}'"),
            ));
            continue;
        };
        let reason_tags = collapse_text(cells[2])
            .split(',')
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        visits.push(RemoteVisit {
            date,
            reason_tags,
            notes: collapse_text(cells[3]),
            duration_minutes: parse_minutes(&collapse_text(cells[4])),
        });
    }
    visits
}

fn collapse_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// The portal renders dates day-first (`31.12.2023`); exports occasionally
/// contain ISO dates. Anything else is dropped, never guessed.
pub fn parse_portal_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%d.%m.%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// "30" or "30 мин" → 30; missing or non-numeric → None.
fn parse_minutes(raw: &str) -> Option<i64> {
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> RawPage {
        RawPage::new(body.to_string())
    }

    #[test]
    fn listing_extracts_ids_and_names() {
        let html = r#"<html><body>
            <table id="TableCustomer"><tbody>
                <tr><td>1</td><td><a href="/customer/viewcustomer/10">Novak Jan</a></td><td>м</td></tr>
                <tr><td>2</td><td><a href="/customer/viewcustomer/11">Shevchenko Olena</a></td><td>ж</td></tr>
                <tr><td>3</td><td>no link here</td></tr>
            </tbody></table>
        </body></html>"#;

        let entities = parse_listing(&page(html)).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].remote_id, "10");
        assert_eq!(entities[0].display_name, "Novak Jan");
        assert_eq!(entities[1].remote_id, "11");
    }

    #[test]
    fn listing_without_table_is_an_error() {
        let err = parse_listing(&page("<html><body><p>maintenance</p></body></html>"))
            .unwrap_err();
        assert!(err.to_string().contains("listing table"));
    }

    #[test]
    fn detail_extracts_labels_form_and_visits() {
        let html = r#"<html><body>
            <div class="invoice-col">
                Дата рождения: 02.03.1985
                Номер визы: VIS-900
            </div>
            <div class="invoice-col">
                Город: Praha
                Email: old@example.org
            </div>
            <form>
                <input name="email" value="jan@example.org">
                <input name="phone_cz" value="">
                <input type="checkbox" name="free_housing" checked>
                <input type="checkbox" name="job">
                <textarea name="note">needs follow-up</textarea>
            </form>
            <table id="visit"><tbody>
                <tr><td>1</td><td>10.01.2024</td><td>консультация, документы</td><td>intake talk</td><td>45</td></tr>
                <tr><td>2</td><td>not-a-date</td><td>x</td><td>y</td><td>z</td></tr>
                <tr><td>3</td><td>11.02.2024</td><td></td><td>follow up</td><td></td></tr>
            </tbody></table>
        </body></html>"#;

        let parsed = parse_detail("10", "Novak Jan", &page(html));
        let record = &parsed.record;

        assert_eq!(record.remote_id, "10");
        assert_eq!(record.date_of_birth, NaiveDate::from_ymd_opt(1985, 3, 2));
        assert_eq!(record.visa_number.as_deref(), Some("VIS-900"));
        // form value wins over the summary block
        assert_eq!(record.fields["email"], "jan@example.org");
        assert_eq!(record.fields["city"], "Praha");
        // blank input means absent, not empty string
        assert!(!record.fields.contains_key("czech_phone"));
        assert_eq!(record.fields["notes"], "needs follow-up");
        assert_eq!(record.flags["free_housing"], true);
        assert_eq!(record.flags["has_work"], false);
        assert!(!record.flags.contains_key("volunteer_interest"));

        assert_eq!(record.visits.len(), 2);
        assert_eq!(
            record.visits[0].date,
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
        );
        assert_eq!(
            record.visits[0].reason_tags,
            vec!["консультация".to_string(), "документы".to_string()]
        );
        assert_eq!(record.visits[0].duration_minutes, Some(45));
        assert_eq!(record.visits[1].notes, "follow up");
        assert_eq!(record.visits[1].duration_minutes, None);

        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].to_string().contains("not-a-date"));
    }

    #[test]
    fn empty_label_followed_by_caption_is_absent() {
        let html = r#"<html><body>
            <div class="invoice-col">
                Город:
                Улица: Dlouhá 12
            </div>
        </body></html>"#;

        let parsed = parse_detail("5", "Test", &page(html));
        assert!(!parsed.record.fields.contains_key("city"));
        assert_eq!(parsed.record.fields["street"], "Dlouhá 12");
    }

    #[test]
    fn selected_option_text_is_used() {
        let html = r#"<html><body><form>
            <select name="education">
                <option value="1">základní</option>
                <option value="2" selected>vysokoškolské</option>
            </select>
        </form></body></html>"#;

        let parsed = parse_detail("5", "Test", &page(html));
        assert_eq!(parsed.record.fields["education"], "vysokoškolské");
    }

    #[test]
    fn portal_dates_parse_day_first() {
        assert_eq!(
            parse_portal_date("31.12.2023"),
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
        assert_eq!(
            parse_portal_date("2023-12-31"),
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
        assert_eq!(parse_portal_date("12/31/2023"), None);
        assert_eq!(parse_portal_date(""), None);
    }

    #[test]
    fn minutes_parse_leading_digits() {
        assert_eq!(parse_minutes("30"), Some(30));
        assert_eq!(parse_minutes("45 мин"), Some(45));
        assert_eq!(parse_minutes("-"), None);
        assert_eq!(parse_minutes(""), None);
    }
}
