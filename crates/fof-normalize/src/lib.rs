//! Field normalization: free-text dates, amounts, statuses and categories into typed
//! [`Opportunity`] fields.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use fof_core::{
    fields, fold_text, unscheduled_closing_date, Amount, Opportunity, OpportunityStatus, RawRecord,
    Taxonomy, GENERAL_CATEGORY,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fof-normalize";

/// Calendar formats tried in order; the first successful parse wins.
pub const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%d %B %Y",
];

pub const KNOWN_CURRENCIES: &[&str] = &[
    "USD", "EUR", "GBP", "CAD", "AUD", "CHF", "JPY", "CNY", "COP", "MXN", "BRL", "ARS", "CLP",
    "PEN", "UYU", "BOB", "PYG", "GTQ", "HNL", "NIO", "CRC", "DOP", "INR", "ZAR",
];

const SPANISH_MONTHS: &[(&str, u32)] = &[
    ("enero", 1),
    ("febrero", 2),
    ("marzo", 3),
    ("abril", 4),
    ("mayo", 5),
    ("junio", 6),
    ("julio", 7),
    ("agosto", 8),
    ("septiembre", 9),
    ("setiembre", 9),
    ("octubre", 10),
    ("noviembre", 11),
    ("diciembre", 12),
];

// Checked before the open markers, so negated forms win.
const CLOSED_MARKERS: &[&str] = &[
    "closed", "cerrad", "vencid", "finalizad", "expired", "inactive", "inactiv", "no disponible",
    "no vigente", "not open", "unavailable",
];

const OPEN_MARKERS: &[&str] = &[
    "open", "abiert", "vigente", "active", "activ", "en curso", "disponible",
];

/// Why a raw record was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordDrop {
    #[error("record has no usable name")]
    MissingName,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedBatch {
    pub opportunities: Vec<Opportunity>,
    pub dropped: usize,
}

/// Parses a closing date; unparseable or absent text yields the unscheduled sentinel.
pub fn parse_closing_date(text: Option<&str>) -> NaiveDate {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .and_then(parse_date_text)
        .unwrap_or_else(unscheduled_closing_date)
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
    {
        return Some(date);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Some(datetime.date_naive());
    }
    if let Some(date) = text
        .get(..10)
        .filter(|_| matches!(text.as_bytes().get(10), Some(b'T') | Some(b' ')))
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
    {
        return Some(date);
    }
    parse_spanish_date(text)
}

/// `15 de marzo de 2026` or `15 marzo 2026`.
fn parse_spanish_date(text: &str) -> Option<NaiveDate> {
    let folded = fold_text(text);
    let parts = folded
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|p| !p.is_empty() && *p != "de" && *p != "del")
        .collect::<Vec<_>>();
    let [day, month, year] = parts.as_slice() else {
        return None;
    };
    let month = SPANISH_MONTHS
        .iter()
        .find(|(name, _)| name == month)
        .map(|(_, number)| *number)?;
    NaiveDate::from_ymd_opt(year.parse().ok()?, month, day.parse().ok()?)
}

fn detect_currency(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_alphabetic())
        .filter(|token| token.len() == 3)
        .map(|token| token.to_ascii_uppercase())
        .find(|token| KNOWN_CURRENCIES.contains(&token.as_str()))
}

/// First numeric token with its separators stripped, plus the text that follows it.
fn leading_number(text: &str) -> Option<(f64, &str)> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let len = text[start..]
        .find(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .unwrap_or(text.len() - start);
    let rest = &text[start + len..];
    let raw = text[start..start + len].trim_end_matches([',', '.']);

    let mut digits = raw.replace(',', "");
    let dots = digits.matches('.').count();
    let single_dot_thousands = dots == 1
        && !raw.contains(',')
        && digits
            .split_once('.')
            .is_some_and(|(head, tail)| head.len() <= 3 && tail.len() == 3);
    if dots > 1 || single_dot_thousands {
        digits = digits.replace('.', "");
    }

    Some((digits.parse::<f64>().ok()?, rest))
}

fn next_word(text: &str) -> (String, &str) {
    let text = text.trim_start();
    let end = text.find(|c: char| !c.is_alphabetic()).unwrap_or(text.len());
    (fold_text(&text[..end]), &text[end..])
}

/// Multiplier for a magnitude word right after the number: `30 millones`, `2.5M`, `500 mil`.
fn magnitude_after(rest: &str) -> f64 {
    let attached = rest.starts_with(|c: char| c.is_alphabetic());
    let (word, rest) = next_word(rest);
    match word.as_str() {
        "millon" | "millones" | "million" | "millions" => 1e6,
        "m" | "mm" if attached => 1e6,
        "mil" if next_word(rest).0.starts_with("millon") => 1e9,
        "mil" | "thousand" => 1e3,
        "k" if attached => 1e3,
        "billion" | "billions" => 1e9,
        _ => 1.0,
    }
}

fn display_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Parses amount text.
///
/// Text without any numeric token becomes `0` even when a currency code is present; a number
/// without a currency code is kept unit-less. Absent or blank text is [`Amount::Unknown`].
/// Magnitude words scale the value to base units, so `30 millones` is `30000000`.
pub fn parse_amount(text: Option<&str>) -> Amount {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Amount::Unknown;
    };
    let currency = detect_currency(text);
    match leading_number(text) {
        Some((number, rest)) => {
            let value = number * magnitude_after(rest);
            Amount::Known {
                value,
                currency,
                display: display_number(value),
            }
        }
        None => Amount::Known {
            value: 0.0,
            currency,
            display: "0".to_string(),
        },
    }
}

pub fn normalize_status(text: Option<&str>) -> OpportunityStatus {
    let Some(folded) = text.map(|t| fold_text(t.trim())).filter(|t| !t.is_empty()) else {
        return OpportunityStatus::Unknown;
    };
    if CLOSED_MARKERS.iter().any(|m| folded.contains(m)) {
        OpportunityStatus::Closed
    } else if OPEN_MARKERS.iter().any(|m| folded.contains(m)) {
        OpportunityStatus::Open
    } else {
        OpportunityStatus::Unknown
    }
}

pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keeps only values that look like web links.
pub fn clean_link(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else if trimmed.starts_with("www.") {
        format!("https://{trimmed}")
    } else {
        String::new()
    }
}

/// Converts raw records into opportunities using one shared [`Taxonomy`].
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    taxonomy: Arc<Taxonomy>,
}

impl Default for FieldNormalizer {
    fn default() -> Self {
        Self::new(Arc::new(Taxonomy::builtin()))
    }
}

impl FieldNormalizer {
    pub fn new(taxonomy: Arc<Taxonomy>) -> Self {
        Self { taxonomy }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn classify(&self, name: &str, description: &str, area: Option<&str>) -> String {
        let category = self.taxonomy.classify_parts(name, description);
        if category != GENERAL_CATEGORY {
            return category.to_string();
        }
        area.map(|a| self.taxonomy.classify(a))
            .unwrap_or(GENERAL_CATEGORY)
            .to_string()
    }

    /// Normalizes one record. `provider` is used when the record names no provider itself.
    pub fn normalize(&self, provider: &str, raw: &RawRecord) -> Result<Opportunity, RecordDrop> {
        let name = raw
            .text(fields::NAME)
            .map(|n| clean_text(&n))
            .filter(|n| !n.is_empty())
            .ok_or(RecordDrop::MissingName)?;
        let provider_name = raw
            .text(fields::PROVIDER)
            .map(|p| clean_text(&p))
            .unwrap_or_else(|| clean_text(provider));
        let description = raw
            .text(fields::DESCRIPTION)
            .map(|d| clean_text(&d))
            .unwrap_or_default();
        let area = raw.text(fields::CATEGORY);

        Ok(Opportunity {
            id: Opportunity::derive_id(&provider_name, &name),
            category: self.classify(&name, &description, area.as_deref()),
            closing_date: parse_closing_date(raw.text(fields::CLOSING_DATE).as_deref()),
            amount: parse_amount(raw.text(fields::AMOUNT).as_deref()),
            status: normalize_status(raw.text(fields::STATUS).as_deref()),
            link: raw.text(fields::LINK).map(|l| clean_link(&l)).unwrap_or_default(),
            name,
            provider_name,
            description,
        })
    }

    pub fn normalize_batch(&self, provider: &str, records: &[RawRecord]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (idx, raw) in records.iter().enumerate() {
            match self.normalize(provider, raw) {
                Ok(opportunity) => batch.opportunities.push(opportunity),
                Err(reason) => {
                    warn!(provider, record_index = idx, %reason, "dropping raw record");
                    batch.dropped += 1;
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn known(value: f64, currency: Option<&str>, display: &str) -> Amount {
        Amount::Known {
            value,
            currency: currency.map(ToString::to_string),
            display: display.to_string(),
        }
    }

    #[test]
    fn dates_follow_format_priority() {
        assert_eq!(parse_closing_date(Some("2026-03-31")), date(2026, 3, 31));
        assert_eq!(parse_closing_date(Some("03/04/2026")), date(2026, 4, 3));
        assert_eq!(parse_closing_date(Some("06/30/2026")), date(2026, 6, 30));
        assert_eq!(parse_closing_date(Some("30-04-2026")), date(2026, 4, 30));
        assert_eq!(parse_closing_date(Some("September 30, 2026")), date(2026, 9, 30));
        assert_eq!(parse_closing_date(Some("2026-08-15T23:59:00Z")), date(2026, 8, 15));
        assert_eq!(parse_closing_date(Some("15 de junio de 2026")), date(2026, 6, 15));
    }

    #[test]
    fn unparseable_or_missing_dates_use_sentinel() {
        for text in [None, Some(""), Some("por definir"), Some("31/31/2026"), Some("soon")] {
            assert_eq!(parse_closing_date(text), date(9999, 12, 31), "{text:?}");
        }
    }

    #[test]
    fn amount_rules_keep_their_asymmetry() {
        assert_eq!(parse_amount(Some("100,000 USD")), known(100000.0, Some("USD"), "100000"));
        assert_eq!(parse_amount(Some("USD")), known(0.0, Some("USD"), "0"));
        assert_eq!(parse_amount(Some("50000")), known(50000.0, None, "50000"));
        assert_eq!(parse_amount(None), Amount::Unknown);
        assert_eq!(parse_amount(Some("   ")), Amount::Unknown);
    }

    #[test]
    fn amount_separators_and_fractions() {
        assert_eq!(parse_amount(Some("COP 450.000.000")), known(450000000.0, Some("COP"), "450000000"));
        assert_eq!(parse_amount(Some("usd 1,500.50")), known(1500.5, Some("USD"), "1500.5"));
        assert_eq!(parse_amount(Some("a combinar")), known(0.0, None, "0"));
    }

    #[test]
    fn magnitude_words_scale_to_base_units() {
        assert_eq!(parse_amount(Some("EUR 2.5 millones")), known(2500000.0, Some("EUR"), "2500000"));
        assert_eq!(
            parse_amount(Some("hasta COP 30 millones")),
            known(30000000.0, Some("COP"), "30000000")
        );
        assert_eq!(parse_amount(Some("USD 2M")), known(2000000.0, Some("USD"), "2000000"));
        assert_eq!(parse_amount(Some("500 mil pesos")), known(500000.0, None, "500000"));
        assert_eq!(
            parse_amount(Some("COP 1.200 mil millones")),
            known(1200000000000.0, Some("COP"), "1200000000000")
        );
        assert_eq!(parse_amount(Some("USD 40 k")).value(), Some(40.0));
    }

    #[test]
    fn currency_codes_must_be_whole_words() {
        assert_eq!(parse_amount(Some("fondusd 100")).currency(), None);
        assert_eq!(parse_amount(Some("100 (usd)")).currency(), Some("USD"));
    }

    #[test]
    fn status_lexicon() {
        assert_eq!(normalize_status(Some("Abierta")), OpportunityStatus::Open);
        assert_eq!(normalize_status(Some("vigente")), OpportunityStatus::Open);
        assert_eq!(normalize_status(Some("Cerrada")), OpportunityStatus::Closed);
        assert_eq!(normalize_status(Some("inactive")), OpportunityStatus::Closed);
        assert_eq!(normalize_status(Some("No disponible")), OpportunityStatus::Closed);
        assert_eq!(normalize_status(Some("Disponible")), OpportunityStatus::Open);
        assert_eq!(normalize_status(Some("no vigente")), OpportunityStatus::Closed);
        assert_eq!(normalize_status(Some("en evaluación")), OpportunityStatus::Unknown);
        assert_eq!(normalize_status(None), OpportunityStatus::Unknown);
    }

    #[test]
    fn records_without_names_are_dropped_and_counted() {
        let normalizer = FieldNormalizer::default();
        let records = vec![
            RawRecord::from_json(json!({ "titulo": "   ", "monto": "USD 10" })).unwrap(),
            RawRecord::from_json(json!({ "description": "no title at all" })).unwrap(),
            RawRecord::from_json(json!({ "name": "Fondo Verde" })).unwrap(),
        ];
        let batch = normalizer.normalize_batch("MinAgricultura", &records);
        assert_eq!(batch.dropped, 2);
        assert_eq!(batch.opportunities.len(), 1);
        assert_eq!(
            normalizer.normalize("x", &records[0]),
            Err(RecordDrop::MissingName)
        );
    }

    #[test]
    fn normalize_maps_every_field() {
        let normalizer = FieldNormalizer::default();
        let raw = RawRecord::from_json(json!({
            "titulo": "  Fondo de  Riego ",
            "fecha_cierre": "2026-03-31",
            "monto": "COP 450.000.000",
            "estado": "Abierta",
            "descripcion": "Sistemas de riego para asociaciones campesinas.",
            "enlace": "www.minagricultura.gov.co/riego",
        }))
        .unwrap();

        let opp = normalizer.normalize("MinAgricultura", &raw).unwrap();
        assert_eq!(opp.name, "Fondo de Riego");
        assert_eq!(opp.provider_name, "MinAgricultura");
        assert_eq!(opp.closing_date, date(2026, 3, 31));
        assert_eq!(opp.amount.value(), Some(450000000.0));
        assert_eq!(opp.status, OpportunityStatus::Open);
        assert_eq!(opp.category, "Water Management");
        assert_eq!(opp.link, "https://www.minagricultura.gov.co/riego");
        assert_eq!(opp.id, Opportunity::derive_id("MinAgricultura", "fondo de riego"));
    }

    #[test]
    fn area_text_is_a_classification_fallback() {
        let normalizer = FieldNormalizer::default();
        let raw = RawRecord::from_json(json!({ "name": "Convocatoria 2026", "area": "Género" })).unwrap();
        assert_eq!(normalizer.normalize("IICA", &raw).unwrap().category, "Youth & Gender");

        let raw = RawRecord::from_json(json!({ "name": "Convocatoria 2026" })).unwrap();
        assert_eq!(normalizer.normalize("IICA", &raw).unwrap().category, GENERAL_CATEGORY);
    }

    #[test]
    fn normalization_is_idempotent() {
        let normalizer = FieldNormalizer::default();
        let raw = RawRecord::from_json(json!({
            "title": "Youth AgTech Grant",
            "deadline": "not announced",
            "amount": "250000 USD",
            "status": "open",
            "url": "https://www.fontagro.org/calls/youth-agtech",
        }))
        .unwrap();
        let first = normalizer.normalize("FONTAGRO", &raw).unwrap();
        let second = normalizer.normalize("FONTAGRO", &raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.closing_date, date(9999, 12, 31));
    }
}
