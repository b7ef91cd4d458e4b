//! Core domain model, shared taxonomy and corpus types for FOF.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fof-core";

/// Category assigned when no taxonomy keyword matches.
pub const GENERAL_CATEGORY: &str = "General";

/// Closing date stored for unscheduled opportunities so they sort after every dated one.
pub fn unscheduled_closing_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).expect("9999-12-31 is a valid calendar date")
}

/// Known raw field names, each with the aliases providers use for it.
pub mod fields {
    pub const NAME: &[&str] = &["name", "title", "titulo", "nombre"];
    pub const PROVIDER: &[&str] = &["provider", "entidad", "source"];
    pub const CLOSING_DATE: &[&str] = &["closing_date", "deadline", "fecha_cierre", "cierre"];
    pub const LINK: &[&str] = &["link", "url", "enlace"];
    pub const STATUS: &[&str] = &["status", "estado"];
    pub const AMOUNT: &[&str] = &["amount", "monto", "funding"];
    pub const CATEGORY: &[&str] = &["category", "area", "sector"];
    pub const DESCRIPTION: &[&str] = &["description", "descripcion", "summary"];
}

/// Untyped provider record as returned by a collector adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    values: JsonMap<String, JsonValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(values) => Some(Self { values }),
            _ => None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First non-blank textual value among `keys`; numbers and booleans are rendered as text.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.values.get(*key))
            .find_map(json_to_text)
    }
}

fn json_to_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(json_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Null | JsonValue::Object(_) => return None,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityStatus {
    Open,
    Closed,
    Unknown,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpportunityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown opportunity status `{other}`")),
        }
    }
}

/// Normalized funding amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Amount {
    Known {
        value: f64,
        currency: Option<String>,
        /// Numeric text with separators stripped and integral values rendered without a fraction.
        display: String,
    },
    Unknown,
}

impl Amount {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Known { value, .. } => Some(*value),
            Self::Unknown => None,
        }
    }

    pub fn currency(&self) -> Option<&str> {
        match self {
            Self::Known { currency, .. } => currency.as_deref(),
            Self::Unknown => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            Self::Known {
                display,
                currency: Some(code),
                ..
            } => format!("{display} {code}"),
            Self::Known { display, .. } => display.clone(),
            Self::Unknown => "unknown".to_string(),
        }
    }
}

/// Canonical normalized opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub name: String,
    pub provider_name: String,
    pub closing_date: NaiveDate,
    pub amount: Amount,
    pub category: String,
    pub status: OpportunityStatus,
    pub link: String,
    pub description: String,
}

impl Opportunity {
    /// Stable id derived from provider attribution and the identity key.
    pub fn derive_id(provider_name: &str, name: &str) -> Uuid {
        let source = format!("{}:{}", provider_name.trim(), identity_key(name));
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
    }

    pub fn scheduled_closing_date(&self) -> Option<NaiveDate> {
        if self.closing_date == unscheduled_closing_date() {
            None
        } else {
            Some(self.closing_date)
        }
    }

    pub fn identity_key(&self) -> String {
        identity_key(&self.name)
    }
}

/// Deduplication identity: trimmed, lower-cased name.
pub fn identity_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Lower-cases and strips Latin diacritics so keyword matching ignores accents.
pub fn fold_text(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyCategory {
    pub name: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub broad_keywords: Vec<String>,
}

impl TaxonomyCategory {
    fn new(name: &str, keywords: &[&str], broad_keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| fold_text(k)).collect(),
            broad_keywords: broad_keywords.iter().map(|k| fold_text(k)).collect(),
        }
    }

    fn all_keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords
            .iter()
            .chain(self.broad_keywords.iter())
            .map(String::as_str)
    }
}

// Keywords at least this long also match as word stems ("agricultur" in "agricultura").
const STEM_MIN_CHARS: usize = 5;

fn split_words(folded: &str) -> Vec<&str> {
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn word_matches(word: &str, keyword: &str) -> bool {
    if keyword.chars().count() >= STEM_MIN_CHARS {
        word.starts_with(keyword)
    } else {
        word == keyword || matches!(word.strip_prefix(keyword), Some("s" | "es"))
    }
}

/// Whether a folded keyword occurs in `words` on word boundaries. Leading words of a multi-word
/// keyword must match exactly; the last one follows [`word_matches`].
fn keyword_in_words(words: &[&str], keyword: &str) -> bool {
    let parts = split_words(keyword);
    let Some((last, leading)) = parts.split_last() else {
        return false;
    };
    words.windows(parts.len()).any(|window| {
        window[..leading.len()] == *leading && word_matches(window[leading.len()], last)
    })
}

/// Priority-ordered category table shared by classification and query expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    categories: Vec<TaxonomyCategory>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Taxonomy {
    pub fn new(categories: Vec<TaxonomyCategory>) -> Self {
        let categories = categories
            .into_iter()
            .map(|c| TaxonomyCategory {
                keywords: c.keywords.iter().map(|k| fold_text(k)).collect(),
                broad_keywords: c.broad_keywords.iter().map(|k| fold_text(k)).collect(),
                name: c.name,
            })
            .collect();
        Self { categories }
    }

    pub fn builtin() -> Self {
        Self {
            categories: vec![
                TaxonomyCategory::new(
                    "Water Management",
                    &[
                        "riego", "irrigation", "irrigación", "water", "recurso hídrico",
                        "recursos hídricos", "hídric", "watershed", "cuenca", "acueducto",
                        "drenaje", "drainage",
                    ],
                    &["agua", "lluvia", "rain", "pozo", "reservorio"],
                ),
                TaxonomyCategory::new(
                    "Climate & Environment",
                    &[
                        "climate", "clima", "cambio climático", "medio ambiente", "environment",
                        "ambiental", "biodivers", "sostenib", "sustainab", "carbon", "reforest",
                        "bosque", "forest", "conservación", "conservation",
                    ],
                    &["verde", "green", "ecolog", "suelo", "soil"],
                ),
                TaxonomyCategory::new(
                    "Technology & Innovation",
                    &[
                        "agtech", "tecnolog", "technolog", "innovación", "innovation", "digital",
                        "startup", "emprendimiento", "entrepreneur",
                    ],
                    &["software", "datos", "data", "internet", "sensor"],
                ),
                TaxonomyCategory::new(
                    "Youth & Gender",
                    &[
                        "youth", "joven", "jóvenes", "juventud", "women", "mujer", "mujeres",
                        "gender", "género",
                    ],
                    &["equidad", "equity", "inclusión", "inclusion"],
                ),
                TaxonomyCategory::new(
                    "Research",
                    &["research", "investigación", "ciencia", "science", "scientific", "científic"],
                    &["estudio", "study", "laboratorio", "laboratory"],
                ),
                TaxonomyCategory::new(
                    "Training & Capacity",
                    &[
                        "training", "capacitación", "formación", "education", "educación", "beca",
                        "scholarship", "curso", "course", "trainee",
                    ],
                    &["taller", "workshop", "aprendizaje", "learning"],
                ),
                TaxonomyCategory::new(
                    "Financing & Credit",
                    &[
                        "crédito", "credit", "loan", "préstamo", "microfinanz", "microfinance",
                        "garantía", "guarantee",
                    ],
                    &["financ", "inversión", "investment", "capital"],
                ),
                TaxonomyCategory::new(
                    "Rural Development",
                    &[
                        "rural", "campesin", "smallholder", "pequeños productores", "agricultur",
                        "farm", "farmer", "farming", "agropecuari", "ganader", "livestock",
                    ],
                    &[
                        "cultivo", "crop", "cosecha", "harvest", "campo", "agro", "agroindustr",
                        "productor",
                    ],
                ),
            ],
        }
    }

    pub fn categories(&self) -> &[TaxonomyCategory] {
        &self.categories
    }

    pub fn contains(&self, category: &str) -> bool {
        category.eq_ignore_ascii_case(GENERAL_CATEGORY)
            || self
                .categories
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(category))
    }

    /// First category (priority order) with a primary keyword in `text`, then the same scan over
    /// broad keywords, else [`GENERAL_CATEGORY`].
    pub fn classify<'a>(&'a self, text: &str) -> &'a str {
        let folded = fold_text(text);
        let words = split_words(&folded);
        let primary = self
            .categories
            .iter()
            .find(|c| c.keywords.iter().any(|k| keyword_in_words(&words, k)));
        let matched = primary.or_else(|| {
            self.categories
                .iter()
                .find(|c| c.broad_keywords.iter().any(|k| keyword_in_words(&words, k)))
        });
        matched.map(|c| c.name.as_str()).unwrap_or(GENERAL_CATEGORY)
    }

    pub fn classify_parts<'a>(&'a self, title: &str, description: &str) -> &'a str {
        self.classify(&format!("{title} {description}"))
    }

    /// Categories whose keyword table relates to `term`, in priority order.
    pub fn categories_for_term(&self, term: &str) -> Vec<&str> {
        let term = fold_text(term.trim());
        if term.chars().count() < 3 {
            return Vec::new();
        }
        self.categories
            .iter()
            .filter(|c| {
                fold_text(&c.name).contains(&term)
                    || c.all_keywords()
                        .any(|k| k.contains(term.as_str()) || (k.len() >= 4 && term.contains(k)))
            })
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusEntry {
    pub key: String,
    pub opportunity: Opportunity,
    pub inserted_at: DateTime<Utc>,
}

/// Deduplicated, insertion-ordered set of opportunities keyed by [`identity_key`].
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    built_at: DateTime<Utc>,
    entries: Vec<CorpusEntry>,
    index: HashMap<String, usize>,
}

impl Default for Corpus {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Corpus {
    pub fn new(built_at: DateTime<Utc>) -> Self {
        Self {
            built_at,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Inserts unless the identity key is already taken; returns whether it was inserted.
    pub fn insert_if_absent(&mut self, opportunity: Opportunity, inserted_at: DateTime<Utc>) -> bool {
        let key = opportunity.identity_key();
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(CorpusEntry {
            key,
            opportunity,
            inserted_at,
        });
        true
    }

    pub fn get(&self, key: &str) -> Option<&Opportunity> {
        self.index
            .get(key)
            .and_then(|idx| self.entries.get(*idx))
            .map(|e| &e.opportunity)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Opportunity> {
        self.entries.iter().map(|e| &e.opportunity)
    }
}

/// Optional structured filters applied alongside free-text search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub category: Option<String>,
    pub status: Option<OpportunityStatus>,
    pub provider_name: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Name,
    Description,
    Category,
    SuggestedCategory,
    Provider,
    Status,
    ProviderPriority,
    AmountRange,
}

/// One contribution to a relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub field: MatchField,
    pub term: String,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    pub opportunity: Opportunity,
    pub score: u32,
    pub matches: Vec<FieldMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opportunity(name: &str, provider: &str) -> Opportunity {
        Opportunity {
            id: Opportunity::derive_id(provider, name),
            name: name.to_string(),
            provider_name: provider.to_string(),
            closing_date: unscheduled_closing_date(),
            amount: Amount::Unknown,
            category: GENERAL_CATEGORY.to_string(),
            status: OpportunityStatus::Unknown,
            link: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn raw_record_text_uses_aliases_and_renders_numbers() {
        let record = RawRecord::from_json(json!({
            "titulo": "  Fondo de Riego ",
            "monto": 250000,
            "estado": "",
        }))
        .unwrap();

        assert_eq!(record.text(fields::NAME).as_deref(), Some("Fondo de Riego"));
        assert_eq!(record.text(fields::AMOUNT).as_deref(), Some("250000"));
        assert_eq!(record.text(fields::STATUS), None);
        assert!(RawRecord::from_json(json!(["not", "an", "object"])).is_none());
    }

    #[test]
    fn riego_classifies_as_water_before_rural() {
        let taxonomy = Taxonomy::builtin();
        assert_eq!(
            taxonomy.classify("Convocatoria de riego para pequeños productores rurales"),
            "Water Management"
        );
        assert_eq!(taxonomy.classify("Programa de desarrollo rural"), "Rural Development");
    }

    #[test]
    fn broad_pass_runs_after_primary_and_general_is_fallback() {
        let taxonomy = Taxonomy::builtin();
        assert_eq!(taxonomy.classify("Apoyo a la cosecha"), "Rural Development");
        assert_eq!(taxonomy.classify("Annual open call"), GENERAL_CATEGORY);
    }

    #[test]
    fn keywords_match_on_word_boundaries() {
        let taxonomy = Taxonomy::builtin();
        assert_eq!(taxonomy.classify("Concurso de proyectos ganaderos"), "Rural Development");
        assert_eq!(
            taxonomy.classify("Recursos para productores del campo"),
            "Rural Development"
        );
        assert_eq!(
            taxonomy.classify("Support for farmers because yields fell"),
            "Rural Development"
        );
        assert_eq!(taxonomy.classify("Trainee exchange"), "Training & Capacity");
        assert_eq!(taxonomy.classify("Becas de posgrado"), "Training & Capacity");
        assert_eq!(taxonomy.classify("Gestión de recursos hídricos"), "Water Management");
    }

    #[test]
    fn classification_ignores_accents_and_case() {
        let taxonomy = Taxonomy::builtin();
        assert_eq!(taxonomy.classify("INVESTIGACIÓN aplicada"), "Research");
        assert_eq!(taxonomy.classify("investigacion aplicada"), "Research");
    }

    #[test]
    fn term_expansion_uses_shared_keyword_table() {
        let taxonomy = Taxonomy::builtin();
        assert_eq!(taxonomy.categories_for_term("irrigation"), vec!["Water Management"]);
        assert!(taxonomy.categories_for_term("jóvenes").contains(&"Youth & Gender"));
        assert!(taxonomy.categories_for_term("of").is_empty());
    }

    #[test]
    fn corpus_keeps_first_entry_per_identity_key() {
        let mut corpus = Corpus::new(Utc::now());
        assert!(corpus.insert_if_absent(opportunity("Rural Water Fund", "a"), Utc::now()));
        assert!(!corpus.insert_if_absent(opportunity("  rural water fund ", "b"), Utc::now()));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get("rural water fund").unwrap().provider_name, "a");
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(
            Opportunity::derive_id("FAO", "Rural Water Fund"),
            Opportunity::derive_id("FAO", " rural water fund")
        );
        assert_ne!(
            Opportunity::derive_id("FAO", "Rural Water Fund"),
            Opportunity::derive_id("IICA", "Rural Water Fund")
        );
    }

    #[test]
    fn amount_display_formats() {
        let usd = Amount::Known {
            value: 100000.0,
            currency: Some("USD".into()),
            display: "100000".into(),
        };
        assert_eq!(usd.display(), "100000 USD");
        assert_eq!(Amount::Unknown.display(), "unknown");
        assert_eq!("closed".parse::<OpportunityStatus>(), Ok(OpportunityStatus::Closed));
    }
}
