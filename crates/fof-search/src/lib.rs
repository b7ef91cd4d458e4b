//! Relevance-ranked search over a corpus snapshot.
//!
//! A query runs through five steps: parse (intent, keywords, amount range), expand keywords into
//! suggested taxonomy categories, score every entry, apply structured filters, then sort and
//! paginate. The engine is synchronous and only reads the snapshot it is handed.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use fof_core::{
    fold_text, Corpus, FieldMatch, MatchField, Opportunity, QueryFilters, ScoredResult, Taxonomy,
};
use serde::Serialize;
use tracing::debug;

pub const CRATE_NAME: &str = "fof-search";

pub const DEFAULT_PAGE_SIZE: usize = 10;

const MILLION: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    OpportunitySearch,
    HelpSeeking,
    RequirementsSeeking,
    ContactSeeking,
    General,
}

// Checked in this order; the first set with a hit decides the intent.
const CONTACT_TRIGGERS: &[&str] = &[
    "contact", "contacto", "contactar", "email", "correo", "phone", "telefono", "whatsapp",
    "llamar",
];
const REQUIREMENTS_TRIGGERS: &[&str] = &[
    "requirement", "requisito", "eligib", "elegib", "criteria", "criterio", "document",
    "who can apply", "quien puede", "puedo aplicar",
];
const HELP_TRIGGERS: &[&str] = &[
    "help", "ayuda", "ayudame", "how do", "how to", "how can", "como aplico", "como postulo",
    "como funciona", "guide", "guia", "assist",
];
const OPPORTUNITY_TRIGGERS: &[&str] = &[
    "grant", "fund", "fondo", "convocatoria", "beca", "subsidio", "financiamiento", "financing",
    "opportunit", "oportunidad", "call", "loan", "credito", "apoyo", "premio", "award",
];

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "are", "what", "which", "how", "can", "find",
    "show", "need", "want", "looking", "about", "any", "all", "from", "into", "some", "there",
    "list", "give", "please", "have", "has", "who", "where", "when", "para", "por", "con", "los",
    "las", "del", "que", "una", "uno", "unos", "unas", "como", "donde", "cual", "cuales", "quiero",
    "necesito", "busco", "buscar", "sobre", "hay", "mis", "sus", "esta", "este", "estos", "estas",
    "tengo", "muestrame", "dame", "usd", "eur", "cop", "dollars", "dolares", "pesos", "euros",
];

const BETWEEN_MARKERS: &[&str] = &["between", "entre"];
const BETWEEN_JOINERS: &[&str] = &["and", "y"];

// Upper bounds are matched first so "no more than" is not read as "more than".
const UPPER_BOUND_PHRASES: &[&[&str]] = &[
    &["no", "more", "than"],
    &["no", "mas", "de"],
    &["up", "to"],
    &["less", "than"],
    &["under"],
    &["below"],
    &["maximum"],
    &["hasta"],
    &["menos", "de"],
    &["maximo"],
];
const LOWER_BOUND_PHRASES: &[&[&str]] = &[
    &["more", "than"],
    &["greater", "than"],
    &["over"],
    &["above"],
    &["at", "least"],
    &["minimum"],
    &["mas", "de"],
    &["mayor", "a"],
    &["mayor", "de"],
    &["minimo"],
    &["desde"],
];

/// Amount bounds in base units, the unit normalized amounts use (`30 millones` is `3e7`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AmountRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AmountRange {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Structured filter bounds take precedence over bounds parsed from the text.
    pub fn merged_with(&self, filters: &QueryFilters) -> Self {
        Self {
            min: filters.amount_min.or(self.min),
            max: filters.amount_max.or(self.max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedQuery {
    pub text: String,
    pub intent: QueryIntent,
    pub keywords: Vec<String>,
    pub amount_range: AmountRange,
}

impl ParsedQuery {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    fold_text(text)
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn detect_intent(tokens: &[String]) -> QueryIntent {
    let joined = format!(" {} ", tokens.join(" "));
    let hit = |triggers: &[&str]| {
        triggers.iter().any(|trigger| {
            if trigger.contains(' ') {
                joined.contains(&format!(" {trigger} "))
            } else {
                tokens.iter().any(|t| t.starts_with(trigger))
            }
        })
    };

    if hit(CONTACT_TRIGGERS) {
        QueryIntent::ContactSeeking
    } else if hit(REQUIREMENTS_TRIGGERS) {
        QueryIntent::RequirementsSeeking
    } else if hit(HELP_TRIGGERS) {
        QueryIntent::HelpSeeking
    } else if hit(OPPORTUNITY_TRIGGERS) {
        QueryIntent::OpportunitySearch
    } else {
        QueryIntent::General
    }
}

#[derive(Debug, Clone, Copy)]
struct AmountToken {
    number: f64,
    scale: Option<f64>,
    consumed: usize,
}

impl AmountToken {
    fn value_with(&self, fallback_scale: f64) -> f64 {
        self.number * self.scale.unwrap_or(fallback_scale)
    }
}

fn scale_word(word: &str) -> Option<f64> {
    match word {
        "million" | "millions" | "millon" | "millones" | "mm" | "m" => Some(MILLION),
        "thousand" | "thousands" | "mil" | "miles" | "k" => Some(1_000.0),
        "billion" | "billions" => Some(1_000_000_000.0),
        _ => None,
    }
}

fn parse_number(token: &str) -> Option<(f64, Option<f64>)> {
    let (digits, scale) = if let Some(rest) = token.strip_suffix("mm") {
        (rest, Some(MILLION))
    } else if let Some(rest) = token.strip_suffix('m') {
        (rest, Some(MILLION))
    } else if let Some(rest) = token.strip_suffix('k') {
        (rest, Some(1_000.0))
    } else {
        (token, None)
    };

    if !digits.chars().any(|c| c.is_ascii_digit())
        || !digits.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
    {
        return None;
    }

    let cleaned: String = digits.chars().filter(|c| *c != ',').collect();
    let cleaned = if cleaned.matches('.').count() > 1 {
        cleaned.replace('.', "")
    } else {
        cleaned
    };
    cleaned.parse::<f64>().ok().map(|n| (n, scale))
}

fn read_amount(tokens: &[String], at: usize) -> Option<AmountToken> {
    let (number, inline_scale) = parse_number(tokens.get(at)?)?;
    if inline_scale.is_some() {
        return Some(AmountToken {
            number,
            scale: inline_scale,
            consumed: 1,
        });
    }
    match tokens.get(at + 1).and_then(|t| scale_word(t)) {
        Some(scale) => Some(AmountToken {
            number,
            scale: Some(scale),
            consumed: 2,
        }),
        None => Some(AmountToken {
            number,
            scale: None,
            consumed: 1,
        }),
    }
}

fn phrase_at(tokens: &[String], at: usize, phrase: &[&str]) -> bool {
    phrase
        .iter()
        .enumerate()
        .all(|(offset, word)| tokens.get(at + offset).is_some_and(|t| t == word))
}

fn mark(consumed: &mut [bool], from: usize, len: usize) {
    for flag in consumed.iter_mut().skip(from).take(len) {
        *flag = true;
    }
}

/// Parses amount phrases and returns the range plus a mask of tokens the phrases consumed.
fn parse_amount_range(tokens: &[String]) -> (AmountRange, Vec<bool>) {
    let mut range = AmountRange::default();
    let mut consumed = vec![false; tokens.len()];

    let mut i = 0;
    'scan: while i < tokens.len() {
        if BETWEEN_MARKERS.contains(&tokens[i].as_str()) {
            if let Some(low) = read_amount(tokens, i + 1) {
                let joiner = i + 1 + low.consumed;
                let joined = tokens
                    .get(joiner)
                    .is_some_and(|t| BETWEEN_JOINERS.contains(&t.as_str()));
                if let Some(high) = joined.then(|| read_amount(tokens, joiner + 1)).flatten() {
                    // "between 1 and 2 million" scales both ends by the trailing unit.
                    let shared = high.scale.unwrap_or(MILLION);
                    range.min = Some(low.value_with(shared));
                    range.max = Some(high.value_with(MILLION));
                    let len = 2 + low.consumed + high.consumed;
                    mark(&mut consumed, i, len);
                    i += len;
                    continue;
                }
            }
        }

        for (phrases, is_upper) in [(UPPER_BOUND_PHRASES, true), (LOWER_BOUND_PHRASES, false)] {
            for phrase in phrases {
                if !phrase_at(tokens, i, phrase) {
                    continue;
                }
                if let Some(amount) = read_amount(tokens, i + phrase.len()) {
                    let value = amount.value_with(MILLION);
                    if is_upper {
                        range.max = Some(value);
                    } else {
                        range.min = Some(value);
                    }
                    let len = phrase.len() + amount.consumed;
                    mark(&mut consumed, i, len);
                    i += len;
                    continue 'scan;
                }
            }
        }

        i += 1;
    }

    (range, consumed)
}

/// Splits free text into intent, search keywords and an amount range.
pub fn parse_query(text: &str) -> ParsedQuery {
    let tokens = tokenize(text);
    let intent = detect_intent(&tokens);
    let (amount_range, consumed) = parse_amount_range(&tokens);

    let mut seen = HashSet::new();
    let keywords = tokens
        .iter()
        .zip(consumed)
        .filter(|(_, used)| !*used)
        .map(|(t, _)| t)
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOP_WORDS.contains(&t.as_str()) && scale_word(t).is_none())
        .filter(|t| seen.insert(t.to_string()))
        .cloned()
        .collect();

    ParsedQuery {
        text: text.trim().to_string(),
        intent,
        keywords,
        amount_range,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWeights {
    pub name: u32,
    pub description: u32,
    pub category: u32,
    pub provider_filter: u32,
    pub status_filter: u32,
    pub amount_bound: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            name: 10,
            description: 5,
            category: 8,
            provider_filter: 15,
            status_filter: 5,
            amount_bound: 3,
        }
    }
}

/// Fixed per-provider bonus; providers missing from the table get nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderPriority {
    weights: HashMap<String, u32>,
}

impl ProviderPriority {
    pub fn builtin() -> Self {
        Self::default()
            .with("MinAgricultura", 6)
            .with("FONTAGRO", 5)
            .with("IICA", 4)
            .with("FAO", 4)
            .with("BID Lab", 3)
    }

    pub fn with(mut self, provider: &str, weight: u32) -> Self {
        self.weights.insert(fold_text(provider.trim()), weight);
        self
    }

    pub fn weight_for(&self, provider: &str) -> u32 {
        self.weights
            .get(&fold_text(provider.trim()))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub results: Vec<ScoredResult>,
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub intent: QueryIntent,
    pub keywords: Vec<String>,
    pub suggested_categories: Vec<String>,
    pub amount_range: AmountRange,
}

/// Index range of a 1-indexed page, or `None` when the page is out of range.
pub fn page_bounds(total: usize, page: usize, page_size: usize) -> Option<Range<usize>> {
    if page == 0 || page_size == 0 {
        return None;
    }
    let start = (page - 1).checked_mul(page_size)?;
    if start >= total {
        return None;
    }
    Some(start..(start + page_size).min(total))
}

pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Vec<T> {
    match page_bounds(items.len(), page, page_size) {
        Some(bounds) => items
            .into_iter()
            .skip(bounds.start)
            .take(bounds.len())
            .collect(),
        None => Vec::new(),
    }
}

fn same_text(a: &str, b: &str) -> bool {
    fold_text(a.trim()) == fold_text(b.trim())
}

fn passes_filters(opportunity: &Opportunity, filters: &QueryFilters) -> bool {
    if let Some(category) = &filters.category {
        if !same_text(&opportunity.category, category) {
            return false;
        }
    }
    if let Some(status) = filters.status {
        if opportunity.status != status {
            return false;
        }
    }
    if let Some(provider) = &filters.provider_name {
        if !same_text(&opportunity.provider_name, provider) {
            return false;
        }
    }
    if let Some(min) = filters.amount_min {
        if !opportunity.amount.value().is_some_and(|v| v >= min) {
            return false;
        }
    }
    if let Some(max) = filters.amount_max {
        if !opportunity.amount.value().is_some_and(|v| v <= max) {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    taxonomy: Arc<Taxonomy>,
    weights: ScoringWeights,
    provider_priority: ProviderPriority,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(Arc::new(Taxonomy::builtin()))
    }
}

impl QueryEngine {
    pub fn new(taxonomy: Arc<Taxonomy>) -> Self {
        Self {
            taxonomy,
            weights: ScoringWeights::default(),
            provider_priority: ProviderPriority::builtin(),
        }
    }

    pub fn with_provider_priority(mut self, provider_priority: ProviderPriority) -> Self {
        self.provider_priority = provider_priority;
        self
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Categories related to any keyword, in taxonomy priority order.
    pub fn expand_keywords(&self, keywords: &[String]) -> Vec<String> {
        let related: HashSet<&str> = keywords
            .iter()
            .flat_map(|k| self.taxonomy.categories_for_term(k))
            .collect();
        self.taxonomy
            .categories()
            .iter()
            .filter(|c| related.contains(c.name.as_str()))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Scores one opportunity; `None` when keywords were given and none of them matched.
    pub fn score(
        &self,
        opportunity: &Opportunity,
        parsed: &ParsedQuery,
        suggested: &[String],
        filters: &QueryFilters,
    ) -> Option<ScoredResult> {
        let w = &self.weights;
        let mut matches = Vec::new();

        let name = fold_text(&opportunity.name);
        let description = fold_text(&opportunity.description);
        let category = fold_text(&opportunity.category);
        for keyword in &parsed.keywords {
            for (text, field, points) in [
                (&name, MatchField::Name, w.name),
                (&description, MatchField::Description, w.description),
                (&category, MatchField::Category, w.category),
            ] {
                if text.contains(keyword.as_str()) {
                    matches.push(FieldMatch {
                        field,
                        term: keyword.clone(),
                        points,
                    });
                }
            }
        }
        if suggested.iter().any(|s| same_text(s, &opportunity.category)) {
            matches.push(FieldMatch {
                field: MatchField::SuggestedCategory,
                term: opportunity.category.clone(),
                points: w.category,
            });
        }

        if !parsed.keywords.is_empty() && matches.is_empty() {
            return None;
        }

        if let Some(provider) = &filters.provider_name {
            if same_text(provider, &opportunity.provider_name) {
                matches.push(FieldMatch {
                    field: MatchField::Provider,
                    term: provider.clone(),
                    points: w.provider_filter,
                });
            }
        }
        if let Some(status) = filters.status {
            if status == opportunity.status {
                matches.push(FieldMatch {
                    field: MatchField::Status,
                    term: status.to_string(),
                    points: w.status_filter,
                });
            }
        }

        let priority = self.provider_priority.weight_for(&opportunity.provider_name);
        if priority > 0 {
            matches.push(FieldMatch {
                field: MatchField::ProviderPriority,
                term: opportunity.provider_name.clone(),
                points: priority,
            });
        }

        let range = parsed.amount_range.merged_with(filters);
        if let Some(value) = opportunity.amount.value() {
            let satisfied = [
                ("min", range.min.is_some_and(|min| value >= min)),
                ("max", range.max.is_some_and(|max| value <= max)),
            ];
            for (bound, _) in satisfied.into_iter().filter(|(_, ok)| *ok) {
                matches.push(FieldMatch {
                    field: MatchField::AmountRange,
                    term: bound.to_string(),
                    points: w.amount_bound,
                });
            }
        }

        let score = matches.iter().map(|m| m.points).sum();
        Some(ScoredResult {
            opportunity: opportunity.clone(),
            score,
            matches,
        })
    }

    pub fn query(
        &self,
        corpus: &Corpus,
        text: &str,
        filters: &QueryFilters,
        page: usize,
        page_size: usize,
    ) -> QueryOutcome {
        let parsed = parse_query(text);

        if parsed.is_blank() {
            let results = page_bounds(corpus.len(), page, page_size)
                .map(|bounds| {
                    corpus
                        .iter()
                        .skip(bounds.start)
                        .take(bounds.len())
                        .map(|o| ScoredResult {
                            opportunity: o.clone(),
                            score: 0,
                            matches: Vec::new(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            return QueryOutcome {
                results,
                total_count: corpus.len(),
                page,
                page_size,
                intent: QueryIntent::General,
                keywords: Vec::new(),
                suggested_categories: Vec::new(),
                amount_range: AmountRange::default(),
            };
        }

        let suggested = self.expand_keywords(&parsed.keywords);
        let mut results: Vec<ScoredResult> = corpus
            .iter()
            .filter(|o| passes_filters(o, filters))
            .filter_map(|o| self.score(o, &parsed, &suggested, filters))
            .collect();
        // sort_by is stable: equal scores keep corpus order.
        results.sort_by(|a, b| b.score.cmp(&a.score));

        let total_count = results.len();
        debug!(
            query = %parsed.text,
            intent = ?parsed.intent,
            total_count,
            "query scored"
        );

        QueryOutcome {
            results: paginate(results, page, page_size),
            total_count,
            page,
            page_size,
            intent: parsed.intent,
            keywords: parsed.keywords,
            suggested_categories: suggested,
            amount_range: parsed.amount_range,
        }
    }
}
