use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

/// Confidence floor below which an observation cannot be auto-accepted.
pub const CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Age window (days) inside which a record receives the full recency boost.
pub const RECENCY_FULL_WINDOW_DAYS: f64 = 30.0;

/// Half-life (days) of the recency boost once a record ages past the full
/// window. A 60-day-old record scores 0.5, a 90-day-old record 0.25.
pub const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// Hard cap on the number of matches a single query may return.
pub const MAX_TOP_N: usize = 20;

/// Dedup window for consultation cache hits.
pub const CONSULT_TTL_HOURS: i64 = 24;

pub const MAX_TITLE_CHARS: usize = 140;

const SCORE_WEIGHT_CONFIDENCE: f32 = 0.5;
const SCORE_WEIGHT_RECENCY: f32 = 0.3;
const SCORE_WEIGHT_LEXICAL: f32 = 0.2;

const REINFORCEMENT_STEP: f32 = 0.02;
const REINFORCEMENT_CAP: f32 = 0.99;

const SNIPPET_CHARS: usize = 120;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PatternError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PatternId(pub Ulid);

impl PatternId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PatternId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientUid(pub Ulid);

impl ClientUid {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ClientUid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ClientUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Stale,
    Archived,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "stale" => Some(Self::Stale),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceSource {
    UserInstruction,
    OfficialDocs,
    VerifiedPattern,
    Inferred,
}

impl ConfidenceSource {
    /// Initial confidence seeded from provenance before any explicit override.
    #[must_use]
    pub fn seed_confidence(self) -> f32 {
        match self {
            Self::UserInstruction => 0.95,
            Self::OfficialDocs => 0.90,
            Self::VerifiedPattern => 0.85,
            Self::Inferred => 0.65,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInstruction => "user-instruction",
            Self::OfficialDocs => "official-docs",
            Self::VerifiedPattern => "verified-pattern",
            Self::Inferred => "inferred",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user-instruction" => Some(Self::UserInstruction),
            "official-docs" => Some(Self::OfficialDocs),
            "verified-pattern" => Some(Self::VerifiedPattern),
            "inferred" => Some(Self::Inferred),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Provenance {
    pub agent: String,
    pub source_uri: Option<String>,
    pub source_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternRecord {
    pub id: PatternId,
    pub client_uid: ClientUid,
    pub project_slug: String,
    pub title: String,
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub severity: Severity,
    pub do_text: String,
    pub dont_text: String,
    pub example: Option<String>,
    pub confidence: f32,
    pub confidence_source: ConfidenceSource,
    pub provenance: Provenance,
    pub status: RecordStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub learned_at: OffsetDateTime,
    #[serde(default)]
    pub supersedes: Vec<PatternId>,
}

impl PatternRecord {
    /// Validate one pattern record against the storage invariants.
    ///
    /// # Errors
    /// Returns [`PatternError::Validation`] when required fields are missing,
    /// out of range, or malformed.
    pub fn validate(&self) -> Result<(), PatternError> {
        if self.project_slug.trim().is_empty() {
            return Err(PatternError::Validation(
                "project_slug MUST be provided for every record".to_string(),
            ));
        }

        if self.title.trim().is_empty() {
            return Err(PatternError::Validation("title MUST be non-empty".to_string()));
        }

        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(PatternError::Validation(format!(
                "title MUST be at most {MAX_TITLE_CHARS} characters"
            )));
        }

        if self.category.trim().is_empty() {
            return Err(PatternError::Validation("category MUST be non-empty".to_string()));
        }

        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(PatternError::Validation("tags MUST be non-empty strings".to_string()));
        }

        if self.do_text.trim().is_empty() {
            return Err(PatternError::Validation("do_text MUST be non-empty".to_string()));
        }

        if self.dont_text.trim().is_empty() {
            return Err(PatternError::Validation("dont_text MUST be non-empty".to_string()));
        }

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PatternError::Validation(
                "confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.provenance.agent.trim().is_empty() {
            return Err(PatternError::Validation(
                "provenance.agent MUST name the originating agent".to_string(),
            ));
        }

        if let Some(source_hash) = &self.provenance.source_hash {
            if !source_hash.starts_with("sha256:") || source_hash.len() <= 7 {
                return Err(PatternError::Validation(
                    "provenance.source_hash MUST be formatted as sha256:<hex>".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct QueryFilters {
    pub project_slug: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub filters: QueryFilters,
    pub top_n: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryMatch {
    pub id: PatternId,
    pub title: String,
    pub category: String,
    pub confidence: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub learned_at: OffsetDateTime,
    pub do_snippet: String,
    pub dont_snippet: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryOutcome {
    pub matches: Vec<QueryMatch>,
    pub total_scanned: usize,
    pub returned: usize,
}

#[derive(Debug, Clone)]
struct RankCandidate<'a> {
    record: &'a PatternRecord,
    score: f32,
}

impl RankCandidate<'_> {
    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.score
            .partial_cmp(&lhs.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rhs.record.learned_at.cmp(&lhs.record.learned_at))
            .then_with(|| lhs.record.id.cmp(&rhs.record.id))
    }
}

/// Recency boost for the scoring formula: 1.0 inside the 30-day window, then
/// an exponential decay with a 30-day half-life.
#[must_use]
pub fn recency_boost(learned_at: OffsetDateTime, as_of: OffsetDateTime) -> f32 {
    let age_days = (as_of - learned_at).as_seconds_f64() / 86_400.0;
    if age_days <= RECENCY_FULL_WINDOW_DAYS {
        return 1.0;
    }

    let half_lives = (age_days - RECENCY_FULL_WINDOW_DAYS) / RECENCY_HALF_LIFE_DAYS;
    let decayed = 0.5_f64.powf(half_lives);
    decayed as f32
}

#[must_use]
pub fn tokenize_query_terms(value: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized.len() >= 2 {
            terms.insert(normalized);
        }
    }
    terms.into_iter().collect()
}

fn passes_filters(record: &PatternRecord, filters: &QueryFilters) -> bool {
    if record.status == RecordStatus::Archived {
        return false;
    }

    if let Some(project_slug) = &filters.project_slug {
        if &record.project_slug != project_slug {
            return false;
        }
    }

    if let Some(category) = &filters.category {
        if &record.category != category {
            return false;
        }
    }

    if !filters.tags.iter().all(|tag| record.tags.contains(tag)) {
        return false;
    }

    if let Some(severity) = filters.severity {
        if record.severity != severity {
            return false;
        }
    }

    true
}

fn lexical_haystack(record: &PatternRecord) -> String {
    format!("{} {} {}", record.title, record.do_text, record.dont_text).to_lowercase()
}

fn ratio(count: usize, total: usize) -> f32 {
    let count = f32::from(u16::try_from(count).unwrap_or(u16::MAX));
    let total = f32::from(u16::try_from(total).unwrap_or(u16::MAX));
    count / total
}

fn snippet(text: &str) -> String {
    let mut out = String::new();
    for (taken, ch) in text.chars().enumerate() {
        if taken == SNIPPET_CHARS {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}

/// Rank the given records against a query: fast filter, lexical match, then
/// the weighted confidence/recency/lexical score.
///
/// With a non-empty query text, candidates with zero keyword overlap are
/// excluded; with an empty query the ranking degrades to confidence plus
/// recency over the filtered set. Zero matches is an empty outcome carrying
/// `total_scanned`, not an error.
///
/// # Errors
/// Returns [`PatternError::Query`] when `top_n` is zero, or
/// [`PatternError::Validation`] when any source record is invalid.
pub fn rank_patterns(
    records: &[PatternRecord],
    request: &QueryRequest,
) -> Result<QueryOutcome, PatternError> {
    if request.top_n == 0 {
        return Err(PatternError::Query("top_n MUST be >= 1".to_string()));
    }

    for record in records {
        record.validate()?;
    }

    let query_terms = tokenize_query_terms(&request.text);
    let top_n = request.top_n.min(MAX_TOP_N);

    let mut candidates: Vec<RankCandidate<'_>> = Vec::new();
    let mut total_scanned = 0_usize;

    for record in records {
        if !passes_filters(record, &request.filters) {
            continue;
        }
        total_scanned += 1;

        let lexical_match = if query_terms.is_empty() {
            0.0
        } else {
            let haystack = lexical_haystack(record);
            let matched = query_terms.iter().filter(|term| haystack.contains(*term)).count();
            if matched == 0 {
                continue;
            }
            ratio(matched, query_terms.len())
        };

        let score = record.confidence * SCORE_WEIGHT_CONFIDENCE
            + recency_boost(record.learned_at, request.as_of) * SCORE_WEIGHT_RECENCY
            + lexical_match * SCORE_WEIGHT_LEXICAL;

        candidates.push(RankCandidate { record, score });
    }

    candidates.sort_by(RankCandidate::cmp);
    candidates.truncate(top_n);

    let matches = candidates
        .iter()
        .map(|candidate| QueryMatch {
            id: candidate.record.id,
            title: candidate.record.title.clone(),
            category: candidate.record.category.clone(),
            confidence: candidate.record.confidence,
            learned_at: candidate.record.learned_at,
            do_snippet: snippet(&candidate.record.do_text),
            dont_snippet: snippet(&candidate.record.dont_text),
            score: candidate.score,
        })
        .collect::<Vec<_>>();

    let returned = matches.len();
    Ok(QueryOutcome { matches, total_scanned, returned })
}

/// Normalize a do/dont text for conflict comparison: lowercase with collapsed
/// whitespace. Exact match over this form is the whole conflict test; a fuzzy
/// matcher would slot in here.
#[must_use]
pub fn normalize_conflict_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn tags_overlap(lhs: &BTreeSet<String>, rhs: &BTreeSet<String>) -> bool {
    lhs.intersection(rhs).next().is_some()
}

/// Two records conflict when they share a category, overlap on tags, and one
/// record's recommended practice is the other's anti-pattern.
#[must_use]
pub fn records_conflict(lhs: &PatternRecord, rhs: &PatternRecord) -> bool {
    if lhs.category != rhs.category || !tags_overlap(&lhs.tags, &rhs.tags) {
        return false;
    }

    let lhs_do = normalize_conflict_text(&lhs.do_text);
    let lhs_dont = normalize_conflict_text(&lhs.dont_text);
    let rhs_do = normalize_conflict_text(&rhs.do_text);
    let rhs_dont = normalize_conflict_text(&rhs.dont_text);

    lhs_do == rhs_dont || rhs_do == lhs_dont
}

/// Active records that contradict the candidate within its category/tag scope.
#[must_use]
pub fn find_conflicts<'a>(
    candidate: &PatternRecord,
    records: &'a [PatternRecord],
) -> Vec<&'a PatternRecord> {
    records
        .iter()
        .filter(|record| record.status == RecordStatus::Active)
        .filter(|record| record.id != candidate.id)
        .filter(|record| records_conflict(candidate, record))
        .collect()
}

/// Scope key under which an unresolved clarification blocks further writes.
#[must_use]
pub fn conflict_scope_key(category: &str, tags: &BTreeSet<String>) -> String {
    let tag_list = tags.iter().map(String::as_str).collect::<Vec<_>>().join(",");
    format!("{category}|{tag_list}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision<'a> {
    AutoAccept,
    Clarify { reasons: Vec<String>, conflicts: Vec<&'a PatternRecord> },
}

/// Learning gate for one incoming record: auto-accept only when its seeded
/// confidence clears the threshold and no active record contradicts it.
#[must_use]
pub fn decide_admission<'a>(
    candidate: &PatternRecord,
    records: &'a [PatternRecord],
) -> AdmissionDecision<'a> {
    let mut reasons = Vec::new();

    if candidate.confidence < CONFIDENCE_THRESHOLD {
        reasons.push(format!(
            "confidence {:.2} is below the auto-accept threshold {CONFIDENCE_THRESHOLD}",
            candidate.confidence
        ));
    }

    let conflicts = find_conflicts(candidate, records);
    if !conflicts.is_empty() {
        reasons.push(format!(
            "{} active record(s) contradict the observation in scope {}",
            conflicts.len(),
            conflict_scope_key(&candidate.category, &candidate.tags)
        ));
    }

    if reasons.is_empty() {
        AdmissionDecision::AutoAccept
    } else {
        AdmissionDecision::Clarify { reasons, conflicts }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Confirm,
    Reject,
}

/// Reinforce a record whose recommendation survived a clarification round.
/// The confidence nudge always refreshes `learned_at`: confidence is never
/// mutated without a visible timestamp change.
pub fn reinforce_confidence(record: &mut PatternRecord, as_of: OffsetDateTime) {
    record.confidence = (record.confidence + REINFORCEMENT_STEP).min(REINFORCEMENT_CAP);
    record.learned_at = as_of;
}

/// A parked observation awaiting an explicit resolution. The candidate is
/// built (ids assigned) but not admitted to retrieval; it lives outside the
/// record namespace until confirmed or rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingClarification {
    pub pending_id: String,
    pub scope: String,
    pub candidate: PatternRecord,
    pub conflicts: Vec<PatternRecord>,
    pub reasons: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PendingClarification {
    #[must_use]
    pub fn new_pending_id() -> String {
        format!("clar_{}", Ulid::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CacheRequest {
    pub role: String,
    pub question: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub context_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CacheResponse {
    pub full_text: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheMetadata {
    pub latency_ms: Option<u64>,
    pub cost_usd: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: String,
    pub request: CacheRequest,
    pub response: CacheResponse,
    #[serde(default)]
    pub metadata: CacheMetadata,
}

/// Derived addressing key for consultation dedup: a digest of the request
/// role, question, and referenced artifacts.
///
/// # Errors
/// Returns [`PatternError::Validation`] when role or question is empty.
pub fn derive_cache_key(request: &CacheRequest) -> Result<String, PatternError> {
    if request.role.trim().is_empty() {
        return Err(PatternError::Validation("cache request role MUST be non-empty".to_string()));
    }
    if request.question.trim().is_empty() {
        return Err(PatternError::Validation(
            "cache request question MUST be non-empty".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(request.role.as_bytes());
    hasher.update(b"\n");
    hasher.update(request.question.as_bytes());
    for artifact in &request.artifacts {
        hasher.update(b"\n");
        hasher.update(artifact.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    Ok(format!("q_{}", &digest_hex[..32]))
}

#[must_use]
pub fn cache_age_hours(record: &CacheRecord, as_of: OffsetDateTime) -> f64 {
    (as_of - record.timestamp).as_seconds_f64() / 3_600.0
}

/// A cached consultation dedups a repeat call only inside the TTL window.
#[must_use]
pub fn cache_hit_is_fresh(record: &CacheRecord, as_of: OffsetDateTime) -> bool {
    as_of - record.timestamp < Duration::hours(CONSULT_TTL_HOURS)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalMatch {
    pub record: CacheRecord,
    pub age_hours: f64,
    pub matched_terms: usize,
    pub total_terms: usize,
    pub relevance: f32,
}

/// Search consultation history across every source, regardless of age.
/// Results are ranked by lexical relevance to the query (then timestamp for
/// determinism); each entry is annotated with its elapsed age so staleness is
/// data for the caller, never a filter.
///
/// # Errors
/// Returns [`PatternError::Query`] when the query text has no usable terms.
pub fn search_cache_history(
    records: &[CacheRecord],
    query: &str,
    as_of: OffsetDateTime,
) -> Result<Vec<HistoricalMatch>, PatternError> {
    let query_terms = tokenize_query_terms(query);
    if query_terms.is_empty() {
        return Err(PatternError::Query(
            "history query MUST include at least one alphanumeric term".to_string(),
        ));
    }

    let mut matches: Vec<HistoricalMatch> = Vec::new();
    for record in records {
        let haystack = format!(
            "{} {} {} {}",
            record.request.question,
            record.response.full_text,
            record.response.key_points.join(" "),
            record.response.suggestions.join(" ")
        )
        .to_lowercase();

        let matched = query_terms.iter().filter(|term| haystack.contains(*term)).count();
        if matched == 0 {
            continue;
        }

        matches.push(HistoricalMatch {
            record: record.clone(),
            age_hours: cache_age_hours(record, as_of),
            matched_terms: matched,
            total_terms: query_terms.len(),
            relevance: ratio(matched, query_terms.len()),
        });
    }

    matches.sort_by(|lhs, rhs| {
        rhs.relevance
            .partial_cmp(&lhs.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rhs.record.timestamp.cmp(&lhs.record.timestamp))
            .then_with(|| lhs.record.source.cmp(&rhs.record.source))
    });

    Ok(matches)
}
