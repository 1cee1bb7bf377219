use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use pattern_memory_core::{
    cache_age_hours, cache_hit_is_fresh, conflict_scope_key, decide_admission, derive_cache_key,
    rank_patterns, reinforce_confidence, search_cache_history, AdmissionDecision, CacheMetadata,
    CacheRecord, CacheRequest, CacheResponse, ClientUid, ConfidenceSource, HistoricalMatch,
    PatternId, PatternRecord, PendingClarification, Provenance, QueryFilters, QueryOutcome,
    QueryRequest, RecordStatus, Resolution, Severity,
};
use pattern_memory_store_fs::{FsStore, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnRequest {
    pub project_slug: String,
    pub title: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub severity: Severity,
    pub do_text: String,
    pub dont_text: String,
    pub example: Option<String>,
    pub confidence_source: ConfidenceSource,
    pub confidence: Option<f32>,
    pub agent: String,
    pub source_uri: Option<String>,
    pub source_hash: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub observed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LearnOutcome {
    AutoAccepted { record: PatternRecord },
    PendingClarification { pending: PendingClarification },
    ScopeBlocked { pending_id: String, scope: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Superseded { record: Box<PatternRecord>, archived: Vec<PatternId> },
    Rejected { reinforced: Vec<PatternId> },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Create,
    Supersede,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutRequest {
    pub write_mode: WriteMode,
    pub id: Option<PatternId>,
    #[serde(default)]
    pub supersedes: Vec<PatternId>,
    #[serde(flatten)]
    pub fields: LearnRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiQueryRequest {
    pub text: String,
    #[serde(default)]
    pub filters: QueryFilters,
    pub top_n: usize,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheLookup {
    pub hit: bool,
    pub derived_key: String,
    pub record: Option<CacheRecord>,
    pub age_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultStoreRequest {
    pub source: String,
    pub request: CacheRequest,
    pub response: CacheResponse,
    #[serde(default)]
    pub metadata: CacheMetadata,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub answered_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredConsultation {
    pub derived_key: String,
    pub record: CacheRecord,
}

/// The process-wide pattern memory service: one explicitly constructed
/// instance owning the storage root, passed by reference to callers.
#[derive(Debug)]
pub struct PatternMemory {
    root: PathBuf,
    store: FsStore,
}

impl PatternMemory {
    /// Open the service over a storage root, creating the directory tree on
    /// first use.
    ///
    /// # Errors
    /// Returns an error when the storage root cannot be prepared.
    pub fn open(root: &Path) -> Result<Self> {
        let store = FsStore::open(root)
            .with_context(|| format!("failed to open pattern memory at {}", root.display()))?;
        tracing::debug!(root = %root.display(), "pattern memory opened");
        Ok(Self { root: root.to_path_buf(), store })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Release the service. The store holds no long-lived handles, so this is
    /// a consuming drop with a lifecycle log line.
    pub fn close(self) {
        tracing::debug!(root = %self.root.display(), "pattern memory closed");
    }

    /// Run one observation through the learning gate: seed confidence from
    /// its source, check the active set for contradictions, then either
    /// persist directly or park a clarification that blocks the scope.
    ///
    /// # Errors
    /// Returns an error when the observation is invalid or the store fails.
    pub fn learn(&self, request: LearnRequest) -> Result<LearnOutcome> {
        let now = request.observed_at.unwrap_or_else(OffsetDateTime::now_utc);
        let candidate = build_record(request, None, Vec::new(), now);
        candidate.validate().context("observation failed validation")?;

        let scope = conflict_scope_key(&candidate.category, &candidate.tags);
        for pending in self.store.list_pending()? {
            if pending.scope == scope {
                tracing::debug!(scope = %scope, pending_id = %pending.pending_id, "scope blocked");
                return Ok(LearnOutcome::ScopeBlocked { pending_id: pending.pending_id, scope });
            }
        }

        let records = self.collect_patterns()?;
        match decide_admission(&candidate, &records) {
            AdmissionDecision::AutoAccept => {
                self.store.put_pattern(&candidate)?;
                tracing::debug!(id = %candidate.id, "observation auto-accepted");
                Ok(LearnOutcome::AutoAccepted { record: candidate })
            }
            AdmissionDecision::Clarify { reasons, conflicts } => {
                let pending = PendingClarification {
                    pending_id: PendingClarification::new_pending_id(),
                    scope,
                    candidate,
                    conflicts: conflicts.into_iter().cloned().collect(),
                    reasons,
                    created_at: now,
                };
                self.store.put_pending(&pending)?;
                tracing::debug!(pending_id = %pending.pending_id, "observation parked");
                Ok(LearnOutcome::PendingClarification { pending })
            }
        }
    }

    /// Apply an explicit resolution to a parked clarification.
    ///
    /// Confirm archives the contradicted records and stores the candidate as
    /// a user instruction superseding them; Reject writes nothing new and
    /// reinforces the surviving records.
    ///
    /// # Errors
    /// Returns an error when the clarification does not exist or the store
    /// fails mid-resolution.
    pub fn resolve(
        &self,
        pending_id: &str,
        resolution: Resolution,
        resolved_at: Option<OffsetDateTime>,
    ) -> Result<ResolveOutcome> {
        let pending = self
            .store
            .get_pending(pending_id)?
            .ok_or_else(|| anyhow!("pending clarification not found: {pending_id}"))?;
        let now = resolved_at.unwrap_or_else(OffsetDateTime::now_utc);

        let outcome = match resolution {
            Resolution::Confirm => {
                let mut archived = Vec::new();
                for conflict in &pending.conflicts {
                    if let Some(mut record) = self.store.get_pattern(conflict.id)? {
                        record.status = RecordStatus::Archived;
                        self.store.put_pattern(&record)?;
                        archived.push(record.id);
                    }
                }

                let mut record = pending.candidate.clone();
                record.confidence_source = ConfidenceSource::UserInstruction;
                record.confidence = ConfidenceSource::UserInstruction.seed_confidence();
                record.learned_at = now;
                record.supersedes = archived.clone();
                self.store.put_pattern(&record)?;
                tracing::debug!(id = %record.id, archived = archived.len(), "clarification confirmed");
                ResolveOutcome::Superseded { record: Box::new(record), archived }
            }
            Resolution::Reject => {
                let mut reinforced = Vec::new();
                for conflict in &pending.conflicts {
                    if let Some(mut record) = self.store.get_pattern(conflict.id)? {
                        reinforce_confidence(&mut record, now);
                        self.store.put_pattern(&record)?;
                        reinforced.push(record.id);
                    }
                }
                tracing::debug!(reinforced = reinforced.len(), "clarification rejected");
                ResolveOutcome::Rejected { reinforced }
            }
        };

        self.store.remove_pending(pending_id)?;
        Ok(outcome)
    }

    /// Direct write outside the learning gate.
    ///
    /// `create` refuses to reuse an existing id (an update must supersede);
    /// `supersede` archives the named targets and records lineage on the
    /// replacement.
    ///
    /// # Errors
    /// Returns an error on validation failure, id reuse, or a missing
    /// supersede target.
    pub fn put(&self, request: PutRequest) -> Result<PatternRecord> {
        let now = request.fields.observed_at.unwrap_or_else(OffsetDateTime::now_utc);
        let record = build_record(request.fields, request.id, request.supersedes.clone(), now);
        record.validate().context("record failed validation")?;

        match request.write_mode {
            WriteMode::Create => {
                if self.store.get_pattern(record.id)?.is_some() {
                    return Err(anyhow!(
                        "id {} already exists; supersede it instead of mutating",
                        record.id
                    ));
                }
            }
            WriteMode::Supersede => {
                if request.supersedes.is_empty() {
                    return Err(anyhow!("write_mode=supersede requires at least one target id"));
                }
                for target in &request.supersedes {
                    let mut old = self
                        .store
                        .get_pattern(*target)?
                        .ok_or_else(|| anyhow!("supersede target not found: {target}"))?;
                    old.status = RecordStatus::Archived;
                    self.store.put_pattern(&old)?;
                }
            }
        }

        self.store.put_pattern(&record)?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when the stored record is corrupt or unreadable.
    pub fn get(&self, id: PatternId) -> Result<Option<PatternRecord>> {
        Ok(self.store.get_pattern(id)?)
    }

    /// All readable records, newest first. Corrupt files are skipped and
    /// reported, never repaired.
    ///
    /// # Errors
    /// Returns an error when the record directory cannot be scanned.
    pub fn list(&self) -> Result<Vec<PatternRecord>> {
        let mut records = self.collect_patterns()?;
        records.sort_by(|lhs, rhs| {
            rhs.learned_at.cmp(&lhs.learned_at).then_with(|| lhs.id.cmp(&rhs.id))
        });
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the pending directory cannot be read.
    pub fn list_pending(&self) -> Result<Vec<PendingClarification>> {
        Ok(self.store.list_pending()?)
    }

    /// Filtered, ranked retrieval over the live store snapshot.
    ///
    /// # Errors
    /// Returns an error when the scan fails or the query is malformed.
    pub fn query(&self, request: ApiQueryRequest) -> Result<QueryOutcome> {
        let as_of = request.as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let records = self.collect_patterns()?;
        let outcome = rank_patterns(
            &records,
            &QueryRequest { text: request.text, filters: request.filters, top_n: request.top_n, as_of },
        )?;
        Ok(outcome)
    }

    /// Consultation-dedup lookup. A hit is honored only inside the TTL
    /// window; an expired record is returned as a miss that still carries the
    /// stale answer and its age.
    ///
    /// # Errors
    /// Returns an error when the key cannot be derived or the cache read
    /// fails.
    pub fn consult_lookup(
        &self,
        source: &str,
        request: &CacheRequest,
        as_of: Option<OffsetDateTime>,
    ) -> Result<CacheLookup> {
        let derived_key = derive_cache_key(request)?;
        self.consult_lookup_key(source, &derived_key, as_of)
    }

    /// Key-addressed variant of [`Self::consult_lookup`] for callers that
    /// already hold a derived key.
    ///
    /// # Errors
    /// Returns an error when the cache read fails.
    pub fn consult_lookup_key(
        &self,
        source: &str,
        derived_key: &str,
        as_of: Option<OffsetDateTime>,
    ) -> Result<CacheLookup> {
        let now = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let derived_key = derived_key.to_string();

        let Some(record) = self.store.latest_consultation(source, &derived_key)? else {
            return Ok(CacheLookup { hit: false, derived_key, record: None, age_hours: None });
        };

        let age_hours = cache_age_hours(&record, now);
        let hit = cache_hit_is_fresh(&record, now);
        if !hit {
            tracing::debug!(key = %derived_key, age_hours, "stale consultation hit, signalling re-consult");
        }
        Ok(CacheLookup { hit, derived_key, record: Some(record), age_hours: Some(age_hours) })
    }

    /// Memoize a fresh consultation under its derived key, superseding (not
    /// deleting) any prior answer.
    ///
    /// # Errors
    /// Returns an error when the key cannot be derived or the write fails.
    pub fn consult_store(&self, request: ConsultStoreRequest) -> Result<StoredConsultation> {
        let derived_key = derive_cache_key(&request.request)?;
        let record = CacheRecord {
            timestamp: request.answered_at.unwrap_or_else(OffsetDateTime::now_utc),
            source: request.source,
            request: request.request,
            response: request.response,
            metadata: request.metadata,
        };
        self.store.put_consultation(&derived_key, &record)?;
        Ok(StoredConsultation { derived_key, record })
    }

    /// Search the full consultation history across every source, regardless
    /// of age.
    ///
    /// # Errors
    /// Returns an error when the cache scan fails or the query is empty.
    pub fn history_search(
        &self,
        text: &str,
        as_of: Option<OffsetDateTime>,
    ) -> Result<Vec<HistoricalMatch>> {
        let now = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let records = self.collect_consultations()?;
        Ok(search_cache_history(&records, text, now)?)
    }

    fn collect_patterns(&self) -> Result<Vec<PatternRecord>> {
        let mut records = Vec::new();
        for item in self.store.scan_patterns()? {
            match item {
                Ok(record) => records.push(record),
                Err(StoreError::Corrupt { path, reason }) => {
                    tracing::warn!(path = %path.display(), reason = %reason, "skipping corrupt pattern record");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(records)
    }

    fn collect_consultations(&self) -> Result<Vec<CacheRecord>> {
        let mut records = Vec::new();
        for item in self.store.scan_consultations()? {
            match item {
                Ok(record) => records.push(record),
                Err(StoreError::Corrupt { path, reason }) => {
                    tracing::warn!(path = %path.display(), reason = %reason, "skipping corrupt consultation record");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(records)
    }
}

fn build_record(
    fields: LearnRequest,
    id: Option<PatternId>,
    supersedes: Vec<PatternId>,
    now: OffsetDateTime,
) -> PatternRecord {
    let confidence =
        fields.confidence.unwrap_or_else(|| fields.confidence_source.seed_confidence());
    let tags = fields.tags.into_iter().collect::<BTreeSet<_>>();

    PatternRecord {
        id: id.unwrap_or_default(),
        client_uid: ClientUid::new(),
        project_slug: fields.project_slug,
        title: fields.title,
        category: fields.category,
        tags,
        severity: fields.severity,
        do_text: fields.do_text,
        dont_text: fields.dont_text,
        example: fields.example,
        confidence,
        confidence_source: fields.confidence_source,
        provenance: Provenance {
            agent: fields.agent,
            source_uri: fields.source_uri,
            source_hash: fields.source_hash,
        },
        status: RecordStatus::Active,
        learned_at: now,
        supersedes,
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use ulid::Ulid;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn unique_memory() -> PatternMemory {
        let root = std::env::temp_dir().join(format!("patternmemory-api-{}", Ulid::new()));
        match PatternMemory::open(&root) {
            Ok(memory) => memory,
            Err(err) => panic!("pattern memory should open: {err}"),
        }
    }

    fn learn_request(confidence_source: ConfidenceSource, do_text: &str, dont_text: &str) -> LearnRequest {
        LearnRequest {
            project_slug: "demo".to_string(),
            title: "Prefer streaming parsers for large payloads".to_string(),
            category: "data-processing".to_string(),
            tags: vec!["parsing".to_string()],
            severity: Severity::Warning,
            do_text: do_text.to_string(),
            dont_text: dont_text.to_string(),
            example: None,
            confidence_source,
            confidence: None,
            agent: "tester".to_string(),
            source_uri: Some("file:///patterns.md".to_string()),
            source_hash: Some("sha256:abc123".to_string()),
            observed_at: Some(fixture_time()),
        }
    }

    fn learn_or_panic(memory: &PatternMemory, request: LearnRequest) -> LearnOutcome {
        match memory.learn(request) {
            Ok(outcome) => outcome,
            Err(err) => panic!("learn should succeed: {err}"),
        }
    }

    fn auto_accepted(outcome: LearnOutcome) -> PatternRecord {
        match outcome {
            LearnOutcome::AutoAccepted { record } => record,
            other => panic!("expected auto-accept, got {other:?}"),
        }
    }

    fn pending_of(outcome: LearnOutcome) -> PendingClarification {
        match outcome {
            LearnOutcome::PendingClarification { pending } => pending,
            other => panic!("expected pending clarification, got {other:?}"),
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn confident_observation_is_persisted_and_retrievable() {
        let memory = unique_memory();
        let record = auto_accepted(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::VerifiedPattern,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        ));

        let loaded = match memory.get(record.id) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => panic!("auto-accepted record should be stored"),
            Err(err) => panic!("get should succeed: {err}"),
        };
        assert_eq!(loaded, record);
        assert!((loaded.confidence - 0.85).abs() < 1e-6);

        let outcome = match memory.query(ApiQueryRequest {
            text: String::new(),
            filters: QueryFilters {
                category: Some("data-processing".to_string()),
                ..QueryFilters::default()
            },
            top_n: 10,
            as_of: Some(fixture_time()),
        }) {
            Ok(outcome) => outcome,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(outcome.returned, 1);
        assert_eq!(outcome.matches[0].id, record.id);

        memory.close();
    }

    // Test IDs: TAPI-002
    #[test]
    fn low_confidence_observation_blocks_its_scope() {
        let memory = unique_memory();
        let pending = pending_of(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::Inferred,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        ));
        assert!(pending.conflicts.is_empty());

        // Nothing admitted to retrieval while the clarification is parked.
        let listed = match memory.list() {
            Ok(listed) => listed,
            Err(err) => panic!("list should succeed: {err}"),
        };
        assert!(listed.is_empty());

        let blocked = learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::OfficialDocs,
                "another recommendation entirely",
                "another anti-pattern entirely",
            ),
        );
        match blocked {
            LearnOutcome::ScopeBlocked { pending_id, .. } => {
                assert_eq!(pending_id, pending.pending_id);
            }
            other => panic!("expected scope block, got {other:?}"),
        }
    }

    // Test IDs: TAPI-003
    #[test]
    fn confirmed_conflict_supersedes_the_old_record() {
        let memory = unique_memory();
        let original = auto_accepted(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::VerifiedPattern,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        ));

        let pending = pending_of(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::OfficialDocs,
                "buffer the entire payload into memory",
                "stream the payload through a bounded reader",
            ),
        ));
        assert_eq!(pending.conflicts[0].id, original.id);

        let outcome = match memory.resolve(&pending.pending_id, Resolution::Confirm, Some(fixture_time())) {
            Ok(outcome) => outcome,
            Err(err) => panic!("resolve should succeed: {err}"),
        };
        let (record, archived) = match outcome {
            ResolveOutcome::Superseded { record, archived } => (record, archived),
            other => panic!("expected supersede outcome, got {other:?}"),
        };

        assert_eq!(archived, vec![original.id]);
        assert_eq!(record.confidence_source, ConfidenceSource::UserInstruction);
        assert!((record.confidence - 0.95).abs() < 1e-6);
        assert_eq!(record.supersedes, vec![original.id]);

        let old = match memory.get(original.id) {
            Ok(Some(old)) => old,
            Ok(None) => panic!("archived record must remain readable"),
            Err(err) => panic!("get should succeed: {err}"),
        };
        assert_eq!(old.status, RecordStatus::Archived);

        // Archived loser no longer appears in default retrieval.
        let outcome = match memory.query(ApiQueryRequest {
            text: String::new(),
            filters: QueryFilters::default(),
            top_n: 10,
            as_of: Some(fixture_time()),
        }) {
            Ok(outcome) => outcome,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(outcome.returned, 1);
        assert_eq!(outcome.matches[0].id, record.id);
    }

    // Test IDs: TAPI-004
    #[test]
    fn rejected_conflict_reinforces_the_existing_record() {
        let memory = unique_memory();
        let original = auto_accepted(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::VerifiedPattern,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        ));

        let pending = pending_of(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::OfficialDocs,
                "buffer the entire payload into memory",
                "stream the payload through a bounded reader",
            ),
        ));

        let resolved_at = fixture_time() + Duration::hours(1);
        let outcome = match memory.resolve(&pending.pending_id, Resolution::Reject, Some(resolved_at)) {
            Ok(outcome) => outcome,
            Err(err) => panic!("resolve should succeed: {err}"),
        };
        match outcome {
            ResolveOutcome::Rejected { reinforced } => assert_eq!(reinforced, vec![original.id]),
            other => panic!("expected reject outcome, got {other:?}"),
        }

        let surviving = match memory.get(original.id) {
            Ok(Some(surviving)) => surviving,
            Ok(None) => panic!("surviving record should exist"),
            Err(err) => panic!("get should succeed: {err}"),
        };
        assert!((surviving.confidence - 0.87).abs() < 1e-6);
        assert_eq!(surviving.learned_at, resolved_at);

        let pending_left = match memory.list_pending() {
            Ok(pending_left) => pending_left,
            Err(err) => panic!("pending list should succeed: {err}"),
        };
        assert!(pending_left.is_empty());
    }

    // Test IDs: TAPI-005
    #[test]
    fn create_mode_refuses_to_mutate_an_existing_id() {
        let memory = unique_memory();
        let record = auto_accepted(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::VerifiedPattern,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        ));

        let mut fields = learn_request(
            ConfidenceSource::VerifiedPattern,
            "a silently different recommendation",
            "buffer the entire payload into memory",
        );
        fields.tags = vec!["sockets".to_string()];
        let err = match memory.put(PutRequest {
            write_mode: WriteMode::Create,
            id: Some(record.id),
            supersedes: Vec::new(),
            fields,
        }) {
            Ok(_) => panic!("create over an existing id must fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("supersede it instead"));
    }

    // Test IDs: TAPI-006
    #[test]
    fn explicit_supersede_archives_the_target() {
        let memory = unique_memory();
        let record = auto_accepted(learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::VerifiedPattern,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        ));

        let replacement = match memory.put(PutRequest {
            write_mode: WriteMode::Supersede,
            id: None,
            supersedes: vec![record.id],
            fields: learn_request(
                ConfidenceSource::UserInstruction,
                "stream with an explicit backpressure budget",
                "buffer the entire payload into memory",
            ),
        }) {
            Ok(replacement) => replacement,
            Err(err) => panic!("supersede should succeed: {err}"),
        };
        assert_eq!(replacement.supersedes, vec![record.id]);

        let old = match memory.get(record.id) {
            Ok(Some(old)) => old,
            Ok(None) => panic!("superseded record must remain readable"),
            Err(err) => panic!("get should succeed: {err}"),
        };
        assert_eq!(old.status, RecordStatus::Archived);
    }

    fn consult_request() -> CacheRequest {
        CacheRequest {
            role: "reviewer".to_string(),
            question: "is the queue bounded?".to_string(),
            artifacts: vec!["src/lib.rs".to_string()],
            context_summary: None,
        }
    }

    // Test IDs: TAPI-007
    #[test]
    fn consultation_cache_honors_the_ttl_window() {
        let memory = unique_memory();
        let now = fixture_time();
        let request = consult_request();

        let miss = match memory.consult_lookup("gemini", &request, Some(now)) {
            Ok(lookup) => lookup,
            Err(err) => panic!("lookup should succeed: {err}"),
        };
        assert!(!miss.hit);
        assert!(miss.record.is_none());

        let stored = match memory.consult_store(ConsultStoreRequest {
            source: "gemini".to_string(),
            request: request.clone(),
            response: CacheResponse {
                full_text: "yes, bounded at 128".to_string(),
                key_points: vec!["bounded channel".to_string()],
                suggestions: Vec::new(),
            },
            metadata: CacheMetadata { latency_ms: Some(900), cost_usd: Some(0.01) },
            answered_at: Some(now),
        }) {
            Ok(stored) => stored,
            Err(err) => panic!("consult store should succeed: {err}"),
        };
        assert_eq!(stored.derived_key, miss.derived_key);

        let hit = match memory.consult_lookup("gemini", &request, Some(now + Duration::minutes(5))) {
            Ok(lookup) => lookup,
            Err(err) => panic!("lookup should succeed: {err}"),
        };
        assert!(hit.hit);

        let expired =
            match memory.consult_lookup("gemini", &request, Some(now + Duration::minutes(24 * 60 + 1))) {
                Ok(lookup) => lookup,
                Err(err) => panic!("lookup should succeed: {err}"),
            };
        assert!(!expired.hit);
        assert!(expired.record.is_some());
        match expired.age_hours {
            Some(age) => assert!(age > 24.0),
            None => panic!("stale miss should carry its age"),
        }
    }

    // Test IDs: TAPI-009
    #[test]
    fn learn_outcome_serializes_with_a_state_tag() {
        let memory = unique_memory();
        let outcome = learn_or_panic(
            &memory,
            learn_request(
                ConfidenceSource::VerifiedPattern,
                "stream the payload through a bounded reader",
                "buffer the entire payload into memory",
            ),
        );

        let value = match serde_json::to_value(&outcome) {
            Ok(value) => value,
            Err(err) => panic!("outcome should serialize: {err}"),
        };
        assert_eq!(value.get("state").and_then(serde_json::Value::as_str), Some("auto_accepted"));
    }

    // Test IDs: TAPI-008
    #[test]
    fn superseded_consultations_stay_searchable_forever() {
        let memory = unique_memory();
        let now = fixture_time();
        let request = consult_request();

        let old = ConsultStoreRequest {
            source: "gemini".to_string(),
            request: request.clone(),
            response: CacheResponse {
                full_text: "bounded queue guidance, first pass".to_string(),
                key_points: Vec::new(),
                suggestions: Vec::new(),
            },
            metadata: CacheMetadata::default(),
            answered_at: Some(now - Duration::days(400)),
        };
        let fresh = ConsultStoreRequest {
            answered_at: Some(now),
            response: CacheResponse {
                full_text: "bounded queue guidance, revised".to_string(),
                key_points: Vec::new(),
                suggestions: Vec::new(),
            },
            ..old.clone()
        };

        for store_request in [old, fresh] {
            if let Err(err) = memory.consult_store(store_request) {
                panic!("consult store should succeed: {err}");
            }
        }

        let matches = match memory.history_search("bounded queue guidance", Some(now)) {
            Ok(matches) => matches,
            Err(err) => panic!("history search should succeed: {err}"),
        };
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().any(|entry| entry.age_hours > 9_000.0));
    }
}
