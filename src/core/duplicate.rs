// Duplicate detection and similarity grouping.
//
// Tiers run in increasing cost order, each narrowing the unmatched set:
// exact content hash, perceptual hash (images), vector similarity.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::{ConfigError, DedupOptions, EngineConfig};
use crate::core::cancel::CancellationToken;
use crate::core::cluster::SimilarityGraph;
use crate::core::fingerprint::{ContentFingerprinter, EmbedContent};
use crate::core::model::{
    ContentHash, ContentKind, DeclaredFormat, DedupReport, DedupStats, DuplicateEntry, DuplicateGroup, Embedding,
    EmbeddingKind, FileDescriptor, FileSummary, Fingerprint, MatchReason, SessionId,
    UngroupedFile, UngroupedReason,
};
use crate::core::tie_break::{select_kept, GroupTraits};
use crate::services::cache::{EmbeddingCache, MemoryEmbeddingCache};
use crate::services::gateway::{EmbedItem, EmbedResponse, EmbeddingGateway, GatewayError};
use crate::services::index::{IndexError, MemorySimilarityIndex, SimilarityIndex};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Worker pool error: {message}")]
    WorkerPool { message: String },
}

/// 1.0 is reserved for byte-identical matches.
const NEAR_DUPLICATE_SCORE_CEILING: f64 = 0.9999;

struct FingerprintJob {
    input_index: usize,
    summary: FileSummary,
    declared: DeclaredFormat,
    reader: Box<dyn Read + Send>,
}

struct Member {
    input_index: usize,
    summary: FileSummary,
    fingerprint: Fingerprint,
    payload: Option<EmbedContent>,
}

impl Member {
    fn embedding_kind(&self) -> Option<EmbeddingKind> {
        self.fingerprint.content_kind.embedding_kind()
    }
}

#[derive(Default)]
struct EmbeddingOutcome {
    vectors: BTreeMap<String, (EmbeddingKind, Vec<f32>)>,
    failures: BTreeMap<String, String>,
}

struct VectorEdge {
    kind: EmbeddingKind,
    a: String,
    b: String,
    score: f64,
}

enum IndexStageError {
    Cancelled,
    Index(IndexError),
}

/// Orchestrates fingerprinting, the matching tiers, and kept-file selection.
pub struct GroupingEngine {
    config: EngineConfig,
    fingerprinter: Arc<ContentFingerprinter>,
    pool: Arc<rayon::ThreadPool>,
    cache: Arc<dyn EmbeddingCache>,
    gateway: Option<Arc<dyn EmbeddingGateway>>,
    index: Arc<dyn SimilarityIndex>,
    embed_permits: Arc<Semaphore>,
}

impl GroupingEngine {
    /// Engine with an in-memory cache and index and no embedding gateway.
    /// Without a gateway only the hash tiers can group files.
    pub fn new(config: EngineConfig) -> Result<Self, DedupError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fingerprint_workers)
            .thread_name(|i| format!("fingerprint-{}", i))
            .build()
            .map_err(|e| DedupError::WorkerPool {
                message: e.to_string(),
            })?;

        Ok(Self {
            fingerprinter: Arc::new(ContentFingerprinter::new(&config)),
            pool: Arc::new(pool),
            cache: Arc::new(MemoryEmbeddingCache::with_capacity(config.cache_capacity)),
            gateway: None,
            index: Arc::new(MemorySimilarityIndex::new()),
            embed_permits: Arc::new(Semaphore::new(config.max_concurrent_embed_calls)),
            config,
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn EmbeddingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn SimilarityIndex>) -> Self {
        self.index = index;
        self
    }

    pub async fn deduplicate(
        &self,
        files: Vec<FileDescriptor>,
        options: &DedupOptions,
    ) -> Result<DedupReport, DedupError> {
        self.deduplicate_with_cancel(files, options, &CancellationToken::new())
            .await
    }

    /// Group `files` into duplicate sets. Sub-tier failures degrade the
    /// result; only cancellation and internal invariant violations are errors.
    pub async fn deduplicate_with_cancel(
        &self,
        files: Vec<FileDescriptor>,
        options: &DedupOptions,
        cancel: &CancellationToken,
    ) -> Result<DedupReport, DedupError> {
        options.validate()?;
        let session: SessionId = Uuid::new_v4();
        let mut stats = DedupStats {
            files_total: files.len(),
            ..DedupStats::default()
        };
        let mut ungrouped = Vec::new();
        log::info!("Deduplicating {} files (session {})", files.len(), session);

        let jobs = self.admit(files, &mut ungrouped);
        if cancel.is_cancelled() {
            return Err(DedupError::Cancelled);
        }

        let started = Instant::now();
        let members = self.fingerprint_all(jobs, cancel, &mut ungrouped).await?;
        stats.fingerprint_duration = started.elapsed();

        // Tier 1
        let (mut groups, remaining) = self.exact_groups(members);
        stats.exact_groups = groups.len();
        log::debug!(
            "{} exact-hash groups, {} files left for similarity tiers",
            groups.len(),
            remaining.len()
        );

        // Tier 2
        let perceptual = self.perceptual_edges(&remaining);

        // Tier 3
        let started = Instant::now();
        let embeddings = self
            .embed_remaining(&remaining, options, cancel, &mut stats)
            .await?;
        stats.embedding_duration = started.elapsed();

        let started = Instant::now();
        let vector_edges = if embeddings.vectors.is_empty() {
            Some(Vec::new())
        } else {
            match self
                .vector_edges(session, &embeddings.vectors, options, cancel)
                .await
            {
                Ok(edges) => Some(edges),
                Err(IndexStageError::Cancelled) => {
                    self.drop_session(session, options.deadline).await;
                    return Err(DedupError::Cancelled);
                }
                Err(IndexStageError::Index(e)) => {
                    log::warn!("Similarity index unavailable, skipping vector tier: {}", e);
                    None
                }
            }
        };
        self.drop_session(session, options.deadline).await;
        stats.similarity_duration = started.elapsed();

        let near = self.near_duplicate_groups(
            &remaining,
            &embeddings,
            vector_edges.as_deref(),
            &perceptual,
        );
        stats.near_duplicate_groups = near.len();
        groups.extend(near);

        let grouped: HashSet<&str> = groups.iter().flat_map(|g| g.member_ids()).collect();
        let mut unique = Vec::new();
        for (id, member) in &remaining {
            if grouped.contains(id.as_str()) {
                continue;
            }
            match self.unavailable_reason(member, &embeddings, vector_edges.is_some()) {
                Some((reason, detail)) => ungrouped.push(UngroupedFile {
                    file_id: id.clone(),
                    input_index: member.input_index,
                    reason_unavailable: reason,
                    detail,
                }),
                None => unique.push(id.clone()),
            }
        }

        verify_partition(&groups)?;

        groups.sort_by(|a, b| a.kept_file.id.cmp(&b.kept_file.id));
        ungrouped.sort_by(|a, b| {
            a.file_id
                .cmp(&b.file_id)
                .then(a.input_index.cmp(&b.input_index))
        });
        unique.sort();
        stats.bytes_reclaimable = groups.iter().map(|g| g.total_size_reclaimed).sum();

        log::info!(
            "Session {}: {} groups ({} exact, {} near), {} ungrouped, {} unique, {} bytes reclaimable",
            session,
            groups.len(),
            stats.exact_groups,
            stats.near_duplicate_groups,
            ungrouped.len(),
            unique.len(),
            stats.bytes_reclaimable
        );

        Ok(DedupReport {
            session_id: session,
            groups,
            ungrouped,
            unique,
            stats,
        })
    }

    /// Reject malformed descriptors before any work is done on them.
    fn admit(
        &self,
        files: Vec<FileDescriptor>,
        ungrouped: &mut Vec<UngroupedFile>,
    ) -> Vec<FingerprintJob> {
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let mut jobs = Vec::with_capacity(files.len());

        for (input_index, mut file) in files.into_iter().enumerate() {
            let rejection = if file.id.trim().is_empty() {
                Some("empty file id".to_string())
            } else if let Some(first) = first_seen.get(&file.id) {
                Some(format!(
                    "duplicate file id in batch (first at position {}, repeated at {})",
                    first, input_index
                ))
            } else if !file.has_content() {
                Some("missing content handle".to_string())
            } else {
                None
            };

            if let Some(detail) = rejection {
                log::warn!("Rejecting file {:?} at position {}: {}", file.id, input_index, detail);
                ungrouped.push(UngroupedFile {
                    file_id: file.id.clone(),
                    input_index,
                    reason_unavailable: UngroupedReason::InvalidInput,
                    detail,
                });
                continue;
            }

            if let Some(reader) = file.take_content() {
                first_seen.insert(file.id.clone(), input_index);
                jobs.push(FingerprintJob {
                    input_index,
                    summary: file.summary(),
                    declared: file.declared_format(),
                    reader,
                });
            }
        }

        jobs
    }

    async fn fingerprint_all(
        &self,
        jobs: Vec<FingerprintJob>,
        cancel: &CancellationToken,
        ungrouped: &mut Vec<UngroupedFile>,
    ) -> Result<Vec<Member>, DedupError> {
        let fingerprinter = self.fingerprinter.clone();
        let pool = self.pool.clone();
        let token = cancel.clone();

        let work = tokio::task::spawn_blocking(move || {
            pool.install(|| {
                jobs.into_par_iter()
                    .map(|job| {
                        if token.is_cancelled() {
                            return None;
                        }
                        let result = fingerprinter.fingerprint(job.reader, job.declared);
                        Some((job.input_index, job.summary, result))
                    })
                    .collect::<Vec<_>>()
            })
        });

        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(DedupError::Cancelled),
            joined = work => joined.map_err(|e| DedupError::WorkerPool { message: e.to_string() })?,
        };
        if cancel.is_cancelled() {
            return Err(DedupError::Cancelled);
        }

        let mut members = Vec::with_capacity(results.len());
        for (input_index, mut summary, result) in results.into_iter().flatten() {
            match result {
                Ok(output) => {
                    summary.dimensions = summary.dimensions.or(output.fingerprint.dimensions);
                    members.push(Member {
                        input_index,
                        summary,
                        fingerprint: output.fingerprint,
                        payload: output.payload,
                    });
                }
                Err(e) => {
                    log::warn!("Failed to read {}: {}", summary.id, e);
                    ungrouped.push(UngroupedFile {
                        file_id: summary.id,
                        input_index,
                        reason_unavailable: UngroupedReason::InvalidInput,
                        detail: e.to_string(),
                    });
                }
            }
        }
        Ok(members)
    }

    /// Tier 1: identical content hashes form groups immediately. Returns the
    /// groups and the singletons keyed by file id.
    fn exact_groups(&self, members: Vec<Member>) -> (Vec<DuplicateGroup>, BTreeMap<String, Member>) {
        let mut by_hash: BTreeMap<ContentHash, Vec<Member>> = BTreeMap::new();
        for member in members {
            by_hash
                .entry(member.fingerprint.content_hash.clone())
                .or_default()
                .push(member);
        }

        let mut groups = Vec::new();
        let mut remaining = BTreeMap::new();
        for (_, partition) in by_hash {
            if partition.len() < 2 {
                for member in partition {
                    remaining.insert(member.summary.id.clone(), member);
                }
                continue;
            }
            let traits = GroupTraits {
                byte_identical: true,
                images: partition
                    .iter()
                    .all(|m| m.fingerprint.content_kind == ContentKind::Image),
            };
            let summaries: Vec<FileSummary> = partition.into_iter().map(|m| m.summary).collect();
            groups.push(build_group(summaries, traits, MatchReason::ExactHash, |_, _| 1.0));
        }

        (groups, remaining)
    }

    /// Tier 2: cheap perceptual-hash candidate pairs among remaining images.
    fn perceptual_edges(&self, remaining: &BTreeMap<String, Member>) -> Vec<(String, String, f64)> {
        let max_distance = self.config.perceptual_distance_threshold;
        let images: Vec<(&String, _)> = remaining
            .iter()
            .filter_map(|(id, m)| m.fingerprint.perceptual_hash.map(|h| (id, h)))
            .collect();

        let mut edges = Vec::new();
        for (i, (a, ha)) in images.iter().enumerate() {
            for (b, hb) in &images[i + 1..] {
                if ha.is_candidate(hb, max_distance) {
                    edges.push(((*a).clone(), (*b).clone(), ha.similarity(hb)));
                }
            }
        }
        log::debug!("{} perceptual candidate pairs among {} images", edges.len(), images.len());
        edges
    }

    /// Tier 3, first half: obtain vectors from the cache or the gateway.
    async fn embed_remaining(
        &self,
        remaining: &BTreeMap<String, Member>,
        options: &DedupOptions,
        cancel: &CancellationToken,
        stats: &mut DedupStats,
    ) -> Result<EmbeddingOutcome, DedupError> {
        let mut outcome = EmbeddingOutcome::default();

        for kind in EmbeddingKind::ALL {
            let expected = self.config.dimensions_for(kind);
            let mut misses = Vec::new();

            for (id, member) in remaining {
                if member.embedding_kind() != Some(kind) {
                    continue;
                }
                let Some(payload) = &member.payload else {
                    continue;
                };
                match self.cache.get(kind, &member.fingerprint.content_hash) {
                    Some(cached) if cached.vector.len() == expected => {
                        stats.cache_hits += 1;
                        outcome.vectors.insert(id.clone(), (kind, cached.vector));
                    }
                    stale => {
                        if stale.is_some() {
                            log::debug!(
                                "Ignoring cached {} vector with wrong dimensions for {}",
                                kind,
                                member.fingerprint.content_hash.short()
                            );
                        }
                        stats.cache_misses += 1;
                        misses.push(EmbedItem {
                            file_id: id.clone(),
                            content: payload.clone(),
                        });
                    }
                }
            }

            if misses.is_empty() {
                continue;
            }

            let Some(gateway) = &self.gateway else {
                for item in misses {
                    outcome
                        .failures
                        .insert(item.file_id, "no embedding gateway configured".to_string());
                }
                continue;
            };

            log::info!("Requesting {} {} embeddings", misses.len(), kind);
            self.call_gateway(gateway.clone(), kind, misses, remaining, options, cancel, stats, &mut outcome)
                .await?;
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_gateway(
        &self,
        gateway: Arc<dyn EmbeddingGateway>,
        kind: EmbeddingKind,
        items: Vec<EmbedItem>,
        remaining: &BTreeMap<String, Member>,
        options: &DedupOptions,
        cancel: &CancellationToken,
        stats: &mut DedupStats,
        outcome: &mut EmbeddingOutcome,
    ) -> Result<(), DedupError> {
        let requested: Vec<String> = items.iter().map(|i| i.file_id.clone()).collect();
        let deadline = options.deadline;
        let mut calls = JoinSet::new();

        for chunk in items.chunks(options.max_embed_batch_size) {
            let chunk = chunk.to_vec();
            let gateway = gateway.clone();
            let permits = self.embed_permits.clone();
            stats.gateway_calls += 1;

            calls.spawn(async move {
                let ids: Vec<String> = chunk.iter().map(|i| i.file_id.clone()).collect();
                let _permit = permits.acquire_owned().await.ok();
                let result = match tokio::time::timeout(deadline, gateway.embed(kind, chunk)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(deadline)),
                };
                (ids, result)
            });
        }

        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    // In-flight responses are discarded.
                    calls.abort_all();
                    return Err(DedupError::Cancelled);
                }
                joined = calls.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((ids, Ok(response))) => {
                    self.absorb_response(kind, &ids, response, remaining, outcome);
                }
                Ok((ids, Err(e))) => {
                    log::warn!("{} embedding call for {} files failed: {}", kind, ids.len(), e);
                    for id in ids {
                        outcome.failures.insert(id, e.to_string());
                    }
                }
                Err(e) => log::error!("{} embedding task failed: {}", kind, e),
            }
        }

        for id in requested {
            if !outcome.vectors.contains_key(&id) && !outcome.failures.contains_key(&id) {
                outcome
                    .failures
                    .insert(id, "embedding call did not complete".to_string());
            }
        }
        Ok(())
    }

    fn absorb_response(
        &self,
        kind: EmbeddingKind,
        requested: &[String],
        response: EmbedResponse,
        remaining: &BTreeMap<String, Member>,
        outcome: &mut EmbeddingOutcome,
    ) {
        let expected = self.config.dimensions_for(kind);
        let requested: HashSet<&str> = requested.iter().map(String::as_str).collect();

        if response.is_partial() {
            log::warn!(
                "{} embedding call partially failed: {} ok, {} failed",
                kind,
                response.results.len(),
                response.failures.len()
            );
        }

        for result in response.results {
            if !requested.contains(result.file_id.as_str()) {
                log::warn!("Gateway returned a vector for unrequested file {}", result.file_id);
                continue;
            }
            let Some(member) = remaining.get(&result.file_id) else {
                continue;
            };
            if result.vector.len() != expected {
                outcome.failures.insert(
                    result.file_id,
                    format!("expected {} dimensions, got {}", expected, result.vector.len()),
                );
                continue;
            }
            if !result.vector.iter().all(|v| v.is_finite()) {
                outcome
                    .failures
                    .insert(result.file_id, "vector contains non-finite values".to_string());
                continue;
            }

            self.cache.put(
                &member.fingerprint.content_hash,
                Embedding {
                    file_id: result.file_id.clone(),
                    kind,
                    vector: result.vector.clone(),
                    source_hash: member.fingerprint.content_hash.clone(),
                },
            );
            outcome.vectors.insert(result.file_id, (kind, result.vector));
        }

        for failure in response.failures {
            if requested.contains(failure.file_id.as_str())
                && !outcome.vectors.contains_key(&failure.file_id)
            {
                outcome.failures.insert(failure.file_id, failure.error);
            }
        }
    }

    /// Tier 3, second half: insert every vector, then query each one. All
    /// inserts complete before the first query runs.
    async fn vector_edges(
        &self,
        session: SessionId,
        vectors: &BTreeMap<String, (EmbeddingKind, Vec<f32>)>,
        options: &DedupOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<VectorEdge>, IndexStageError> {
        let deadline = options.deadline;

        let mut inserts = JoinSet::new();
        for (id, (kind, vector)) in vectors {
            let index = self.index.clone();
            let (id, kind, vector) = (id.clone(), *kind, vector.clone());
            inserts.spawn(async move {
                match tokio::time::timeout(deadline, index.insert(session, &id, &vector, kind)).await {
                    Ok(result) => result,
                    Err(_) => Err(IndexError::Timeout(deadline)),
                }
            });
        }
        drain(&mut inserts, cancel).await?;

        let mut queries = JoinSet::new();
        for (id, (kind, vector)) in vectors {
            let index = self.index.clone();
            let (id, kind, vector) = (id.clone(), *kind, vector.clone());
            let threshold = options.threshold_for(kind);
            queries.spawn(async move {
                let neighbors =
                    match tokio::time::timeout(deadline, index.query(session, &vector, kind, threshold)).await {
                        Ok(result) => result?,
                        Err(_) => return Err(IndexError::Timeout(deadline)),
                    };
                Ok((id, kind, threshold, neighbors))
            });
        }
        let answers = drain(&mut queries, cancel).await?;

        let mut edges = Vec::new();
        for (id, kind, threshold, neighbors) in answers {
            for neighbor in neighbors {
                if neighbor.file_id == id || neighbor.score < threshold {
                    continue;
                }
                match vectors.get(&neighbor.file_id) {
                    Some((other_kind, _)) if *other_kind == kind => edges.push(VectorEdge {
                        kind,
                        a: id.clone(),
                        b: neighbor.file_id,
                        score: neighbor.score,
                    }),
                    _ => log::debug!("Ignoring out-of-batch neighbor {}", neighbor.file_id),
                }
            }
        }
        Ok(edges)
    }

    async fn drop_session(&self, session: SessionId, deadline: Duration) {
        match tokio::time::timeout(deadline, self.index.drop_session(session)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Failed to drop index session {}: {}", session, e),
            Err(_) => log::debug!("Timed out dropping index session {}", session),
        }
    }

    /// Build near-duplicate groups from vector edges and, for files with no
    /// usable vector, perceptual candidate edges.
    fn near_duplicate_groups(
        &self,
        remaining: &BTreeMap<String, Member>,
        embeddings: &EmbeddingOutcome,
        vector_edges: Option<&[VectorEdge]>,
        perceptual: &[(String, String, f64)],
    ) -> Vec<DuplicateGroup> {
        let has_vector = |id: &str| vector_edges.is_some() && embeddings.vectors.contains_key(id);
        let mut groups = Vec::new();

        for kind in EmbeddingKind::ALL {
            let mut graph = SimilarityGraph::new();
            for edge in vector_edges.unwrap_or_default().iter().filter(|e| e.kind == kind) {
                graph.add_edge(&edge.a, &edge.b, edge.score);
            }
            if kind == EmbeddingKind::Image {
                for (a, b, score) in perceptual {
                    if !(has_vector(a) && has_vector(b)) {
                        graph.add_edge(a, b, *score);
                    }
                }
            }

            let (reason, traits) = match kind {
                EmbeddingKind::Text => (
                    MatchReason::NearDuplicateText,
                    GroupTraits {
                        byte_identical: false,
                        images: false,
                    },
                ),
                EmbeddingKind::Image => (
                    MatchReason::NearDuplicateImage,
                    GroupTraits {
                        byte_identical: false,
                        images: true,
                    },
                ),
            };

            for component in graph.components() {
                let within: BTreeSet<String> = component.iter().cloned().collect();
                let summaries: Vec<FileSummary> = component
                    .iter()
                    .filter_map(|id| remaining.get(id).map(|m| m.summary.clone()))
                    .collect();
                if summaries.len() < 2 {
                    continue;
                }
                groups.push(build_group(summaries, traits, reason, |dup, kept| {
                    let score = graph
                        .edge(dup, kept)
                        .or_else(|| graph.strongest_edge(dup, &within))
                        .unwrap_or(0.0);
                    score.clamp(0.0, NEAR_DUPLICATE_SCORE_CEILING)
                }));
            }
        }

        groups
    }

    fn unavailable_reason(
        &self,
        member: &Member,
        embeddings: &EmbeddingOutcome,
        index_available: bool,
    ) -> Option<(UngroupedReason, String)> {
        member.embedding_kind()?;
        let id = member.summary.id.as_str();

        if embeddings.vectors.contains_key(id) {
            return (!index_available).then(|| {
                (
                    UngroupedReason::IndexUnavailable,
                    "vector similarity tier skipped".to_string(),
                )
            });
        }
        embeddings
            .failures
            .get(id)
            .map(|detail| (UngroupedReason::EmbeddingUnavailable, detail.clone()))
    }
}

/// Wait for every task in `set`, failing fast on the first index error.
async fn drain<T: 'static>(
    set: &mut JoinSet<Result<T, IndexError>>,
    cancel: &CancellationToken,
) -> Result<Vec<T>, IndexStageError> {
    let mut out = Vec::with_capacity(set.len());
    loop {
        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                set.abort_all();
                return Err(IndexStageError::Cancelled);
            }
            joined = set.join_next() => joined,
        };
        match joined {
            None => return Ok(out),
            Some(Ok(Ok(value))) => out.push(value),
            Some(Ok(Err(e))) => {
                set.abort_all();
                return Err(IndexStageError::Index(e));
            }
            Some(Err(e)) => {
                set.abort_all();
                return Err(IndexStageError::Index(IndexError::Unavailable {
                    message: e.to_string(),
                }));
            }
        }
    }
}

fn build_group<F>(
    summaries: Vec<FileSummary>,
    traits: GroupTraits,
    reason: MatchReason,
    score: F,
) -> DuplicateGroup
where
    F: Fn(&str, &str) -> f64,
{
    let kept_index = select_kept(&summaries, traits);
    let kept_file = summaries[kept_index].clone();

    let mut duplicates: Vec<DuplicateEntry> = summaries
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != kept_index)
        .map(|(_, file)| DuplicateEntry {
            similarity_score: score(&file.id, &kept_file.id),
            reason,
            file,
        })
        .collect();
    duplicates.sort_by(|a, b| a.file.id.cmp(&b.file.id));

    let mut ids: Vec<&str> = std::iter::once(kept_file.id.as_str())
        .chain(duplicates.iter().map(|d| d.file.id.as_str()))
        .collect();
    ids.sort_unstable();
    let group_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, ids.join("\n").as_bytes());

    DuplicateGroup {
        group_id,
        total_size_reclaimed: duplicates.iter().map(|d| d.file.size_bytes).sum(),
        kept_file,
        duplicates,
    }
}

/// Every file may appear in at most one group, once.
fn verify_partition(groups: &[DuplicateGroup]) -> Result<(), DedupError> {
    let mut seen = HashSet::new();
    for group in groups {
        if group.duplicates.is_empty() {
            return Err(DedupError::InvariantViolation {
                message: format!("group {} has no duplicates", group.group_id),
            });
        }
        for id in group.member_ids() {
            if !seen.insert(id) {
                return Err(DedupError::InvariantViolation {
                    message: format!("file {} claimed by more than one group", id),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, size: u64) -> FileSummary {
        FileSummary {
            id: id.to_string(),
            name: format!("{}.txt", id),
            mime_type: "text/plain".to_string(),
            size_bytes: size,
            modified_at: None,
            dimensions: None,
        }
    }

    #[test]
    fn test_build_group_sorts_duplicates_and_sums_sizes() {
        let traits = GroupTraits {
            byte_identical: true,
            images: false,
        };
        let group = build_group(
            vec![summary("c", 30), summary("a", 10), summary("b", 20)],
            traits,
            MatchReason::ExactHash,
            |_, _| 1.0,
        );
        assert_eq!(group.kept_file.id, "a");
        let ids: Vec<_> = group.duplicates.iter().map(|d| d.file.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(group.total_size_reclaimed, 50);
    }

    #[test]
    fn test_group_id_is_deterministic() {
        let traits = GroupTraits {
            byte_identical: false,
            images: false,
        };
        let a = build_group(
            vec![summary("x", 1), summary("y", 1)],
            traits,
            MatchReason::NearDuplicateText,
            |_, _| 0.9,
        );
        let b = build_group(
            vec![summary("y", 1), summary("x", 1)],
            traits,
            MatchReason::NearDuplicateText,
            |_, _| 0.9,
        );
        assert_eq!(a.group_id, b.group_id);
    }

    #[test]
    fn test_verify_partition_detects_overlap() {
        let traits = GroupTraits {
            byte_identical: true,
            images: false,
        };
        let first = build_group(
            vec![summary("a", 1), summary("b", 1)],
            traits,
            MatchReason::ExactHash,
            |_, _| 1.0,
        );
        let second = build_group(
            vec![summary("b", 1), summary("c", 1)],
            traits,
            MatchReason::ExactHash,
            |_, _| 1.0,
        );
        assert!(verify_partition(std::slice::from_ref(&first)).is_ok());
        assert!(matches!(
            verify_partition(&[first, second]),
            Err(DedupError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_engine_rejects_zero_workers() {
        let config = EngineConfig {
            fingerprint_workers: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            GroupingEngine::new(config),
            Err(DedupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let engine = GroupingEngine::new(EngineConfig::default()).unwrap();
        let options = DedupOptions {
            image_threshold: -0.1,
            ..DedupOptions::default()
        };
        let result = engine.deduplicate(Vec::new(), &options).await;
        assert!(matches!(result, Err(DedupError::Config(_))));
    }
}
