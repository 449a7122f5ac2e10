//! Knowledge base: document chunking, hashed embeddings and hybrid search.
//!
//! Search ranks chunks by `0.7 * cosine + 0.3 * trigram` where the cosine is
//! taken between hashed bag-of-words vectors and the trigram part is the
//! Jaccard similarity of character trigram sets.

use crate::errors::SakhiError;
use crate::settings::Kb as KbCfg;
use crate::storage::{self, NewKbChunk, NewKbDoc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;

const COSINE_WEIGHT: f32 = 0.7;
const TRIGRAM_WEIGHT: f32 = 0.3;

pub const DEFAULT_K: usize = 5;
pub const MAX_K: usize = 20;

/// A chunk's text and its char offsets within the source document
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split `content` into windows of at most `size` characters overlapping by
/// `overlap`. Windows end on whitespace when one exists in their back half.
pub fn chunk_text(content: &str, size: usize, overlap: usize) -> Vec<TextChunk> {
    let chars: Vec<char> = content.chars().collect();
    let n = chars.len();
    let size = size.max(1);
    let overlap = overlap.min(size.saturating_sub(1));
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < n {
        let mut end = (start + size).min(n);
        if end < n {
            // A cut at `start` would make no progress
            let floor = (start + size / 2).max(start + 1);
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws;
            }
        }
        let text: String = chars[start..end].iter().collect();
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            chunks.push(TextChunk {
                text: trimmed.to_string(),
                start,
                end,
            });
        }
        if end >= n {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }
    chunks
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Deterministic hashed bag-of-words vector, L2-normalized.
/// Empty input yields the zero vector.
pub fn embed(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim.max(1)];
    for token in tokens(text) {
        let digest = Sha256::digest(token.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(bucket) % v.len() as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn trigrams(text: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    for word in tokens(text) {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for w in padded.windows(3) {
            set.insert(w.iter().collect());
        }
    }
    set
}

/// Jaccard similarity of the two texts' word-padded character trigrams
pub fn trigram_similarity(a: &str, b: &str) -> f32 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f32 / union as f32
}

pub fn hybrid_score(query: &str, query_vec: &[f32], chunk_text: &str, chunk_vec: &[f32]) -> f32 {
    // Opposing hash signs can make cosine negative; treat that as no match
    let cos = cosine(query_vec, chunk_vec).max(0.0);
    COSINE_WEIGHT * cos + TRIGRAM_WEIGHT * trigram_similarity(query, chunk_text)
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub title: String,
    pub content: String,
    pub source: String,
    pub language: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub doc_id: String,
    pub title: String,
    pub chunks: usize,
    pub word_count: i32,
}

pub async fn ingest(
    db: &DatabaseConnection,
    cfg: &KbCfg,
    req: IngestRequest,
) -> Result<IngestResponse, SakhiError> {
    let language = match req.language {
        Some(l) => l,
        None => crate::nlu::detect_language(&req.content).to_string(),
    };
    let chunks: Vec<NewKbChunk> = chunk_text(&req.content, cfg.chunk_size, cfg.chunk_overlap)
        .into_iter()
        .map(|c| NewKbChunk {
            embedding: embed(&c.text, cfg.embedding_dim),
            text: c.text,
            start_char: c.start,
            end_char: c.end,
        })
        .collect();

    let (doc, stored) = storage::create_kb_doc(
        db,
        NewKbDoc {
            title: req.title,
            source: req.source,
            language,
            url: req.url,
            content: req.content,
        },
        chunks,
    )
    .await?;

    tracing::info!(doc_id = %doc.id, chunks = stored.len(), "Ingested knowledge base document");
    Ok(IngestResponse {
        doc_id: doc.id,
        title: doc.title,
        chunks: stored.len(),
        word_count: doc.word_count,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub doc_id: String,
    pub title: String,
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
}

pub fn validate_k(k: Option<usize>) -> Result<usize, SakhiError> {
    let k = k.unwrap_or(DEFAULT_K);
    if !(1..=MAX_K).contains(&k) {
        return Err(SakhiError::BadRequest(format!(
            "k must be between 1 and {}",
            MAX_K
        )));
    }
    Ok(k)
}

pub async fn search(
    db: &DatabaseConnection,
    cfg: &KbCfg,
    query: &str,
    k: Option<usize>,
    language: Option<&str>,
) -> Result<SearchResponse, SakhiError> {
    let k = validate_k(k)?;
    let query = query.trim();
    if query.is_empty() {
        return Err(SakhiError::BadRequest("q is required".into()));
    }

    let query_vec = embed(query, cfg.embedding_dim);
    let mut hits: Vec<SearchHit> = storage::searchable_chunks(db, language)
        .await?
        .into_iter()
        .filter_map(|(doc, chunk)| {
            let chunk_vec: Vec<f32> = serde_json::from_str(&chunk.embedding).ok()?;
            let score = hybrid_score(query, &query_vec, &chunk.text, &chunk_vec);
            (score > 0.0).then(|| SearchHit {
                doc_id: doc.id,
                title: doc.title,
                chunk_id: chunk.id,
                text: chunk.text,
                score,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.title.cmp(&b.title))
    });
    hits.truncate(k);

    tracing::debug!(query = %query, hits = hits.len(), "Knowledge base search");
    Ok(SearchResponse {
        query: query.to_string(),
        results: hits,
    })
}
