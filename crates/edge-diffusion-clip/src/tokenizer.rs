//! CLIP BPE Tokenizer
//!
//! Implements the byte-level Byte Pair Encoding tokenizer used by the CLIP
//! text encoder of Stable Diffusion 1.x.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid vocabulary file: {0}")]
    InvalidVocab(#[from] serde_json::Error),

    #[error("Invalid merge rule on line {line}: {content:?}")]
    InvalidMerge { line: usize, content: String },

    #[error("Special token {0} missing from vocabulary")]
    MissingSpecialToken(&'static str),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Text {0:?} produced no tokens")]
    NoTokens(String),

    #[error("max_length must be at least 2 to keep the begin/end markers, got {0}")]
    MaxLength(usize),
}

/// Begin-of-sequence marker
pub const START_OF_TEXT: &str = "<|startoftext|>";
/// End-of-sequence marker, also used for padding
pub const END_OF_TEXT: &str = "<|endoftext|>";
/// Sequence length expected by the SD 1.x text encoder
pub const DEFAULT_MAX_LENGTH: usize = 77;
/// Upper bound on merge rules read from a merges file (CLIP vocabulary size
/// minus the byte alphabet and the two markers, plus one)
pub const MAX_MERGES: usize = 49152 - 256 - 2 + 1;

const END_OF_WORD: &str = "</w>";

/// Padding strategy for [`ClipTokenizer::encode_batch_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Padding {
    /// Pad every sequence to `max_length` with the pad id
    #[default]
    MaxLength,
    /// Leave sequences at their natural length
    None,
}

/// Options for batch encoding
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub max_length: usize,
    pub truncation: bool,
    pub padding: Padding,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            truncation: true,
            padding: Padding::MaxLength,
        }
    }
}

/// Token ids and attention masks for a batch of texts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEncoding {
    /// One id sequence per input text
    pub input_ids: Vec<Vec<u32>>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<Vec<u8>>,
}

/// Memoized BPE results, keyed by the byte-encoded token.
///
/// The begin/end markers are seeded on construction and on every clear so
/// they are never split into sub-words.
struct BpeCache {
    entries: Mutex<HashMap<String, String>>,
}

impl BpeCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Self::seeded()),
        }
    }

    fn seeded() -> HashMap<String, String> {
        [START_OF_TEXT, END_OF_TEXT]
            .into_iter()
            .map(|marker| (marker.to_string(), marker.to_string()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // Entries are independent; a poisoned map is still usable
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, token: &str) -> Option<String> {
        self.lock().get(token).cloned()
    }

    fn insert(&self, token: &str, merged: &str) {
        self.lock().insert(token.to_string(), merged.to_string());
    }

    fn clear(&self) {
        *self.lock() = Self::seeded();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// CLIP BPE Tokenizer
pub struct ClipTokenizer {
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    cache: BpeCache,
    pat: Regex,
    bos_token_id: u32,
    eos_token_id: u32,
    pad_token_id: u32,
}

impl ClipTokenizer {
    /// Create a tokenizer from a `vocab.json` and a `merges.txt` file
    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(
        vocab_path: P,
        merges_path: Q,
    ) -> Result<Self, TokenizerError> {
        let vocab = fs::read_to_string(vocab_path)?;
        let merges = fs::read_to_string(merges_path)?;
        Self::from_strs(&vocab, &merges)
    }

    /// Create a tokenizer from vocabulary JSON and merge rules content
    pub fn from_strs(vocab_json: &str, merges: &str) -> Result<Self, TokenizerError> {
        let encoder: HashMap<String, u32> = serde_json::from_str(vocab_json)?;
        let decoder: HashMap<u32, String> = encoder.iter().map(|(k, &v)| (v, k.clone())).collect();
        let bpe_ranks = parse_merges(merges)?;

        let byte_encoder = bytes_to_unicode();
        let byte_decoder: HashMap<char, u8> = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        let bos_token_id = *encoder
            .get(START_OF_TEXT)
            .ok_or(TokenizerError::MissingSpecialToken(START_OF_TEXT))?;
        let eos_token_id = *encoder
            .get(END_OF_TEXT)
            .ok_or(TokenizerError::MissingSpecialToken(END_OF_TEXT))?;

        // Regex pattern for pre-tokenization (matches CLIP's pattern)
        let pat = Regex::new(
            r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+",
        )?;

        debug!(
            vocab = encoder.len(),
            merges = bpe_ranks.len(),
            "loaded CLIP tokenizer"
        );

        Ok(Self {
            byte_encoder,
            byte_decoder,
            encoder,
            decoder,
            bpe_ranks,
            cache: BpeCache::new(),
            pat,
            bos_token_id,
            eos_token_id,
            pad_token_id: eos_token_id,
        })
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Padding id; CLIP pads with the end marker
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }

    /// Encode a batch of texts, padded to `max_length`
    pub fn encode_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        max_length: usize,
        truncation: bool,
    ) -> Result<BatchEncoding, TokenizerError> {
        let options = EncodeOptions {
            max_length,
            truncation,
            padding: Padding::MaxLength,
        };
        self.encode_batch_with(texts, &options)
    }

    /// Encode a batch of texts with explicit truncation and padding options
    pub fn encode_batch_with<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: &EncodeOptions,
    ) -> Result<BatchEncoding, TokenizerError> {
        if options.truncation && options.max_length < 2 {
            return Err(TokenizerError::MaxLength(options.max_length));
        }

        let mut input_ids = Vec::with_capacity(texts.len());
        let mut attention_mask = Vec::with_capacity(texts.len());

        for text in texts {
            let mut ids = self.encode(text.as_ref())?;

            if options.truncation && ids.len() > options.max_length {
                ids.truncate(options.max_length - 1);
                ids.push(self.eos_token_id);
            }

            let mut mask = vec![1u8; ids.len()];

            if options.padding == Padding::MaxLength && ids.len() < options.max_length {
                ids.resize(options.max_length, self.pad_token_id);
                mask.resize(options.max_length, 0);
            }

            input_ids.push(ids);
            attention_mask.push(mask);
        }

        Ok(BatchEncoding {
            input_ids,
            attention_mask,
        })
    }

    /// Encode text to token IDs, including the begin and end markers
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        if text.is_empty() {
            return Ok(vec![self.bos_token_id, self.eos_token_id]);
        }

        let pieces = self.tokenize(text)?;

        let mut ids = Vec::with_capacity(pieces.len() + 2);
        ids.push(self.bos_token_id);
        for piece in &pieces {
            match self.encoder.get(piece) {
                Some(&id) => ids.push(id),
                None => {
                    warn!(piece = piece.as_str(), "sub-word missing from vocabulary");
                    ids.push(self.eos_token_id);
                }
            }
        }
        ids.push(self.eos_token_id);

        Ok(ids)
    }

    /// Decode token IDs back to text
    pub fn decode(&self, tokens: &[u32]) -> String {
        let text: String = tokens
            .iter()
            .filter(|&&id| id != self.bos_token_id && id != self.eos_token_id)
            .filter_map(|id| self.decoder.get(id))
            .map(String::as_str)
            .collect();

        // Convert byte encoding back to text
        let bytes: Vec<u8> = text
            .replace(END_OF_WORD, " ")
            .chars()
            .filter_map(|c| {
                if c == ' ' {
                    Some(b' ')
                } else {
                    self.byte_decoder.get(&c).copied()
                }
            })
            .collect();

        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    /// Drop memoized BPE results, keeping the marker entries
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of memoized entries, including the two markers
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Split text into BPE sub-words
    fn tokenize(&self, text: &str) -> Result<Vec<String>, TokenizerError> {
        let normalized = normalize(text);
        let mut pieces = Vec::new();
        let mut matched = false;

        for mat in self.pat.find_iter(&normalized) {
            matched = true;

            let byte_encoded: String = mat
                .as_str()
                .bytes()
                .map(|b| self.byte_encoder[b as usize])
                .collect();

            pieces.extend(self.bpe(&byte_encoded).split(' ').map(str::to_string));
        }

        if !matched && !normalized.is_empty() {
            return Err(TokenizerError::NoTokens(text.to_string()));
        }

        Ok(pieces)
    }

    /// Apply BPE to a byte-encoded token
    fn bpe(&self, token: &str) -> String {
        if let Some(cached) = self.cache.get(token) {
            return cached;
        }

        let mut word: Vec<String> = token.chars().map(String::from).collect();

        // Add end-of-word marker to last character
        let Some(last) = word.last_mut() else {
            return String::new();
        };
        last.push_str(END_OF_WORD);

        let result = self.merge_word(word).join(" ");
        self.cache.insert(token, &result);
        result
    }

    /// Run the merge loop over a list of sub-word pieces.
    ///
    /// Picks the lowest-ranked adjacent pair, merges every non-overlapping
    /// occurrence left to right, and repeats until a single piece remains or
    /// no adjacent pair has a rank.
    pub fn merge_word(&self, mut word: Vec<String>) -> Vec<String> {
        while word.len() > 1 {
            let best = word
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.bpe_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, i))
                })
                .min_by_key(|&(rank, _)| rank);

            let Some((_, at)) = best else {
                break;
            };
            let first = word[at].clone();
            let second = word[at + 1].clone();

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }

            word = merged;
        }

        word
    }
}

/// Clean, NFC-normalize, collapse whitespace, trim and lowercase
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|&c| c != '\0' && c != '\u{fffd}')
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();

    cleaned
        .nfc()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parse merge rules; line order is merge priority
fn parse_merges(merges: &str) -> Result<HashMap<(String, String), usize>, TokenizerError> {
    let mut lines = merges.lines().enumerate().peekable();

    // Skip header line if present (starts with #version)
    if lines
        .peek()
        .is_some_and(|(_, line)| line.starts_with("#version"))
    {
        lines.next();
    }

    let mut ranks = HashMap::new();
    for (rank, (line_idx, line)) in lines
        .filter(|(_, line)| !line.trim().is_empty())
        .take(MAX_MERGES)
        .enumerate()
    {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(first), Some(second), None) => {
                ranks.insert((first.to_string(), second.to_string()), rank);
            }
            _ => {
                return Err(TokenizerError::InvalidMerge {
                    line: line_idx + 1,
                    content: line.to_string(),
                });
            }
        }
    }

    Ok(ranks)
}

/// Build byte-to-unicode mapping
///
/// Printable ASCII and Latin-1 bytes map to themselves; the remaining 68
/// bytes map to U+0100 onwards in byte order.
pub fn bytes_to_unicode() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut n = 0u32;

    for b in 0..=255u8 {
        table[b as usize] = if matches!(b, b'!'..=b'~' | 0xa1..=0xac | 0xae..=0xff) {
            b as char
        } else {
            let c = char::from_u32(0x100 + n).unwrap_or(char::REPLACEMENT_CHARACTER);
            n += 1;
            c
        };
    }

    table
}
