//! CLIP Tokenizer
//!
//! This crate turns prompts into the fixed-length id sequences consumed by
//! the Stable Diffusion 1.x text encoder.
//!
//! # Tokenizer
//!
//! The [`ClipTokenizer`] handles byte-level BPE tokenization of text prompts:
//!
//! ```ignore
//! use edge_diffusion_clip::ClipTokenizer;
//!
//! let tokenizer = ClipTokenizer::from_files("vocab.json", "merges.txt")?;
//! let batch = tokenizer.encode_batch(&["a photo of a cat"], 77, true)?;
//! ```

pub mod tokenizer;

pub use tokenizer::{
    BatchEncoding, ClipTokenizer, DEFAULT_MAX_LENGTH, END_OF_TEXT, EncodeOptions, MAX_MERGES,
    Padding, START_OF_TEXT, TokenizerError, bytes_to_unicode,
};
