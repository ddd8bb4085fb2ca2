//! BPE tokenizer adapter built on tiktoken-rs.
//!
//! Positions handed out by [`TokenizerAdapter::tokenize`] index the original
//! full encode of a prompt; attributors carry them unchanged through
//! truncation, filtering and coalition sampling.

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::error::{ConfigError, TokenizationError};

/// Encoding used when the model is not recognised.
pub const DEFAULT_ENCODING: &str = "cl100k_base";

/// A token id as produced by the BPE encoder.
pub type TokenId = u32;

/// One token of a prompt: its id, decoded text and original position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub text: String,
    pub position: usize,
}

/// Wraps a named BPE encoding for encode/decode.
pub struct TokenizerAdapter {
    bpe: CoreBPE,
    encoding: String,
}

impl std::fmt::Debug for TokenizerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerAdapter")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl TokenizerAdapter {
    /// Load a tokenizer by encoding name.
    pub fn from_encoding(name: &str) -> Result<Self, ConfigError> {
        let bpe = match name {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "p50k_edit" => tiktoken_rs::p50k_edit(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => {
                return Err(ConfigError::UnknownEncoding {
                    name: other.to_string(),
                });
            }
        }
        .map_err(|e| ConfigError::Invalid {
            message: format!("failed to load encoding {name}: {e}"),
        })?;
        Ok(Self {
            bpe,
            encoding: name.to_string(),
        })
    }

    /// Create a tokenizer for the given model.
    /// Falls back to cl100k_base if the model isn't recognized.
    pub fn for_model(model: &str) -> Result<Self, ConfigError> {
        let encoding = encoding_name_for_model(model);
        debug!(model, encoding, "Selecting tokenizer encoding");
        Self::from_encoding(encoding)
    }

    /// Build from configuration: explicit encoding wins over the model mapping.
    pub fn from_config(explicit: Option<&str>, model: &str) -> Result<Self, ConfigError> {
        match explicit {
            Some(name) => Self::from_encoding(name),
            None => Self::for_model(model),
        }
    }

    /// Name of the encoding, recorded in results for reproducibility.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Encode text into token ids. Special-token text is treated as ordinary text.
    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        self.bpe.encode_ordinary(text)
    }

    /// Decode a (possibly partial) id sequence back into text.
    ///
    /// Sequences that split a multi-byte character decode with U+FFFD in
    /// place of the broken bytes, so a reconstruction never fails on
    /// ablation boundaries.
    pub fn decode(&self, ids: &[TokenId]) -> Result<String, TokenizationError> {
        let bytes = self.decode_bytes(ids)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decode a single id, dropping bytes that are not valid UTF-8 on their own.
    pub fn decode_token(&self, id: TokenId) -> Result<String, TokenizationError> {
        let bytes = self.decode_bytes(&[id])?;
        Ok(utf8_ignore_invalid(&bytes))
    }

    /// Raw bytes of an id sequence. Unknown ids are an error.
    fn decode_bytes(&self, ids: &[TokenId]) -> Result<Vec<u8>, TokenizationError> {
        if let Some(&unknown) = ids.iter().find(|&&id| !self.is_known(id)) {
            return Err(TokenizationError::Decode {
                message: format!("unknown token id {unknown} for {}", self.encoding),
            });
        }
        Ok(self
            .bpe
            ._decode_native_and_split(ids.to_vec())
            .flatten()
            .collect())
    }

    /// Whether the encoding has bytes for `id`.
    ///
    /// The split decoder panics on unknown ids and tiktoken-rs keeps its
    /// decode-key error private, so a failed strict decode is told apart from
    /// a multi-byte fragment by its message.
    fn is_known(&self, id: TokenId) -> bool {
        match self.bpe.decode(vec![id]) {
            Ok(_) => true,
            Err(e) => !e.to_string().starts_with("Invalid token for decoding"),
        }
    }

    /// Encode a prompt and pair each id with its decoded text and position.
    pub fn tokenize(&self, text: &str) -> Result<Vec<Token>, TokenizationError> {
        self.encode(text)
            .into_iter()
            .enumerate()
            .map(|(position, id)| {
                Ok(Token {
                    id,
                    text: self.decode_token(id)?,
                    position,
                })
            })
            .collect()
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Map a model name to its tiktoken encoding.
pub fn encoding_name_for_model(model: &str) -> &'static str {
    if model.starts_with("gpt-4o")
        || model.starts_with("gpt-4.1")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
    {
        "o200k_base"
    } else if model.starts_with("text-davinci-002") || model.starts_with("text-davinci-003") {
        "p50k_base"
    } else if model.starts_with("davinci") || model.starts_with("curie") {
        "r50k_base"
    } else {
        DEFAULT_ENCODING
    }
}

/// Decode UTF-8, skipping invalid byte runs instead of replacing them.
fn utf8_ignore_invalid(mut bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                // valid_up_to guarantees this prefix is well-formed
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match e.error_len() {
                    Some(skip) => bytes = &rest[skip..],
                    None => return out,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> TokenizerAdapter {
        TokenizerAdapter::from_encoding("cl100k_base").unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tok = tokenizer();
        let text = "The quick brown fox jumps over the lazy dog.";
        let ids = tok.encode(text);
        assert!(!ids.is_empty());
        assert_eq!(tok.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_roundtrip_multibyte() {
        let tok = tokenizer();
        let text = "naïve café — 日本語のテキスト 🦀";
        assert_eq!(tok.decode(&tok.encode(text)).unwrap(), text);
    }

    #[test]
    fn test_encode_empty() {
        let tok = tokenizer();
        assert!(tok.encode("").is_empty());
        assert!(tok.tokenize("").unwrap().is_empty());
    }

    #[test]
    fn test_tokenize_positions_are_sequential() {
        let tok = tokenizer();
        let tokens = tok.tokenize("The quick brown fox").unwrap();
        assert_eq!(tokens.len(), 4);
        for (i, t) in tokens.iter().enumerate() {
            assert_eq!(t.position, i);
        }
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["The", " quick", " brown", " fox"]);
    }

    #[test]
    fn test_decode_token_drops_partial_bytes() {
        let tok = tokenizer();
        // Emoji usually spans several byte-level tokens; none of the
        // fragments may produce a replacement character.
        for id in tok.encode("🦀") {
            let text = tok.decode_token(id).unwrap();
            assert!(!text.contains('\u{FFFD}'));
        }
    }

    #[test]
    fn test_decode_partial_sequence_is_lossy_not_fatal() {
        let tok = tokenizer();
        let ids = tok.encode("🦀 crab");
        if ids.len() > 2 {
            let partial: Vec<TokenId> = ids[1..].to_vec();
            assert!(tok.decode(&partial).is_ok());
        }
    }

    #[test]
    fn test_decode_unknown_id_is_an_error() {
        let tok = tokenizer();
        let err = tok.decode(&[u32::MAX]).unwrap_err();
        assert!(matches!(err, TokenizationError::Decode { .. }));
        assert!(tok.decode_token(u32::MAX).is_err());

        let mut ids = tok.encode("hello");
        ids.push(u32::MAX);
        assert!(tok.decode(&ids).is_err());
    }

    #[test]
    fn test_tokenize_multibyte_fragments_are_empty_not_replaced() {
        let tok = tokenizer();
        let text = "héllo 日本語 🎉🦀 naïve";
        let tokens = tok.tokenize(text).unwrap();
        assert_eq!(tokens.len(), tok.count(text));
        for token in &tokens {
            assert!(!token.text.contains('\u{FFFD}'));
        }
        let ids: Vec<TokenId> = tokens.iter().map(|t| t.id).collect();
        assert_eq!(tok.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_unknown_encoding() {
        let err = TokenizerAdapter::from_encoding("nope_base").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEncoding { .. }));
    }

    #[test]
    fn test_encoding_for_model() {
        assert_eq!(encoding_name_for_model("gpt-3.5-turbo"), "cl100k_base");
        assert_eq!(encoding_name_for_model("gpt-4"), "cl100k_base");
        assert_eq!(encoding_name_for_model("gpt-4o-mini"), "o200k_base");
        assert_eq!(encoding_name_for_model("llama3.1:8b"), "cl100k_base");
    }

    #[test]
    fn test_from_config_explicit_encoding() {
        let tok = TokenizerAdapter::from_config(Some("o200k_base"), "gpt-3.5-turbo").unwrap();
        assert_eq!(tok.encoding(), "o200k_base");
        let tok = TokenizerAdapter::from_config(None, "gpt-3.5-turbo").unwrap();
        assert_eq!(tok.encoding(), "cl100k_base");
    }

    #[test]
    fn test_utf8_ignore_invalid() {
        assert_eq!(utf8_ignore_invalid(b"abc"), "abc");
        assert_eq!(utf8_ignore_invalid(b"a\xffb"), "ab");
        // Truncated multi-byte sequence at the end is dropped
        assert_eq!(utf8_ignore_invalid(b"ok\xe6\x97"), "ok");
        assert_eq!(utf8_ignore_invalid(b"\xf0\x9f"), "");
    }
}
