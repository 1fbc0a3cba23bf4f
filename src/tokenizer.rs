use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::error::{Error, Result};

/// SentencePiece word-boundary marker (U+2581).
pub const WORD_BOUNDARY: char = '\u{2581}';

pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

/// Maximum number of content ids between the BOS and EOS sentinels.
pub const DEFAULT_MAX_TOKENS: usize = 510;

const FALLBACK_BOS_ID: u32 = 0;
const FALLBACK_EOS_ID: u32 = 2;

/// Which encoding path a [`Tokenizer`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    /// Greedy BPE over a loaded vocabulary and merge table.
    Bpe,
    /// Per-character ASCII codes. Retrieval quality is poor on this path.
    Fallback,
}

impl std::fmt::Display for TokenizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenizerKind::Bpe => f.write_str("bpe"),
            TokenizerKind::Fallback => f.write_str("fallback"),
        }
    }
}

/// Token string to id mapping with resolved sentinel ids.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    ids: HashMap<String, u32>,
    bos: u32,
    eos: u32,
    unk: u32,
}

impl Vocabulary {
    /// Validate a raw vocabulary: ids must be dense in `[0, len)` and the
    /// `<s>`, `</s>` and `<unk>` sentinels must be present.
    pub fn new(ids: HashMap<String, u32>) -> Result<Self> {
        let mut seen = vec![false; ids.len()];
        for (token, &id) in &ids {
            let slot = seen.get_mut(id as usize).ok_or_else(|| {
                Error::malformed(
                    "tokenizer vocabulary",
                    format!(
                        "id {id} for {token:?} is outside [0, {})",
                        ids.len()
                    ),
                )
            })?;
            if *slot {
                return Err(Error::malformed(
                    "tokenizer vocabulary",
                    format!("id {id} is assigned more than once"),
                ));
            }
            *slot = true;
        }

        let sentinel = |name: &str| {
            ids.get(name).copied().ok_or_else(|| {
                Error::malformed(
                    "tokenizer vocabulary",
                    format!("missing sentinel token {name:?}"),
                )
            })
        };
        let bos = sentinel(BOS_TOKEN)?;
        let eos = sentinel(EOS_TOKEN)?;
        let unk = sentinel(UNK_TOKEN)?;

        Ok(Self { ids, bos, eos, unk })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    /// Id of `token`, or the `<unk>` id when it is not in the vocabulary.
    pub fn id_or_unknown(&self, token: &str) -> u32 {
        self.get(token).unwrap_or(self.unk)
    }

    pub fn bos(&self) -> u32 {
        self.bos
    }

    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn unk(&self) -> u32 {
        self.unk
    }
}

/// Merge rules keyed by `"left right"`; the rank is the rule's position.
#[derive(Debug, Clone, Default)]
pub struct MergeRanks {
    ranks: HashMap<String, usize>,
}

impl MergeRanks {
    pub fn from_rules<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranks = HashMap::new();
        for (rank, rule) in rules.into_iter().enumerate() {
            let rule = rule.as_ref();
            let valid = matches!(
                rule.split_once(' '),
                Some((left, right))
                    if !left.is_empty() && !right.is_empty() && !right.contains(' ')
            );
            if !valid {
                return Err(Error::malformed(
                    "tokenizer merges",
                    format!("rule {rank} is not a \"left right\" pair: {rule:?}"),
                ));
            }
            // A repeated rule keeps its first (lowest) rank.
            ranks.entry(rule.to_string()).or_insert(rank);
        }
        Ok(Self { ranks })
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn rank(&self, left: &str, right: &str) -> Option<usize> {
        let mut key = String::with_capacity(left.len() + right.len() + 1);
        key.push_str(left);
        key.push(' ');
        key.push_str(right);
        self.ranks.get(&key).copied()
    }
}

#[derive(Deserialize)]
struct TokenizerFile {
    model: ModelSection,
}

#[derive(Deserialize)]
struct ModelSection {
    vocab: HashMap<String, u32>,
    merges: Vec<MergeEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MergeEntry {
    Joined(String),
    Pair(String, String),
}

impl MergeEntry {
    fn into_rule(self) -> String {
        match self {
            MergeEntry::Joined(rule) => rule,
            MergeEntry::Pair(left, right) => format!("{left} {right}"),
        }
    }
}

#[derive(Debug, Clone)]
struct BpeModel {
    vocab: Vocabulary,
    merges: MergeRanks,
}

/// Query tokenizer: greedy BPE when a vocabulary is loaded, otherwise a
/// trivial per-character encoding.
///
/// Output is always `[BOS, content.., EOS]` with at most `max_tokens`
/// content ids.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    model: Option<BpeModel>,
    max_tokens: usize,
}

impl Tokenizer {
    pub fn new(vocab: Vocabulary, merges: MergeRanks) -> Self {
        Self {
            model: Some(BpeModel { vocab, merges }),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// A tokenizer with no vocabulary. Every call to `encode` degrades
    /// silently, so construction is logged.
    pub fn fallback() -> Self {
        tracing::warn!(
            "no tokenizer vocabulary loaded; using per-character fallback tokenizer"
        );
        Self {
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Parse a `tokenizer.json` document (`model.vocab` + `model.merges`).
    pub fn from_json(json: &str) -> Result<Self> {
        let file: TokenizerFile = serde_json::from_str(json)
            .map_err(|e| Error::malformed("tokenizer file", e.to_string()))?;

        let vocab = Vocabulary::new(file.model.vocab)?;
        let merges = MergeRanks::from_rules(
            file.model.merges.into_iter().map(MergeEntry::into_rule),
        )?;

        tracing::info!(
            vocab_size = vocab.len(),
            merges = merges.len(),
            "tokenizer loaded"
        );
        Ok(Self::new(vocab, merges))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "tokenizer file",
                path: path.to_path_buf(),
            });
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn kind(&self) -> TokenizerKind {
        if self.model.is_some() {
            TokenizerKind::Bpe
        } else {
            TokenizerKind::Fallback
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        match &self.model {
            Some(model) => self.encode_bpe(model, text),
            None => self.encode_fallback(text),
        }
    }

    fn encode_bpe(&self, model: &BpeModel, text: &str) -> Vec<u32> {
        let mut ids = Vec::with_capacity(text.len().min(self.max_tokens) + 2);
        ids.push(model.vocab.bos());

        let mut content = 0;
        'words: for word in text.split_whitespace() {
            for piece in merge_word(&model.merges, word) {
                if content == self.max_tokens {
                    tracing::debug!(
                        max_tokens = self.max_tokens,
                        "query truncated at token cap"
                    );
                    break 'words;
                }
                ids.push(model.vocab.id_or_unknown(&piece));
                content += 1;
            }
        }

        ids.push(model.vocab.eos());
        ids
    }

    fn encode_fallback(&self, text: &str) -> Vec<u32> {
        tracing::trace!("encoding with fallback tokenizer");
        let mut ids = Vec::with_capacity(text.len().min(self.max_tokens) + 2);
        ids.push(FALLBACK_BOS_ID);
        // Non-ASCII characters collapse to id 0.
        ids.extend(
            text.chars()
                .take(self.max_tokens)
                .map(|c| if c.is_ascii() { c as u32 } else { 0 }),
        );
        ids.push(FALLBACK_EOS_ID);
        ids
    }
}

/// Split one whitespace-free word into its final BPE pieces.
///
/// The word is prefixed with [`WORD_BOUNDARY`], segmented into characters,
/// and the lowest-ranked adjacent pair is merged until no ranked pair
/// remains. Equal ranks resolve to the leftmost pair.
fn merge_word(merges: &MergeRanks, word: &str) -> Vec<String> {
    let mut pieces: Vec<String> = std::iter::once(WORD_BOUNDARY)
        .chain(word.chars())
        .map(String::from)
        .collect();

    while pieces.len() > 1 {
        let best = pieces
            .windows(2)
            .enumerate()
            .filter_map(|(i, pair)| {
                merges.rank(&pair[0], &pair[1]).map(|rank| (rank, i))
            })
            .min();

        let Some((_, i)) = best else {
            break;
        };

        let right = pieces.remove(i + 1);
        pieces[i].push_str(&right);
    }

    pieces
}
