use std::collections::BTreeMap;

use crate::error::{SseError, SseResult};
use crate::tree::Tree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TipState {
    Observed(usize),
    Ambiguous(Vec<usize>),
    Missing,
    Gap,
}

impl TipState {
    pub fn parse(s: &str, n_states: usize) -> SseResult<Self> {
        let s = s.trim();
        let state = match s {
            "?" | "" => Self::Missing,
            "-" => Self::Gap,
            _ if s.starts_with('{') || s.starts_with('(') => {
                let inner = s.trim_matches(|c| matches!(c, '{' | '}' | '(' | ')'));
                let mut states = inner
                    .split(|c: char| c == ',' || c == ' ' || c == '/')
                    .filter(|t| !t.is_empty())
                    .map(|t| parse_index(t, n_states))
                    .collect::<SseResult<Vec<_>>>()?;
                states.sort_unstable();
                states.dedup();
                match states.len() {
                    0 => Self::Missing,
                    1 => Self::Observed(states[0]),
                    _ => Self::Ambiguous(states),
                }
            }
            _ if s.contains('/') => {
                let states = s
                    .split('/')
                    .map(|t| parse_index(t, n_states))
                    .collect::<SseResult<Vec<_>>>()?;
                Self::Ambiguous(states).normalized()
            }
            _ => Self::Observed(parse_index(s, n_states)?),
        };
        Ok(state)
    }

    fn normalized(self) -> Self {
        match self {
            Self::Ambiguous(mut states) => {
                states.sort_unstable();
                states.dedup();
                if states.len() == 1 {
                    Self::Observed(states[0])
                } else {
                    Self::Ambiguous(states)
                }
            }
            other => other,
        }
    }

    /// Whether the tip is compatible with state `i`. Missing and gap codes
    /// are compatible with every state.
    pub fn allows(&self, i: usize) -> bool {
        match self {
            Self::Observed(s) => *s == i,
            Self::Ambiguous(states) => states.contains(&i),
            Self::Missing | Self::Gap => true,
        }
    }

    pub fn observed(&self) -> Option<usize> {
        match self {
            Self::Observed(s) => Some(*s),
            _ => None,
        }
    }

    pub fn symbol(&self) -> String {
        match self {
            Self::Observed(s) => s.to_string(),
            Self::Ambiguous(states) => {
                let parts: Vec<String> = states.iter().map(|s| s.to_string()).collect();
                format!("{{{}}}", parts.join(","))
            }
            Self::Missing => "?".to_string(),
            Self::Gap => "-".to_string(),
        }
    }
}

fn parse_index(token: &str, n_states: usize) -> SseResult<usize> {
    let idx: usize = token
        .trim()
        .parse()
        .map_err(|_| SseError::Config(format!("invalid character state '{token}'")))?;
    if idx >= n_states {
        return Err(SseError::Config(format!(
            "character state {idx} out of range for {n_states} states"
        )));
    }
    Ok(idx)
}

/// Tip character states keyed by taxon name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterData {
    states: BTreeMap<String, TipState>,
}

impl CharacterData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_missing(tree: &Tree) -> Self {
        let states = tree
            .tip_names()
            .into_iter()
            .map(|name| (name, TipState::Missing))
            .collect();
        Self { states }
    }

    pub fn insert(&mut self, taxon: impl Into<String>, state: TipState) {
        self.states.insert(taxon.into(), state);
    }

    pub fn get(&self, taxon: &str) -> Option<&TipState> {
        self.states.get(taxon)
    }

    pub fn state_or_missing(&self, taxon: &str) -> TipState {
        self.states.get(taxon).cloned().unwrap_or(TipState::Missing)
    }

    pub fn contains(&self, taxon: &str) -> bool {
        self.states.contains_key(taxon)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TipState)> {
        self.states.iter()
    }

    /// Fails on the first tree tip that has no row.
    pub fn check_covers(&self, tree: &Tree) -> SseResult<()> {
        for taxon in tree.tip_names() {
            if !self.contains(&taxon) {
                return Err(SseError::TaxonMismatch { taxon });
            }
        }
        Ok(())
    }

    pub fn max_state(&self) -> Option<usize> {
        self.states
            .values()
            .filter_map(|s| match s {
                TipState::Observed(i) => Some(*i),
                TipState::Ambiguous(v) => v.iter().copied().max(),
                _ => None,
            })
            .max()
    }
}

impl FromIterator<(String, TipState)> for CharacterData {
    fn from_iter<I: IntoIterator<Item = (String, TipState)>>(iter: I) -> Self {
        Self {
            states: iter.into_iter().collect(),
        }
    }
}
