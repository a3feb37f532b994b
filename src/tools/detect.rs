//! Incremental detection of tool invocations in streamed model text
//!
//! `detect` is a pure function: everything it needs to remember between chunks is carried in
//! the `PartialState` it returns, which the caller passes back in with the next call.
//!
//! Precedence between candidates: a wrapper element anywhere in the scanned text wins over a
//! bare known-tool element, which wins over plain text.

use super::names::ToolNames;
use super::scan::{find_closing, read_open_tag, TagScan};
use tracing::trace;

/// How the candidate announced itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// `<tool_calls>` or one of its spellings
    Wrapper,
    /// A top-level element named after a declared tool
    Bare,
}

/// What the detector remembers between calls
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PartialState {
    #[default]
    Idle,
    /// The text passed in starts at the `<` of a confirmed candidate
    InCandidate { root: String, kind: CandidateKind },
}

/// Classification of the text passed to `detect`. Offsets are byte offsets into that text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Nothing in the text can start a tool call; all of it may be released
    NotACall,
    /// The text ends in something that may still become a marker. Text before `start` may be
    /// released, the rest must be held.
    PartialMarker { start: usize },
    /// A candidate starts at `start` but its closing tag has not arrived
    Candidate {
        root: String,
        kind: CandidateKind,
        start: usize,
    },
    /// `text[start..end]` is one balanced candidate element
    Complete {
        root: String,
        kind: CandidateKind,
        start: usize,
        end: usize,
    },
}

impl Detection {
    /// A tool element was recognized, complete or not
    pub fn is_potential(&self) -> bool {
        matches!(self, Detection::Candidate { .. } | Detection::Complete { .. })
    }

    /// The text may contain the beginning of a tool call
    pub fn might_be_tool_call(&self) -> bool {
        !matches!(self, Detection::NotACall)
    }

    pub fn root_tag_name(&self) -> Option<&str> {
        match self {
            Detection::Candidate { root, .. } | Detection::Complete { root, .. } => Some(root),
            _ => None,
        }
    }

    pub fn is_completed_xml(&self) -> bool {
        matches!(self, Detection::Complete { .. })
    }
}

struct Found<'a> {
    name: &'a str,
    kind: CandidateKind,
    start: usize,
}

/// Classify `text` against the declared tools.
///
/// With `PartialState::Idle` the whole text is scanned for a candidate start. With
/// `PartialState::InCandidate` the text must begin with that candidate's opening tag and only
/// its completion is checked.
pub fn detect(text: &str, names: &ToolNames, state: &PartialState) -> (Detection, PartialState) {
    if names.is_empty() {
        return (Detection::NotACall, PartialState::Idle);
    }

    let detection = match state {
        PartialState::Idle => scan_for_candidate(text, names),
        PartialState::InCandidate { root, kind } => continue_candidate(text, names, root, *kind),
    };

    let next = match &detection {
        Detection::Candidate { root, kind, .. } => PartialState::InCandidate {
            root: root.clone(),
            kind: *kind,
        },
        _ => PartialState::Idle,
    };
    trace!("Detection {:?}", detection);
    (detection, next)
}

fn scan_for_candidate(text: &str, names: &ToolNames) -> Detection {
    let mut bare: Option<Found> = None;
    let mut partial: Option<usize> = None;
    let mut wrapper: Option<Found> = None;

    for (at, _) in text.match_indices('<') {
        match read_open_tag(text, at) {
            TagScan::Open { name, .. }
            | TagScan::Incomplete {
                name,
                name_complete: true,
            } => {
                if names.is_wrapper(name) {
                    wrapper = Some(Found {
                        name,
                        kind: CandidateKind::Wrapper,
                        start: at,
                    });
                    break;
                }
                if bare.is_none() && !names.require_wrapper() && names.is_known(name) {
                    bare = Some(Found {
                        name,
                        kind: CandidateKind::Bare,
                        start: at,
                    });
                }
            }
            TagScan::Incomplete {
                name,
                name_complete: false,
            } => {
                if names.could_complete(name) {
                    partial = Some(at);
                }
            }
            TagScan::NotATag => {}
        }
    }

    match wrapper.or(bare) {
        Some(found) => resolve(text, found),
        None => match partial {
            Some(start) => Detection::PartialMarker { start },
            None => Detection::NotACall,
        },
    }
}

fn continue_candidate(
    text: &str,
    names: &ToolNames,
    root: &str,
    kind: CandidateKind,
) -> Detection {
    let found = Found {
        name: root,
        kind,
        start: 0,
    };
    let detection = resolve(text, found);

    // A wrapper showing up before a bare candidate closes takes over
    if kind == CandidateKind::Bare && !detection.is_completed_xml() {
        if let Some(at) = find_wrapper(text, names) {
            trace!("Wrapper at {} supersedes bare candidate {}", at, root);
            return scan_for_candidate(&text[at..], names).shifted(at);
        }
    }
    detection
}

/// Start offset of the first wrapper opening tag after the first byte
fn find_wrapper(text: &str, names: &ToolNames) -> Option<usize> {
    text.match_indices('<').skip(1).find_map(|(at, _)| {
        match read_open_tag(text, at) {
            TagScan::Open { name, .. }
            | TagScan::Incomplete {
                name,
                name_complete: true,
            } if names.is_wrapper(name) => Some(at),
            _ => None,
        }
    })
}

fn resolve(text: &str, found: Found) -> Detection {
    let Found { name, kind, start } = found;
    let root = name.to_string();

    match read_open_tag(text, start) {
        TagScan::Open {
            end,
            self_closing: true,
            ..
        } => Detection::Complete {
            root,
            kind,
            start,
            end,
        },
        TagScan::Open { end, .. } => match find_closing(text, end, name) {
            Some((_, close_end)) => Detection::Complete {
                root,
                kind,
                start,
                end: close_end,
            },
            None => Detection::Candidate { root, kind, start },
        },
        TagScan::Incomplete { .. } => Detection::Candidate { root, kind, start },
        // The held opening tag turned out not to be markup after all
        TagScan::NotATag => Detection::NotACall,
    }
}

impl Detection {
    fn shifted(self, offset: usize) -> Self {
        match self {
            Detection::NotACall => Detection::NotACall,
            Detection::PartialMarker { start } => Detection::PartialMarker {
                start: start + offset,
            },
            Detection::Candidate { root, kind, start } => Detection::Candidate {
                root,
                kind,
                start: start + offset,
            },
            Detection::Complete {
                root,
                kind,
                start,
                end,
            } => Detection::Complete {
                root,
                kind,
                start: start + offset,
                end: end + offset,
            },
        }
    }
}
