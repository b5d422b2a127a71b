//! Output filtering applied to stdout before it is returned to callers.

use crate::config::FilterConfig;

pub trait OutputFilter: Send + Sync {
    fn keep(&self, line: &str) -> bool;

    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines.into_iter().filter(|line| self.keep(line)).collect()
    }
}

pub struct PassthroughFilter;

impl OutputFilter for PassthroughFilter {
    fn keep(&self, _line: &str) -> bool {
        true
    }
}

/// Drops interpreter prompts and warning chatter.
pub struct ReplNoiseFilter {
    drop_prefixes: Vec<String>,
    drop_substrings: Vec<String>,
}

impl ReplNoiseFilter {
    pub fn new(drop_prefixes: Vec<String>, drop_substrings: Vec<String>) -> Self {
        Self {
            drop_prefixes,
            drop_substrings,
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.drop_prefixes.clone(), config.drop_substrings.clone())
    }
}

impl OutputFilter for ReplNoiseFilter {
    fn keep(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        !self.drop_prefixes.iter().any(|p| trimmed.starts_with(p.as_str()))
            && !self.drop_substrings.iter().any(|s| line.contains(s.as_str()))
    }
}

/// Filter described by `config`; a disabled filter passes everything.
pub fn filter_from_config(config: &FilterConfig) -> Box<dyn OutputFilter> {
    if config.enabled {
        Box::new(ReplNoiseFilter::from_config(config))
    } else {
        Box::new(PassthroughFilter)
    }
}
