//! Keyword filter pipeline.
//!
//! Decides whether a message is relayed at all. Rejected messages still
//! advance the checkpoint so they are never revisited.

use courier_types::{FilterConfig, FilterMode};

/// Compiled filter state for one worker, rebuilt on every config reload.
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    enabled: bool,
    mode: FilterMode,
    /// Keywords pre-lowercased for case-insensitive substring matching.
    keywords: Vec<String>,
}

impl FilterPipeline {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            enabled: config.enabled,
            mode: config.mode,
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Whether a message with this text/caption should be relayed.
    ///
    /// A message without text passes a blacklist (nothing to match against)
    /// and fails a whitelist (cannot contain a required keyword). An empty
    /// keyword list always passes.
    pub fn should_relay(&self, text: Option<&str>) -> bool {
        if !self.enabled || self.keywords.is_empty() {
            return true;
        }

        let Some(text) = text else {
            return self.mode == FilterMode::Blacklist;
        };

        let haystack = text.to_lowercase();
        let has_keyword = self.keywords.iter().any(|k| haystack.contains(k));

        match self.mode {
            FilterMode::Whitelist => has_keyword,
            FilterMode::Blacklist => !has_keyword,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, mode: FilterMode, keywords: &[&str]) -> FilterConfig {
        FilterConfig {
            enabled,
            mode,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn whitelist_requires_a_keyword() {
        let filter = FilterPipeline::new(&config(true, FilterMode::Whitelist, &["GOLD", "BUY"]));

        assert!(filter.should_relay(Some("BUY GOLD now")));
        assert!(!filter.should_relay(Some("SELL now")));
    }

    #[test]
    fn whitelist_matching_is_case_insensitive() {
        let filter = FilterPipeline::new(&config(true, FilterMode::Whitelist, &["GOLD"]));
        assert!(filter.should_relay(Some("buy gold today")));
    }

    #[test]
    fn blacklist_drops_matching_messages() {
        let filter = FilterPipeline::new(&config(true, FilterMode::Blacklist, &["spam"]));

        assert!(!filter.should_relay(Some("this is SPAM")));
        assert!(filter.should_relay(Some("legit message")));
    }

    #[test]
    fn textless_message_depends_on_mode() {
        let white = FilterPipeline::new(&config(true, FilterMode::Whitelist, &["x"]));
        let black = FilterPipeline::new(&config(true, FilterMode::Blacklist, &["x"]));

        assert!(!white.should_relay(None));
        assert!(black.should_relay(None));
    }

    #[test]
    fn disabled_filter_passes_everything() {
        let filter = FilterPipeline::new(&config(false, FilterMode::Whitelist, &["x"]));
        assert!(filter.should_relay(Some("anything")));
        assert!(filter.should_relay(None));
    }

    #[test]
    fn empty_keyword_list_passes_everything() {
        let filter = FilterPipeline::new(&config(true, FilterMode::Whitelist, &[]));
        assert!(filter.should_relay(Some("anything")));
    }
}
